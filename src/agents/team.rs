//! Team coordination: a static mode -> instruction bundle table and the
//! coordinator that applies the selected synthesis policy to its members.
//!
//! The coordinator keeps no per-request state. Mode and model override are
//! resolved per call and threaded through as arguments, so concurrent
//! requests cannot observe each other's selection.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use clap::ValueEnum;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::error::StandardsError;
use crate::provider::{GenerationRequest, LanguageModel, select_model_id};

use super::{AgentKey, ReasoningAgent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamMode {
    #[default]
    Collaborate,
    Route,
    Coordinate,
}

impl TeamMode {
    pub const ALL: [TeamMode; 3] = [TeamMode::Collaborate, TeamMode::Route, TeamMode::Coordinate];

    pub fn label(self) -> &'static str {
        match self {
            TeamMode::Collaborate => "collaborate",
            TeamMode::Route => "route",
            TeamMode::Coordinate => "coordinate",
        }
    }

    pub fn names() -> Vec<&'static str> {
        TeamMode::ALL.iter().map(|mode| mode.label()).collect()
    }
}

impl fmt::Display for TeamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Exact match only; anything else is rejected rather than defaulted.
impl FromStr for TeamMode {
    type Err = StandardsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TeamMode::ALL
            .into_iter()
            .find(|mode| mode.label() == value)
            .ok_or_else(|| StandardsError::UnknownMode {
                mode: value.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionBundle {
    pub mode: TeamMode,
    pub description: &'static str,
    pub instructions: &'static [&'static str],
}

impl InstructionBundle {
    pub fn system_prompt(&self) -> String {
        let mut out = String::from(self.description);
        out.push_str("\n\nInstructions:\n");
        for (index, instruction) in self.instructions.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", index + 1, instruction));
        }
        out.push_str("Format the answer in markdown.");
        out
    }
}

const OUT_OF_SCOPE: &str = "If the question is completely unrelated to either safety or quality \
    standards, respond that you can only answer questions related to safety and quality standards.";

static COLLABORATE: InstructionBundle = InstructionBundle {
    mode: TeamMode::Collaborate,
    description: "You are a collaborative team where all members work on the same task to \
                  create comprehensive responses.",
    instructions: &[
        "First determine whether the question is primarily about safety standards or quality \
         standards.",
        "For safety questions (workplace safety, hazard prevention, fire safety, electrical \
         safety, etc.), primarily rely on the Safety Standards Agent.",
        "For quality questions (quality assurance, cross-contamination prevention, personnel \
         hygiene, etc.), primarily rely on the Quality Standards Agent.",
        "Synthesize a comprehensive response based on contributions from all experts.",
        "Always identify which expert provided which information in your response.",
        OUT_OF_SCOPE,
    ],
};

static ROUTE: InstructionBundle = InstructionBundle {
    mode: TeamMode::Route,
    description: "You are a router that directs questions to the appropriate standards agent.",
    instructions: &[
        "Analyze the user's question to determine if it's about safety standards or quality \
         standards.",
        "If the question is about safety protocols, workplace safety, hazard prevention, fire \
         safety, electrical safety, noise standards, fall prevention, etc., route to the Safety \
         Standards Agent.",
        "If the question is about quality assurance, quality control, cross-contamination \
         prevention, personnel hygiene, utilities quality, etc., route to the Quality Standards \
         Agent.",
        "If the question could apply to both domains, prioritize routing based on the most \
         relevant expertise needed.",
        "Always provide a brief explanation of why you're routing to a particular agent before \
         routing.",
        OUT_OF_SCOPE,
    ],
};

static COORDINATE: InstructionBundle = InstructionBundle {
    mode: TeamMode::Coordinate,
    description: "You are a coordinator that delegates tasks to team members and synthesizes \
                  their outputs.",
    instructions: &[
        "Break down the user's question into specific sub-tasks for each relevant team member.",
        "Delegate safety-related aspects (workplace safety, hazard prevention, fire safety, etc.) \
         to the Safety Standards Agent.",
        "Delegate quality-related aspects (quality assurance, hygiene, contamination prevention, \
         etc.) to the Quality Standards Agent.",
        "Synthesize the responses from each team member into a cohesive answer.",
        "Ensure the final response is comprehensive and addresses all aspects of the question.",
        OUT_OF_SCOPE,
    ],
};

pub fn instruction_bundle(mode: TeamMode) -> &'static InstructionBundle {
    match mode {
        TeamMode::Collaborate => &COLLABORATE,
        TeamMode::Route => &ROUTE,
        TeamMode::Coordinate => &COORDINATE,
    }
}

pub fn resolve_mode(name: &str) -> Result<&'static InstructionBundle, StandardsError> {
    Ok(instruction_bundle(name.parse::<TeamMode>()?))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamRun {
    pub response: String,
    pub mode: TeamMode,
    pub consulted: Vec<AgentKey>,
}

#[derive(Debug, Deserialize)]
pub struct RouteDecision {
    pub member: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub reply: String,
}

#[derive(Debug, Deserialize)]
pub struct CoordinationPlan {
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub reply: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedTask {
    pub member: String,
    pub task: String,
}

/// Models often wrap JSON in prose or code fences; take the outermost object.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_route_decision(text: &str) -> Result<RouteDecision, StandardsError> {
    extract_json_object(text)
        .and_then(|raw| serde_json::from_str::<RouteDecision>(raw).ok())
        .ok_or_else(|| {
            StandardsError::Upstream(format!(
                "team router returned an unreadable routing decision: {}",
                text.trim()
            ))
        })
}

pub fn parse_coordination_plan(text: &str) -> Result<CoordinationPlan, StandardsError> {
    extract_json_object(text)
        .and_then(|raw| serde_json::from_str::<CoordinationPlan>(raw).ok())
        .ok_or_else(|| {
            StandardsError::Upstream(format!(
                "team coordinator returned an unreadable task plan: {}",
                text.trim()
            ))
        })
}

pub struct TeamCoordinator {
    name: String,
    members: Vec<Arc<ReasoningAgent>>,
    model: Arc<dyn LanguageModel>,
    default_model_id: String,
}

impl TeamCoordinator {
    pub fn new(
        name: impl Into<String>,
        members: Vec<Arc<ReasoningAgent>>,
        model: Arc<dyn LanguageModel>,
        default_model_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            members,
            model,
            default_model_id: default_model_id.into(),
        }
    }

    fn member(&self, label: &str) -> Option<&Arc<ReasoningAgent>> {
        let key = AgentKey::from_label(label)?;
        self.members.iter().find(|member| member.key() == key)
    }

    fn roster(&self) -> String {
        self.members
            .iter()
            .map(|member| {
                format!(
                    "- {}: {}. {}",
                    member.key().label(),
                    member.name(),
                    member.key().role()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Resolves `mode` (default collaborate) and runs the query under it.
    /// An unknown mode or invalid model id fails before any member runs.
    pub async fn run(
        &self,
        query: &str,
        mode: Option<&str>,
        model_id: Option<&str>,
    ) -> Result<TeamRun, StandardsError> {
        let bundle = match mode {
            Some(name) => resolve_mode(name)?,
            None => instruction_bundle(TeamMode::default()),
        };
        let model_id = select_model_id(model_id, &self.default_model_id)?;

        tracing::debug!(
            team = %self.name,
            mode = %bundle.mode,
            model = %model_id,
            backend = self.model.backend_name(),
            "running team"
        );

        match bundle.mode {
            TeamMode::Collaborate => self.collaborate(query, bundle, &model_id).await,
            TeamMode::Route => self.route(query, bundle, &model_id).await,
            TeamMode::Coordinate => self.coordinate(query, bundle, &model_id).await,
        }
    }

    async fn generate(
        &self,
        bundle: &InstructionBundle,
        model_id: &str,
        prompt: String,
        stage: &str,
    ) -> Result<String, StandardsError> {
        let system = format!(
            "{}\n\nTeam members:\n{}",
            bundle.system_prompt(),
            self.roster()
        );
        let text = self
            .model
            .generate(GenerationRequest {
                model_id: model_id.to_string(),
                system,
                prompt,
            })
            .await
            .map_err(|err| StandardsError::upstream(&format!("{} {stage} failed", self.name), err))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(StandardsError::Upstream(format!(
                "{} {stage} returned no text",
                self.name
            )));
        }
        Ok(text.to_string())
    }

    async fn collaborate(
        &self,
        query: &str,
        bundle: &InstructionBundle,
        model_id: &str,
    ) -> Result<TeamRun, StandardsError> {
        let contributions = try_join_all(self.members.iter().map(|member| async move {
            let answer = member.run(query, None).await?;
            Ok::<_, StandardsError>((member.key(), None::<String>, answer))
        }))
        .await?;

        let response = self
            .generate(
                bundle,
                model_id,
                synthesis_prompt(query, &contributions),
                "synthesis",
            )
            .await?;

        Ok(TeamRun {
            response,
            mode: bundle.mode,
            consulted: contributions.iter().map(|(key, _, _)| *key).collect(),
        })
    }

    async fn route(
        &self,
        query: &str,
        bundle: &InstructionBundle,
        model_id: &str,
    ) -> Result<TeamRun, StandardsError> {
        let members = self
            .members
            .iter()
            .map(|member| member.key().label())
            .collect::<Vec<_>>()
            .join("|");
        let prompt = format!(
            "Question:\n{query}\n\n\
             Decide which single team member should answer. Reply with only a JSON object:\n\
             {{\"member\": \"<{members}|none>\", \"reason\": \"<one sentence>\", \
             \"reply\": \"<your reply to the user when member is none, otherwise empty>\"}}"
        );
        let decision_text = self.generate(bundle, model_id, prompt, "routing").await?;
        let decision = parse_route_decision(&decision_text)?;

        if decision.member.trim().eq_ignore_ascii_case("none") {
            let reply = decision.reply.trim();
            if reply.is_empty() {
                return Err(StandardsError::Upstream(format!(
                    "{} declined to route the question without a reply",
                    self.name
                )));
            }
            return Ok(TeamRun {
                response: reply.to_string(),
                mode: bundle.mode,
                consulted: Vec::new(),
            });
        }

        let member = self.member(&decision.member).ok_or_else(|| {
            StandardsError::Upstream(format!(
                "{} routed to unknown team member '{}'",
                self.name,
                decision.member.trim()
            ))
        })?;

        tracing::info!(team = %self.name, member = member.key().label(), reason = %decision.reason, "routed question");

        let answer = member.run(query, None).await?;
        let reason = decision.reason.trim();
        let response = if reason.is_empty() {
            format!("Routed to {}.\n\n{}", member.name(), answer)
        } else {
            format!("Routed to {}: {}\n\n{}", member.name(), reason, answer)
        };

        Ok(TeamRun {
            response,
            mode: bundle.mode,
            consulted: vec![member.key()],
        })
    }

    async fn coordinate(
        &self,
        query: &str,
        bundle: &InstructionBundle,
        model_id: &str,
    ) -> Result<TeamRun, StandardsError> {
        let members = self
            .members
            .iter()
            .map(|member| member.key().label())
            .collect::<Vec<_>>()
            .join("|");
        let prompt = format!(
            "Question:\n{query}\n\n\
             Break the question into sub-tasks for the relevant team members. Reply with only a \
             JSON object:\n\
             {{\"tasks\": [{{\"member\": \"<{members}>\", \"task\": \"<self-contained sub-question>\"}}], \
             \"reply\": \"<your reply to the user when no member is relevant, otherwise empty>\"}}"
        );
        let plan_text = self.generate(bundle, model_id, prompt, "planning").await?;
        let plan = parse_coordination_plan(&plan_text)?;

        // Validate the whole plan before delegating anything.
        let assignments = plan
            .tasks
            .iter()
            .map(|task| {
                self.member(&task.member)
                    .map(|member| (member, task.task.trim()))
                    .ok_or_else(|| {
                        StandardsError::Upstream(format!(
                            "{} delegated to unknown team member '{}'",
                            self.name,
                            task.member.trim()
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if assignments.is_empty() {
            let reply = plan.reply.trim();
            if reply.is_empty() {
                return Err(StandardsError::Upstream(format!(
                    "{} produced an empty task plan",
                    self.name
                )));
            }
            return Ok(TeamRun {
                response: reply.to_string(),
                mode: bundle.mode,
                consulted: Vec::new(),
            });
        }

        let results = try_join_all(assignments.iter().map(|(member, task)| async move {
            let sub_query = if task.is_empty() { query } else { *task };
            let answer = member.run(sub_query, None).await?;
            Ok::<_, StandardsError>((member.key(), Some(sub_query.to_string()), answer))
        }))
        .await?;

        let response = self
            .generate(
                bundle,
                model_id,
                synthesis_prompt(query, &results),
                "synthesis",
            )
            .await?;

        let mut consulted = Vec::new();
        for (key, _, _) in &results {
            if !consulted.contains(key) {
                consulted.push(*key);
            }
        }

        Ok(TeamRun {
            response,
            mode: bundle.mode,
            consulted,
        })
    }
}

fn synthesis_prompt(query: &str, contributions: &[(AgentKey, Option<String>, String)]) -> String {
    let mut out = format!("Question:\n{query}\n\nTeam member contributions:\n");
    for (key, task, answer) in contributions {
        out.push_str(&format!("\n### {}\n", key.display_name()));
        if let Some(task) = task {
            out.push_str(&format!("Sub-task: {task}\n"));
        }
        out.push_str(answer);
        out.push('\n');
    }
    out.push_str("\nWrite the final answer for the user following your instructions.");
    out
}
