//! Standards agents: two single-domain reasoning agents and the team that
//! composes them under a selectable coordination mode.

pub mod reasoning;
pub mod registry;
pub mod team;

use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub use reasoning::ReasoningAgent;
pub use registry::{AgentRegistry, StandardsAgents, build_agents};
pub use team::{InstructionBundle, TeamCoordinator, TeamMode, TeamRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKey {
    Safety,
    Quality,
}

impl AgentKey {
    pub const ALL: [AgentKey; 2] = [AgentKey::Safety, AgentKey::Quality];

    pub fn label(self) -> &'static str {
        match self {
            AgentKey::Safety => "safety",
            AgentKey::Quality => "quality",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AgentKey::Safety => "Safety Standards Agent",
            AgentKey::Quality => "Quality Standards Agent",
        }
    }

    /// Short name used in availability errors.
    pub fn short_name(self) -> &'static str {
        match self {
            AgentKey::Safety => "Safety Agent",
            AgentKey::Quality => "Quality Agent",
        }
    }

    pub fn role(self) -> &'static str {
        match self {
            AgentKey::Safety => {
                "You are an expert on safety standards and protocols. Always provide your \
                 response in a concise manner based on the information provided in the documents."
            }
            AgentKey::Quality => {
                "You are an expert on quality standards and quality assurance processes. Always \
                 provide your response in a concise manner based on the information provided in \
                 the documents."
            }
        }
    }

    pub fn domain(self) -> &'static str {
        match self {
            AgentKey::Safety => "safety standards",
            AgentKey::Quality => "quality standards",
        }
    }

    /// Accepts the key label or the display name, ignoring case.
    pub fn from_label(value: &str) -> Option<Self> {
        let normalized = value.trim();
        AgentKey::ALL.into_iter().find(|key| {
            normalized.eq_ignore_ascii_case(key.label())
                || normalized.eq_ignore_ascii_case(key.display_name())
        })
    }
}

pub fn run_modes_list() -> Result<()> {
    println!(
        "Team modes (default='{}'):",
        TeamMode::default().label()
    );
    for mode in TeamMode::ALL {
        let marker = if mode == TeamMode::default() { "*" } else { " " };
        let bundle = team::instruction_bundle(mode);
        println!("{marker} {} - {}", mode.label(), bundle.description);
    }
    println!(
        "Members: {}",
        AgentKey::ALL
            .iter()
            .map(|key| key.display_name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

pub fn run_modes_show(mode: TeamMode) -> Result<()> {
    let bundle = team::instruction_bundle(mode);
    println!("Mode: {}", mode.label());
    println!("Description: {}", bundle.description);
    println!("Instructions:");
    for (index, instruction) in bundle.instructions.iter().enumerate() {
        println!("{}. {}", index + 1, instruction);
    }
    Ok(())
}
