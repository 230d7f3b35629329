//! Startup initialization. Building the agents either succeeds or leaves the
//! registry in a degraded state that still lets the API answer health and
//! config probes.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::KnowledgeBackend;
use crate::config::RuntimeConfig;
use crate::error::StandardsError;
use crate::provider::{LanguageModel, OpenAiChatModel, OpenAiEmbedder, http_client};
use crate::retrieval::{
    KnowledgeSource, LanceKnowledgeSource, LocalCorpusKnowledgeSource, RetrievalPolicy,
};

use super::{AgentKey, ReasoningAgent, TeamCoordinator};

pub const TEAM_NAME: &str = "Standards Team";

pub struct StandardsAgents {
    pub safety: Arc<ReasoningAgent>,
    pub quality: Arc<ReasoningAgent>,
    pub team: Arc<TeamCoordinator>,
}

impl StandardsAgents {
    /// Wires both domain agents and the team over shared, read-only adapters.
    pub fn assemble(
        safety_knowledge: Arc<dyn KnowledgeSource>,
        quality_knowledge: Arc<dyn KnowledgeSource>,
        model: Arc<dyn LanguageModel>,
        default_model_id: &str,
        retrieval: RetrievalPolicy,
    ) -> Self {
        let safety = Arc::new(ReasoningAgent::new(
            AgentKey::Safety,
            safety_knowledge,
            model.clone(),
            default_model_id,
            retrieval,
        ));
        let quality = Arc::new(ReasoningAgent::new(
            AgentKey::Quality,
            quality_knowledge,
            model.clone(),
            default_model_id,
            retrieval,
        ));
        let team = Arc::new(TeamCoordinator::new(
            TEAM_NAME,
            vec![safety.clone(), quality.clone()],
            model,
            default_model_id,
        ));
        Self {
            safety,
            quality,
            team,
        }
    }
}

pub fn retrieval_policy(cfg: &RuntimeConfig) -> RetrievalPolicy {
    RetrievalPolicy {
        max_chunks: cfg.retrieval_max_chunks,
        max_chars: cfg.retrieval_max_chars,
    }
}

pub fn build_agents(cfg: &RuntimeConfig) -> Result<StandardsAgents, StandardsError> {
    let openai_api_key = cfg.openai_api_key.clone().ok_or_else(|| {
        StandardsError::Configuration(
            "OPENAI_API_KEY is not set; the language model backend cannot be reached".to_string(),
        )
    })?;

    let client = http_client(Duration::from_secs(cfg.request_timeout_secs))
        .map_err(|err| StandardsError::Configuration(format!("{err:#}")))?;

    let (safety_knowledge, quality_knowledge) = match cfg.knowledge_backend {
        KnowledgeBackend::Lance => {
            let (Some(url), Some(api_key)) = (cfg.lance_url.as_deref(), cfg.lance_api_key.as_deref())
            else {
                return Err(StandardsError::Configuration(
                    "LanceDB cloud configuration is incomplete. Set LanceURL and LANCE_API_KEY."
                        .to_string(),
                ));
            };
            let embedder = Arc::new(OpenAiEmbedder::new(
                client.clone(),
                openai_api_key.clone(),
                &cfg.openai_base_url,
                cfg.embedding_model.clone(),
            ));
            let safety: Arc<dyn KnowledgeSource> = Arc::new(LanceKnowledgeSource::new(
                client.clone(),
                url,
                &cfg.lance_region,
                api_key,
                cfg.safety_table.clone(),
                embedder.clone(),
            ));
            let quality: Arc<dyn KnowledgeSource> = Arc::new(LanceKnowledgeSource::new(
                client.clone(),
                url,
                &cfg.lance_region,
                api_key,
                cfg.quality_table.clone(),
                embedder,
            ));
            (safety, quality)
        }
        KnowledgeBackend::Local => {
            let safety: Arc<dyn KnowledgeSource> =
                Arc::new(load_local_corpus(&cfg.safety_corpus_path)?);
            let quality: Arc<dyn KnowledgeSource> =
                Arc::new(load_local_corpus(&cfg.quality_corpus_path)?);
            (safety, quality)
        }
    };

    let model = Arc::new(OpenAiChatModel::new(
        client,
        openai_api_key,
        &cfg.openai_base_url,
    ));

    Ok(StandardsAgents::assemble(
        safety_knowledge,
        quality_knowledge,
        model,
        &cfg.default_model,
        retrieval_policy(cfg),
    ))
}

fn load_local_corpus(path: &str) -> Result<LocalCorpusKnowledgeSource, StandardsError> {
    LocalCorpusKnowledgeSource::load(Path::new(path))
        .map_err(|err| StandardsError::Configuration(format!("{err:#}")))
}

pub struct AgentRegistry {
    agents: Option<StandardsAgents>,
    unavailable_reason: Option<String>,
}

impl AgentRegistry {
    /// Never fails: a broken configuration yields a degraded registry.
    pub fn initialize(cfg: &RuntimeConfig) -> Self {
        match build_agents(cfg) {
            Ok(agents) => {
                tracing::info!(
                    backend = ?cfg.knowledge_backend,
                    model = %cfg.default_model,
                    "agents successfully initialized"
                );
                Self::available(agents)
            }
            Err(err) => {
                tracing::error!(error = %err, "agents were not initialized; serving in degraded mode");
                Self::unavailable(err.to_string())
            }
        }
    }

    pub fn available(agents: StandardsAgents) -> Self {
        Self {
            agents: Some(agents),
            unavailable_reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            agents: None,
            unavailable_reason: Some(reason.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.agents.is_some()
    }

    pub fn status_label(&self) -> &'static str {
        if self.is_available() {
            "available"
        } else {
            "unavailable"
        }
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        self.unavailable_reason.as_deref()
    }

    pub fn available_agents(&self) -> Vec<&'static str> {
        if self.is_available() {
            vec![AgentKey::Safety.label(), AgentKey::Quality.label(), "team"]
        } else {
            Vec::new()
        }
    }

    fn unavailable_error(&self, agent: &str) -> StandardsError {
        StandardsError::AgentUnavailable {
            agent: agent.to_string(),
            reason: self
                .unavailable_reason
                .clone()
                .unwrap_or_else(|| "agents were not initialized".to_string()),
        }
    }

    pub fn agent(&self, key: AgentKey) -> Result<&Arc<ReasoningAgent>, StandardsError> {
        match (&self.agents, key) {
            (Some(agents), AgentKey::Safety) => Ok(&agents.safety),
            (Some(agents), AgentKey::Quality) => Ok(&agents.quality),
            (None, key) => Err(self.unavailable_error(key.short_name())),
        }
    }

    pub fn team(&self) -> Result<&Arc<TeamCoordinator>, StandardsError> {
        self.agents
            .as_ref()
            .map(|agents| &agents.team)
            .ok_or_else(|| self.unavailable_error("Team Agent"))
    }
}
