//! Single-domain question answering: knowledge lookup, then one model call.
use std::sync::Arc;

use crate::error::StandardsError;
use crate::provider::{GenerationRequest, LanguageModel, select_model_id};
use crate::retrieval::{KnowledgeSource, RetrievalPolicy, augment_prompt_with_knowledge};

use super::AgentKey;

pub struct ReasoningAgent {
    key: AgentKey,
    knowledge: Arc<dyn KnowledgeSource>,
    model: Arc<dyn LanguageModel>,
    default_model_id: String,
    retrieval: RetrievalPolicy,
}

impl ReasoningAgent {
    pub fn new(
        key: AgentKey,
        knowledge: Arc<dyn KnowledgeSource>,
        model: Arc<dyn LanguageModel>,
        default_model_id: impl Into<String>,
        retrieval: RetrievalPolicy,
    ) -> Self {
        Self {
            key,
            knowledge,
            model,
            default_model_id: default_model_id.into(),
            retrieval,
        }
    }

    pub fn key(&self) -> AgentKey {
        self.key
    }

    pub fn name(&self) -> &'static str {
        self.key.display_name()
    }

    pub fn system_prompt(&self) -> String {
        format!(
            "{}\n\
             Base your answer on the retrieved context from the {} documents and say so when \
             the documents do not cover the question.\n\
             If the question is unrelated to {}, respond that you can only answer questions \
             related to {}.\n\
             Format the answer in markdown.",
            self.key.role(),
            self.key.domain(),
            self.key.domain(),
            self.key.domain()
        )
    }

    /// Answers `query` from this agent's corpus. `model_id` overrides the
    /// default model for this call only.
    pub async fn run(&self, query: &str, model_id: Option<&str>) -> Result<String, StandardsError> {
        let model_id = select_model_id(model_id, &self.default_model_id)?;

        let prompt = augment_prompt_with_knowledge(self.knowledge.as_ref(), query, self.retrieval)
            .await
            .map_err(|err| {
                StandardsError::upstream(&format!("{} knowledge search failed", self.name()), err)
            })?;

        tracing::debug!(
            agent = self.key.label(),
            model = %model_id,
            backend = self.model.backend_name(),
            knowledge = self.knowledge.backend_name(),
            prompt_chars = prompt.len(),
            "running reasoning agent"
        );

        let answer = self
            .model
            .generate(GenerationRequest {
                model_id,
                system: self.system_prompt(),
                prompt,
            })
            .await
            .map_err(|err| {
                StandardsError::upstream(&format!("{} model call failed", self.name()), err)
            })?;

        let answer = answer.trim();
        if answer.is_empty() {
            return Err(StandardsError::Upstream(format!(
                "{} returned an empty answer",
                self.name()
            )));
        }
        Ok(answer.to_string())
    }
}
