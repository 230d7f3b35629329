use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::{Cli, KnowledgeBackend};

pub const DEFAULT_MODEL_ID: &str = "o3-mini";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub default_model: String,
    pub embedding_model: String,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub knowledge_backend: KnowledgeBackend,
    pub lance_url: Option<String>,
    pub lance_api_key: Option<String>,
    pub lance_region: String,
    pub safety_table: String,
    pub quality_table: String,
    pub safety_corpus_path: String,
    pub quality_corpus_path: String,
    pub retrieval_max_chunks: usize,
    pub retrieval_max_chars: usize,
    pub request_timeout_secs: u64,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub show_sensitive_config: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub model: Option<String>,
    pub embedding_model: Option<String>,
    pub openai_base_url: Option<String>,
    pub knowledge_backend: Option<KnowledgeBackend>,
    pub lance_url: Option<String>,
    pub lance_region: Option<String>,
    pub safety_table: Option<String>,
    pub quality_table: Option<String>,
    pub safety_corpus_path: Option<String>,
    pub quality_corpus_path: Option<String>,
    pub retrieval_max_chunks: Option<usize>,
    pub retrieval_max_chars: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    parse_profiles(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check backend values and field names.",
            path.display()
        )
    })
}

pub fn parse_profiles(content: &str) -> Result<ProfilesFile> {
    Ok(toml::from_str::<ProfilesFile>(content)?)
}

/// Secrets never come from the CLI or profile file, only from the process environment.
#[derive(Debug, Clone, Default)]
pub struct SecretEnv {
    pub openai_api_key: Option<String>,
    pub lance_api_key: Option<String>,
}

impl SecretEnv {
    pub fn from_process() -> Self {
        Self {
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            lance_api_key: non_empty_env("LANCE_API_KEY"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    resolve_runtime_config_with_secrets(cli, profiles, SecretEnv::from_process())
}

pub fn resolve_runtime_config_with_secrets(
    cli: &Cli,
    profiles: &ProfilesFile,
    secrets: SecretEnv,
) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        default_model: non_empty(cli.model.clone().or(profile.model))
            .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
        embedding_model: non_empty(cli.embedding_model.clone().or(profile.embedding_model))
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
        openai_base_url: non_empty(cli.openai_base_url.clone().or(profile.openai_base_url))
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
        openai_api_key: secrets.openai_api_key,
        knowledge_backend: cli
            .knowledge_backend
            .or(profile.knowledge_backend)
            .unwrap_or(KnowledgeBackend::Lance),
        lance_url: non_empty(cli.lance_url.clone().or(profile.lance_url)),
        lance_api_key: secrets.lance_api_key,
        lance_region: non_empty(cli.lance_region.clone().or(profile.lance_region))
            .unwrap_or_else(|| "us-east-1".to_string()),
        safety_table: cli
            .safety_table
            .clone()
            .or(profile.safety_table)
            .unwrap_or_else(|| "safety_standards".to_string()),
        quality_table: cli
            .quality_table
            .clone()
            .or(profile.quality_table)
            .unwrap_or_else(|| "quality_standards".to_string()),
        safety_corpus_path: cli
            .safety_corpus_path
            .clone()
            .or(profile.safety_corpus_path)
            .unwrap_or_else(|| "data/pdfs".to_string()),
        quality_corpus_path: cli
            .quality_corpus_path
            .clone()
            .or(profile.quality_corpus_path)
            .unwrap_or_else(|| "data/Quality PDF".to_string()),
        retrieval_max_chunks: cli
            .retrieval_max_chunks
            .or(profile.retrieval_max_chunks)
            .unwrap_or(5)
            .max(1),
        retrieval_max_chars: cli
            .retrieval_max_chars
            .or(profile.retrieval_max_chars)
            .unwrap_or(6000)
            .max(256),
        request_timeout_secs: cli
            .request_timeout_secs
            .or(profile.request_timeout_secs)
            .unwrap_or(120)
            .max(1),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".standards/telemetry/events.jsonl".to_string()),
        show_sensitive_config: cli.show_sensitive_config,
    })
}

pub fn display_lance_url(cfg: &RuntimeConfig) -> String {
    match cfg.lance_url.as_deref() {
        None => "<not set>".to_string(),
        Some(url) if cfg.show_sensitive_config => url.to_string(),
        Some(url) => format!(
            "{} (set --show-sensitive-config to reveal)",
            crate::error::redact_lance_url_value(url)
        ),
    }
}
