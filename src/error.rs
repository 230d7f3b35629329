use thiserror::Error;

use crate::agents::team::TeamMode;

/// Failures that cross the agent boundary and surface to API callers.
#[derive(Debug, Error)]
pub enum StandardsError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("Invalid team mode: {mode}. Must be one of: {}", TeamMode::names().join(", "))]
    UnknownMode { mode: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{agent} is not available: {reason}")]
    AgentUnavailable { agent: String, reason: String },

    #[error("{0}")]
    Upstream(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),
}

impl StandardsError {
    pub fn upstream(context: &str, err: anyhow::Error) -> Self {
        StandardsError::Upstream(format!("{context}: {err:#}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Input,
    Upstream,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "CONFIG",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Upstream => "UPSTREAM",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Configuration => {
                "Set LanceURL, LANCE_API_KEY and OPENAI_API_KEY (or use --knowledge-backend local), then run standards-agents doctor."
            }
            ErrorCategory::Input => "Run standards-agents --help and correct command arguments.",
            ErrorCategory::Upstream => {
                "The vector database or language model call failed. Retry with RUST_LOG=debug for request details."
            }
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if let Some(domain) = err.downcast_ref::<StandardsError>() {
        return match domain {
            StandardsError::Configuration(_) | StandardsError::AgentUnavailable { .. } => {
                ErrorCategory::Configuration
            }
            StandardsError::UnknownMode { .. } | StandardsError::InvalidRequest(_) => {
                ErrorCategory::Input
            }
            StandardsError::Upstream(_) | StandardsError::Timeout(_) => ErrorCategory::Upstream,
        };
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key") || msg.contains("lanceurl") || msg.contains("profile") {
        return ErrorCategory::Configuration;
    }

    if msg.contains("invalid value") || msg.contains("unknown argument") || msg.contains("failed to read input")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("openai") || msg.contains("lancedb") || msg.contains("http") {
        return ErrorCategory::Upstream;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let message = format!("{err:#}");
    if show_sensitive_config {
        message
    } else {
        redact_sensitive_text(&message)
    }
}

pub fn redact_sensitive_text(text: &str) -> String {
    text.split_inclusive(char::is_whitespace)
        .map(|piece| {
            let token = piece.trim_end();
            let trailing = &piece[token.len()..];
            let core = token.trim_matches(|ch: char| {
                matches!(ch, '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';')
            });
            if core.is_empty() {
                return piece.to_string();
            }
            let redacted = if core.starts_with("db://") {
                redact_lance_url_value(core)
            } else if looks_like_api_key(core) {
                "[REDACTED]".to_string()
            } else {
                return piece.to_string();
            };
            format!("{}{}", token.replacen(core, &redacted, 1), trailing)
        })
        .collect()
}

pub fn redact_lance_url_value(value: &str) -> String {
    if value.starts_with("db://") {
        "db://[REDACTED]".to_string()
    } else if let Some(rest) = value.split_once("://") {
        format!("{}://[REDACTED]", rest.0)
    } else {
        "[REDACTED]".to_string()
    }
}

fn looks_like_api_key(token: &str) -> bool {
    (token.starts_with("sk-") || token.starts_with("sk_")) && token.len() > 12
}
