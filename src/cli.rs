use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::agents::AgentKey;
use crate::agents::team::TeamMode;
use crate::console::DEFAULT_ASK_TIMEOUT_SECS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeBackend {
    Lance,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AskTarget {
    Safety,
    Quality,
    Team,
}

impl AskTarget {
    pub fn agent_key(self) -> Option<AgentKey> {
        match self {
            AskTarget::Safety => Some(AgentKey::Safety),
            AskTarget::Quality => Some(AgentKey::Quality),
            AskTarget::Team => None,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum ModeCommands {
    #[command(about = "List team modes and their descriptions")]
    List,
    #[command(about = "Show the instruction bundle for one team mode")]
    Show {
        #[arg(value_enum)]
        mode: TeamMode,
    },
}

#[derive(Debug, Subcommand)]
pub enum MockCommands {
    #[command(about = "Run the mock API returning canned answers (no external services)")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, env = "PORT", default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  standards-agents serve --port 8080\n\
  standards-agents ask safety \"What PPE is required for welding?\"\n\
  standards-agents ask team --mode route \"Is this a safety or quality question?\"\n\
  standards-agents --knowledge-backend local ask quality \"How is cross-contamination prevented?\"\n\
  standards-agents modes list\n\
  standards-agents modes show coordinate\n\
  standards-agents mock serve --port 8080\n\
  standards-agents console --api-url http://localhost:8080\n\
  standards-agents doctor\n\
  standards-agents telemetry report --limit 2000\n\
\n\
Environment:\n\
  LanceURL, LANCE_API_KEY     vector database location and credentials\n\
  OPENAI_API_KEY              language model and embedding credentials";

#[derive(Debug, Parser)]
#[command(name = "standards-agents")]
#[command(about = "Safety and quality standards agents served over HTTP")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "STANDARDS_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "STANDARDS_CONFIG", default_value = ".standards/config.toml")]
    pub config_path: String,

    #[arg(long, env = "STANDARDS_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "STANDARDS_EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL")]
    pub openai_base_url: Option<String>,

    #[arg(long, env = "STANDARDS_KNOWLEDGE_BACKEND", value_enum)]
    pub knowledge_backend: Option<KnowledgeBackend>,

    #[arg(long, env = "LanceURL")]
    pub lance_url: Option<String>,

    #[arg(long, env = "LANCE_REGION")]
    pub lance_region: Option<String>,

    #[arg(long, env = "STANDARDS_SAFETY_TABLE")]
    pub safety_table: Option<String>,

    #[arg(long, env = "STANDARDS_QUALITY_TABLE")]
    pub quality_table: Option<String>,

    #[arg(long, env = "STANDARDS_SAFETY_CORPUS")]
    pub safety_corpus_path: Option<String>,

    #[arg(long, env = "STANDARDS_QUALITY_CORPUS")]
    pub quality_corpus_path: Option<String>,

    #[arg(long, env = "STANDARDS_RETRIEVAL_MAX_CHUNKS")]
    pub retrieval_max_chunks: Option<usize>,

    #[arg(long, env = "STANDARDS_RETRIEVAL_MAX_CHARS")]
    pub retrieval_max_chars: Option<usize>,

    #[arg(long, env = "STANDARDS_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, env = "STANDARDS_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "STANDARDS_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "STANDARDS_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the standards agents HTTP API")]
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "PORT", default_value_t = 8080)]
        port: u16,
    },
    #[command(about = "Ask one agent (or the team) a question and print the answer")]
    Ask {
        #[arg(value_enum)]
        target: AskTarget,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        model_id: Option<String>,
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    #[command(about = "Interactive console client for a running API")]
    Console {
        #[arg(long, env = "STANDARDS_API_URL", default_value = "http://localhost:8080")]
        api_url: String,
        #[arg(long, default_value = "o3-mini")]
        model_id: String,
        #[arg(long, default_value_t = DEFAULT_ASK_TIMEOUT_SECS)]
        timeout_secs: u64,
    },
    #[command(about = "Check environment variables and resolved configuration")]
    Doctor,
    #[command(about = "Inspect team coordination modes")]
    Modes {
        #[command(subcommand)]
        command: ModeCommands,
    },
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Mock API server")]
    Mock {
        #[command(subcommand)]
        command: MockCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Serve { .. } => "serve".to_string(),
        Commands::Ask { target, .. } => format!("ask.{}", ask_target_label(*target)),
        Commands::Console { .. } => "console".to_string(),
        Commands::Doctor => "doctor".to_string(),
        Commands::Modes { command } => match command {
            ModeCommands::List => "modes.list".to_string(),
            ModeCommands::Show { .. } => "modes.show".to_string(),
        },
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Mock { command } => match command {
            MockCommands::Serve { .. } => "mock.serve".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}

pub fn ask_target_label(target: AskTarget) -> &'static str {
    match target {
        AskTarget::Safety => "safety",
        AskTarget::Quality => "quality",
        AskTarget::Team => "team",
    }
}
