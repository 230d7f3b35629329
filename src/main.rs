use anyhow::Result;
use clap::Parser;
use serde_json::json;

use standards_agents::agents::{AgentKey, build_agents, run_modes_list, run_modes_show};
use standards_agents::cli::{
    AskTarget, Cli, Commands, MockCommands, ModeCommands, ProfileCommands, TelemetryCommands,
    ask_target_label, command_label,
};
use standards_agents::config::{ProfilesFile, RuntimeConfig, load_profiles, resolve_runtime_config};
use standards_agents::console::run_console;
use standards_agents::doctor::run_doctor;
use standards_agents::error::{categorize_error, format_cli_error};
use standards_agents::mock::run_mock_server;
use standards_agents::provider::requested_model_id;
use standards_agents::profiles::{run_profiles_list, run_profiles_show};
use standards_agents::server::run_server;
use standards_agents::telemetry::{TelemetrySink, run_telemetry_report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive));
        tracing::error!(category = %categorize_error(&err).code(), "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let telemetry = TelemetrySink::new(&cfg, command_label(&cli.command));

    let outcome = dispatch(cli.command, &cfg, &profiles, &telemetry).await;
    match &outcome {
        Ok(()) => telemetry.emit("command.completed", json!({})),
        Err(err) => telemetry.emit(
            "command.failed",
            json!({ "category": categorize_error(err).code() }),
        ),
    }
    outcome
}

async fn dispatch(
    command: Commands,
    cfg: &RuntimeConfig,
    profiles: &ProfilesFile,
    telemetry: &TelemetrySink,
) -> Result<()> {
    match command {
        Commands::Serve { host, port } => {
            run_server(cfg.clone(), host, port, telemetry).await?;
        }
        Commands::Ask {
            target,
            mode,
            model_id,
            prompt,
        } => {
            let prompt = prompt.join(" ");
            let answer = run_ask(
                cfg,
                target,
                mode.as_deref(),
                model_id.as_deref(),
                &prompt,
                telemetry,
            )
            .await?;
            println!("{answer}");
        }
        Commands::Console {
            api_url,
            model_id,
            timeout_secs,
        } => {
            run_console(&api_url, &model_id, timeout_secs).await?;
        }
        Commands::Doctor => run_doctor(cfg)?,
        Commands::Modes { command } => match command {
            ModeCommands::List => run_modes_list()?,
            ModeCommands::Show { mode } => run_modes_show(mode)?,
        },
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(profiles, cfg)?,
            ProfileCommands::Show => run_profiles_show(cfg)?,
        },
        Commands::Mock { command } => match command {
            MockCommands::Serve { host, port } => run_mock_server(host, port, telemetry).await?,
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(cfg, path, limit)?,
        },
    }

    Ok(())
}

async fn run_ask(
    cfg: &RuntimeConfig,
    target: AskTarget,
    mode: Option<&str>,
    model_id: Option<&str>,
    prompt: &str,
    telemetry: &TelemetrySink,
) -> Result<String> {
    let agents = build_agents(cfg)?;
    tracing::info!(
        ask_target = ask_target_label(target),
        backend = ?cfg.knowledge_backend,
        model = requested_model_id(model_id).unwrap_or(&cfg.default_model),
        "running one-shot ask"
    );

    let outcome = match target.agent_key() {
        Some(key) => {
            let agent = match key {
                AgentKey::Safety => &agents.safety,
                AgentKey::Quality => &agents.quality,
            };
            agent.run(prompt, model_id).await
        }
        None => agents
            .team
            .run(prompt, mode, model_id)
            .await
            .map(|run| {
                tracing::info!(mode = run.mode.label(), consulted = ?run.consulted, "team run finished");
                run.response
            }),
    };

    let agent = ask_target_label(target);
    match &outcome {
        Ok(_) => telemetry.emit("cli.ask.completed", json!({ "agent": agent, "mode": mode })),
        Err(err) => telemetry.emit(
            "cli.ask.failed",
            json!({ "agent": agent, "mode": mode, "error": err.to_string() }),
        ),
    }
    Ok(outcome?)
}

fn init_tracing(log_filter: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
