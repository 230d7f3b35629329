//! Interactive console client for a running standards agents API.
use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde::Deserialize;

use crate::agents::{AgentKey, TeamMode};
use crate::server::{AskResponse, QueryRequest, TeamQueryRequest};
use crate::theme::{
    BOLD, BOLD_CYAN, CYAN, GREEN, RED, RESET, YELLOW, failure, print_console_banner, rule,
    success, warning,
};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ASK_TIMEOUT_SECS: u64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleChoice {
    Agent(AgentKey),
    Team,
    Exit,
}

pub fn parse_menu_choice(input: &str) -> Option<ConsoleChoice> {
    match input.trim() {
        "1" => Some(ConsoleChoice::Agent(AgentKey::Safety)),
        "2" => Some(ConsoleChoice::Agent(AgentKey::Quality)),
        "3" => Some(ConsoleChoice::Team),
        "4" => Some(ConsoleChoice::Exit),
        _ => None,
    }
}

/// Anything other than 2 or 3 falls back to collaborate.
pub fn parse_mode_choice(input: &str) -> TeamMode {
    match input.trim() {
        "2" => TeamMode::Route,
        "3" => TeamMode::Coordinate,
        _ => TeamMode::Collaborate,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub agents_status: String,
    #[serde(default)]
    pub available_agents: Vec<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Deserialize)]
struct ErrorDetail {
    detail: String,
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// `ask_timeout` bounds every request; the health check uses a shorter one.
    pub fn new(base_url: &str, ask_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ask_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("failed to reach API at {}", self.base_url))?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "health check failed with status {}",
                response.status()
            ));
        }
        response
            .json::<HealthStatus>()
            .await
            .context("failed to decode health response")
    }

    pub async fn ask(&self, agent: AgentKey, query: &str, model_id: &str) -> Result<String> {
        let body = QueryRequest {
            query: query.to_string(),
            model_id: Some(model_id.to_string()),
        };
        self.post_ask(&format!("/{}/ask", agent.label()), &body)
            .await
    }

    pub async fn ask_team(&self, query: &str, model_id: &str, mode: TeamMode) -> Result<String> {
        let body = TeamQueryRequest {
            query: query.to_string(),
            model_id: Some(model_id.to_string()),
            team_mode: Some(mode.label().to_string()),
        };
        self.post_ask("/team/ask", &body).await
    }

    async fn post_ask<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to send request to {path}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorDetail>(&text)
                .map(|body| body.detail)
                .unwrap_or(text);
            return Err(anyhow::anyhow!("{path} returned {status}: {detail}"));
        }

        let parsed = response
            .json::<AskResponse>()
            .await
            .with_context(|| format!("failed to decode response from {path}"))?;
        Ok(parsed.response)
    }
}

fn clear_screen() {
    if let Err(err) = execute!(io::stdout(), Clear(ClearType::All), MoveTo(0, 0)) {
        tracing::debug!(error = %err, "failed to clear terminal");
    }
}

/// `None` means the operator closed the input (Ctrl+C / Ctrl+D).
fn read_line(editor: &mut DefaultEditor, prompt: &str) -> Result<Option<String>> {
    match editor.readline(prompt) {
        Ok(line) => {
            if !line.trim().is_empty() {
                let _ = editor.add_history_entry(line.as_str());
            }
            Ok(Some(line))
        }
        Err(ReadlineError::Interrupted | ReadlineError::Eof) => Ok(None),
        Err(err) => Err(err).context("failed to read input from terminal"),
    }
}

fn print_menu() {
    println!("{BOLD}Choose an agent to ask a question:{RESET}");
    println!("{CYAN}1. Safety Agent{RESET}");
    println!("{GREEN}2. Quality Agent{RESET}");
    println!("{YELLOW}3. Team Agent{RESET}");
    println!("{RED}4. Exit{RESET}");
    println!();
}

fn print_mode_menu() {
    println!();
    println!("{BOLD}Choose team mode:{RESET}");
    println!("{CYAN}1. Collaborate{RESET}");
    println!("{GREEN}2. Route{RESET}");
    println!("{YELLOW}3. Coordinate{RESET}");
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn print_answer(title: &str, answer: &str) {
    println!();
    println!("{}", rule());
    println!("{BOLD_CYAN}{title} Response:{RESET}");
    println!("{}", rule());
    println!("{answer}");
    println!("{}", rule());
}

pub async fn run_console(api_url: &str, model_id: &str, timeout_secs: u64) -> Result<()> {
    let client = ApiClient::new(api_url, Duration::from_secs(timeout_secs))?;
    let mut editor = DefaultEditor::new().context("failed to initialize line editor")?;

    loop {
        clear_screen();
        print_console_banner(client.base_url(), model_id);
        println!();

        let health = match client.health().await {
            Ok(health) if health.is_healthy() => health,
            Ok(_) | Err(_) => {
                println!(
                    "{}",
                    failure(&format!(
                        "Error: Cannot connect to the API. Make sure it's running at: {}",
                        client.base_url()
                    ))
                );
                match read_line(&mut editor, "Press Enter to try again or 'q' to quit... ")? {
                    Some(input) if !input.trim().eq_ignore_ascii_case("q") => continue,
                    _ => break,
                }
            }
        };

        if health.available_agents.is_empty() {
            println!(
                "{}",
                warning(&format!(
                    "API is up but agents are {}.",
                    health.agents_status
                ))
            );
        } else {
            println!(
                "{}",
                success(&format!(
                    "API is healthy. Available agents: {}",
                    health.available_agents.join(", ")
                ))
            );
        }
        println!();

        print_menu();
        let Some(choice) = read_line(&mut editor, "Select option (1-4): ")? else {
            break;
        };
        let choice = match parse_menu_choice(&choice) {
            Some(ConsoleChoice::Exit) => break,
            Some(choice) => choice,
            None => {
                if read_line(&mut editor, "Invalid choice. Press Enter to continue...")?.is_none() {
                    break;
                }
                continue;
            }
        };

        println!();
        println!("{BOLD}Enter your question:{RESET}");
        let Some(query) = read_line(&mut editor, "> ")? else {
            break;
        };
        let query = query.trim().to_string();
        if query.is_empty() {
            if read_line(&mut editor, "Empty query. Press Enter to continue...")?.is_none() {
                break;
            }
            continue;
        }

        let (title, outcome) = match choice {
            ConsoleChoice::Agent(key) => {
                println!("\n{CYAN}Sending request...{RESET}");
                (
                    key.short_name().to_string(),
                    client.ask(key, &query, model_id).await,
                )
            }
            ConsoleChoice::Team => {
                print_mode_menu();
                let Some(mode_input) = read_line(&mut editor, "Select mode (1-3, default is 1): ")?
                else {
                    break;
                };
                let mode = parse_mode_choice(&mode_input);
                println!("\n{CYAN}Sending request...{RESET}");
                (
                    format!("Team Agent ({})", capitalize(mode.label())),
                    client.ask_team(&query, model_id, mode).await,
                )
            }
            ConsoleChoice::Exit => break,
        };

        match outcome {
            Ok(answer) => print_answer(&title, &answer),
            Err(err) => println!(
                "\n{}",
                failure(&format!("Error: Failed to get response from API: {err:#}"))
            ),
        }

        if read_line(&mut editor, "\nPress Enter to continue...")?.is_none() {
            break;
        }
    }

    println!("\n{}", warning("Exiting. Goodbye!"));
    Ok(())
}
