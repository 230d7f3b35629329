//! ANSI colors and banner helpers for the operator console.

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const CYAN: &str = "\x1b[36m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const RED: &str = "\x1b[31m";
pub const BOLD_CYAN: &str = "\x1b[1;36m";
pub const BOLD_GREEN: &str = "\x1b[1;32m";
pub const BOLD_YELLOW: &str = "\x1b[1;33m";
pub const BOLD_RED: &str = "\x1b[1;31m";

const RULE_WIDTH: usize = 60;

pub fn rule() -> String {
    format!("{DIM}{}{RESET}", "=".repeat(RULE_WIDTH))
}

pub fn print_console_banner(api_url: &str, model_id: &str) {
    let version = env!("CARGO_PKG_VERSION");
    println!("{}", rule());
    println!("  {BOLD_CYAN}Standards Agents Console{RESET} {DIM}v{version}{RESET}");
    println!("  {DIM}API:{RESET} {GREEN}{api_url}{RESET}  {DIM}model:{RESET} {GREEN}{model_id}{RESET}");
    println!("{}", rule());
}

pub fn success(message: &str) -> String {
    format!("{BOLD_GREEN}{message}{RESET}")
}

pub fn warning(message: &str) -> String {
    format!("{BOLD_YELLOW}{message}{RESET}")
}

pub fn failure(message: &str) -> String {
    format!("{BOLD_RED}{message}{RESET}")
}
