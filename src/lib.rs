pub mod agents;
pub mod cli;
pub mod config;
pub mod console;
pub mod doctor;
pub mod error;
pub mod mock;
pub mod profiles;
pub mod provider;
pub mod retrieval;
pub mod server;
pub mod telemetry;
pub mod theme;

#[cfg(test)]
mod tests;
