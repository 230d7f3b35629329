use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig, display_lance_url};

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

fn flag(set: bool) -> &'static str {
    if set { "set" } else { "missing" }
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Default model: {}", cfg.default_model);
    println!("Embedding model: {}", cfg.embedding_model);
    println!("OpenAI base URL: {}", cfg.openai_base_url);
    println!("OPENAI_API_KEY: {}", flag(cfg.openai_api_key.is_some()));
    println!("Knowledge backend: {:?}", cfg.knowledge_backend);
    println!("LanceDB URL: {}", display_lance_url(cfg));
    println!("LanceDB region: {}", cfg.lance_region);
    println!("LANCE_API_KEY: {}", flag(cfg.lance_api_key.is_some()));
    println!("Safety table: {}", cfg.safety_table);
    println!("Quality table: {}", cfg.quality_table);
    println!("Safety corpus path: {}", cfg.safety_corpus_path);
    println!("Quality corpus path: {}", cfg.quality_corpus_path);
    println!("Retrieval max chunks: {}", cfg.retrieval_max_chunks);
    println!("Retrieval max chars: {}", cfg.retrieval_max_chars);
    println!("Request timeout (secs): {}", cfg.request_timeout_secs);
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    Ok(())
}
