use anyhow::Result;

use crate::cli::KnowledgeBackend;
use crate::config::{RuntimeConfig, display_lance_url};
use crate::provider::env_present;
use crate::retrieval::{lance_endpoint, load_corpus_chunks};

pub fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    let checks = [
        ("LanceURL", env_present("LanceURL") || cfg.lance_url.is_some()),
        ("LANCE_API_KEY", cfg.lance_api_key.is_some()),
        ("OPENAI_API_KEY", cfg.openai_api_key.is_some()),
    ];

    println!("Environment check:");
    for (key, ok) in checks {
        let status = if ok { "set" } else { "missing" };
        println!("- {key}: {status}");
    }

    println!(
        "Model: default={} embedding={} base_url={}",
        cfg.default_model, cfg.embedding_model, cfg.openai_base_url
    );
    println!(
        "Retrieval: max_chunks={}, max_chars={}, request_timeout_secs={}",
        cfg.retrieval_max_chunks, cfg.retrieval_max_chars, cfg.request_timeout_secs
    );

    match cfg.knowledge_backend {
        KnowledgeBackend::Lance => {
            println!("Knowledge backend: lance");
            println!("LanceDB URL: {}", display_lance_url(cfg));
            if let Some(url) = cfg.lance_url.as_deref() {
                let endpoint = if cfg.show_sensitive_config {
                    lance_endpoint(url, &cfg.lance_region)
                } else {
                    format!("<redacted> (region {})", cfg.lance_region)
                };
                println!("LanceDB endpoint: {endpoint}");
            }
            println!(
                "Tables: safety={} quality={}",
                cfg.safety_table, cfg.quality_table
            );
            if cfg.lance_url.is_none() || cfg.lance_api_key.is_none() {
                println!("Tip: set LanceURL and LANCE_API_KEY, or run with --knowledge-backend local");
            }
        }
        KnowledgeBackend::Local => {
            println!("Knowledge backend: local");
            for (label, path) in [
                ("safety", &cfg.safety_corpus_path),
                ("quality", &cfg.quality_corpus_path),
            ] {
                match load_corpus_chunks(std::path::Path::new(path)) {
                    Ok(chunks) => println!("- {label} corpus '{path}': {} chunks", chunks.len()),
                    Err(err) => println!("- {label} corpus '{path}': unreadable ({err:#})"),
                }
            }
        }
    }

    if cfg.openai_api_key.is_none() {
        println!("Tip: export OPENAI_API_KEY; agents stay unavailable without it");
    }

    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );

    Ok(())
}
