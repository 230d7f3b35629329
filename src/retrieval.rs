use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float32Type, Float64Type};
use arrow_array::{Array, ArrayRef, RecordBatch};
use arrow_ipc::reader::FileReader;
use arrow_schema::DataType;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::provider::Embedder;

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub source: String,
    pub text: String,
    pub score: f32,
}

/// Semantic search over one domain corpus. Chunks come back best first.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    fn backend_name(&self) -> &'static str;
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<RetrievedChunk>>;
}

pub struct LocalCorpusKnowledgeSource {
    pub chunks: Vec<RetrievedChunk>,
}

const CORPUS_EXTENSIONS: &[&str] = &["txt", "md"];

fn corpus_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = std::fs::read_dir(path)
        .with_context(|| format!("failed to read knowledge corpus directory '{}'", path.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| {
            format!("failed to list knowledge corpus directory '{}'", path.display())
        })?;
        let file = entry.path();
        let supported = file
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| CORPUS_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if file.is_file() && supported {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

pub fn load_corpus_chunks(path: &Path) -> Result<Vec<RetrievedChunk>> {
    let mut chunks = Vec::new();
    for file in corpus_files(path)? {
        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read corpus document '{}'", file.display()))?;
        chunks.extend(
            content
                .split("\n\n")
                .map(str::trim)
                .filter(|chunk| !chunk.is_empty())
                .enumerate()
                .map(|(index, text)| RetrievedChunk {
                    source: format!("{}#{}", file.display(), index + 1),
                    text: text.to_string(),
                    score: 0.0,
                }),
        );
    }
    Ok(chunks)
}

pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .filter(|token| token.len() > 2)
        .collect::<Vec<String>>()
}

impl LocalCorpusKnowledgeSource {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            chunks: load_corpus_chunks(path)?,
        })
    }
}

#[async_trait]
impl KnowledgeSource for LocalCorpusKnowledgeSource {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<RetrievedChunk>> {
        let terms = query_terms(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let body = chunk.text.to_ascii_lowercase();
                let hits = terms
                    .iter()
                    .map(|term| body.matches(term.as_str()).count())
                    .sum::<usize>();
                (hits > 0).then(|| RetrievedChunk {
                    source: chunk.source.clone(),
                    text: chunk.text.clone(),
                    score: hits as f32,
                })
            })
            .collect::<Vec<RetrievedChunk>>();

        // Stable sort keeps corpus order for equal scores.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit.max(1));
        Ok(scored)
    }
}

/// Hybrid (vector + full text) search against a LanceDB Cloud table.
pub struct LanceKnowledgeSource {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    table: String,
    embedder: Arc<dyn Embedder>,
}

/// `db://name` is the LanceDB Cloud shorthand; anything else is used as a base URL.
pub fn lance_endpoint(url: &str, region: &str) -> String {
    match url.strip_prefix("db://") {
        Some(name) => format!(
            "https://{}.{}.api.lancedb.com",
            name.trim_end_matches('/'),
            region
        ),
        None => url.trim_end_matches('/').to_string(),
    }
}

impl LanceKnowledgeSource {
    pub fn new(
        client: reqwest::Client,
        url: &str,
        region: &str,
        api_key: impl Into<String>,
        table: impl Into<String>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            client,
            endpoint: lance_endpoint(url, region),
            api_key: api_key.into(),
            table: table.into(),
            embedder,
        }
    }

    pub fn query_url(&self) -> String {
        format!("{}/v1/table/{}/query/", self.endpoint, self.table)
    }
}

#[derive(Serialize)]
struct LanceQuery<'a> {
    vector: Vec<f32>,
    k: usize,
    full_text_query: LanceFullTextQuery<'a>,
}

#[derive(Serialize)]
struct LanceFullTextQuery<'a> {
    query: &'a str,
    columns: [&'static str; 1],
}

#[async_trait]
impl KnowledgeSource for LanceKnowledgeSource {
    fn backend_name(&self) -> &'static str {
        "lance"
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<RetrievedChunk>> {
        let vector = self
            .embedder
            .embed(text)
            .await
            .context("failed to embed knowledge query")?;

        let response = self
            .client
            .post(self.query_url())
            .header("x-api-key", &self.api_key)
            .header(reqwest::header::ACCEPT, "application/vnd.apache.arrow.file")
            .json(&LanceQuery {
                vector,
                k: limit.max(1),
                full_text_query: LanceFullTextQuery {
                    query: text,
                    columns: ["payload"],
                },
            })
            .send()
            .await
            .with_context(|| format!("failed to query LanceDB table '{}'", self.table))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "LanceDB query on table '{}' failed with status {status}: {body}",
                self.table
            ));
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("failed to read LanceDB reply for table '{}'", self.table))?;
        let mut chunks = decode_lance_ipc(&self.table, &body)?;
        chunks.truncate(limit.max(1));
        Ok(chunks)
    }
}

/// Query replies are an Arrow IPC file; each batch carries the result rows.
pub fn decode_lance_ipc(table: &str, body: &[u8]) -> Result<Vec<RetrievedChunk>> {
    let reader = FileReader::try_new(Cursor::new(body), None)
        .with_context(|| format!("failed to open LanceDB Arrow reply for table '{table}'"))?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(
            batch.with_context(|| format!("failed to read LanceDB rows for table '{table}'"))?,
        );
    }
    Ok(decode_lance_batches(table, &batches))
}

fn string_at(column: Option<&ArrayRef>, row: usize) -> Option<&str> {
    let column = column?;
    if column.is_null(row) {
        return None;
    }
    match column.data_type() {
        DataType::Utf8 => Some(column.as_string::<i32>().value(row)),
        DataType::LargeUtf8 => Some(column.as_string::<i64>().value(row)),
        _ => None,
    }
}

fn float_at(column: Option<&ArrayRef>, row: usize) -> Option<f64> {
    let column = column?;
    if column.is_null(row) {
        return None;
    }
    match column.data_type() {
        DataType::Float32 => Some(f64::from(column.as_primitive::<Float32Type>().value(row))),
        DataType::Float64 => Some(column.as_primitive::<Float64Type>().value(row)),
        _ => None,
    }
}

/// Rows either carry a `payload` JSON string (name/content) or plain
/// `name`/`content` columns. Hybrid queries score by `_relevance_score`,
/// vector queries by `_distance`.
pub fn decode_lance_batches(table: &str, batches: &[RecordBatch]) -> Vec<RetrievedChunk> {
    let mut chunks = Vec::new();
    let mut index = 0usize;

    for batch in batches {
        let payload = batch.column_by_name("payload");
        let content = batch.column_by_name("content");
        let name = batch.column_by_name("name");
        let relevance = batch.column_by_name("_relevance_score");
        let distance = batch.column_by_name("_distance");

        for row in 0..batch.num_rows() {
            index += 1;
            let parsed = string_at(payload, row)
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
            let (text, source_name) = match &parsed {
                Some(fields) => (
                    fields.get("content").and_then(Value::as_str),
                    fields.get("name").and_then(Value::as_str),
                ),
                None => (string_at(content, row), string_at(name, row)),
            };

            let Some(text) = text.map(str::trim).filter(|text| !text.is_empty()) else {
                continue;
            };
            let score = float_at(relevance, row)
                .or_else(|| float_at(distance, row).map(|d| 1.0 / (1.0 + d)))
                .unwrap_or(0.0) as f32;

            chunks.push(RetrievedChunk {
                source: match source_name {
                    Some(source_name) => format!("{table}:{source_name}"),
                    None => format!("{table}:row-{index}"),
                },
                text: text.to_string(),
                score,
            });
        }
    }
    chunks
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalPolicy {
    pub max_chunks: usize,
    pub max_chars: usize,
}

pub async fn augment_prompt_with_knowledge(
    knowledge: &dyn KnowledgeSource,
    prompt: &str,
    policy: RetrievalPolicy,
) -> Result<String> {
    let chunks = knowledge.query(prompt, policy.max_chunks).await?;
    Ok(render_context(prompt, chunks, policy.max_chars))
}

pub fn render_context(prompt: &str, chunks: Vec<RetrievedChunk>, max_chars: usize) -> String {
    let mut used_chars = 0usize;
    let mut kept = Vec::new();

    for chunk in chunks {
        if used_chars >= max_chars {
            break;
        }

        let remaining = max_chars - used_chars;
        let text = truncate_chars(&chunk.text, remaining);
        if text.trim().is_empty() {
            continue;
        }

        used_chars += text.chars().count();
        kept.push(RetrievedChunk { text, ..chunk });
    }

    if kept.is_empty() {
        return prompt.to_string();
    }

    let mut out = String::new();
    out.push_str("Retrieved context from the standards documents:\n");
    for (index, chunk) in kept.iter().enumerate() {
        out.push_str(&format!(
            "[{}] {} (score={:.3})\n{}\n",
            index + 1,
            chunk.source,
            chunk.score,
            chunk.text
        ));
    }
    out.push_str("\nQuestion:\n");
    out.push_str(prompt);
    out
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
