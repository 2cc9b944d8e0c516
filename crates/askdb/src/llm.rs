//! Chat-completion client for SQL generation, narration, refinement,
//! and judging, plus the SQL extraction helpers that pull candidate
//! statements out of model output.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }
}

/// Seam for tests and alternative providers; the pipeline only ever
/// talks to this trait.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> CoreResult<String>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

/// OpenAI-compatible `/v1/chat/completions` client.
pub struct HttpModelClient {
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpModelClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url,
            api_key,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> CoreResult<String> {
        debug!("LLM chat call ({} messages, model {})", messages.len(), model);
        let request = ChatCompletionRequest { model, messages, max_tokens, temperature, stream: false };

        let mut builder = self.http_client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CoreError::Model(format!("backend request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Model(format!("backend returned {}: {}", status, body)));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Model(format!("response parse failed: {}", e)))?;
        let content = completion
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(CoreError::Model("backend returned no choices".into()));
        }
        Ok(content)
    }
}

lazy_static! {
    static ref FENCED_SQL: Regex = Regex::new(r"(?s)```sql\s*(.*?)```").unwrap();
    static ref FENCED_ANY: Regex = Regex::new(r"(?s)```\s*(.*?)```").unwrap();
    static ref TRAILING_LIMIT: Regex = Regex::new(r"(?i)\blimit\s+(\d+)\s*;?\s*$").unwrap();
}

/// Pulls candidate SQL statements out of model output, fenced blocks
/// first, then bare SELECT/WITH lines. Order matters: the executor
/// keeps the first candidate that runs.
pub fn extract_sql_candidates(text: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    for capture in FENCED_SQL.captures_iter(text) {
        push_candidate(&mut candidates, &capture[1]);
    }
    for capture in FENCED_ANY.captures_iter(text) {
        let block = capture[1].trim();
        if looks_like_query(block) {
            push_candidate(&mut candidates, block);
        }
    }
    if candidates.is_empty() && looks_like_query(text.trim()) {
        push_candidate(&mut candidates, text.trim());
    }
    candidates
}

fn push_candidate(candidates: &mut Vec<String>, raw: &str) {
    let cleaned = raw.trim().trim_end_matches(';').trim().to_string();
    if !cleaned.is_empty() && !candidates.contains(&cleaned) {
        candidates.push(cleaned);
    }
}

pub fn looks_like_query(text: &str) -> bool {
    let lowered = text.trim_start().to_lowercase();
    lowered.starts_with("select") || lowered.starts_with("with")
}

/// A `LIMIT` the model wrote itself overrides the agent's `top_k` cap.
pub fn explicit_limit(sql: &str) -> Option<usize> {
    TRAILING_LIMIT
        .captures(sql.trim())
        .and_then(|c| c[1].parse().ok())
}

// ===== prompt builders =====

pub fn build_sql_prompt(
    dialect: &str,
    schema_snippet: &str,
    sample_rows: &str,
    history: &str,
    question: &str,
    top_k: i64,
) -> Vec<ChatMessage> {
    let mut system = format!(
        "You are a senior data analyst writing {dialect} SQL. \
         Answer with a single SQL query in a fenced ```sql block. \
         Query only tables listed in the schema. \
         Unless the question requires otherwise, return at most {top_k} rows.\n\n\
         Schema:\n{schema_snippet}\n"
    );
    if !sample_rows.is_empty() {
        system.push_str(&format!("\nSample rows:\n{sample_rows}\n"));
    }
    if !history.is_empty() {
        system.push_str(&format!("\nConversation context:\n{history}\n"));
    }
    vec![ChatMessage::system(system), ChatMessage::user(question.to_string())]
}

pub fn build_narration_prompt(question: &str, sql: &str, result_text: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You are a data analyst. Given a question, the SQL that was run, and its \
             result rows, write a short factual answer in the user's language. \
             Do not repeat the SQL.",
        ),
        ChatMessage::user(format!(
            "Question: {question}\n\nSQL:\n{sql}\n\nResult:\n{result_text}"
        )),
    ]
}

pub fn build_refine_prompt(question: &str, draft: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "Rewrite the draft answer for clarity and completeness. Keep every number \
             and fact unchanged. Reply with the rewritten answer only.",
        ),
        ChatMessage::user(format!("Question: {question}\n\nDraft answer:\n{draft}")),
    ]
}

pub fn build_schema_hint_prompt(question: &str, tables: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "Given a question and the available tables with their columns, name the \
             tables and columns most relevant to the question, in two or three lines.",
        ),
        ChatMessage::user(format!("Question: {question}\n\nTables:\n{tables}")),
    ]
}

pub fn build_judge_prompt(question: &str, sql: &str, answer: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You are grading a text-to-SQL exchange. Reply with JSON only: \
             {\"score\": <0-10>, \"verdict\": \"correct\"|\"partial\"|\"wrong\", \
             \"explanation\": \"...\"}.",
        ),
        ChatMessage::user(format!(
            "Question: {question}\n\nSQL:\n{sql}\n\nAnswer:\n{answer}"
        )),
    ]
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_fenced_sql_block() {
        let text = "Here you go:\n```sql\nSELECT COUNT(*) FROM orders;\n```\nDone.";
        let candidates = extract_sql_candidates(text);
        assert_eq!(candidates, vec!["SELECT COUNT(*) FROM orders"]);
    }

    #[test]
    fn test_extract_multiple_candidates_in_order() {
        let text = "```sql\nSELECT a FROM t\n```\nor maybe\n```sql\nSELECT b FROM t\n```";
        let candidates = extract_sql_candidates(text);
        assert_eq!(candidates, vec!["SELECT a FROM t", "SELECT b FROM t"]);
    }

    #[test]
    fn test_extract_plain_fence_with_select() {
        let text = "```\nWITH x AS (SELECT 1) SELECT * FROM x\n```";
        let candidates = extract_sql_candidates(text);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].starts_with("WITH"));
    }

    #[test]
    fn test_extract_bare_select() {
        let candidates = extract_sql_candidates("SELECT name FROM sales LIMIT 5");
        assert_eq!(candidates, vec!["SELECT name FROM sales LIMIT 5"]);
    }

    #[test]
    fn test_extract_nothing_from_prose() {
        assert!(extract_sql_candidates("I cannot answer that.").is_empty());
    }

    #[test]
    fn test_extract_dedupes_identical_blocks() {
        let text = "```sql\nSELECT 1\n```\n```sql\nSELECT 1\n```";
        assert_eq!(extract_sql_candidates(text).len(), 1);
    }

    #[test]
    fn test_explicit_limit() {
        assert_eq!(explicit_limit("SELECT * FROM t LIMIT 50"), Some(50));
        assert_eq!(explicit_limit("SELECT * FROM t LIMIT 50;"), Some(50));
        assert_eq!(explicit_limit("SELECT * FROM t"), None);
        // A LIMIT buried in a subquery is not a request for more rows.
        assert_eq!(
            explicit_limit("SELECT * FROM (SELECT * FROM t LIMIT 99) sub WHERE x > 1"),
            None
        );
    }

    #[test]
    fn test_sql_prompt_carries_context() {
        let messages = build_sql_prompt(
            "clickhouse",
            "sales(id, amount)",
            "id | amount\n1 | 2.0",
            "RECENT MESSAGES:\n[user] hi",
            "total sales?",
            10,
        );
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("clickhouse"));
        assert!(messages[0].content.contains("sales(id, amount)"));
        assert!(messages[0].content.contains("RECENT MESSAGES"));
        assert_eq!(messages[1].content, "total sales?");
    }
}
