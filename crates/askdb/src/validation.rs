//! Validation harness: on-demand scoring of terminal runs by a judge
//! model. Optional path; nothing in the execution pipeline depends on
//! it.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::llm::{build_judge_prompt, ModelClient};
use crate::store::{MetaStore, RunStatus};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationOutcome {
    pub run_id: i64,
    pub score: f64,
    pub verdict: String,
    pub explanation: String,
}

#[derive(Debug, Deserialize)]
struct JudgeReply {
    score: f64,
    verdict: String,
    #[serde(default)]
    explanation: String,
}

pub struct ValidationHarness {
    store: Arc<MetaStore>,
    llm: Arc<dyn ModelClient>,
    judge_model: String,
}

impl ValidationHarness {
    pub fn new(store: Arc<MetaStore>, llm: Arc<dyn ModelClient>, judge_model: String) -> Self {
        Self { store, llm, judge_model }
    }

    pub async fn score_run(&self, run_id: i64) -> CoreResult<ValidationOutcome> {
        let run = self
            .store
            .runs
            .get(run_id)?
            .ok_or(CoreError::NotFound { category: "run", id: run_id.to_string() })?;
        if run.status != RunStatus::Success {
            return Err(CoreError::InvalidInput(format!(
                "run {} is {}, only successful runs are scored",
                run_id, run.status
            )));
        }

        let sql = run.sql_used.as_deref().unwrap_or("");
        let answer = run.result_data.as_deref().unwrap_or("");
        let messages = build_judge_prompt(&run.question, sql, answer);
        let reply = self.llm.chat(&self.judge_model, &messages, 512, 0.0).await?;
        let parsed = parse_judge_reply(&reply)?;

        let outcome = ValidationOutcome {
            run_id,
            score: parsed.score.clamp(0.0, 10.0),
            verdict: parsed.verdict,
            explanation: parsed.explanation,
        };
        self.store.runs.record_validation(
            run_id,
            &self.judge_model,
            outcome.score,
            &outcome.verdict,
            &outcome.explanation,
        )?;
        info!("Run {} judged {} ({:.1})", run_id, outcome.verdict, outcome.score);
        Ok(outcome)
    }

    /// Scores a batch; individual failures are reported, not fatal.
    pub async fn score_many(&self, run_ids: &[i64]) -> Vec<CoreResult<ValidationOutcome>> {
        let mut outcomes = Vec::with_capacity(run_ids.len());
        for &run_id in run_ids {
            let result = self.score_run(run_id).await;
            if let Err(e) = &result {
                warn!("Scoring run {} failed: {}", run_id, e);
            }
            outcomes.push(result);
        }
        outcomes
    }
}

/// Judges are told to reply with bare JSON but routinely wrap it in a
/// fence anyway.
fn parse_judge_reply(reply: &str) -> CoreResult<JudgeReply> {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    serde_json::from_str(body)
        .map_err(|e| CoreError::Model(format!("judge reply was not valid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_support::StubModelClient;
    use crate::store::agents::test_fixtures::seed_user_agent;
    use crate::store::RunOutcome;

    fn successful_run(store: &MetaStore) -> i64 {
        let (user_id, _, agent_id) = seed_user_agent(store);
        let run = store.runs.create(agent_id, user_id, None, "how many orders?").unwrap();
        store.runs.mark_running(run.id).unwrap();
        store
            .runs
            .finalize_success(
                run.id,
                &RunOutcome {
                    sql_used: Some("SELECT COUNT(*) FROM orders".into()),
                    result_data: "There are 42 orders.".into(),
                    execution_ms: 10,
                    result_rows_count: 1,
                },
            )
            .unwrap();
        run.id
    }

    #[tokio::test]
    async fn test_score_run_parses_and_persists() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let run_id = successful_run(&store);
        let llm = Arc::new(StubModelClient::with_replies(vec![
            r#"{"score": 8.5, "verdict": "correct", "explanation": "count matches"}"#,
        ]));
        let harness = ValidationHarness::new(store, llm, "gpt-4o".into());

        let outcome = harness.score_run(run_id).await.unwrap();
        assert_eq!(outcome.score, 8.5);
        assert_eq!(outcome.verdict, "correct");
    }

    #[tokio::test]
    async fn test_score_clamped_to_range() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let run_id = successful_run(&store);
        let llm = Arc::new(StubModelClient::with_replies(vec![
            r#"{"score": 99, "verdict": "correct"}"#,
        ]));
        let harness = ValidationHarness::new(store, llm, "gpt-4o".into());

        assert_eq!(harness.score_run(run_id).await.unwrap().score, 10.0);
    }

    #[tokio::test]
    async fn test_fenced_judge_reply_accepted() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let run_id = successful_run(&store);
        let llm = Arc::new(StubModelClient::with_replies(vec![
            "```json\n{\"score\": 4, \"verdict\": \"partial\", \"explanation\": \"x\"}\n```",
        ]));
        let harness = ValidationHarness::new(store, llm, "gpt-4o".into());

        assert_eq!(harness.score_run(run_id).await.unwrap().verdict, "partial");
    }

    #[tokio::test]
    async fn test_non_terminal_run_rejected() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let (user_id, _, agent_id) = seed_user_agent(&store);
        let run = store.runs.create(agent_id, user_id, None, "q").unwrap();
        let llm = Arc::new(StubModelClient::with_replies(vec![]));
        let harness = ValidationHarness::new(store, llm, "gpt-4o".into());

        assert!(matches!(
            harness.score_run(run.id).await.unwrap_err(),
            CoreError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn test_score_many_isolates_failures() {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let good = successful_run(&store);
        let llm = Arc::new(StubModelClient::with_replies(vec![
            r#"{"score": 7, "verdict": "correct"}"#,
        ]));
        let harness = ValidationHarness::new(store, llm, "gpt-4o".into());

        let outcomes = harness.score_many(&[good, 99999]).await;
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_err());
    }
}
