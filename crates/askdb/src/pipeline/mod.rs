//! The question-to-answer pipeline: a fixed node graph over a
//! serialisable state bag, with conditional routing decided by node
//! outcomes.
//!
//! Routing:
//! validate_input → check_cache → (hit: history_capture → done)
//!               → history_retrieve → prepare_context
//!               → process_initial_context? → process_query
//!               → refine_response? → format_response
//!               → history_capture → cache_store
//!
//! Any `Fail` from a fatal node short-circuits to the error terminal,
//! which stamps `error_kind` into the state for the worker to persist.

pub mod nodes;
pub mod state;

pub use nodes::{AgentBundle, PipelineContext};
pub use state::{NodeOutcome, PipelineState};

use tracing::info;

use crate::error::ErrorKind;

pub async fn run_pipeline(ctx: &PipelineContext, mut state: PipelineState) -> PipelineState {
    if let NodeOutcome::Fail { kind, message } = ctx.validate_input(&mut state).await {
        return terminal_failure(state, kind, message);
    }

    ctx.check_cache(&mut state).await;
    if state.cache_hit {
        // A hit still records the exchange before finishing.
        ctx.history_capture(&mut state).await;
        return state;
    }

    ctx.history_retrieve(&mut state).await;

    if let NodeOutcome::Fail { kind, message } = ctx.prepare_context(&mut state).await {
        return terminal_failure(state, kind, message);
    }

    ctx.process_initial_context(&mut state).await;

    if let NodeOutcome::Fail { kind, message } = ctx.process_query(&mut state).await {
        return terminal_failure(state, kind, message);
    }

    ctx.refine_response(&mut state).await;
    ctx.format_response(&mut state);
    ctx.history_capture(&mut state).await;
    ctx.cache_store(&mut state).await;
    state
}

fn terminal_failure(mut state: PipelineState, kind: ErrorKind, message: String) -> PipelineState {
    info!("Pipeline failed ({}): {}", kind, message);
    state.error_kind = Some(kind);
    state.error_message = Some(message);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::connection::{sqlite::SqliteEngine, Engine};
    use crate::history::embedder::test_support::StubEmbedder;
    use crate::history::{EmbeddingJob, EmbeddingStore, HistoryConfig, HistoryService};
    use crate::llm::test_support::StubModelClient;
    use crate::registry::{category, ObjectRegistry};
    use crate::store::agents::NewAgent;
    use crate::store::MetaStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        store: Arc<MetaStore>,
        registry: Arc<ObjectRegistry>,
        cache: Arc<ResponseCache>,
        user_id: i64,
        agent_id: i64,
        session_id: i64,
        engine_ref: String,
        bundle_ref: String,
        history_ref: String,
        _embed_rx: mpsc::UnboundedReceiver<EmbeddingJob>,
    }

    impl Harness {
        fn state(&self) -> PipelineState {
            self.state_with_question("How many rows in orders?")
        }

        fn state_with_question(&self, question: &str) -> PipelineState {
            let mut state = PipelineState::new(question, self.user_id, self.agent_id);
            state.chat_session_id = Some(self.session_id);
            state.engine_ref = Some(self.engine_ref.clone());
            state.agent_bundle_ref = Some(self.bundle_ref.clone());
            state.history_ref = Some(self.history_ref.clone());
            state
        }
    }

    async fn build_harness(
        replies: Vec<&str>,
        tweak: impl FnOnce(&mut NewAgent),
    ) -> (Harness, PipelineContext) {
        let store = Arc::new(MetaStore::new_in_memory().unwrap());
        let registry = Arc::new(ObjectRegistry::new());
        let cache = Arc::new(ResponseCache::new(64, Duration::from_secs(3600)));

        let user = store.agents.create_user("u@x.com", "hash", "U").unwrap();
        let connection = store
            .agents
            .create_connection(
                user.id,
                crate::connection::ConnectionKind::Sqlite,
                &serde_json::json!({"dataset_id": "demo"}),
            )
            .unwrap();
        let mut new_agent = NewAgent { connection_id: connection.id, ..NewAgent::default() };
        tweak(&mut new_agent);
        let agent = store.agents.create_agent(user.id, new_agent).unwrap();
        let session = store.sessions.create_session(user.id, agent.id, "test chat").unwrap();

        // Seeded embedded target database.
        let engine = SqliteEngine::open_in_memory().unwrap();
        engine
            .execute(
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, amount REAL, region TEXT)",
            )
            .unwrap();
        engine.execute("INSERT INTO orders VALUES (1, 10.0, 'north'), (2, 5.5, 'south')").unwrap();
        engine.execute("CREATE TABLE internal_audit (id INTEGER PRIMARY KEY)").unwrap();
        let engine_ref = format!("conn-{}:v1", connection.id);
        registry.put_with_id(category::ENGINE, &engine_ref, Arc::new(Engine::Sqlite(engine)));

        let bundle_ref = registry.put(
            category::AGENT_BUNDLE,
            Arc::new(AgentBundle { agent: agent.clone(), engine_ref: engine_ref.clone() }),
        );

        let (embed_tx, embed_rx) = mpsc::unbounded_channel();
        let history = HistoryService::new(
            store.clone(),
            Arc::new(EmbeddingStore::new(store.pool())),
            Arc::new(StubEmbedder::new()),
            embed_tx,
            HistoryConfig {
                enabled: true,
                max_messages: 15,
                similarity_threshold: 0.3,
                model_version: "m1".into(),
            },
        );
        let history_ref = registry.put(category::HISTORY_SERVICE, Arc::new(history));

        let ctx = PipelineContext {
            store: store.clone(),
            registry: registry.clone(),
            cache: cache.clone(),
            llm: Arc::new(StubModelClient::with_replies(replies)),
        };
        let harness = Harness {
            store,
            registry,
            cache,
            user_id: user.id,
            agent_id: agent.id,
            session_id: session.id,
            engine_ref,
            bundle_ref,
            history_ref,
            _embed_rx: embed_rx,
        };
        (harness, ctx)
    }

    const COUNT_SQL_REPLY: &str = "```sql\nSELECT COUNT(*) FROM orders\n```";

    #[tokio::test]
    async fn test_cold_run_success() {
        let (harness, ctx) =
            build_harness(vec![COUNT_SQL_REPLY, "There are 2 orders."], |_| {}).await;

        let state = run_pipeline(&ctx, harness.state()).await;

        assert!(!state.failed());
        assert_eq!(state.sql_query.as_deref(), Some("SELECT COUNT(*) FROM orders"));
        assert_eq!(state.result_row_count, Some(1));
        assert!(state.execution_ms.is_some());

        let response = state.formatted_response.unwrap();
        assert!(response.starts_with("There are 2 orders."));
        assert!(response.contains("**SQL query used:**"));
        assert!(response.contains("```sql\nSELECT COUNT(*) FROM orders\n```"));
        assert!(response.contains("_Execution:"));
        assert!(response.contains("Rows: 1_"));

        // Exchange captured with dense sequence numbers.
        let messages = harness.store.sessions.recent_messages(harness.session_id, 10).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sequence_order, 1);
        assert_eq!(messages[1].sequence_order, 2);
        assert_eq!(messages[1].role, "assistant");
    }

    #[tokio::test]
    async fn test_empty_question_fails_fast() {
        let (harness, ctx) = build_harness(vec![], |_| {}).await;
        let state = run_pipeline(&ctx, harness.state_with_question("   ")).await;

        assert_eq!(state.error_kind, Some(ErrorKind::InvalidInput));
        // Nothing downstream ran.
        assert!(state.sql_query.is_none());
        assert!(state.formatted_response.is_none());
    }

    #[tokio::test]
    async fn test_foreign_agent_rejected() {
        let (harness, ctx) = build_harness(vec![], |_| {}).await;
        let stranger = harness.store.agents.create_user("s@x.com", "h", "S").unwrap();

        let mut state = harness.state();
        state.user_id = stranger.id;
        let state = run_pipeline(&ctx, state).await;
        assert_eq!(state.error_kind, Some(ErrorKind::InvalidInput));
    }

    #[tokio::test]
    async fn test_cache_hit_short_circuits_and_still_captures() {
        let (harness, ctx) =
            build_harness(vec![COUNT_SQL_REPLY, "There are 2 orders."], |_| {}).await;

        let first = run_pipeline(&ctx, harness.state()).await;
        assert!(!first.cache_hit);
        let first_response = first.formatted_response.clone().unwrap();

        // Second identical question: the exhausted stub would error on
        // any LLM call, so a pass proves the model was never consulted.
        let second = run_pipeline(&ctx, harness.state()).await;
        assert!(second.cache_hit);
        assert_eq!(second.formatted_response.as_deref(), Some(first_response.as_str()));
        assert_eq!(second.sql_query, first.sql_query);
        assert_eq!(second.execution_ms, Some(0));

        // The hit still recorded an exchange.
        let session = harness.store.sessions.get_session(harness.session_id).unwrap().unwrap();
        assert_eq!(session.total_messages, 4);
    }

    #[tokio::test]
    async fn test_whitespace_case_variant_hits_cache() {
        let (harness, ctx) =
            build_harness(vec![COUNT_SQL_REPLY, "There are 2 orders."], |_| {}).await;

        run_pipeline(&ctx, harness.state_with_question("How many rows in orders?")).await;
        let variant =
            run_pipeline(&ctx, harness.state_with_question("  how MANY rows   in orders? ")).await;
        assert!(variant.cache_hit);
    }

    #[tokio::test]
    async fn test_single_table_mode_scopes_schema_to_selected_table() {
        let (harness, ctx) = build_harness(
            vec!["```sql\nSELECT * FROM orders LIMIT 5\n```", "First five orders."],
            |agent| {
                agent.single_table_mode = true;
                agent.selected_table = Some("orders".into());
            },
        )
        .await;

        let state = run_pipeline(&ctx, harness.state_with_question("Show the 5 first orders")).await;
        assert!(!state.failed());

        let snippet = state.schema_snippet.unwrap();
        assert!(snippet.contains("orders("));
        // The catalog was never enumerated, so the other table cannot
        // appear in the prompt context.
        assert!(!snippet.contains("internal_audit"));
        assert!(state.sql_query.unwrap().contains("orders"));
    }

    #[tokio::test]
    async fn test_included_tables_filter_limits_schema() {
        let (harness, ctx) = build_harness(
            vec![COUNT_SQL_REPLY, "There are 2 orders."],
            |agent| agent.included_tables = "orders".into(),
        )
        .await;

        let state = run_pipeline(&ctx, harness.state()).await;
        let snippet = state.schema_snippet.unwrap();
        assert!(snippet.contains("orders("));
        assert!(!snippet.contains("internal_audit"));
    }

    #[tokio::test]
    async fn test_model_failure_is_model_error() {
        let (harness, mut ctx) = build_harness(vec![], |_| {}).await;
        ctx.llm = Arc::new(StubModelClient::failing());

        let state = run_pipeline(&ctx, harness.state()).await;
        assert_eq!(state.error_kind, Some(ErrorKind::ModelError));
    }

    #[tokio::test]
    async fn test_first_executing_candidate_wins() {
        let reply = "```sql\nSELECT nope FROM missing\n```\n\
                     ```sql\nSELECT COUNT(*) FROM orders\n```";
        let (harness, ctx) = build_harness(vec![reply, "Two orders."], |_| {}).await;

        let state = run_pipeline(&ctx, harness.state()).await;
        assert!(!state.failed());
        assert_eq!(state.sql_query.as_deref(), Some("SELECT COUNT(*) FROM orders"));
    }

    #[tokio::test]
    async fn test_all_candidates_failing_is_query_error() {
        let reply = "```sql\nSELECT nope FROM missing\n```";
        let (harness, ctx) = build_harness(vec![reply], |_| {}).await;

        let state = run_pipeline(&ctx, harness.state()).await;
        assert_eq!(state.error_kind, Some(ErrorKind::QueryError));
        assert!(state.error_message.is_some());
    }

    #[tokio::test]
    async fn test_top_k_caps_rows_unless_model_asks_for_more() {
        let (harness, ctx) = build_harness(
            vec!["```sql\nSELECT id FROM orders\n```", "Both orders."],
            |agent| agent.top_k = 1,
        )
        .await;
        let state = run_pipeline(&ctx, harness.state()).await;
        assert_eq!(state.result_row_count, Some(1));

        let (harness, ctx) = build_harness(
            vec!["```sql\nSELECT id FROM orders LIMIT 10\n```", "Both orders."],
            |agent| agent.top_k = 1,
        )
        .await;
        let state = run_pipeline(&ctx, harness.state()).await;
        assert_eq!(state.result_row_count, Some(2));
    }

    #[tokio::test]
    async fn test_history_contextualises_prompt() {
        let (harness, ctx) = build_harness(
            vec![
                COUNT_SQL_REPLY,
                "There are 2 orders.",
                "```sql\nSELECT SUM(amount) FROM orders\n```",
                "Total is 15.5.",
            ],
            |_| {},
        )
        .await;

        run_pipeline(&ctx, harness.state_with_question("How many rows in orders?")).await;
        let second = run_pipeline(&ctx, harness.state_with_question("and their total amount?")).await;

        assert!(second.has_history);
        assert!(second.relevant_history.contains("RECENT MESSAGES"));
        assert!(second.relevant_history.contains("How many rows in orders?"));
        assert!(!second.failed());
    }

    #[tokio::test]
    async fn test_missing_history_service_is_soft() {
        let (harness, ctx) =
            build_harness(vec![COUNT_SQL_REPLY, "There are 2 orders."], |_| {}).await;

        let mut state = harness.state();
        state.history_ref = None;
        let state = run_pipeline(&ctx, state).await;

        assert!(!state.failed());
        assert!(!state.has_history);
        assert!(state.formatted_response.is_some());
    }

    #[tokio::test]
    async fn test_refinement_rewrites_answer_when_enabled() {
        let (harness, ctx) = build_harness(
            vec![COUNT_SQL_REPLY, "raw answer", "Polished: there are exactly 2 orders."],
            |agent| agent.refinement_enabled = true,
        )
        .await;

        let state = run_pipeline(&ctx, harness.state()).await;
        assert!(state
            .formatted_response
            .unwrap()
            .starts_with("Polished: there are exactly 2 orders."));
    }

    #[tokio::test]
    async fn test_processing_flag_adds_schema_hint_call() {
        let (harness, ctx) = build_harness(
            vec!["Use orders(amount).", COUNT_SQL_REPLY, "There are 2 orders."],
            |agent| agent.processing_enabled = true,
        )
        .await;

        let state = run_pipeline(&ctx, harness.state()).await;
        assert!(!state.failed());
        assert_eq!(state.schema_hint.as_deref(), Some("Use orders(amount)."));
    }

    #[tokio::test]
    async fn test_failure_skips_capture_and_cache() {
        let (harness, mut ctx) = build_harness(vec![], |_| {}).await;
        ctx.llm = Arc::new(StubModelClient::failing());

        run_pipeline(&ctx, harness.state()).await;

        let session = harness.store.sessions.get_session(harness.session_id).unwrap().unwrap();
        assert_eq!(session.total_messages, 0);
        assert_eq!(harness.cache.len(harness.agent_id), 0);
    }
}
