//! Pipeline nodes. Fatal nodes abort to the error terminal; soft nodes
//! absorb their failures and let the run continue.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::connection::{filter_tables, Engine};
use crate::error::ErrorKind;
use crate::history::HistoryService;
use crate::llm::{
    build_narration_prompt, build_refine_prompt, build_schema_hint_prompt, build_sql_prompt,
    explicit_limit, extract_sql_candidates, ModelClient,
};
use crate::pipeline::state::{NodeOutcome, PipelineState};
use crate::registry::{category, ObjectRegistry};
use crate::store::{AgentRecord, MetaStore};

/// How many tables the schema snippet describes before eliding.
const SCHEMA_TABLE_CAP: usize = 20;
/// Sample depth per table.
const SAMPLE_ROWS: usize = 5;
/// Candidate SQL statements tried before giving up.
const CANDIDATE_CAP: usize = 3;

/// The constructed per-(agent, connection version) bundle resolved
/// through the object registry: the agent snapshot plus the id of the
/// engine it runs against.
pub struct AgentBundle {
    pub agent: AgentRecord,
    pub engine_ref: String,
}

/// Shared collaborators every node can reach.
pub struct PipelineContext {
    pub store: Arc<MetaStore>,
    pub registry: Arc<ObjectRegistry>,
    pub cache: Arc<ResponseCache>,
    pub llm: Arc<dyn ModelClient>,
}

impl PipelineContext {
    fn bundle(&self, state: &PipelineState) -> Option<Arc<AgentBundle>> {
        let bundle_ref = state.agent_bundle_ref.as_deref()?;
        self.registry.get::<AgentBundle>(category::AGENT_BUNDLE, bundle_ref).ok()
    }

    fn engine(&self, state: &PipelineState) -> Option<Arc<Engine>> {
        let engine_ref = state.engine_ref.as_deref()?;
        self.registry.get::<Engine>(category::ENGINE, engine_ref).ok()
    }

    fn history(&self, state: &PipelineState) -> Option<Arc<HistoryService>> {
        let history_ref = state.history_ref.as_deref()?;
        self.registry.get::<HistoryService>(category::HISTORY_SERVICE, history_ref).ok()
    }

    // ===== 1. validate_input (fatal) =====

    pub async fn validate_input(&self, state: &mut PipelineState) -> NodeOutcome {
        if state.user_input.trim().is_empty() {
            return NodeOutcome::fail(ErrorKind::InvalidInput, "question is empty");
        }
        let agent = match self.store.agents.get_agent(state.agent_id) {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                return NodeOutcome::fail(
                    ErrorKind::InvalidInput,
                    format!("unknown agent: {}", state.agent_id),
                )
            }
            Err(e) => return NodeOutcome::fail(ErrorKind::InternalError, e.to_string()),
        };
        if agent.owner_user_id != state.user_id {
            return NodeOutcome::fail(ErrorKind::InvalidInput, "agent not owned by user");
        }
        NodeOutcome::Continue
    }

    // ===== 2. check_cache (soft) =====

    pub async fn check_cache(&self, state: &mut PipelineState) -> NodeOutcome {
        let Some(bundle) = self.bundle(state) else {
            return NodeOutcome::Skip;
        };
        let fingerprint = ResponseCache::fingerprint(
            &state.user_input,
            state.agent_id,
            bundle.agent.schema_version,
        );
        state.fingerprint = Some(fingerprint.clone());

        if let Some(hit) = self.cache.get(state.agent_id, &fingerprint) {
            info!("Cache hit for agent {} run {:?}", state.agent_id, state.run_id);
            state.cache_hit = true;
            state.formatted_response = Some(hit.formatted_response);
            state.sql_query = hit.sql_query;
            state.execution_ms = Some(0);
        }
        NodeOutcome::Continue
    }

    // ===== 3. history_retrieve (soft) =====

    pub async fn history_retrieve(&self, state: &mut PipelineState) -> NodeOutcome {
        let Some(history) = self.history(state) else {
            state.relevant_history = String::new();
            state.has_history = false;
            return NodeOutcome::Skip;
        };
        if !history.is_enabled() || state.chat_session_id.is_none() {
            state.relevant_history = String::new();
            state.has_history = false;
            return NodeOutcome::Skip;
        }

        let retrieved = history
            .relevant(state.user_id, state.agent_id, &state.user_input, state.chat_session_id)
            .await;
        state.relevant_history = history.render(&retrieved);
        state.has_history = !state.relevant_history.is_empty();
        debug!("History retrieval: {} chars", state.relevant_history.len());
        NodeOutcome::Continue
    }

    // ===== 4. prepare_context (fatal) =====

    pub async fn prepare_context(&self, state: &mut PipelineState) -> NodeOutcome {
        let Some(bundle) = self.bundle(state) else {
            return NodeOutcome::fail(ErrorKind::InternalError, "agent bundle not resolved");
        };
        let Some(engine) = self.engine(state) else {
            return NodeOutcome::fail(ErrorKind::ConnectError, "engine not resolved");
        };
        let agent = &bundle.agent;

        // Single-table agents never enumerate the catalog; the selected
        // table is the whole scope.
        let tables: Vec<String> = if agent.single_table_mode {
            match &agent.selected_table {
                Some(table) => vec![table.clone()],
                None => {
                    return NodeOutcome::fail(
                        ErrorKind::SchemaError,
                        "single_table_mode without selected_table",
                    )
                }
            }
        } else {
            match engine.list_tables().await {
                Ok(all) => filter_tables(all, &agent.included_tables),
                Err(e) => return NodeOutcome::fail(ErrorKind::SchemaError, e.to_string()),
            }
        };
        if tables.is_empty() {
            return NodeOutcome::fail(ErrorKind::SchemaError, "no tables in scope");
        }

        let mut snippet = String::new();
        for table in tables.iter().take(SCHEMA_TABLE_CAP) {
            match engine.columns(table).await {
                Ok(columns) => {
                    let described: Vec<String> = columns
                        .iter()
                        .map(|c| format!("{} {}", c.name, c.data_type))
                        .collect();
                    snippet.push_str(&format!("{}({})\n", table, described.join(", ")));
                }
                Err(e) => return NodeOutcome::fail(ErrorKind::SchemaError, e.to_string()),
            }
        }
        if tables.len() > SCHEMA_TABLE_CAP {
            snippet.push_str(&format!("... and {} more tables\n", tables.len() - SCHEMA_TABLE_CAP));
        }

        // A small sample of the first table anchors the model on real
        // values; failure to sample is survivable.
        match engine.sample(&tables[0], SAMPLE_ROWS).await {
            Ok(rows) if !rows.is_empty() => {
                state.sample_rows = Some(format!("{}:\n{}", tables[0], rows.render_text()));
            }
            Ok(_) => {}
            Err(e) => warn!("Sample of {} failed: {}", tables[0], e),
        }

        state.connection_kind = Some(engine.dialect());
        state.schema_snippet = Some(snippet);
        NodeOutcome::Continue
    }

    // ===== 5. process_initial_context (soft, gated) =====

    pub async fn process_initial_context(&self, state: &mut PipelineState) -> NodeOutcome {
        let Some(bundle) = self.bundle(state) else {
            return NodeOutcome::Skip;
        };
        if !bundle.agent.processing_enabled {
            return NodeOutcome::Skip;
        }
        let Some(schema) = state.schema_snippet.clone() else {
            return NodeOutcome::Skip;
        };

        let messages = build_schema_hint_prompt(&state.user_input, &schema);
        match self.llm.chat(&bundle.agent.model_id, &messages, 256, 0.2).await {
            Ok(hint) => {
                debug!("Schema hint: {}", hint);
                state.schema_hint = Some(hint);
                NodeOutcome::Continue
            }
            Err(e) => {
                warn!("Schema-hint call failed, continuing without: {}", e);
                NodeOutcome::Skip
            }
        }
    }

    // ===== 6. process_query (fatal) =====

    pub async fn process_query(&self, state: &mut PipelineState) -> NodeOutcome {
        let Some(bundle) = self.bundle(state) else {
            return NodeOutcome::fail(ErrorKind::InternalError, "agent bundle not resolved");
        };
        let Some(engine) = self.engine(state) else {
            return NodeOutcome::fail(ErrorKind::ConnectError, "engine not resolved");
        };
        let agent = &bundle.agent;

        let mut schema = state.schema_snippet.clone().unwrap_or_default();
        if let Some(hint) = &state.schema_hint {
            schema.push_str(&format!("\nFocus: {}\n", hint));
        }
        let messages = build_sql_prompt(
            engine.dialect().as_str(),
            &schema,
            state.sample_rows.as_deref().unwrap_or(""),
            &state.relevant_history,
            &state.user_input,
            agent.top_k,
        );

        let reply = match self.llm.chat(&agent.model_id, &messages, 1024, 0.1).await {
            Ok(reply) => reply,
            Err(e) => return NodeOutcome::fail(ErrorKind::ModelError, e.to_string()),
        };
        let candidates = extract_sql_candidates(&reply);
        if candidates.is_empty() {
            return NodeOutcome::fail(ErrorKind::ModelError, "model produced no SQL statement");
        }

        // First candidate that executes wins.
        let mut last_error = String::new();
        let mut executed = None;
        for candidate in candidates.into_iter().take(CANDIDATE_CAP) {
            let row_cap = explicit_limit(&candidate).unwrap_or(agent.top_k as usize);
            let started = Instant::now();
            match engine.execute(&candidate, Some(row_cap)).await {
                Ok(rows) => {
                    executed = Some((candidate, rows, started.elapsed().as_millis() as i64));
                    break;
                }
                Err(e) => {
                    warn!("Candidate SQL failed: {}", e);
                    last_error = e.to_string();
                }
            }
        }
        let Some((sql, rows, elapsed_ms)) = executed else {
            return NodeOutcome::fail(ErrorKind::QueryError, last_error);
        };

        state.result_row_count = Some(rows.len() as i64);
        state.execution_ms = Some(elapsed_ms);

        // Narration is part of the answer but its failure only costs
        // polish, not the run.
        let result_text = rows.render_text();
        let narration = build_narration_prompt(&state.user_input, &sql, &result_text);
        state.narrative = match self.llm.chat(&agent.model_id, &narration, 512, 0.3).await {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) => {
                warn!("Narration call failed, using tabular answer: {}", e);
                Some(format!("Query returned {} row(s):\n{}", rows.len(), result_text))
            }
        };
        state.sql_query = Some(sql);
        state.result_rows = Some(rows);
        NodeOutcome::Continue
    }

    // ===== 7. refine_response (soft, gated) =====

    pub async fn refine_response(&self, state: &mut PipelineState) -> NodeOutcome {
        let Some(bundle) = self.bundle(state) else {
            return NodeOutcome::Skip;
        };
        if !bundle.agent.refinement_enabled {
            return NodeOutcome::Skip;
        }
        let Some(draft) = state.narrative.clone() else {
            return NodeOutcome::Skip;
        };

        let messages = build_refine_prompt(&state.user_input, &draft);
        match self.llm.chat(&bundle.agent.model_id, &messages, 512, 0.3).await {
            Ok(refined) => {
                state.narrative = Some(refined.trim().to_string());
                NodeOutcome::Continue
            }
            Err(e) => {
                warn!("Refinement call failed, keeping draft: {}", e);
                NodeOutcome::Skip
            }
        }
    }

    // ===== 8. format_response (deterministic) =====

    /// Stable template: narrative, separator, fenced SQL, metadata
    /// markers. The frontend splits on these markers to separate prose
    /// from SQL, so the shape must not drift.
    pub fn format_response(&self, state: &mut PipelineState) -> NodeOutcome {
        let narrative = state.narrative.clone().unwrap_or_default();
        let mut response = narrative.trim().to_string();

        if let Some(sql) = &state.sql_query {
            response.push_str(&format!("\n\n---\n\n**SQL query used:**\n\n```sql\n{}\n```", sql));
        }
        if let (Some(ms), Some(count)) = (state.execution_ms, state.result_row_count) {
            response.push_str(&format!("\n\n_Execution: {} ms · Rows: {}_", ms, count));
        }

        state.formatted_response = Some(response);
        NodeOutcome::Continue
    }

    // ===== 9. history_capture (soft) =====

    pub async fn history_capture(&self, state: &mut PipelineState) -> NodeOutcome {
        let Some(history) = self.history(state) else {
            return NodeOutcome::Skip;
        };
        if !history.is_enabled() {
            return NodeOutcome::Skip;
        }
        let Some(session_id) = state.chat_session_id else {
            return NodeOutcome::Skip;
        };
        let Some(response) = state.formatted_response.clone() else {
            return NodeOutcome::Skip;
        };

        match history.capture(
            session_id,
            state.run_id,
            &state.user_input,
            &response,
            state.sql_query.as_deref(),
        ) {
            Ok(_) => NodeOutcome::Continue,
            Err(e) => {
                warn!("History capture failed (run continues): {}", e);
                NodeOutcome::Skip
            }
        }
    }

    // ===== 10. cache_store (soft) =====

    pub async fn cache_store(&self, state: &mut PipelineState) -> NodeOutcome {
        if state.cache_hit {
            return NodeOutcome::Skip;
        }
        let (Some(fingerprint), Some(response)) =
            (state.fingerprint.clone(), state.formatted_response.clone())
        else {
            return NodeOutcome::Skip;
        };
        self.cache.put(state.agent_id, fingerprint, response, state.sql_query.clone());
        NodeOutcome::Continue
    }
}
