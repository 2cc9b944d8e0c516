//! The serialisable state bag that flows through the node graph.
//!
//! Live resources never appear here; the `*_ref` fields are opaque
//! object-registry ids that only resolve inside the worker process.

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionKind, Rows};
use crate::error::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    // Required inputs
    pub user_input: String,
    pub user_id: i64,
    pub agent_id: i64,

    // Identity / routing
    pub run_id: Option<i64>,
    pub chat_session_id: Option<i64>,
    pub connection_kind: Option<ConnectionKind>,
    pub connection_id: Option<i64>,

    // Registry references
    pub engine_ref: Option<String>,
    pub agent_bundle_ref: Option<String>,
    pub history_ref: Option<String>,

    // Cache
    pub fingerprint: Option<String>,
    pub cache_hit: bool,

    // History
    pub relevant_history: String,
    pub has_history: bool,

    // Context
    pub schema_snippet: Option<String>,
    pub sample_rows: Option<String>,
    pub schema_hint: Option<String>,

    // Query execution
    pub sql_query: Option<String>,
    pub result_rows: Option<Rows>,
    pub result_row_count: Option<i64>,
    pub execution_ms: Option<i64>,

    // Output
    pub narrative: Option<String>,
    pub formatted_response: Option<String>,

    // Failure terminal
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl PipelineState {
    pub fn new(user_input: impl Into<String>, user_id: i64, agent_id: i64) -> Self {
        Self {
            user_input: user_input.into(),
            user_id,
            agent_id,
            run_id: None,
            chat_session_id: None,
            connection_kind: None,
            connection_id: None,
            engine_ref: None,
            agent_bundle_ref: None,
            history_ref: None,
            fingerprint: None,
            cache_hit: false,
            relevant_history: String::new(),
            has_history: false,
            schema_snippet: None,
            sample_rows: None,
            schema_hint: None,
            sql_query: None,
            result_rows: None,
            result_row_count: None,
            execution_ms: None,
            narrative: None,
            formatted_response: None,
            error_kind: None,
            error_message: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error_kind.is_some()
    }
}

/// What a node hands back to the dispatcher. Soft nodes return `Skip`
/// instead of failing; only fatal nodes produce `Fail`.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Continue,
    Skip,
    Fail { kind: ErrorKind, message: String },
}

impl NodeOutcome {
    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        NodeOutcome::Fail { kind, message: message.into() }
    }
}
