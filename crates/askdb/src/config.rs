use anyhow::Result;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

/// Hard ceiling for the per-run budget. Large analytical tables may need
/// hours, but nothing is allowed to hold a worker slot longer than this.
pub const RUN_TIMEOUT_CEILING_SECONDS: u64 = 7200;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub datasets_dir: String,
    pub api_host: String,
    pub api_port: u16,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub embedder_base_url: String,
    pub embedding_model: String,
    pub history_enabled: bool,
    pub history_max_messages: usize,
    pub history_similarity_threshold: f32,
    pub history_cache_ttl_seconds: u64,
    pub worker_count: usize,
    pub worker_concurrency: usize,
    pub queue_capacity: usize,
    pub broker_url: String,
    pub result_backend_url: String,
    pub run_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub cache_capacity: usize,
    pub cache_ttl_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("No .env file loaded: {}. Using system environment variables.", e);
        }

        let worker_count = match env::var("WORKER_COUNT").as_deref() {
            Ok("auto") | Err(_) => Self::auto_detect_worker_count(),
            Ok(v) => v.parse().unwrap_or(2),
        };
        let worker_concurrency = env::var("WORKER_CONCURRENCY")
            .unwrap_or_else(|_| "4".into())
            .parse()
            .unwrap_or(4);

        let run_timeout_seconds: u64 = env::var("RUN_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "120".into())
            .parse()
            .unwrap_or(120);
        let run_timeout_seconds = if run_timeout_seconds > RUN_TIMEOUT_CEILING_SECONDS {
            warn!(
                "RUN_TIMEOUT_SECONDS {} exceeds ceiling, clamping to {}",
                run_timeout_seconds, RUN_TIMEOUT_CEILING_SECONDS
            );
            RUN_TIMEOUT_CEILING_SECONDS
        } else {
            run_timeout_seconds
        };

        let llm_base_url =
            env::var("LLM_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8081".into());

        Ok(Self {
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "./data/askdb.db".into()),
            datasets_dir: env::var("DATASETS_DIR").unwrap_or_else(|_| "./data/datasets".into()),
            api_host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            api_port: env::var("API_PORT").unwrap_or_else(|_| "8000".into()).parse()?,
            embedder_base_url: env::var("EMBEDDER_BASE_URL")
                .unwrap_or_else(|_| llm_base_url.clone()),
            llm_base_url,
            llm_api_key: env::var("LLM_API_KEY").ok(),
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".into()),
            history_enabled: env::var("HISTORY_ENABLED")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(true),
            history_max_messages: env::var("HISTORY_MAX_MESSAGES")
                .unwrap_or_else(|_| "15".into())
                .parse()
                .unwrap_or(15),
            history_similarity_threshold: env::var("HISTORY_SIMILARITY_THRESHOLD")
                .unwrap_or_else(|_| "0.75".into())
                .parse()
                .unwrap_or(0.75),
            history_cache_ttl_seconds: env::var("HISTORY_CACHE_TTL")
                .unwrap_or_else(|_| "3600".into())
                .parse()
                .unwrap_or(3600),
            worker_count,
            worker_concurrency,
            queue_capacity: env::var("QUEUE_CAPACITY")
                .unwrap_or_else(|_| "100".into())
                .parse()
                .unwrap_or(100),
            broker_url: env::var("BROKER_URL").unwrap_or_else(|_| "embedded".into()),
            result_backend_url: env::var("RESULT_BACKEND_URL")
                .unwrap_or_else(|_| "embedded".into()),
            run_timeout_seconds,
            connect_timeout_seconds: env::var("CONNECT_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "10".into())
                .parse()
                .unwrap_or(10),
            cache_capacity: env::var("CACHE_CAPACITY")
                .unwrap_or_else(|_| "256".into())
                .parse()
                .unwrap_or(256),
            cache_ttl_seconds: env::var("CACHE_TTL_SECONDS")
                .unwrap_or_else(|_| "3600".into())
                .parse()
                .unwrap_or(3600),
        })
    }

    fn auto_detect_worker_count() -> usize {
        let num_cpus = num_cpus::get();
        // Two workers is the recommended deployment; give big machines a
        // little more, tiny ones a single worker.
        match num_cpus {
            1..=2 => 1,
            3..=8 => 2,
            9..=16 => 4,
            _ => 6,
        }
    }

    /// Per-run wall-clock budget.
    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    /// How long a pulled job stays invisible before the broker hands it
    /// to another worker: the run budget plus a grace period.
    pub fn visibility_timeout(&self) -> Duration {
        self.run_budget() + Duration::from_secs(30)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Total in-flight run capacity for this process.
    pub fn total_slots(&self) -> usize {
        self.worker_count * self.worker_concurrency
    }

    pub fn api_addr(&self) -> SocketAddr {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .expect("invalid API_HOST/API_PORT")
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.database_url);
        info!("- Datasets dir: {}", self.datasets_dir);
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- LLM backend: {}", self.llm_base_url);
        info!("- Embedder: {} ({})", self.embedder_base_url, self.embedding_model);
        info!(
            "- History: enabled={} max={} threshold={}",
            self.history_enabled, self.history_max_messages, self.history_similarity_threshold
        );
        info!(
            "- Workers: {} x {} ({} slots)",
            self.worker_count,
            self.worker_concurrency,
            self.total_slots()
        );
        info!("- Queue capacity: {}", self.queue_capacity);
        info!("- Run timeout: {}s", self.run_timeout_seconds);
    }
}
