//! Job records and the request lifecycle supervisor.
//!
//! A job tracks one user turn through `prepare -> processing ->
//! finished`. The supervisor owns creation and the timeout sweep; the
//! stream multiplexer's elected producer owns all other transitions.
//! Sweep state is derived entirely from persisted records so a
//! restarted process keeps reclaiming jobs it never saw created.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::llm::ChatMessage;
use crate::notify::{PlatformNotifier, PlatformTarget};
use crate::store::{Keyspace, KvStore};
use crate::stream::StreamBuffer;

/// Synthetic response for jobs reclaimed by the sweep.
pub const TIMEOUT_MESSAGE: &str = "Request timed out, please try again.";

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Prepare,
    Processing,
    Finished,
}

/// Request payload captured at job creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// The user's message text.
    pub text: String,
    /// System message prepended to every prompt.
    #[serde(default)]
    pub system_message: Option<String>,
    /// Ephemeral instructions sent before the history, never persisted.
    #[serde(default)]
    pub before_messages: Vec<ChatMessage>,

    pub backend: String,
    pub model: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub reasoning_budget: Option<u32>,
    /// Explicit context budget override, in heuristic units.
    #[serde(default)]
    pub context_limit: Option<usize>,

    /// Callback coordinates on the origin platform, when known.
    #[serde(default)]
    pub platform: Option<PlatformTarget>,
}

/// One user turn being answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Capability token required on every stream read.
    pub stream_key: String,
    pub state: JobState,
    /// Unix seconds; drives the timeout sweep.
    pub created_at: i64,
    /// Which conversation history this job reads and appends to.
    pub context_key: String,
    pub request: JobRequest,
    /// Final accumulated text; empty until the job finishes.
    #[serde(default)]
    pub response: String,
}

fn random_stream_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Owns job state transitions and reclaims jobs that never complete.
pub struct Supervisor {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    notifier: Arc<PlatformNotifier>,
    /// Shared with every consumer's wall-clock timer.
    timeout: Duration,
    job_ttl: Duration,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keyspace,
        notifier: Arc<PlatformNotifier>,
        timeout: Duration,
        job_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            notifier,
            timeout,
            job_ttl,
        }
    }

    /// Create and persist a new job in `prepare` state.
    pub async fn create_job(
        &self,
        id: String,
        context_key: String,
        request: JobRequest,
    ) -> Result<Job, JobError> {
        let job = Job {
            id,
            stream_key: random_stream_key(),
            state: JobState::Prepare,
            created_at: chrono::Utc::now().timestamp(),
            context_key,
            request,
            response: String::new(),
        };
        self.save(&job).await?;
        tracing::info!(job_id = %job.id, context_key = %job.context_key, "job created");
        Ok(job)
    }

    /// Fetch a job record.
    pub async fn job(&self, id: &str) -> Result<Option<Job>, JobError> {
        let raw = self
            .store
            .get(&self.keys.job(id))
            .await
            .map_err(JobError::Store)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| {
                JobError::Store(crate::error::StoreError::Serialization(e))
            })?)),
            None => Ok(None),
        }
    }

    /// Persist a modified job record.
    pub async fn save(&self, job: &Job) -> Result<(), JobError> {
        let raw = serde_json::to_string(job)
            .map_err(|e| JobError::Store(crate::error::StoreError::Serialization(e)))?;
        self.store
            .set(&self.keys.job(&job.id), &raw, Some(self.job_ttl))
            .await
            .map_err(JobError::Store)
    }

    /// Run the timeout sweep forever at the given interval.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = supervisor.sweep_once().await {
                    tracing::error!(error = %e, "timeout sweep failed");
                }
            }
        })
    }

    /// One sweep pass over all persisted jobs. Returns how many jobs
    /// were forced to `finished`.
    pub async fn sweep_once(&self) -> Result<usize, JobError> {
        let now = chrono::Utc::now().timestamp();
        let cutoff = self.timeout.as_secs() as i64;
        let keys = self
            .store
            .scan(&self.keys.job_prefix())
            .await
            .map_err(JobError::Store)?;

        let mut reclaimed = 0usize;
        for key in keys {
            let Some(raw) = self.store.get(&key).await.map_err(JobError::Store)? else {
                continue;
            };
            let Ok(mut job) = serde_json::from_str::<Job>(&raw) else {
                tracing::warn!(%key, "sweeping unreadable job record");
                continue;
            };
            if job.state == JobState::Finished || now - job.created_at <= cutoff {
                continue;
            }

            tracing::warn!(
                job_id = %job.id,
                state = ?job.state,
                age_secs = now - job.created_at,
                "job timed out, forcing finished"
            );
            job.state = JobState::Finished;
            job.response = TIMEOUT_MESSAGE.to_string();
            self.save(&job).await?;

            // Terminate any attached consumers promptly.
            let buffer = StreamBuffer {
                text: TIMEOUT_MESSAGE.to_string(),
                done: true,
                error: Some(TIMEOUT_MESSAGE.to_string()),
            };
            if let Ok(raw) = serde_json::to_string(&buffer) {
                let _ = self
                    .store
                    .set(&self.keys.buffer(&job.id), &raw, Some(self.job_ttl))
                    .await;
            }

            if let Some(target) = &job.request.platform {
                self.notifier
                    .update_message(target, &job.id, TIMEOUT_MESSAGE)
                    .await;
            }
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}
