//! Stream multiplexer: one generation, many viewers.
//!
//! `open_stream` elects exactly one producer per job via an atomic
//! create-if-absent on the job's stream buffer; everyone else (and
//! every later arrival) becomes a consumer polling that buffer. The
//! producer runs on the worker pool, detached from whichever HTTP
//! connection elected it, so generation survives client disconnects.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::config::StreamConfig;
use crate::context;
use crate::error::{LlmError, StreamError};
use crate::history::HistoryStore;
use crate::jobs::{Job, JobState, Supervisor, TIMEOUT_MESSAGE};
use crate::llm::{ChatMessage, GenerationConfig, ModelRegistry, ModelSpec};
use crate::notify::PlatformNotifier;
use crate::store::{Keyspace, KvStore};
use crate::worker::WorkerPool;

/// Marker a model emits to end the dialogue; stripped from the reply
/// and the conversation history is cleared when present.
pub const END_CONVERSATION_MARK: &str = "<!--::END_CHAT::-->";

/// Shared accumulation of generated text for one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamBuffer {
    /// Monotonically growing text as rendered to viewers.
    pub text: String,
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Event delivered to one SSE connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Append(String),
    Replace(String),
    Done(Option<String>),
}

impl StreamEvent {
    /// Wire framing; must stay byte-for-byte stable for clients.
    pub fn sse_frame(&self, job_id: &str) -> String {
        let (event, data) = match self {
            StreamEvent::Append(content) => ("append", json!({ "content": content })),
            StreamEvent::Replace(content) => ("replace", json!({ "content": content })),
            StreamEvent::Done(None) => ("done", json!({})),
            StreamEvent::Done(Some(error)) => ("done", json!({ "error": error })),
        };
        format!("id: {job_id}\nevent: {event}\ndata: {data}\n\n")
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Incremental render state for one producer.
///
/// Reasoning deltas are shown as a leading markdown quote while the
/// answer has not started; the persisted answer never includes them.
#[derive(Debug, Clone, Default)]
struct Accum {
    answer: String,
    display: String,
    quoting: bool,
}

impl Accum {
    fn push(&mut self, content: Option<&str>, reasoning: Option<&str>) {
        if let Some(reasoning) = reasoning.filter(|r| !r.is_empty()) {
            if self.answer.is_empty() {
                if !self.quoting {
                    self.display.push_str("> ");
                    self.quoting = true;
                }
                self.display.push_str(&reasoning.replace('\n', "\n> "));
            }
        }
        if let Some(content) = content.filter(|c| !c.is_empty()) {
            if self.quoting {
                self.display.push_str("\n\n");
                self.quoting = false;
            }
            self.answer.push_str(content);
            self.display.push_str(content);
        }
    }
}

/// Turns one model invocation into a durable, replayable, multi-reader
/// event feed.
#[derive(Clone)]
pub struct Multiplexer {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    supervisor: Arc<Supervisor>,
    history: Arc<HistoryStore>,
    registry: Arc<ModelRegistry>,
    pool: Arc<WorkerPool>,
    notifier: Arc<PlatformNotifier>,
    config: StreamConfig,
}

impl Multiplexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keyspace,
        supervisor: Arc<Supervisor>,
        history: Arc<HistoryStore>,
        registry: Arc<ModelRegistry>,
        pool: Arc<WorkerPool>,
        notifier: Arc<PlatformNotifier>,
        config: StreamConfig,
    ) -> Self {
        Self {
            store,
            keys,
            supervisor,
            history,
            registry,
            pool,
            notifier,
            config,
        }
    }

    /// Open the event feed for a job.
    ///
    /// The first caller on a fresh job becomes the producer; everyone
    /// else observes the shared buffer. Replaying a finished job is
    /// idempotent and writes nothing.
    pub async fn open_stream(
        &self,
        job_id: &str,
        stream_key: &str,
    ) -> Result<EventStream, StreamError> {
        let job = self
            .supervisor
            .job(job_id)
            .await?
            .ok_or_else(|| StreamError::NotFound(job_id.to_string()))?;
        if job.stream_key != stream_key {
            return Err(StreamError::InvalidKey(job_id.to_string()));
        }

        if job.state == JobState::Finished {
            let events = vec![
                StreamEvent::Replace(job.response.clone()),
                StreamEvent::Done(None),
            ];
            return Ok(Box::pin(tokio_stream::iter(events)));
        }

        // Producer election: exactly one caller across all processes
        // creates the buffer and owns generation for this job.
        let initial = serde_json::to_string(&StreamBuffer::default())
            .map_err(crate::error::StoreError::Serialization)?;
        let elected = self
            .store
            .set_if_absent(
                &self.keys.buffer(job_id),
                &initial,
                Some(self.config.buffer_ttl),
            )
            .await?;

        if elected {
            tracing::info!(job_id = %job.id, "producer elected");
            let this = self.clone();
            let job = job.clone();
            self.pool.submit(async move {
                this.run_producer(job).await;
            });
        }

        let (tx, rx) = mpsc::channel(32);
        let this = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            this.run_consumer(job_id, tx).await;
        });
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    // ==================== producer ====================

    async fn run_producer(&self, mut job: Job) {
        job.state = JobState::Processing;
        if let Err(e) = self.supervisor.save(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to mark job processing");
        }

        let accum = Arc::new(Mutex::new(Accum::default()));
        let generation = tokio::spawn({
            let this = self.clone();
            let job = job.clone();
            let accum = Arc::clone(&accum);
            async move { this.generate(&job, accum).await }
        });
        let abort = generation.abort_handle();

        let outcome = match tokio::time::timeout(self.config.timeout, generation).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(LlmError::TaskAborted(join_error.to_string())),
            Err(_) => {
                // Cancel the backend call, not just abandon it: the
                // worker slot and the HTTP connection both come back.
                abort.abort();
                Err(LlmError::Timeout {
                    timeout: self.config.timeout,
                })
            }
        };

        self.finalize(job, accum, outcome).await;
    }

    async fn generate(&self, job: &Job, accum: Arc<Mutex<Accum>>) -> Result<(), LlmError> {
        let request = &job.request;
        let model = self.registry.create(&ModelSpec {
            backend: request.backend.clone(),
            model: request.model.clone(),
            api_key: SecretString::from(request.api_key.clone()),
            base_url: request.base_url.clone(),
            proxy: request.proxy.clone(),
        })?;

        let limit = context::context_limit(&request.backend, &request.model, request.context_limit);
        let transcript = self
            .history
            .load(&job.context_key)
            .await
            .map_err(|e| LlmError::TaskAborted(format!("history load failed: {e}")))?;

        let mut pre: Vec<ChatMessage> = Vec::new();
        if let Some(system) = request.system_message.as_deref().filter(|s| !s.is_empty()) {
            pre.push(ChatMessage::system(system));
        }
        pre.extend(request.before_messages.iter().cloned());
        let end = vec![ChatMessage::human(request.text.clone())];

        let messages = context::build(&pre, &transcript, &end, limit);
        if messages.is_empty() {
            return Err(LlmError::ContextOverflow { limit });
        }

        let generation_config = GenerationConfig {
            temperature: request.temperature.or(Some(0.7)),
            max_tokens: request.max_tokens,
            reasoning_budget: request.reasoning_budget,
        };
        let mut deltas = model.stream(messages, &generation_config).await?;

        let mut last_publish = Instant::now();
        let mut dirty = false;
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            if delta.is_empty() {
                continue;
            }
            let display = {
                let mut acc = accum.lock().await;
                acc.push(delta.content.as_deref(), delta.reasoning_content.as_deref());
                acc.display.clone()
            };
            dirty = true;
            // Bound store write amplification; the final flush in
            // finalize republishes regardless.
            if last_publish.elapsed() >= self.config.publish_interval {
                self.publish(&job.id, &display, false, None).await;
                last_publish = Instant::now();
                dirty = false;
            }
        }
        if dirty {
            let display = accum.lock().await.display.clone();
            self.publish(&job.id, &display, false, None).await;
        }
        Ok(())
    }

    /// Runs unconditionally on every producer exit path. A failure in
    /// any step is logged and the remaining steps still run, so no
    /// consumer can block forever on a job that never finishes.
    async fn finalize(&self, mut job: Job, accum: Arc<Mutex<Accum>>, outcome: Result<(), LlmError>) {
        // The terminal flush must extend what consumers already saw,
        // so it is built from the rendered display; only the history
        // append uses the bare answer.
        let (answer, display) = {
            let acc = accum.lock().await;
            (acc.answer.clone(), acc.display.clone())
        };

        let mut error = None;
        let mut end_dialogue = false;
        let final_text = match outcome {
            Ok(()) => {
                if answer.contains(END_CONVERSATION_MARK) {
                    end_dialogue = true;
                    display.replace(END_CONVERSATION_MARK, "").trim().to_string()
                } else {
                    display.clone()
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "generation ended in error");
                error = Some(e.to_string());
                if display.is_empty() {
                    e.to_string()
                } else {
                    format!("{display}\n\n[error] {e}")
                }
            }
        };

        self.publish(&job.id, &final_text, true, error.clone()).await;

        job.state = JobState::Finished;
        job.response = final_text.clone();
        if let Err(e) = self.supervisor.save(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to persist finished job");
        }

        if end_dialogue {
            if let Err(e) = self.history.clear(&job.context_key).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to clear history");
            }
        } else if !answer.is_empty() {
            let limit = context::context_limit(
                &job.request.backend,
                &job.request.model,
                job.request.context_limit,
            );
            if let Err(e) = self
                .history
                .append_turn(&job.context_key, &job.request.text, &answer, limit)
                .await
            {
                tracing::warn!(job_id = %job.id, error = %e, "failed to append history");
            }
        }

        if let Some(target) = &job.request.platform {
            self.notifier
                .update_message(target, &job.id, &final_text)
                .await;
        }
        tracing::info!(job_id = %job.id, chars = final_text.len(), error = error.is_some(), "job finished");
    }

    async fn publish(&self, job_id: &str, text: &str, done: bool, error: Option<String>) {
        let buffer = StreamBuffer {
            text: text.to_string(),
            done,
            error,
        };
        match serde_json::to_string(&buffer) {
            Ok(raw) => {
                if let Err(e) = self
                    .store
                    .set(&self.keys.buffer(job_id), &raw, Some(self.config.buffer_ttl))
                    .await
                {
                    tracing::error!(job_id, error = %e, "failed to publish stream buffer");
                }
            }
            Err(e) => tracing::error!(job_id, error = %e, "failed to encode stream buffer"),
        }
    }

    // ==================== consumer ====================

    async fn read_buffer(&self, job_id: &str) -> Option<StreamBuffer> {
        match self.store.get(&self.keys.buffer(job_id)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(buffer) => Some(buffer),
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "unreadable stream buffer");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "failed to read stream buffer");
                None
            }
        }
    }

    /// Emit prefix diffs against the shared buffer until terminal.
    ///
    /// A send failure means the SSE connection went away; generation
    /// continues regardless because the producer owns its own task.
    async fn run_consumer(&self, job_id: String, tx: mpsc::Sender<StreamEvent>) {
        let deadline = Instant::now() + self.config.timeout;
        let mut delivered = String::new();

        loop {
            if Instant::now() >= deadline {
                let _ = tx
                    .send(StreamEvent::Done(Some(TIMEOUT_MESSAGE.to_string())))
                    .await;
                return;
            }

            let buffer = self.read_buffer(&job_id).await;
            let mut advanced = false;
            if let Some(buf) = &buffer {
                if buf.text != delivered {
                    let event = if buf.text.starts_with(&delivered) {
                        StreamEvent::Append(buf.text[delivered.len()..].to_string())
                    } else {
                        // A restarted producer rewrote the buffer; the
                        // prefix relationship is gone, resend whole.
                        StreamEvent::Replace(buf.text.clone())
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    delivered = buf.text.clone();
                    advanced = true;
                }
                if buf.done {
                    let _ = tx.send(StreamEvent::Done(buf.error.clone())).await;
                    return;
                }
            }

            // The buffer alone cannot prove liveness: a producer that
            // died before its final flush leaves done=false forever.
            match self.supervisor.job(&job_id).await {
                Ok(Some(job)) if job.state == JobState::Finished => {
                    if job.response != delivered {
                        let event = if job.response.starts_with(&delivered) {
                            StreamEvent::Append(job.response[delivered.len()..].to_string())
                        } else {
                            StreamEvent::Replace(job.response.clone())
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(StreamEvent::Done(None)).await;
                    return;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    let _ = tx
                        .send(StreamEvent::Done(Some("job record expired".to_string())))
                        .await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "consumer failed to read job");
                }
            }

            let interval = if advanced {
                self.config.poll_interval
            } else {
                self.config.idle_poll_interval
            };
            tokio::time::sleep(interval).await;
        }
    }
}
