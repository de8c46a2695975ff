//! End-to-end tests for the stream fan-out path: producer election,
//! multi-reader delivery, replay, and error termination.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use pretty_assertions::assert_eq;

use chatrelay::config::{StreamConfig, WorkerConfig};
use chatrelay::error::{LlmError, StreamError};
use chatrelay::history::HistoryStore;
use chatrelay::jobs::{Job, JobRequest, JobState, Supervisor};
use chatrelay::llm::{
    ChatDelta, ChatMessage, ChatModel, Completion, DeltaStream, GenerationConfig, ModelRegistry,
    Role, TokenUsage,
};
use chatrelay::notify::PlatformNotifier;
use chatrelay::store::{Keyspace, KvStore, MemoryStore};
use chatrelay::stream::{
    EventStream, Multiplexer, StreamBuffer, StreamEvent, END_CONVERSATION_MARK,
};
use chatrelay::worker::WorkerPool;

/// One scripted step of a mock generation.
#[derive(Clone, Copy)]
enum Chunk {
    Text(&'static str),
    Reasoning(&'static str),
    Fail(&'static str),
}

/// Backend that replays a fixed script, counting stream() calls.
struct ScriptedModel {
    calls: Arc<AtomicUsize>,
    script: Vec<Chunk>,
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn backend(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
        _config: &GenerationConfig,
    ) -> Result<DeltaStream, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let items: Vec<Result<ChatDelta, LlmError>> = self
            .script
            .iter()
            .map(|chunk| match chunk {
                Chunk::Text(text) => Ok(ChatDelta {
                    content: Some(text.to_string()),
                    reasoning_content: None,
                }),
                Chunk::Reasoning(text) => Ok(ChatDelta {
                    content: None,
                    reasoning_content: Some(text.to_string()),
                }),
                Chunk::Fail(reason) => Err(LlmError::RequestFailed {
                    backend: "mock".to_string(),
                    reason: reason.to_string(),
                }),
            })
            .collect();
        let stream = futures::stream::iter(items).then(|item| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            item
        });
        Ok(Box::pin(stream))
    }

    async fn invoke(
        &self,
        _messages: Vec<ChatMessage>,
        _config: &GenerationConfig,
    ) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self
            .script
            .iter()
            .filter_map(|chunk| match chunk {
                Chunk::Text(text) => Some(*text),
                _ => None,
            })
            .collect();
        Ok(Completion {
            content,
            usage: TokenUsage::default(),
        })
    }
}

struct Harness {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    supervisor: Arc<Supervisor>,
    history: Arc<HistoryStore>,
    multiplexer: Multiplexer,
    calls: Arc<AtomicUsize>,
}

fn harness(script: Vec<Chunk>) -> Harness {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let keys = Keyspace::new("test");
    let notifier = Arc::new(PlatformNotifier::new());
    let config = StreamConfig {
        timeout: Duration::from_secs(10),
        publish_interval: Duration::from_millis(5),
        poll_interval: Duration::from_millis(10),
        idle_poll_interval: Duration::from_millis(20),
        sweep_interval: Duration::from_secs(1),
        buffer_ttl: Duration::from_secs(60),
    };
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store),
        keys.clone(),
        Arc::clone(&notifier),
        config.timeout,
        Duration::from_secs(3600),
    ));
    let history = Arc::new(HistoryStore::new(Arc::clone(&store), keys.clone()));

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ModelRegistry::new();
    let factory_calls = Arc::clone(&calls);
    registry.register("mock", move |_spec| {
        Ok(Arc::new(ScriptedModel {
            calls: Arc::clone(&factory_calls),
            script: script.clone(),
        }) as Arc<dyn ChatModel>)
    });

    let pool = Arc::new(
        WorkerPool::new(&WorkerConfig {
            floor: 5,
            ceiling: 50,
            check_interval: Duration::from_secs(30),
        })
        .unwrap(),
    );

    let multiplexer = Multiplexer::new(
        Arc::clone(&store),
        keys.clone(),
        Arc::clone(&supervisor),
        Arc::clone(&history),
        Arc::new(registry),
        pool,
        notifier,
        config,
    );

    Harness {
        store,
        keys,
        supervisor,
        history,
        multiplexer,
        calls,
    }
}

fn request() -> JobRequest {
    JobRequest {
        text: "hi there".to_string(),
        system_message: None,
        before_messages: Vec::new(),
        backend: "mock".to_string(),
        model: "scripted".to_string(),
        api_key: "sk-test".to_string(),
        base_url: None,
        proxy: None,
        temperature: None,
        max_tokens: None,
        reasoning_budget: None,
        context_limit: None,
        platform: None,
    }
}

/// Apply events until the terminal `done`, returning the final text
/// and the terminal error payload.
async fn drain(mut events: EventStream) -> (String, Option<Option<String>>) {
    let mut text = String::new();
    let mut terminal = None;
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Append(chunk) => text.push_str(&chunk),
            StreamEvent::Replace(full) => text = full,
            StreamEvent::Done(error) => {
                terminal = Some(error);
                break;
            }
        }
    }
    (text, terminal)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_producer_no_matter_how_many_viewers() {
    let h = harness(vec![Chunk::Text("Hello"), Chunk::Text(" world")]);
    let job = h
        .supervisor
        .create_job("1".to_string(), "mock:ctx".to_string(), request())
        .await
        .unwrap();

    let mut viewers = Vec::new();
    for _ in 0..50 {
        let multiplexer = h.multiplexer.clone();
        let (id, key) = (job.id.clone(), job.stream_key.clone());
        viewers.push(tokio::spawn(async move {
            let events = multiplexer.open_stream(&id, &key).await.unwrap();
            drain(events).await
        }));
    }
    for viewer in viewers {
        let (text, terminal) = viewer.await.unwrap();
        assert_eq!(text, "Hello world");
        assert_eq!(terminal, Some(None));
    }

    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    let job = h.supervisor.job("1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Finished);
    assert_eq!(job.response, "Hello world");

    let transcript = h.history.load("mock:ctx").await.unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::Human);
    assert_eq!(transcript[0].content, "hi there");
    assert_eq!(transcript[1].content, "Hello world");
}

#[tokio::test(flavor = "multi_thread")]
async fn reasoning_renders_as_quote_but_is_not_persisted() {
    let h = harness(vec![
        Chunk::Reasoning("mull it over"),
        Chunk::Text("Answer"),
    ]);
    let job = h
        .supervisor
        .create_job("2".to_string(), "mock:r".to_string(), request())
        .await
        .unwrap();

    let mut events = h
        .multiplexer
        .open_stream(&job.id, &job.stream_key)
        .await
        .unwrap();
    // A live viewer only ever sees its text grow; the terminal flush
    // must extend the quoted thinking section, not retract it.
    let mut text = String::new();
    let mut terminal = None;
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Append(chunk) => text.push_str(&chunk),
            StreamEvent::Replace(full) => panic!("viewer text shrank: replace {full:?}"),
            StreamEvent::Done(error) => {
                terminal = Some(error);
                break;
            }
        }
    }
    assert_eq!(text, "> mull it over\n\nAnswer");
    assert_eq!(terminal, Some(None));

    // The finished record matches what viewers saw; only history is
    // stripped down to the answer.
    let job = h.supervisor.job("2").await.unwrap().unwrap();
    assert_eq!(job.response, "> mull it over\n\nAnswer");
    let transcript = h.history.load("mock:r").await.unwrap();
    assert_eq!(transcript[1].content, "Answer");
}

#[tokio::test(flavor = "multi_thread")]
async fn replaying_a_finished_job_writes_nothing() {
    let h = harness(vec![]);
    let job = h
        .supervisor
        .create_job("3".to_string(), "mock:f".to_string(), request())
        .await
        .unwrap();
    let done = Job {
        state: JobState::Finished,
        response: "final text".to_string(),
        ..job
    };
    h.supervisor.save(&done).await.unwrap();

    for _ in 0..2 {
        let events = h
            .multiplexer
            .open_stream(&done.id, &done.stream_key)
            .await
            .unwrap();
        let (text, terminal) = drain(events).await;
        assert_eq!(text, "final text");
        assert_eq!(terminal, Some(None));
    }

    // No producer ran, no buffer was created.
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.get(&h.keys.buffer("3")).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn backend_error_terminates_with_partial_text() {
    let h = harness(vec![Chunk::Text("Hel"), Chunk::Fail("backend 500")]);
    let job = h
        .supervisor
        .create_job("4".to_string(), "mock:e".to_string(), request())
        .await
        .unwrap();

    let events = h
        .multiplexer
        .open_stream(&job.id, &job.stream_key)
        .await
        .unwrap();
    let (text, terminal) = drain(events).await;
    assert!(text.starts_with("Hel"), "partial output kept: {text}");
    assert!(text.contains("[error]"), "error appended: {text}");
    let error = terminal.expect("stream terminated").expect("error payload");
    assert!(error.contains("backend 500"));

    let job = h.supervisor.job("4").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Finished);
}

#[tokio::test(flavor = "multi_thread")]
async fn consumers_receive_prefix_diffs_only() {
    let h = harness(vec![]);
    let job = h
        .supervisor
        .create_job("5".to_string(), "mock:p".to_string(), request())
        .await
        .unwrap();

    // Seed the buffer so election is already taken and no producer runs;
    // the test then plays producer by hand.
    let write = |text: &str, done: bool| {
        serde_json::to_string(&StreamBuffer {
            text: text.to_string(),
            done,
            error: None,
        })
        .unwrap()
    };
    let buffer_key = h.keys.buffer(&job.id);
    h.store
        .set(&buffer_key, &write("Hel", false), None)
        .await
        .unwrap();

    let mut events = h
        .multiplexer
        .open_stream(&job.id, &job.stream_key)
        .await
        .unwrap();
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    assert_eq!(events.next().await, Some(StreamEvent::Append("Hel".to_string())));

    h.store
        .set(&buffer_key, &write("Hello!", false), None)
        .await
        .unwrap();
    assert_eq!(events.next().await, Some(StreamEvent::Append("lo!".to_string())));

    h.store
        .set(&buffer_key, &write("Hello!", true), None)
        .await
        .unwrap();
    assert_eq!(events.next().await, Some(StreamEvent::Done(None)));
}

#[tokio::test(flavor = "multi_thread")]
async fn end_mark_strips_reply_and_clears_history() {
    let h = harness(vec![Chunk::Text("Bye"), Chunk::Text(END_CONVERSATION_MARK)]);
    h.history
        .append_turn("mock:end", "earlier", "reply", 1000)
        .await
        .unwrap();
    let job = h
        .supervisor
        .create_job("7".to_string(), "mock:end".to_string(), request())
        .await
        .unwrap();

    let events = h
        .multiplexer
        .open_stream(&job.id, &job.stream_key)
        .await
        .unwrap();
    let (text, terminal) = drain(events).await;
    assert_eq!(text, "Bye");
    assert_eq!(terminal, Some(None));

    let job = h.supervisor.job("7").await.unwrap().unwrap();
    assert_eq!(job.response, "Bye");
    assert!(h.history.load("mock:end").await.unwrap().is_empty());
}

#[tokio::test]
async fn stream_key_gates_access() {
    let h = harness(vec![Chunk::Text("x")]);
    let job = h
        .supervisor
        .create_job("6".to_string(), "mock:k".to_string(), request())
        .await
        .unwrap();

    let wrong = h.multiplexer.open_stream(&job.id, "wrong-key").await;
    assert!(matches!(wrong, Err(StreamError::InvalidKey(_))));
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    let missing = h.multiplexer.open_stream("no-such-job", "k").await;
    assert!(matches!(missing, Err(StreamError::NotFound(_))));
}
