//! Request handlers for the web gateway.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::channels::web::server::GatewayState;
use crate::context;
use crate::jobs::JobRequest;
use crate::llm::{catalog, ChatMessage, GenerationConfig, ModelSpec};
use crate::notify::PlatformTarget;
use crate::stream::StreamEvent;

/// Commands that reset the conversation instead of starting a job.
const CLEAR_COMMANDS: &[&str] = &[
    ":clear",
    ":reset",
    ":restart",
    ":new",
    ":清空上下文",
    ":重置上下文",
    ":重启",
    ":重启对话",
];

/// Marker on catalog model names requesting extended reasoning.
const THINKING_SUFFIX: &str = " (thinking)";
const DEFAULT_REASONING_BUDGET: u32 = 2048;

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "code": 200, "data": data }))
}

fn err(code: u16, error: &str) -> Json<Value> {
    Json(json!({ "code": code, "error": error }))
}

/// Merge query and form parameters; query wins, like the platform's
/// own webhook client expects.
fn merge_params(
    query: HashMap<String, String>,
    form: Option<Form<HashMap<String, String>>>,
) -> HashMap<String, String> {
    let mut params = form.map(|Form(form)| form).unwrap_or_default();
    params.extend(query);
    params
}

fn get_str(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_i64(params: &HashMap<String, String>, key: &str) -> i64 {
    get_str(params, key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Model options carried in the `extras` parameter.
#[derive(Debug, Default, Deserialize)]
struct Extras {
    #[serde(default)]
    model_type: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    system_message: Option<String>,
    #[serde(default)]
    server_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    agency: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    reasoning_budget: Option<u32>,
    #[serde(default)]
    context_limit: Option<usize>,
    #[serde(default)]
    context_key: Option<String>,
}

/// Split the reasoning marker off a catalog model name.
fn parse_model_name(name: &str) -> (String, bool) {
    match name.strip_suffix(THINKING_SUFFIX) {
        Some(base) => (base.trim().to_string(), true),
        None => (name.to_string(), false),
    }
}

/// `POST/GET /chat` — create a job for an inbound platform message.
pub async fn chat_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HashMap<String, String>>,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> Json<Value> {
    let params = merge_params(query, form.ok());

    let Some(text) = get_str(&params, "text") else {
        return err(400, "Parameter error");
    };
    let Some(token) = get_str(&params, "token") else {
        return err(400, "Parameter error");
    };
    let Some(version) = get_str(&params, "version") else {
        return err(400, "Parameter error");
    };
    let dialog_id = get_i64(&params, "dialog_id");
    let msg_id = get_i64(&params, "msg_id");
    let msg_uid = get_i64(&params, "msg_uid");
    let bot_uid = get_i64(&params, "bot_uid");
    if dialog_id == 0 || msg_uid == 0 || bot_uid == 0 {
        return err(400, "Parameter error");
    }
    let dialog_type = get_str(&params, "dialog_type");

    let extras: Extras = match params.get("extras") {
        Some(raw) => match serde_json::from_str(raw) {
            Ok(extras) => extras,
            Err(_) => return err(400, "Invalid extras parameter"),
        },
        None => Extras::default(),
    };
    let backend = extras.model_type.unwrap_or_else(|| "openai".to_string());
    let raw_model = extras
        .model_name
        .unwrap_or_else(|| "gpt-3.5-turbo".to_string());
    let (Some(server_url), Some(api_key)) = (extras.server_url, extras.api_key) else {
        return err(400, "Parameter error in extras");
    };

    // Group chats answer as a reply to the triggering message.
    let reply_id = if dialog_type.as_deref() == Some("group") {
        msg_id
    } else {
        0
    };

    let target = PlatformTarget {
        server_url,
        version,
        token,
        dialog_id,
    };

    let Some(send_id) = state.notifier.create_placeholder(&target, reply_id).await else {
        return err(400, "Send message failed");
    };
    let job_id = send_id.to_string();

    // History is partitioned by backend so switching models never
    // feeds one vendor's transcript to another.
    let mut context_key = format!("{backend}:{dialog_id}_{msg_uid}");
    if let Some(sub) = extras.context_key.as_deref().filter(|s| !s.is_empty()) {
        context_key = format!("{context_key}:{sub}");
    }

    if CLEAR_COMMANDS.contains(&text.as_str()) {
        if let Err(e) = state.history.clear(&context_key).await {
            tracing::warn!(context_key = %context_key, error = %e, "failed to clear context");
        }
        state
            .notifier
            .update_message(&target, &job_id, "Operation Successful")
            .await;
        return ok(json!({ "id": send_id, "key": "" }));
    }

    let (model, thinking) = parse_model_name(&raw_model);
    let reasoning_budget = extras
        .reasoning_budget
        .or(thinking.then_some(DEFAULT_REASONING_BUDGET));

    let request = JobRequest {
        text,
        system_message: extras.system_message,
        before_messages: Vec::new(),
        backend,
        model,
        api_key,
        base_url: extras.base_url,
        proxy: extras.agency,
        temperature: extras.temperature,
        max_tokens: extras.max_tokens,
        reasoning_budget,
        context_limit: extras.context_limit,
        platform: Some(target.clone()),
    };

    let job = match state
        .supervisor
        .create_job(job_id.clone(), context_key, request)
        .await
    {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(error = %e, "failed to create job");
            return err(500, "Failed to create job");
        }
    };

    state
        .notifier
        .push_stream_url(
            &target,
            msg_uid,
            &format!("/stream/{}/{}", job.id, job.stream_key),
        )
        .await;

    ok(json!({ "id": send_id, "key": job.stream_key }))
}

/// `GET /stream/{id}/{key}` — the SSE feed for one job.
pub async fn stream_handler(
    State(state): State<Arc<GatewayState>>,
    Path((id, key)): Path<(String, String)>,
) -> Response {
    match state.multiplexer.open_stream(&id, &key).await {
        Ok(events) => {
            let job_id = id.clone();
            let frames = events.map(move |event| Ok::<_, Infallible>(event.sse_frame(&job_id)));
            sse_response(Body::from_stream(frames))
        }
        Err(e) => {
            // Stream-open failures still terminate with a `done`
            // frame so no client is left waiting on a silent socket.
            let frame = StreamEvent::Done(Some(e.to_string())).sse_frame(&id);
            sse_response(Body::from(frame))
        }
    }
}

fn sse_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// `POST/GET /invoke` — synchronous, non-streaming completion.
pub async fn invoke_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HashMap<String, String>>,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> Json<Value> {
    let params = merge_params(query, form.ok());

    let Some(text) = get_str(&params, "text") else {
        return err(400, "Parameter error");
    };
    let Some(api_key) = get_str(&params, "api_key") else {
        return err(400, "Parameter error");
    };
    let backend = get_str(&params, "model_type").unwrap_or_else(|| "openai".to_string());
    let (model, thinking) =
        parse_model_name(&get_str(&params, "model_name").unwrap_or_else(|| "gpt-3.5-turbo".to_string()));

    let chat_model = match state.registry.create(&ModelSpec {
        backend: backend.clone(),
        model: model.clone(),
        api_key: SecretString::from(api_key),
        base_url: get_str(&params, "base_url"),
        proxy: get_str(&params, "agency"),
    }) {
        Ok(chat_model) => chat_model,
        Err(e) => return err(400, &e.to_string()),
    };

    let mut pre = Vec::new();
    if let Some(system) = get_str(&params, "system_message") {
        pre.push(ChatMessage::system(system));
    }
    let end = vec![ChatMessage::human(text)];
    let explicit_limit = get_str(&params, "context_limit").and_then(|s| s.parse().ok());
    let limit = context::context_limit(&backend, &model, explicit_limit);
    let messages = context::build(&pre, &[], &end, limit);
    if messages.is_empty() {
        return err(500, "Context window exhausted");
    }

    let config = GenerationConfig {
        temperature: get_str(&params, "temperature")
            .and_then(|s| s.parse().ok())
            .or(Some(0.7)),
        max_tokens: get_str(&params, "max_tokens").and_then(|s| s.parse().ok()),
        reasoning_budget: thinking.then_some(DEFAULT_REASONING_BUDGET),
    };

    match chat_model.invoke(messages, &config).await {
        Ok(completion) => ok(json!({
            "content": completion.content,
            "usage": {
                "total_tokens": completion.usage.total_tokens,
                "prompt_tokens": completion.usage.prompt_tokens,
                "completion_tokens": completion.usage.completion_tokens,
            },
        })),
        Err(e) => err(500, &e.to_string()),
    }
}

/// `GET /models` — static model catalog for a backend.
pub async fn models_handler(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    let Some(backend) = get_str(&query, "type") else {
        return err(400, "Parameter error");
    };
    match catalog::models_for(&backend) {
        Some(models) => ok(json!({ "models": models })),
        None => err(400, "No default models"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_overrides_form() {
        let mut query = HashMap::new();
        query.insert("text".to_string(), "from-query".to_string());
        let mut form = HashMap::new();
        form.insert("text".to_string(), "from-form".to_string());
        form.insert("token".to_string(), "t".to_string());
        let merged = merge_params(query, Some(Form(form)));
        assert_eq!(merged["text"], "from-query");
        assert_eq!(merged["token"], "t");
    }

    #[test]
    fn thinking_suffix_is_split_off() {
        assert_eq!(parse_model_name("o3 (thinking)"), ("o3".to_string(), true));
        assert_eq!(parse_model_name("gpt-4o"), ("gpt-4o".to_string(), false));
    }

    #[test]
    fn extras_parse_tolerates_unknown_fields() {
        let extras: Extras =
            serde_json::from_str(r#"{"model_type":"claude","future_field":1}"#).unwrap();
        assert_eq!(extras.model_type.as_deref(), Some("claude"));
    }

    #[test]
    fn clear_commands_include_cjk_variants() {
        assert!(CLEAR_COMMANDS.contains(&":clear"));
        assert!(CLEAR_COMMANDS.contains(&":清空上下文"));
    }
}
