//! Best-effort callbacks to the origin chat platform.
//!
//! Every call is fire-and-forget from the gateway's perspective:
//! failures are logged and swallowed, never propagated into the
//! request lifecycle.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Where platform callbacks for one conversation go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformTarget {
    pub server_url: String,
    pub version: String,
    pub token: String,
    pub dialog_id: i64,
}

/// Callback endpoint selector on the origin platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SendText,
    Stream,
}

impl Action {
    fn path(self) -> &'static str {
        match self {
            Action::SendText => "/api/dialog/msg/sendtext",
            Action::Stream => "/api/dialog/msg/stream",
        }
    }
}

/// HTTP client for origin-platform callbacks.
pub struct PlatformNotifier {
    client: reqwest::Client,
}

impl PlatformNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    /// POST a payload to the platform, returning the message id the
    /// platform assigned, if any. Invalid or missing server URLs and
    /// transport failures all collapse to `None`.
    pub async fn call(
        &self,
        target: &PlatformTarget,
        action: Action,
        mut payload: serde_json::Value,
    ) -> Option<i64> {
        if !target.server_url.starts_with("http://") && !target.server_url.starts_with("https://") {
            tracing::debug!(server_url = %target.server_url, "notify: skipping invalid server url");
            return None;
        }

        if let Some(map) = payload.as_object_mut() {
            map.entry("dialog_id").or_insert(json!(target.dialog_id));
        }

        let url = format!(
            "{}{}",
            target.server_url.trim_end_matches('/'),
            action.path()
        );
        let result = self
            .client
            .post(&url)
            .header("version", &target.version)
            .header("token", &target.token)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) => {
                let body: serde_json::Value = response.json().await.ok()?;
                body.get("data")?.get("id")?.as_i64()
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "notify: platform callback failed");
                None
            }
        }
    }

    /// Create the placeholder message whose id becomes the job id.
    pub async fn create_placeholder(&self, target: &PlatformTarget, reply_id: i64) -> Option<i64> {
        self.call(
            target,
            Action::SendText,
            json!({
                "reply_id": reply_id,
                "text": "...",
                "text_type": "md",
                "silence": "yes",
            }),
        )
        .await
    }

    /// Tell the platform where the SSE feed for a job lives.
    pub async fn push_stream_url(&self, target: &PlatformTarget, user_id: i64, stream_url: &str) {
        self.call(
            target,
            Action::Stream,
            json!({
                "userid": user_id,
                "stream_url": stream_url,
            }),
        )
        .await;
    }

    /// Replace a previously created message with final text.
    pub async fn update_message(&self, target: &PlatformTarget, message_id: &str, text: &str) {
        self.call(
            target,
            Action::SendText,
            json!({
                "update_id": message_id,
                "update_mark": "no",
                "text": text,
                "text_type": "md",
                "silence": "yes",
            }),
        )
        .await;
    }
}

impl Default for PlatformNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_server_url_is_skipped() {
        let notifier = PlatformNotifier::new();
        let target = PlatformTarget {
            server_url: "not-a-url".to_string(),
            version: "1".to_string(),
            token: "t".to_string(),
            dialog_id: 7,
        };
        assert_eq!(notifier.create_placeholder(&target, 0).await, None);
    }

    #[test]
    fn action_paths() {
        assert_eq!(Action::SendText.path(), "/api/dialog/msg/sendtext");
        assert_eq!(Action::Stream.path(), "/api/dialog/msg/stream");
    }
}
