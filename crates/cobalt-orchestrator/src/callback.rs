//! Webhook callbacks for terminal task notifications.
//!
//! A task submitted with a `webhook_url` gets a POST when it reaches a
//! terminal status. Delivery is best-effort with a bounded retry budget;
//! a callback that keeps failing is logged and dropped, never blocking
//! the scheduler.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use cobalt_core::config::CallbackConfig;
use cobalt_core::models::{Task, TaskStatus};

/// Payload delivered to the webhook target.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackPayload {
    /// The task that reached a terminal status.
    pub task_id: String,
    /// The terminal status.
    pub status: TaskStatus,
    /// Result payload, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of attempts the task consumed.
    pub attempt: u32,
}

impl CallbackPayload {
    /// Builds the payload for a terminal task.
    #[must_use]
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            attempt: task.attempt,
        }
    }
}

/// Dispatches webhook callbacks with bounded retries.
pub struct CallbackDispatcher {
    client: reqwest::Client,
    config: CallbackConfig,
}

impl fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDispatcher").field("config", &self.config).finish_non_exhaustive()
    }
}

impl CallbackDispatcher {
    /// Creates a dispatcher with the given tuning.
    #[must_use]
    pub fn new(config: CallbackConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Fires a callback for a terminal task, if it declared a webhook.
    ///
    /// Delivery runs on a detached task so scheduling is never blocked on
    /// a slow receiver.
    pub fn notify(&self, task: &Task) {
        let Some(url) = task.webhook_url.clone() else {
            return;
        };
        let payload = CallbackPayload::for_task(task);
        let client = self.client.clone();
        let attempts = self.config.attempts;
        let retry_delay = Duration::from_secs(self.config.retry_delay_seconds);

        tokio::spawn(async move {
            for attempt in 1..=attempts {
                match client.post(&url).json(&payload).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(task_id = %payload.task_id, url = %url, "Callback delivered");
                        return;
                    }
                    Ok(response) => {
                        warn!(
                            task_id = %payload.task_id,
                            url = %url,
                            status = %response.status(),
                            attempt,
                            "Callback rejected"
                        );
                    }
                    Err(e) => {
                        warn!(
                            task_id = %payload.task_id,
                            url = %url,
                            error = %e,
                            attempt,
                            "Callback delivery failed"
                        );
                    }
                }
                if attempt < attempts {
                    tokio::time::sleep(retry_delay).await;
                }
            }
            warn!(task_id = %payload.task_id, url = %url, "Callback abandoned after retries");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cobalt_core::models::TaskSpec;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_payload_shape() {
        let mut task = Task::from_spec(
            "task-1".to_string(),
            TaskSpec::new("test").with_webhook_url("https://example.com/cb"),
        );
        task.begin("agent-1", Utc::now());
        task.complete(json!({"ok": true}), Utc::now());

        let payload = CallbackPayload::for_task(&task);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["task_id"], "task-1");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["result"]["ok"], true);
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_notify_without_webhook_is_noop() {
        let dispatcher = CallbackDispatcher::new(CallbackConfig::default());
        let task = Task::from_spec("task-1".to_string(), TaskSpec::new("test"));
        dispatcher.notify(&task);
    }
}
