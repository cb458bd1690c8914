/// Action registry and built-in action handlers
///
/// Maps an action-type name to a handler. The registry is pure lookup: a
/// resolved handler is cloned out of the table before it runs, so a slow
/// handler (delay, network call) never holds the registry lock.
///
/// Built-in handlers:
/// - `email`: { "to": "...", "subject": "...", "body": "..." }
/// - `whatsapp_message` (alias `whatsapp`): { "phone": "...", "body": "..." }
/// - `delay`: { "seconds": 5 }

use crate::config::ActionsConfig;
use crate::error::{EngineError, EngineResult};
use crate::workflow::types::ActionParams;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Seconds slept by `delay` when the step gives no `seconds` parameter
pub const DEFAULT_DELAY_SECS: f64 = 5.0;

/// Errors returned by an action handler; every variant is retried
#[derive(Debug, Error)]
pub enum ActionError {
    /// Missing or ill-typed parameters
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Transient or unexplained failure
    #[error("{0}")]
    Failed(String),

    /// Network failure talking to a delivery gateway
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// The contract every action must fulfil: `(params) -> outcome`
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, params: &ActionParams) -> Result<Value, ActionError>;
}

/// Lookup table from action-type name to handler
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionRegistry {
    /// Empty registry, for tests and custom setups
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `email`, `whatsapp_message` and `delay`
    pub fn with_builtins(config: &ActionsConfig) -> Self {
        let registry = Self::new();
        let client = reqwest::Client::new();

        registry.register(
            "email",
            Arc::new(EmailAction::new(client.clone(), config.email_gateway_url.clone())),
        );

        let whatsapp: Arc<dyn ActionHandler> = Arc::new(WhatsAppAction::new(
            client,
            config.whatsapp_gateway_url.clone(),
        ));
        registry.register("whatsapp_message", Arc::clone(&whatsapp));
        registry.register("whatsapp", whatsapp);

        registry.register("delay", Arc::new(DelayAction));

        tracing::info!(
            "🧰 Action registry ready with built-ins: {:?}",
            registry.registered_types()
        );
        registry
    }

    /// Store a handler under `type_name`, replacing any previous registration
    pub fn register(&self, type_name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let type_name = type_name.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(type_name.clone(), handler).is_some() {
            tracing::debug!("🔁 Replaced action handler: {}", type_name);
        }
    }

    /// Look up the handler for `type_name`
    pub fn resolve(&self, type_name: &str) -> EngineResult<Arc<dyn ActionHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownActionType(type_name.to_string()))
    }

    /// Sorted list of registered type names
    pub fn registered_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Suspends the current run for `params.seconds`
///
/// Only the calling task sleeps; other runs and the timing loop are unaffected.
pub struct DelayAction;

#[async_trait]
impl ActionHandler for DelayAction {
    async fn execute(&self, params: &ActionParams) -> Result<Value, ActionError> {
        let seconds = match params.get("seconds") {
            None | Some(Value::Null) => DEFAULT_DELAY_SECS,
            Some(value) => value.as_f64().ok_or_else(|| {
                ActionError::InvalidParams(format!("'seconds' must be a number, got {value}"))
            })?,
        };

        let duration = Duration::try_from_secs_f64(seconds).map_err(|e| {
            ActionError::InvalidParams(format!(
                "'seconds' must be a non-negative number within range, got {seconds}: {e}"
            ))
        })?;

        tracing::info!("⏳ Delaying for {} seconds", seconds);
        tokio::time::sleep(duration).await;

        Ok(json!({ "delayed_seconds": seconds }))
    }
}

/// Sends an email through the configured gateway, or logs it when none is set
pub struct EmailAction {
    client: reqwest::Client,
    gateway_url: Option<String>,
}

impl EmailAction {
    pub fn new(client: reqwest::Client, gateway_url: Option<String>) -> Self {
        Self { client, gateway_url }
    }
}

#[async_trait]
impl ActionHandler for EmailAction {
    async fn execute(&self, params: &ActionParams) -> Result<Value, ActionError> {
        let to = required_str(params, "to")?;
        let subject = optional_str(params, "subject");
        let body = optional_str(params, "body");

        let message = json!({
            "channel": "email",
            "to": to,
            "subject": subject,
            "body": body,
        });

        match &self.gateway_url {
            Some(url) => deliver(&self.client, url, message).await,
            None => {
                tracing::info!("📧 Sending email to: {} | Subject: {}", to, subject);
                Ok(json!({ "channel": "email", "to": to, "dispatched_via": "log" }))
            }
        }
    }
}

/// Sends a WhatsApp message through the configured gateway, or logs it
pub struct WhatsAppAction {
    client: reqwest::Client,
    gateway_url: Option<String>,
}

impl WhatsAppAction {
    pub fn new(client: reqwest::Client, gateway_url: Option<String>) -> Self {
        Self { client, gateway_url }
    }
}

#[async_trait]
impl ActionHandler for WhatsAppAction {
    async fn execute(&self, params: &ActionParams) -> Result<Value, ActionError> {
        let phone = required_str(params, "phone")?;
        let body = optional_str(params, "body");

        let message = json!({
            "channel": "whatsapp",
            "phone": phone,
            "body": body,
        });

        match &self.gateway_url {
            Some(url) => deliver(&self.client, url, message).await,
            None => {
                tracing::info!("💬 Sending WhatsApp to: {} | Body: {}", phone, body);
                Ok(json!({ "channel": "whatsapp", "phone": phone, "dispatched_via": "log" }))
            }
        }
    }
}

/// POST a message to a delivery gateway; non-2xx responses are retryable failures
async fn deliver(client: &reqwest::Client, url: &str, message: Value) -> Result<Value, ActionError> {
    tracing::debug!("📡 Posting message to gateway: {}", url);
    let response = client.post(url).json(&message).send().await?;
    let status = response.status();

    let response_text = response.text().await?;
    let response_data = serde_json::from_str::<Value>(&response_text)
        .unwrap_or(Value::String(response_text));

    if !status.is_success() {
        return Err(ActionError::Failed(format!(
            "gateway {} answered {}: {}",
            url, status, response_data
        )));
    }

    Ok(json!({
        "channel": message["channel"],
        "dispatched_via": "gateway",
        "status": status.as_u16(),
        "response": response_data,
    }))
}

fn required_str<'a>(params: &'a ActionParams, key: &str) -> Result<&'a str, ActionError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ActionError::InvalidParams(format!("missing '{key}' parameter")))
}

fn optional_str<'a>(params: &'a ActionParams, key: &str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{params, MockAction};

    #[test]
    fn unknown_type_is_a_typed_error() {
        let registry = ActionRegistry::new();
        let err = registry.resolve("teleport").err().unwrap();
        assert!(matches!(err, EngineError::UnknownActionType(name) if name == "teleport"));
    }

    #[tokio::test]
    async fn register_overwrites_previous_handler() {
        let registry = ActionRegistry::with_builtins(&ActionsConfig::default());
        let double = Arc::new(MockAction::returning(json!({ "sent": "mock" })));
        registry.register("email", double.clone());

        let handler = registry.resolve("email").unwrap();
        let output = handler.execute(&params(json!({}))).await.unwrap();

        assert_eq!(output, json!({ "sent": "mock" }));
        assert_eq!(double.call_count(), 1);
    }

    #[test]
    fn builtins_are_registered() {
        let registry = ActionRegistry::with_builtins(&ActionsConfig::default());
        assert_eq!(
            registry.registered_types(),
            vec!["delay", "email", "whatsapp", "whatsapp_message"]
        );
    }

    #[tokio::test]
    async fn delay_zero_returns_immediately() {
        let output = DelayAction.execute(&params(json!({ "seconds": 0 }))).await.unwrap();
        assert_eq!(output["delayed_seconds"], json!(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_defaults_to_five_seconds() {
        let started = tokio::time::Instant::now();
        DelayAction.execute(&ActionParams::new()).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5), "slept {elapsed:?}");
        assert!(elapsed < Duration::from_millis(5_010), "slept {elapsed:?}");
    }

    #[tokio::test]
    async fn delay_rejects_negative_seconds() {
        let err = DelayAction
            .execute(&params(json!({ "seconds": -1 })))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn delay_rejects_seconds_beyond_duration_range() {
        let err = DelayAction
            .execute(&params(json!({ "seconds": 1e20 })))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)), "got {err}");
    }

    #[tokio::test]
    async fn email_without_gateway_is_logged() {
        let email = EmailAction::new(reqwest::Client::new(), None);
        let output = email
            .execute(&params(json!({ "to": "ops@example.com", "subject": "hi" })))
            .await
            .unwrap();
        assert_eq!(output["dispatched_via"], "log");
        assert_eq!(output["to"], "ops@example.com");
    }

    #[tokio::test]
    async fn email_requires_recipient() {
        let email = EmailAction::new(reqwest::Client::new(), None);
        let err = email.execute(&params(json!({ "subject": "hi" }))).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn whatsapp_requires_phone() {
        let whatsapp = WhatsAppAction::new(reqwest::Client::new(), None);
        let err = whatsapp.execute(&params(json!({ "body": "hello" }))).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));
    }
}
