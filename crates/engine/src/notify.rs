//! Subscriber notifications for migration steps
//!
//! Delivery is fire-and-forget from the engine's point of view: a failed
//! notification becomes a warning on the notify step and never blocks the
//! migration.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use planguard_shared::SubscriptionId;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::impact::RecommendedAction;

/// Template tags passed to the notification collaborator
pub mod template {
    pub const MIGRATE: &str = "plan_change.migrate";
    pub const UPGRADE_OFFER: &str = "plan_change.upgrade_offer";
    pub const DOWNGRADE_OFFER: &str = "plan_change.downgrade_offer";
    pub const GRANDFATHERED: &str = "plan_change.grandfathered";
    pub const NOTICE: &str = "plan_change.notice";
}

/// Template tag for a recommended action
pub fn template_for(action: RecommendedAction) -> &'static str {
    match action {
        RecommendedAction::Migrate => template::MIGRATE,
        RecommendedAction::Upgrade => template::UPGRADE_OFFER,
        RecommendedAction::Downgrade => template::DOWNGRADE_OFFER,
        RecommendedAction::Grandfather => template::GRANDFATHERED,
        RecommendedAction::NoAction => template::NOTICE,
    }
}

/// Notification collaborator
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification. `Err` carries a human-readable reason that
    /// ends up as a step warning.
    async fn notify(
        &self,
        subscription_id: SubscriptionId,
        template_tag: &str,
        payload: Value,
    ) -> Result<(), String>;
}

/// Notifier that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(
        &self,
        subscription_id: SubscriptionId,
        template_tag: &str,
        _payload: Value,
    ) -> Result<(), String> {
        tracing::debug!(
            subscription_id = %subscription_id,
            template = %template_tag,
            "Notification dropped (no notifier configured)"
        );
        Ok(())
    }
}

/// Webhook notifier configuration
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Endpoint receiving notification requests
    pub url: String,
    /// Optional bearer token
    pub token: Option<String>,
}

/// Notifier that POSTs JSON to a notification service
#[derive(Clone)]
pub struct HttpNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(
        &self,
        subscription_id: SubscriptionId,
        template_tag: &str,
        payload: Value,
    ) -> Result<(), String> {
        let body = serde_json::json!({
            "subscription_id": subscription_id,
            "template": template_tag,
            "payload": payload,
        });

        let mut request = self.client.post(&self.config.url).json(&body);
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    template = %template_tag,
                    "Plan change notification sent"
                );
                Ok(())
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::warn!(
                    subscription_id = %subscription_id,
                    template = %template_tag,
                    status = %status,
                    body = %body,
                    "Plan change notification rejected - non-fatal"
                );
                Err(format!("notification service returned {}", status))
            }
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    template = %template_tag,
                    error = %e,
                    "Plan change notification failed - non-fatal"
                );
                Err(format!("notification request failed: {}", e))
            }
        }
    }
}

/// Webhook notifier when `NOTIFICATION_WEBHOOK_URL` is set, otherwise a no-op
pub fn notifier_from_config(config: &EngineConfig) -> Arc<dyn Notifier> {
    match &config.notification_webhook_url {
        Some(url) => Arc::new(HttpNotifier::new(WebhookConfig {
            url: url.clone(),
            token: config.notification_webhook_token.clone(),
        })),
        None => {
            tracing::info!("No notification webhook configured, notifications disabled");
            Arc::new(NoopNotifier)
        }
    }
}

/// A notification captured by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub subscription_id: SubscriptionId,
    pub template_tag: String,
    pub payload: Value,
}

/// Notifier that keeps every call in memory, optionally failing some of them
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    failing: Mutex<Vec<SubscriptionId>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject notifications addressed to this subscription
    pub fn fail_for(&self, subscription_id: SubscriptionId) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(subscription_id);
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        subscription_id: SubscriptionId,
        template_tag: &str,
        payload: Value,
    ) -> Result<(), String> {
        let rejected = self
            .failing
            .lock()
            .map(|f| f.contains(&subscription_id))
            .unwrap_or(false);
        if rejected {
            return Err(format!("delivery refused for {}", subscription_id));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentNotification {
                subscription_id,
                template_tag: template_tag.to_string(),
                payload,
            });
        }
        Ok(())
    }
}
