//! Alerting through structured logging
//!
//! Fire-and-forget by construction: a tracing subscriber is always
//! available, so this adapter cannot be unavailable.

use async_trait::async_trait;
use steward_core::ports::{AlertSeverity, Alerting};
use tracing::{error, info, warn};

#[derive(Default)]
pub struct TracingAlerter;

impl TracingAlerter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Alerting for TracingAlerter {
    async fn alert(&self, severity: AlertSeverity, summary: &str, payload: serde_json::Value) {
        match severity {
            AlertSeverity::Info => info!(target: "steward::alert", %payload, "{summary}"),
            AlertSeverity::Warning => warn!(target: "steward::alert", %payload, "{summary}"),
            AlertSeverity::Critical => error!(target: "steward::alert", %payload, "{summary}"),
        }
    }
}
