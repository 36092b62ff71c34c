//! Logging action sink
//!
//! Accepts every admitted request, logs it, and acknowledges. Submission is
//! idempotent by request id: a resubmitted id returns the original receipt
//! unchanged. Useful for dry-run deployments where the real execution
//! backend is not wired yet.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use steward_core::error::CoreResult;
use steward_core::ports::{ActionSink, SinkStatus, SubmitReceipt};
use steward_core::types::ActionRequest;
use tracing::info;
use uuid::Uuid;

#[derive(Default)]
pub struct LoggingActionSink {
    receipts: Mutex<HashMap<Uuid, SubmitReceipt>>,
}

impl LoggingActionSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionSink for LoggingActionSink {
    async fn submit(&self, request: &ActionRequest) -> CoreResult<SubmitReceipt> {
        let mut receipts = self.receipts.lock().unwrap();
        if let Some(existing) = receipts.get(&request.id) {
            return Ok(existing.clone());
        }
        info!(
            request_id = %request.id,
            actor = %request.actor,
            kind = request.kind.as_str(),
            "action accepted (dry run)"
        );
        let receipt = SubmitReceipt {
            accepted: true,
            id: request.id,
            reason: None,
        };
        receipts.insert(request.id, receipt.clone());
        Ok(receipt)
    }

    async fn status(&self, id: Uuid) -> CoreResult<SinkStatus> {
        let receipts = self.receipts.lock().unwrap();
        Ok(SinkStatus {
            state: if receipts.contains_key(&id) {
                "accepted".to_string()
            } else {
                "unknown".to_string()
            },
            result: None,
        })
    }
}
