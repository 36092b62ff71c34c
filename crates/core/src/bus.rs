//! Typed in-process event bus
//!
//! Two delivery classes, chosen per topic:
//! - telemetry topics ride a `broadcast` channel: a slow subscriber lags and
//!   loses the oldest entries, publishers never block.
//! - decision topics ride bounded `mpsc` queues per subscriber: a full queue
//!   blocks the publisher up to a timeout, then the publish fails with
//!   `Overloaded`.
//!
//! Ordering is preserved per topic. Delivery is at-least-once within the
//! process; subscribers dedupe on event ids where it matters. Every
//! published event is also appended to the durable journal with a payload
//! hash.

use crate::error::{CoreError, CoreResult};
use crate::types::{DecisionLevel, OperatingMode, Risk};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_QUEUE_CAP: usize = 1024;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Decisions,
    Mode,
    Health,
    Improvements,
    Errors,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Decisions,
        Topic::Mode,
        Topic::Health,
        Topic::Improvements,
        Topic::Errors,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Decisions => "decisions",
            Topic::Mode => "mode",
            Topic::Health => "health",
            Topic::Improvements => "improvements",
            Topic::Errors => "errors",
        }
    }

    /// Decision-class topics get backpressure; the rest are telemetry.
    fn is_decision_class(self) -> bool {
        matches!(self, Topic::Decisions | Topic::Mode)
    }
}

/// Events exchanged between components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A governance decision finished its cycle (approved or rejected).
    DecisionCompleted {
        event_id: Uuid,
        decision_id: Uuid,
        level: DecisionLevel,
        approved: bool,
        weighted_score: f64,
        confidence: f64,
        risk: Risk,
        /// Wall time from context creation to completion.
        elapsed_ms: u64,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    /// Operating mode transition.
    ModeChanged {
        event_id: Uuid,
        from: OperatingMode,
        to: OperatingMode,
        reason: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    /// Periodic health score report.
    HealthReport {
        event_id: Uuid,
        score: f64,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    /// Health crossed the warn threshold.
    Degraded {
        event_id: Uuid,
        score: f64,
        detail: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    /// Health crossed the critical threshold or failures accumulated.
    EmergencySignal {
        event_id: Uuid,
        reason: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    /// A queue or tick budget overran; the source skipped work.
    Overloaded {
        event_id: Uuid,
        component: String,
        detail: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    /// Non-fatal component error, converted at the boundary.
    ComponentError {
        event_id: Uuid,
        component: String,
        kind: String,
        detail: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    /// Improvement candidate changed state.
    ImprovementTransition {
        event_id: Uuid,
        candidate_id: Uuid,
        state: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::DecisionCompleted { .. } => Topic::Decisions,
            Event::ModeChanged { .. } => Topic::Mode,
            Event::HealthReport { .. } | Event::Degraded { .. } | Event::EmergencySignal { .. } => {
                Topic::Health
            }
            Event::ImprovementTransition { .. } => Topic::Improvements,
            Event::Overloaded { .. } | Event::ComponentError { .. } => Topic::Errors,
        }
    }

    pub fn event_id(&self) -> Uuid {
        match self {
            Event::DecisionCompleted { event_id, .. }
            | Event::ModeChanged { event_id, .. }
            | Event::HealthReport { event_id, .. }
            | Event::Degraded { event_id, .. }
            | Event::EmergencySignal { event_id, .. }
            | Event::Overloaded { event_id, .. }
            | Event::ComponentError { event_id, .. }
            | Event::ImprovementTransition { event_id, .. } => *event_id,
        }
    }
}

/// One line of the durable event journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub topic: Topic,
    pub payload_hash: String,
    pub payload: serde_json::Value,
}

/// Append-only JSONL journal keyed by monotonic sequence.
pub struct EventJournal {
    writer: Mutex<BufWriter<File>>,
    seq: AtomicU64,
}

impl EventJournal {
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Transient(format!("create journal dir {}: {e}", parent.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CoreError::Transient(format!("open journal {}: {e}", path.display())))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            seq: AtomicU64::new(0),
        })
    }

    fn append(&self, event: &Event) -> CoreResult<u64> {
        let payload = serde_json::to_value(event)
            .map_err(|e| CoreError::Fatal(format!("unserializable event: {e}")))?;
        let hash = {
            let bytes =
                serde_json::to_vec(&payload).map_err(|e| CoreError::Fatal(e.to_string()))?;
            let digest = Sha256::digest(&bytes);
            format!("{digest:x}")
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let entry = JournalEntry {
            seq,
            ts: Utc::now(),
            topic: event.topic(),
            payload_hash: hash,
            payload,
        };
        let line =
            serde_json::to_string(&entry).map_err(|e| CoreError::Fatal(e.to_string()))?;
        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{line}")
            .and_then(|_| writer.flush())
            .map_err(|e| CoreError::Transient(format!("journal append: {e}")))?;
        Ok(seq)
    }
}

struct DecisionSubscriber {
    name: String,
    tx: mpsc::Sender<Event>,
}

/// In-process pub/sub hub.
pub struct EventBus {
    queue_cap: usize,
    send_timeout: Duration,
    telemetry: HashMap<Topic, broadcast::Sender<Event>>,
    decision_subs: Mutex<HashMap<Topic, Vec<DecisionSubscriber>>>,
    journal: Option<EventJournal>,
}

impl EventBus {
    pub fn new(queue_cap: usize, send_timeout: Duration) -> Self {
        let mut telemetry = HashMap::new();
        for topic in Topic::ALL {
            if !topic.is_decision_class() {
                let (tx, _) = broadcast::channel(queue_cap);
                telemetry.insert(topic, tx);
            }
        }
        Self {
            queue_cap,
            send_timeout,
            telemetry,
            decision_subs: Mutex::new(HashMap::new()),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: EventJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Subscribe to a telemetry topic. Lagging loses oldest entries.
    pub fn subscribe_telemetry(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.telemetry
            .get(&topic)
            .expect("telemetry topic registered at construction")
            .subscribe()
    }

    /// Subscribe to a decision-class topic with a dedicated bounded queue.
    pub fn subscribe_decisions(&self, topic: Topic, name: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.queue_cap);
        self.decision_subs
            .lock()
            .unwrap()
            .entry(topic)
            .or_default()
            .push(DecisionSubscriber {
                name: name.to_string(),
                tx,
            });
        rx
    }

    /// Publish an event to its topic. Decision-class topics apply
    /// backpressure; after `send_timeout` the publish fails `Overloaded`.
    pub async fn publish(&self, event: Event) -> CoreResult<()> {
        if let Some(journal) = &self.journal {
            // Journal failures degrade to a warning; the journal is a record
            // of bus traffic, not the source of truth for decisions.
            if let Err(e) = journal.append(&event) {
                warn!(error = %e, "event journal append failed");
            }
        }

        let topic = event.topic();
        if topic.is_decision_class() {
            let subscribers: Vec<(String, mpsc::Sender<Event>)> = {
                let subs = self.decision_subs.lock().unwrap();
                subs.get(&topic)
                    .map(|v| {
                        v.iter()
                            .filter(|s| !s.tx.is_closed())
                            .map(|s| (s.name.clone(), s.tx.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            };
            for (name, tx) in subscribers {
                match tokio::time::timeout(self.send_timeout, tx.send(event.clone())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {} // subscriber dropped between snapshot and send
                    Err(_) => {
                        return Err(CoreError::Overloaded(format!(
                            "subscriber {name} on {} did not drain within {:?}",
                            topic.as_str(),
                            self.send_timeout
                        )));
                    }
                }
            }
            Ok(())
        } else {
            // No receivers is fine; broadcast just drops the event.
            let _ = self
                .telemetry
                .get(&topic)
                .expect("telemetry topic registered at construction")
                .send(event);
            Ok(())
        }
    }

    /// Current queue depths, for health reporting.
    pub fn queue_depths(&self) -> Vec<(Topic, usize)> {
        let mut depths = Vec::new();
        for (topic, tx) in &self.telemetry {
            depths.push((*topic, tx.len()));
        }
        let subs = self.decision_subs.lock().unwrap();
        for (topic, list) in subs.iter() {
            let depth = list
                .iter()
                .map(|s| self.queue_cap - s.tx.capacity())
                .max()
                .unwrap_or(0);
            depths.push((*topic, depth));
        }
        depths.sort_by_key(|(t, _)| t.as_str());
        depths
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAP, DEFAULT_SEND_TIMEOUT)
    }
}
