// src/events/mod.rs
// Event bus: ring buffer, glob-matched SSE fan-out, critical persistence

mod audit;

pub use audit::{AuditEntry, AuditLog};

use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events retained in the ring buffer
const RING_CAP: usize = 1000;
/// Per-subscriber channel depth; slow consumers drop events
const SUBSCRIBER_BUFFER: usize = 64;

/// Event names with these prefixes are persisted durably
const CRITICAL_PREFIXES: &[&str] = &["system.gateway.", "system.agent.error", "security."];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Dotted name, e.g. `system.agent.completed`
    pub name: String,
    pub payload: HashMap<String, String>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

struct Subscriber {
    pattern: Pattern,
    tx: mpsc::Sender<Event>,
}

/// Publish-subscribe bus. Publishing never blocks: the ring buffer is
/// bounded, subscriber sends are best-effort, and the critical-event
/// file is appended synchronously (small writes).
pub struct EventBus {
    ring: Mutex<VecDeque<Event>>,
    subscribers: Mutex<Vec<Subscriber>>,
    critical_file: Option<PathBuf>,
}

impl EventBus {
    pub fn new(critical_file: Option<PathBuf>) -> Self {
        Self {
            ring: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
            critical_file,
        }
    }

    pub fn publish(
        &self,
        name: impl Into<String>,
        payload: HashMap<String, String>,
        source: impl Into<String>,
    ) {
        let event = Event {
            name: name.into(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
        };

        {
            let mut ring = self.ring.lock().expect("event ring poisoned");
            ring.push_back(event.clone());
            while ring.len() > RING_CAP {
                ring.pop_front();
            }
        }

        {
            let mut subscribers = self.subscribers.lock().expect("subscribers poisoned");
            subscribers.retain(|sub| {
                if !sub.pattern.matches(&event.name) {
                    return !sub.tx.is_closed();
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(event = %event.name, "Subscriber lagging, event dropped");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }

        if is_critical(&event.name)
            && let Some(ref path) = self.critical_file
            && let Err(e) = append_event(path, &event)
        {
            warn!(error = %e, "Failed to persist critical event");
        }
    }

    /// Subscribe with a glob pattern (`system.*`, `*`). Invalid patterns
    /// subscribe to nothing.
    pub fn subscribe(&self, pattern: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let pattern = Pattern::new(pattern).unwrap_or_else(|_| {
            warn!(pattern = %pattern, "Invalid event pattern, subscribing to nothing");
            Pattern::new("\u{0}none").expect("literal pattern parses")
        });
        self.subscribers
            .lock()
            .expect("subscribers poisoned")
            .push(Subscriber { pattern, tx });
        rx
    }

    /// Most recent events, oldest first
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let ring = self.ring.lock().expect("event ring poisoned");
        ring.iter().rev().take(limit).rev().cloned().collect()
    }
}

fn is_critical(name: &str) -> bool {
    CRITICAL_PREFIXES
        .iter()
        .any(|p| name.starts_with(p) || name == p.trim_end_matches('.'))
}

fn append_event(path: &PathBuf, event: &Event) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(event)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writeln!(file, "{}", line)
}
