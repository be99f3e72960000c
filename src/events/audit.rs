// src/events/audit.rs
// Append-only audit log: bounded ring + optional file sink

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

use crate::access::AccessLevel;

/// In-memory entries retained for the /audit/log endpoint
const RING_CAP: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub required_level: u8,
    pub granted: bool,
    pub detail: String,
}

/// Every request that reaches the access guard produces exactly one
/// entry; rejection paths (auth, rate limit) produce theirs at the
/// rejection site.
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    file: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            file,
        }
    }

    pub fn record(
        &self,
        client_ip: &str,
        method: &str,
        path: &str,
        required: AccessLevel,
        granted: bool,
        detail: impl Into<String>,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            required_level: required.as_u8(),
            granted,
            detail: detail.into(),
        };

        {
            let mut entries = self.entries.lock().expect("audit log poisoned");
            entries.push_back(entry.clone());
            while entries.len() > RING_CAP {
                entries.pop_front();
            }
        }

        if let Some(ref path) = self.file
            && let Err(e) = append_line(path, &entry)
        {
            warn!(error = %e, "Failed to write audit file");
        }
    }

    /// Page through entries, newest first
    pub fn page(&self, offset: usize, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock().expect("audit log poisoned");
        entries
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn append_line(path: &PathBuf, entry: &AuditEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(entry)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writeln!(file, "{}", line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_page_newest_first() {
        let log = AuditLog::new(None);
        log.record("1.1.1.1", "GET", "/a", AccessLevel::Chat, true, "ok");
        log.record("1.1.1.1", "GET", "/b", AccessLevel::Read, false, "denied");

        let page = log.page(0, 10);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].path, "/b");
        assert!(!page[0].granted);
        assert_eq!(page[1].path, "/a");
    }

    #[test]
    fn test_pagination_offset() {
        let log = AuditLog::new(None);
        for i in 0..5 {
            log.record("ip", "GET", &format!("/{}", i), AccessLevel::Chat, true, "");
        }
        let page = log.page(2, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].path, "/2");
        assert_eq!(page[1].path, "/1");
    }

    #[test]
    fn test_ring_bound() {
        let log = AuditLog::new(None);
        for i in 0..(RING_CAP + 10) {
            log.record("ip", "GET", &format!("/{}", i), AccessLevel::Chat, true, "");
        }
        assert_eq!(log.len(), RING_CAP);
    }

    #[test]
    fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(Some(path.clone()));
        log.record("9.9.9.9", "POST", "/exec/shell", AccessLevel::Full, false, "level");

        let raw = std::fs::read_to_string(&path).unwrap();
        let entry: AuditEntry = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(entry.client_ip, "9.9.9.9");
        assert_eq!(entry.required_level, 5);
    }
}
