// src/store/devices.rs
// Paired-device registry: opaque tokens, 30-day inactivity expiry

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::store::write_atomic;

/// Days of inactivity after which a device token stops authenticating
const EXPIRY_DAYS: i64 = 30;
/// Random bytes per token (>= 24 required)
const TOKEN_BYTES: usize = 32;
/// Device names are sanitized to this many characters
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    pub id: String,
    pub name: String,
    pub token: String,
    pub paired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl PairedDevice {
    /// A device is expired when neither pairing nor use happened within
    /// the expiry window.
    fn expired(&self, now: DateTime<Utc>) -> bool {
        let reference = self.last_seen.unwrap_or(self.paired_at);
        now - reference > Duration::days(EXPIRY_DAYS)
    }
}

/// Strip control characters and enforce the length cap on device names
pub fn sanitize_device_name(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim();
    trimmed.chars().take(MAX_NAME_LEN).collect()
}

/// Mint an opaque device token: random bytes, base64url without padding
fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Persisted device registry, mutated under its own lock, written
/// atomically on every change.
pub struct DeviceStore {
    path: PathBuf,
    devices: RwLock<Vec<PairedDevice>>,
}

impl DeviceStore {
    pub fn load(path: PathBuf) -> Self {
        let devices = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            devices: RwLock::new(devices),
        }
    }

    /// Pair a new device, returning its record (token included once)
    pub fn pair(&self, name: &str) -> PairedDevice {
        let device = PairedDevice {
            id: uuid::Uuid::new_v4().to_string(),
            name: sanitize_device_name(name),
            token: mint_token(),
            paired_at: Utc::now(),
            last_seen: None,
        };
        {
            let mut devices = self.devices.write().expect("device store poisoned");
            devices.push(device.clone());
        }
        self.persist();
        info!(device = %device.id, "Device paired");
        device
    }

    /// Idempotent pairing by name for trusted-network auto-pair.
    /// Returns `(device, existed)`.
    pub fn pair_auto(&self, name: &str) -> (PairedDevice, bool) {
        let clean = sanitize_device_name(name);
        let existing = {
            let devices = self.devices.read().expect("device store poisoned");
            devices
                .iter()
                .find(|d| d.name == clean && !d.expired(Utc::now()))
                .cloned()
        };
        match existing {
            Some(device) => (device, true),
            None => (self.pair(&clean), false),
        }
    }

    /// Resolve a bearer token to an unexpired device, updating
    /// `last_seen` on success.
    pub fn authenticate(&self, token: &str) -> Option<PairedDevice> {
        let now = Utc::now();
        let authenticated = {
            let mut devices = self.devices.write().expect("device store poisoned");
            devices.iter_mut().find_map(|d| {
                if d.token == token && !d.expired(now) {
                    d.last_seen = Some(now);
                    Some(d.clone())
                } else {
                    None
                }
            })
        };
        if authenticated.is_some() {
            self.persist();
        }
        authenticated
    }

    /// Token validity check without side effects (pairing verify)
    pub fn verify(&self, token: &str) -> bool {
        let now = Utc::now();
        self.devices
            .read()
            .expect("device store poisoned")
            .iter()
            .any(|d| d.token == token && !d.expired(now))
    }

    pub fn list(&self) -> Vec<PairedDevice> {
        self.devices.read().expect("device store poisoned").clone()
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut devices = self.devices.write().expect("device store poisoned");
            let before = devices.len();
            devices.retain(|d| d.id != id);
            devices.len() != before
        };
        if removed {
            self.persist();
        }
        removed
    }

    fn persist(&self) {
        let snapshot = self.list();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = write_atomic(&self.path, &json) {
                    warn!(error = %e, "Failed to persist device store");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize device store"),
        }
    }
}
