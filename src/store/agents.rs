// src/store/agents.rs
// Agent identity records with capped access levels

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::access::AccessLevel;
use crate::store::write_atomic;

/// A configured persona: its own access ceiling, preferred model, and
/// identity prompt material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub access_level: AccessLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_knowledge: Option<String>,
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, level: AccessLevel) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            access_level: level,
            preferred_model: None,
            identity_template: None,
            voice_tone: None,
            personality: None,
            custom_instructions: None,
            background_knowledge: None,
        }
    }

    /// Render the identity system-prompt block for this agent
    pub fn identity_block(&self) -> String {
        let mut block = match &self.identity_template {
            Some(template) => template
                .replace("{name}", &self.name)
                .replace("{personality}", self.personality.as_deref().unwrap_or(""))
                .replace("{voice_tone}", self.voice_tone.as_deref().unwrap_or("")),
            None => format!("You are {}.", self.name),
        };
        if let Some(ref instructions) = self.custom_instructions {
            block.push_str("\n\n");
            block.push_str(instructions);
        }
        if let Some(ref knowledge) = self.background_knowledge {
            block.push_str("\n\nBackground knowledge:\n");
            block.push_str(knowledge);
        }
        block
    }
}

/// Agent registry persisted by atomic file replace. Writes silently cap
/// each agent's level at the global ceiling.
pub struct AgentStore {
    path: PathBuf,
    agents: RwLock<HashMap<String, AgentConfig>>,
}

impl AgentStore {
    pub fn load(path: PathBuf) -> Self {
        let agents = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Vec<AgentConfig>>(&raw).ok())
            .map(|list| list.into_iter().map(|a| (a.id.clone(), a)).collect())
            .unwrap_or_default();
        Self {
            path,
            agents: RwLock::new(agents),
        }
    }

    pub fn get(&self, id: &str) -> Option<AgentConfig> {
        self.agents.read().expect("agent store poisoned").get(id).cloned()
    }

    pub fn list(&self) -> Vec<AgentConfig> {
        let mut list: Vec<_> = self
            .agents
            .read()
            .expect("agent store poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Insert or replace an agent. The stored level is capped at
    /// `global_level`; a higher requested value is silently lowered.
    pub fn upsert(&self, mut config: AgentConfig, global_level: AccessLevel) -> AgentConfig {
        if config.access_level > global_level {
            info!(
                agent = %config.id,
                requested = %config.access_level,
                capped = %global_level,
                "Agent access level capped at global ceiling"
            );
            config.access_level = global_level;
        }
        {
            let mut agents = self.agents.write().expect("agent store poisoned");
            agents.insert(config.id.clone(), config.clone());
        }
        self.persist();
        config
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut agents = self.agents.write().expect("agent store poisoned");
            agents.remove(id).is_some()
        };
        if removed {
            self.persist();
        }
        removed
    }

    /// Re-apply the global ceiling to every agent (after /control/level)
    pub fn cap_all(&self, global_level: AccessLevel) {
        let mut changed = false;
        {
            let mut agents = self.agents.write().expect("agent store poisoned");
            for agent in agents.values_mut() {
                if agent.access_level > global_level {
                    agent.access_level = global_level;
                    changed = true;
                }
            }
        }
        if changed {
            self.persist();
        }
    }

    /// Snapshot outside the lock, then replace the file atomically
    fn persist(&self) {
        let snapshot = self.list();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = write_atomic(&self.path, &json) {
                    warn!(error = %e, "Failed to persist agent store");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize agent store"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, AgentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::load(dir.path().join("agents.json"));
        (dir, store)
    }

    #[test]
    fn test_upsert_and_get() {
        let (_dir, store) = store();
        store.upsert(
            AgentConfig::new("helper", "Helper", AccessLevel::Write),
            AccessLevel::Full,
        );
        let agent = store.get("helper").unwrap();
        assert_eq!(agent.name, "Helper");
        assert_eq!(agent.access_level, AccessLevel::Write);
    }

    #[test]
    fn test_upsert_caps_level_silently() {
        let (_dir, store) = store();
        let stored = store.upsert(
            AgentConfig::new("x", "X", AccessLevel::Full),
            AccessLevel::Write,
        );
        assert_eq!(stored.access_level, AccessLevel::Write);
        assert_eq!(store.get("x").unwrap().access_level, AccessLevel::Write);
    }

    #[test]
    fn test_cap_all_lowers_existing() {
        let (_dir, store) = store();
        store.upsert(
            AgentConfig::new("a", "A", AccessLevel::Full),
            AccessLevel::Full,
        );
        store.upsert(
            AgentConfig::new("b", "B", AccessLevel::Chat),
            AccessLevel::Full,
        );
        store.cap_all(AccessLevel::Read);
        assert_eq!(store.get("a").unwrap().access_level, AccessLevel::Read);
        assert_eq!(store.get("b").unwrap().access_level, AccessLevel::Chat);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        {
            let store = AgentStore::load(path.clone());
            store.upsert(
                AgentConfig::new("p", "Persisted", AccessLevel::Read),
                AccessLevel::Full,
            );
        }
        let reloaded = AgentStore::load(path);
        assert_eq!(reloaded.get("p").unwrap().name, "Persisted");
    }

    #[test]
    fn test_identity_block_template() {
        let mut agent = AgentConfig::new("t", "Torbo", AccessLevel::Chat);
        agent.identity_template = Some("You are {name}, {personality}.".into());
        agent.personality = Some("dry and precise".into());
        agent.custom_instructions = Some("Answer in one sentence.".into());
        let block = agent.identity_block();
        assert!(block.contains("You are Torbo, dry and precise."));
        assert!(block.contains("Answer in one sentence."));
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = store();
        store.upsert(
            AgentConfig::new("gone", "G", AccessLevel::Chat),
            AccessLevel::Full,
        );
        assert!(store.remove("gone"));
        assert!(!store.remove("gone"));
        assert!(store.get("gone").is_none());
    }
}
