// routing/src/route_manager.rs

use crate::device_registry::DeviceRegistry;
use log::{info, warn};
use midi_fabric_core::{DeviceId, MessageTypeMask, NodeId, RuleError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub last_used_micros: u64,
}

/// Caller-supplied half of a rule; the manager assigns the id.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub src_node: NodeId,
    pub src_dev: DeviceId,
    pub dst_node: NodeId,
    pub dst_dev: DeviceId,
    pub priority: i32,
    pub enabled: bool,
    /// 1..=16 selects one channel, 0 or None matches any.
    pub channel_filter: Option<u8>,
    pub message_types: MessageTypeMask,
}

impl NewRule {
    pub fn new(src_node: NodeId, src_dev: DeviceId, dst_node: NodeId, dst_dev: DeviceId) -> Self {
        Self {
            src_node,
            src_dev,
            dst_node,
            dst_dev,
            priority: 0,
            enabled: true,
            channel_filter: None,
            message_types: MessageTypeMask::ALL,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn channel(mut self, channel: u8) -> Self {
        self.channel_filter = Some(channel);
        self
    }

    pub fn types(mut self, mask: MessageTypeMask) -> Self {
        self.message_types = mask;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A validated forwarding edge. Statistics live in memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub id: String,
    pub src_node: NodeId,
    pub src_dev: DeviceId,
    pub dst_node: NodeId,
    pub dst_dev: DeviceId,
    pub priority: i32,
    pub enabled: bool,
    pub channel_filter: Option<u8>,
    pub message_types: MessageTypeMask,
    #[serde(skip)]
    pub stats: RuleStats,
    #[serde(skip)]
    inserted: u64,
}

#[derive(Serialize, Deserialize)]
struct RulesFile {
    version: u32,
    rules: Vec<ForwardingRule>,
}

/// Forwarding-rule store: CRUD with validation, priority ordering, per-rule
/// statistics, and durable JSON persistence.
pub struct RouteManager {
    devices: Arc<DeviceRegistry>,
    inner: RwLock<Store>,
}

#[derive(Default)]
struct Store {
    rules: HashMap<String, ForwardingRule>,
    next_insert: u64,
}

impl RouteManager {
    pub fn new(devices: Arc<DeviceRegistry>) -> Self {
        Self {
            devices,
            inner: RwLock::new(Store::default()),
        }
    }

    /// Validates and stores a rule, returning its assigned id.
    ///
    /// Self-routing is allowed; the forwarding engine relies on loop
    /// prevention rather than rule-time refusal.
    pub fn add_rule(&self, rule: NewRule) -> Result<String, RuleError> {
        self.validate(&rule)?;
        let id = Uuid::new_v4().simple().to_string();
        let mut store = self.inner.write().expect("rule store lock");
        let inserted = store.next_insert;
        store.next_insert += 1;
        store.rules.insert(
            id.clone(),
            ForwardingRule {
                id: id.clone(),
                src_node: rule.src_node,
                src_dev: rule.src_dev,
                dst_node: rule.dst_node,
                dst_dev: rule.dst_dev,
                priority: rule.priority,
                enabled: rule.enabled,
                channel_filter: rule.channel_filter,
                message_types: rule.message_types,
                stats: RuleStats::default(),
                inserted,
            },
        );
        Ok(id)
    }

    pub fn remove_rule(&self, id: &str) -> Result<(), RuleError> {
        self.inner
            .write()
            .expect("rule store lock")
            .rules
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuleError::NoSuchRule(id.to_string()))
    }

    /// Replaces a rule's parameters, keeping its id, statistics, and place
    /// in the insertion order.
    pub fn update_rule(&self, id: &str, rule: NewRule) -> Result<(), RuleError> {
        self.validate(&rule)?;
        let mut store = self.inner.write().expect("rule store lock");
        let existing = store
            .rules
            .get_mut(id)
            .ok_or_else(|| RuleError::NoSuchRule(id.to_string()))?;
        existing.src_node = rule.src_node;
        existing.src_dev = rule.src_dev;
        existing.dst_node = rule.dst_node;
        existing.dst_dev = rule.dst_dev;
        existing.priority = rule.priority;
        existing.enabled = rule.enabled;
        existing.channel_filter = rule.channel_filter;
        existing.message_types = rule.message_types;
        Ok(())
    }

    pub fn get_rule(&self, id: &str) -> Option<ForwardingRule> {
        self.inner
            .read()
            .expect("rule store lock")
            .rules
            .get(id)
            .cloned()
    }

    pub fn get_all_rules(&self) -> Vec<ForwardingRule> {
        let store = self.inner.read().expect("rule store lock");
        let mut rules: Vec<ForwardingRule> = store.rules.values().cloned().collect();
        rules.sort_by_key(|r| r.inserted);
        rules
    }

    pub fn clear_all_rules(&self) {
        self.inner.write().expect("rule store lock").rules.clear();
    }

    pub fn rule_count(&self) -> usize {
        self.inner.read().expect("rule store lock").rules.len()
    }

    /// Enabled rules matching the source, highest priority first, ties in
    /// insertion order.
    pub fn get_destinations(&self, src_node: NodeId, src_dev: DeviceId) -> Vec<ForwardingRule> {
        let local = self.devices.local_node();
        let store = self.inner.read().expect("rule store lock");
        let mut rules: Vec<ForwardingRule> = store
            .rules
            .values()
            .filter(|r| {
                r.enabled && same_node(r.src_node, src_node, local) && r.src_dev == src_dev
            })
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.inserted.cmp(&b.inserted)));
        rules
    }

    /// Bumps forwarded or dropped on a rule; forwarded also stamps
    /// last-used.
    pub fn update_rule_statistics(&self, id: &str, forwarded: bool) {
        let mut store = self.inner.write().expect("rule store lock");
        if let Some(rule) = store.rules.get_mut(id) {
            if forwarded {
                rule.stats.forwarded += 1;
                rule.stats.last_used_micros = unix_micros();
            } else {
                rule.stats.dropped += 1;
            }
        }
    }

    pub fn reset_statistics(&self) {
        let mut store = self.inner.write().expect("rule store lock");
        for rule in store.rules.values_mut() {
            rule.stats = RuleStats::default();
        }
    }

    /// Writes the rule set as JSON, atomically: temp file then rename.
    pub fn save_to_file(&self, path: &Path) -> Result<(), RuleError> {
        let file = RulesFile {
            version: 1,
            rules: self.get_all_rules(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| RuleError::Persistence(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RuleError::Persistence(e.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| RuleError::Persistence(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| RuleError::Persistence(e.to_string()))?;
        info!("saved {} rules to {}", self.rule_count(), path.display());
        Ok(())
    }

    /// Loads rules from disk, replacing the in-memory set. A missing file is
    /// a fresh install; a corrupt file leaves an empty set and reports the
    /// problem. Statistics start from zero either way.
    pub fn load_from_file(&self, path: &Path) -> Result<usize, RuleError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.clear_all_rules();
                return Ok(0);
            }
            Err(e) => {
                self.clear_all_rules();
                return Err(RuleError::Persistence(e.to_string()));
            }
        };

        let file: RulesFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!("corrupt rules file {}: {e}", path.display());
                self.clear_all_rules();
                return Err(RuleError::Persistence(e.to_string()));
            }
        };

        let mut store = self.inner.write().expect("rule store lock");
        store.rules.clear();
        store.next_insert = 0;
        for mut rule in file.rules {
            rule.inserted = store.next_insert;
            store.next_insert += 1;
            store.rules.insert(rule.id.clone(), rule);
        }
        Ok(store.rules.len())
    }

    fn validate(&self, rule: &NewRule) -> Result<(), RuleError> {
        if let Some(ch) = rule.channel_filter {
            if ch > 16 {
                return Err(RuleError::InvalidChannelFilter(ch));
            }
        }
        if !self.devices.contains_node(rule.src_node) {
            return Err(RuleError::UnknownSourceNode(rule.src_node.to_string()));
        }
        if !self.devices.device_exists(rule.src_node, rule.src_dev) {
            return Err(RuleError::UnknownSourceDevice {
                node: rule.src_node.to_string(),
                device: rule.src_dev,
            });
        }
        if !self.devices.contains_node(rule.dst_node) {
            return Err(RuleError::UnknownDestNode(rule.dst_node.to_string()));
        }
        if !self.devices.device_exists(rule.dst_node, rule.dst_dev) {
            return Err(RuleError::UnknownDestDevice {
                node: rule.dst_node.to_string(),
                device: rule.dst_dev,
            });
        }
        Ok(())
    }
}

/// Node equality that treats the all-zero "this node" spelling and the
/// host's own id as the same thing.
fn same_node(a: NodeId, b: NodeId, local: NodeId) -> bool {
    let a = if a.is_local() { local } else { a };
    let b = if b.is_local() { local } else { b };
    a == b
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
