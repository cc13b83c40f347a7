//! Configuration surface: deserializing a switch terminal's initial capacity
//! and a circuit-blocker policy from JSON or YAML.
//!
//! `from_str` sniffs the format instead of asking the caller to say which
//! one they have: a leading `{` means JSON, anything else is tried as YAML.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub fn from_str<T: for<'de> Deserialize<'de>>(txt: &str) -> Result<T> {
    let trimmed = txt.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(txt).map_err(|e| Error::invalid_argument(format!("invalid JSON config: {}", e)))
    } else {
        serde_yaml::from_str(txt).map_err(|e| Error::invalid_argument(format!("invalid YAML config: {}", e)))
    }
}

/// A switch terminal's initial bandwidth capacity. `None` in either field
/// means unlimited, matching `Switch::modify_bandwidth`'s own convention.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalConfig {
    pub ingress: Option<f64>,
    pub egress: Option<f64>,
}

/// A per-terminal label blocklist, keyed by `<prefix><terminal-name>` in
/// the backing property set. Values are comma/space-separated integer
/// label lists — every label named in the value sets that bit, not just
/// the first (see DESIGN.md for why this beats a single-integer parse).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CircuitBlockerConfig {
    #[serde(flatten)]
    properties: HashMap<String, String>,
}

/// A parsed circuit blocker: which labels are blocked on which terminal.
pub struct CircuitBlocker {
    prefix: String,
    blocked: HashMap<String, HashSet<i32>>,
}

impl CircuitBlockerConfig {
    /// Parses every `<prefix><terminal-name>` property into a per-terminal
    /// label set.
    pub fn build(&self, prefix: &str) -> Result<CircuitBlocker> {
        let mut blocked: HashMap<String, HashSet<i32>> = HashMap::new();
        for (key, value) in &self.properties {
            let terminal_name = match key.strip_prefix(prefix) {
                Some(rest) if !rest.is_empty() => rest,
                _ => continue,
            };
            let mut labels = HashSet::new();
            for token in value.split(|c: char| c == ',' || c.is_whitespace()) {
                if token.is_empty() {
                    continue;
                }
                let label: i32 = token
                    .parse()
                    .map_err(|_| Error::invalid_argument(format!("circuit blocker label {:?} is not an integer", token)))?;
                labels.insert(label);
            }
            blocked.insert(terminal_name.to_string(), labels);
        }
        Ok(CircuitBlocker { prefix: prefix.to_string(), blocked })
    }
}

impl CircuitBlocker {
    pub fn is_blocked(&self, terminal_name: &str, label: i32) -> bool {
        self.blocked.get(terminal_name).map(|labels| labels.contains(&label)).unwrap_or(false)
    }

    pub fn is_clear(&self, terminal_name: &str, label: i32) -> bool {
        !self.is_blocked(terminal_name, label)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}
