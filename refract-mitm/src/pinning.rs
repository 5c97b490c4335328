//! Pinning exception list.
//!
//! Apps that pin their server certificates break under interception, so
//! their flows must be left alone. Exceptions come from two places: a
//! statically loaded allow-list of `{app, domain_patterns}` entries, and
//! dynamic records added whenever a handshake fails — one failed
//! interception is enough to stop retrying that (domain, app) pair.

use crate::error::{MitmError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

/// Matches any application in a rule or dynamic record
const ANY_APP: &str = "*";

/// One allow-list entry: an application and the domains it pins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinningEntry {
    pub app: String,
    #[serde(default)]
    pub domain_patterns: Vec<String>,
}

/// Static allow-list plus dynamically recorded handshake failures
#[derive(Default)]
pub struct PinningList {
    rules: RwLock<Vec<PinningEntry>>,
    /// certificate common name (lowercased) -> app names
    dynamic: DashMap<String, HashSet<String>>,
}

impl PinningList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<PinningEntry>) -> Self {
        info!("Loaded {} pinning entries", entries.len());
        Self {
            rules: RwLock::new(entries),
            dynamic: DashMap::new(),
        }
    }

    /// Parse a JSON allow-list: `[{"app": "...", "domain_patterns": [...]}]`
    pub fn load_json(json: &str) -> Result<Self> {
        let entries: Vec<PinningEntry> =
            serde_json::from_str(json).map_err(|e| MitmError::Pinning(e.to_string()))?;
        Ok(Self::from_entries(entries))
    }

    /// Remember that interception of `domain` failed for `app`; future
    /// connections to that name from that app bypass interception.
    pub fn record_failure(&self, domain: &str, app: Option<&str>) {
        let domain = domain.to_lowercase();
        let app = app.unwrap_or(ANY_APP).to_string();
        debug!("Recording pinning exception: {} for {}", domain, app);
        self.dynamic.entry(domain).or_default().insert(app);
    }

    /// Whether a flow presenting `names` (CN + SANs) from `app` must bypass
    /// interception.
    pub fn is_exempt(&self, names: &[String], app: Option<&str>) -> bool {
        for name in names {
            let name = name.to_lowercase();

            if let Some(apps) = self.dynamic.get(&name) {
                if apps.contains(ANY_APP) || app.is_some_and(|a| apps.contains(a)) {
                    return true;
                }
            }

            for entry in self.rules.read().iter() {
                let app_matches = entry.app == ANY_APP || app == Some(entry.app.as_str());
                if app_matches
                    && entry
                        .domain_patterns
                        .iter()
                        .any(|p| domain_matches(p, &name))
                {
                    return true;
                }
            }
        }
        false
    }

    /// Number of dynamically recorded exceptions
    pub fn dynamic_len(&self) -> usize {
        self.dynamic.len()
    }
}

/// `*.example.com` matches the apex and every subdomain; plain patterns
/// match exactly. Comparison is case-insensitive (callers lowercase names).
fn domain_matches(pattern: &str, name: &str) -> bool {
    let pattern = pattern.to_lowercase();
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return name == suffix || name.ends_with(&format!(".{}", suffix));
    }
    name == pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn recorded_failure_exempts_same_app_and_domain() {
        let list = PinningList::new();
        assert!(!list.is_exempt(&names(&["api.bank.example"]), Some("bankapp")));

        list.record_failure("api.bank.example", Some("bankapp"));
        assert_eq!(list.dynamic_len(), 1);

        // Same app, same domain: bypass without another attempt
        assert!(list.is_exempt(&names(&["api.bank.example"]), Some("bankapp")));
        // A different app still gets intercepted
        assert!(!list.is_exempt(&names(&["api.bank.example"]), Some("other")));
        // A different domain from the same app still gets intercepted
        assert!(!list.is_exempt(&names(&["cdn.example"]), Some("bankapp")));
    }

    #[test]
    fn failure_without_app_applies_to_everyone() {
        let list = PinningList::new();
        list.record_failure("Pinned.Example", None);
        assert!(list.is_exempt(&names(&["pinned.example"]), Some("anything")));
        assert!(list.is_exempt(&names(&["PINNED.example"]), None));
    }

    #[test]
    fn static_wildcard_patterns() {
        let list = PinningList::from_entries(vec![PinningEntry {
            app: "messenger".to_string(),
            domain_patterns: vec!["*.chat.example".to_string()],
        }]);

        assert!(list.is_exempt(&names(&["media.chat.example"]), Some("messenger")));
        assert!(list.is_exempt(&names(&["chat.example"]), Some("messenger")));
        assert!(!list.is_exempt(&names(&["chat.example"]), Some("browser")));
        assert!(!list.is_exempt(&names(&["notchat.example"]), Some("messenger")));
    }

    #[test]
    fn any_app_rule() {
        let list = PinningList::from_entries(vec![PinningEntry {
            app: "*".to_string(),
            domain_patterns: vec!["ocsp.example".to_string()],
        }]);
        assert!(list.is_exempt(&names(&["ocsp.example"]), None));
        assert!(list.is_exempt(&names(&["OCSP.example"]), Some("any")));
    }

    #[test]
    fn json_round_trip() {
        let list = PinningList::load_json(
            r#"[{"app": "messenger", "domain_patterns": ["*.chat.example"]},
                {"app": "updater"}]"#,
        )
        .unwrap();
        assert!(list.is_exempt(&names(&["x.chat.example"]), Some("messenger")));
        assert!(PinningList::load_json("not json").is_err());
    }
}
