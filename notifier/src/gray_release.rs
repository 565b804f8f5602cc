use crate::types::{WatchKey, assemble_key};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

pub const ALL_IP: &str = "*";

/// One client selector of a gray release rule.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct GrayReleaseRuleItem {
    pub client_app_id: String,
    #[serde(default)]
    pub client_ips: HashSet<String>,
}

impl GrayReleaseRuleItem {
    pub fn new<I, S>(client_app_id: impl Into<String>, client_ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GrayReleaseRuleItem {
            client_app_id: client_app_id.into(),
            client_ips: client_ips.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, client_app_id: &str, client_ip: &str) -> bool {
        self.client_app_id == client_app_id
            && (self.client_ips.contains(ALL_IP) || self.client_ips.contains(client_ip))
    }
}

/// A branch of a namespace with the release its matching instances should see.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct GrayReleaseRule {
    pub app_id: String,
    pub cluster_name: String,
    pub namespace_name: String,
    pub branch_name: String,
    pub release_id: i64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub rule_items: Vec<GrayReleaseRuleItem>,
}

fn default_active() -> bool {
    true
}

impl GrayReleaseRule {
    pub fn matches(&self, client_app_id: &str, client_ip: &str) -> bool {
        self.rule_items
            .iter()
            .any(|item| item.matches(client_app_id, client_ip))
    }
}

/// Current rule set, grouped by `appId+cluster+namespace`.
#[derive(Default)]
pub struct GrayReleaseRules {
    rules: RwLock<HashMap<WatchKey, Vec<GrayReleaseRule>>>,
}

impl GrayReleaseRules {
    pub fn new(rules: impl IntoIterator<Item = GrayReleaseRule>) -> Self {
        let holder = GrayReleaseRules::default();
        holder.replace_rules(rules);
        holder
    }

    /// Swaps in a freshly loaded rule set. The service seeds rules once from
    /// config; a store-backed loader refreshes them through this.
    pub fn replace_rules(&self, rules: impl IntoIterator<Item = GrayReleaseRule>) {
        let mut grouped: HashMap<WatchKey, Vec<GrayReleaseRule>> = HashMap::new();
        for rule in rules {
            grouped
                .entry(assemble_key(
                    &rule.app_id,
                    &rule.cluster_name,
                    &rule.namespace_name,
                ))
                .or_default()
                .push(rule);
        }
        *self.rules.write() = grouped;
    }

    /// Release the given instance should see instead of the main release, if any
    /// active branch of the namespace selects it.
    pub fn find_release_id(
        &self,
        client_app_id: &str,
        client_ip: &str,
        app_id: &str,
        cluster: &str,
        namespace: &str,
    ) -> Option<i64> {
        let rules = self.rules.read();
        rules
            .get(&assemble_key(app_id, cluster, namespace))?
            .iter()
            .filter(|rule| rule.active)
            .find(|rule| rule.matches(client_app_id, client_ip))
            .map(|rule| rule.release_id)
    }
}
