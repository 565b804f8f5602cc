use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

pub const CLUSTER_NAME_DEFAULT: &str = "default";
pub const NAMESPACE_APPLICATION: &str = "application";
pub const NO_APPID_PLACEHOLDER: &str = "NoAppIdPlaceHolder";
pub const NOTIFICATION_ID_PLACEHOLDER: i64 = -1;
pub const KEY_SEPARATOR: char = '+';

/// `appId+cluster+namespace`
pub type WatchKey = String;

pub fn assemble_key(app_id: &str, cluster: &str, namespace: &str) -> WatchKey {
    format!("{app_id}{KEY_SEPARATOR}{cluster}{KEY_SEPARATOR}{namespace}")
}

/// Components of a release message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageKey<'a> {
    pub app_id: &'a str,
    pub cluster: &'a str,
    pub namespace: &'a str,
}

impl<'a> MessageKey<'a> {
    /// Empty segments are skipped; anything other than exactly three
    /// remaining segments is rejected.
    pub fn parse(content: &'a str) -> Option<Self> {
        let mut parts = content.split(KEY_SEPARATOR).filter(|s| !s.is_empty());
        let key = MessageKey {
            app_id: parts.next()?,
            cluster: parts.next()?,
            namespace: parts.next()?,
        };
        match parts.next() {
            Some(_) => None,
            None => Some(key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMessage {
    pub id: i64,
    #[serde(rename = "message")]
    pub content: String,
    #[serde(skip)]
    pub created_at: SystemTime,
}

impl ReleaseMessage {
    pub fn new(id: i64, content: impl Into<String>) -> Self {
        ReleaseMessage {
            id,
            content: content.into(),
            created_at: SystemTime::now(),
        }
    }
}

/// What a client reports it has already seen for one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientNotification {
    #[serde(default)]
    pub namespace_name: String,
    #[serde(default = "default_notification_id")]
    pub notification_id: i64,
}

fn default_notification_id() -> i64 {
    NOTIFICATION_ID_PLACEHOLDER
}

/// One changed namespace in a poll response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub namespace_name: String,
    pub notification_id: i64,
    #[serde(default)]
    pub messages: BTreeMap<WatchKey, i64>,
}

impl Notification {
    pub fn new(namespace_name: impl Into<String>, notification_id: i64) -> Self {
        Notification {
            namespace_name: namespace_name.into(),
            notification_id,
            messages: BTreeMap::new(),
        }
    }

    pub fn add_message(&mut self, key: impl Into<WatchKey>, id: i64) {
        self.messages.insert(key.into(), id);
    }
}
