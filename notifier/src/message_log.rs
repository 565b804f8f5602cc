//! The release-message log is the version clock: every publish appends one
//! `appId+cluster+namespace` message with a strictly increasing id.
use crate::types::{MessageKey, ReleaseMessage};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("invalid release message content: {0:?}")]
    InvalidContent(String),
    #[error("release message log unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ReleaseMessageLog: Send + Sync {
    async fn append(&self, content: &str) -> Result<ReleaseMessage, LogError>;

    /// Latest message id per key, keys without any message are absent.
    async fn find_latest_message_ids(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, i64>, LogError>;

    /// Up to `limit` messages with an id greater than `after_id`, in id order.
    async fn find_messages_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ReleaseMessage>, LogError>;

    async fn max_message_id(&self) -> Result<i64, LogError>;
}

#[derive(Default)]
struct LogInner {
    messages: Vec<ReleaseMessage>,
    latest_by_content: HashMap<String, i64>,
}

#[derive(Default)]
pub struct InMemoryReleaseMessageLog {
    inner: RwLock<LogInner>,
}

impl InMemoryReleaseMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn append_sync(&self, content: &str) -> Result<ReleaseMessage, LogError> {
        if MessageKey::parse(content).is_none() {
            return Err(LogError::InvalidContent(content.to_string()));
        }

        let mut inner = self.inner.write();
        let id = inner.messages.last().map_or(1, |last| last.id + 1);
        let message = ReleaseMessage::new(id, content);
        inner.latest_by_content.insert(content.to_string(), id);
        inner.messages.push(message.clone());

        tracing::debug!(id, content, "appended release message");
        Ok(message)
    }
}

#[async_trait]
impl ReleaseMessageLog for InMemoryReleaseMessageLog {
    async fn append(&self, content: &str) -> Result<ReleaseMessage, LogError> {
        self.append_sync(content)
    }

    async fn find_latest_message_ids(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, i64>, LogError> {
        let inner = self.inner.read();
        Ok(keys
            .iter()
            .filter_map(|key| {
                inner
                    .latest_by_content
                    .get(key)
                    .map(|id| (key.clone(), *id))
            })
            .collect())
    }

    async fn find_messages_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ReleaseMessage>, LogError> {
        let inner = self.inner.read();
        // Ids are dense and sorted, binary search for the start
        let start = inner.messages.partition_point(|m| m.id <= after_id);
        Ok(inner.messages[start..].iter().take(limit).cloned().collect())
    }

    async fn max_message_id(&self) -> Result<i64, LogError> {
        Ok(self.inner.read().messages.last().map_or(0, |m| m.id))
    }
}
