//! Long-poll resolution and instance activity queries.
use crate::activity::InstanceActivityCache;
use crate::config::ValidationError;
use crate::gray_release::GrayReleaseRules;
use crate::message_log::{LogError, ReleaseMessageLog};
use crate::metrics_defs::LONG_POLL_IMMEDIATE;
use crate::namespace::NamespaceResolver;
use crate::registry::{NotificationRegistry, WatchRequest};
use crate::store::ReleaseStore;
use crate::types::{ClientNotification, NOTIFICATION_ID_PLACEHOLDER, Notification, WatchKey};
use crate::watch_keys::WatchKeyResolver;
use indexmap::IndexMap;
use shared::counter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout_at;

#[derive(thiserror::Error, Debug)]
pub enum NotifierError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct PollRequest {
    pub app_id: String,
    pub cluster: String,
    pub notifications: Vec<ClientNotification>,
    pub data_center: Option<String>,
    pub client_ip: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum PollOutcome {
    Notified(Vec<Notification>),
    // Deadline passed without a newer message
    NotModified,
}

/// Client notifications after stripping, normalization and de-duplication.
#[derive(Debug, Default)]
struct FilteredNotifications {
    // normalized name -> last seen id, in request order
    ids: IndexMap<String, i64>,
    // normalized name -> stripped name the client sent, only where they differ
    original_names: HashMap<String, String>,
}

// Cancels the watch when the poll future is dropped before finishing, which is
// how a client disconnect shows up. A no-op once the watch is terminal.
struct CancelOnDrop {
    registry: Arc<NotificationRegistry>,
    watch: Arc<WatchRequest>,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.registry.cancel(&self.watch);
    }
}

pub struct NotificationService {
    namespaces: NamespaceResolver,
    watch_keys: WatchKeyResolver,
    log: Arc<dyn ReleaseMessageLog>,
    registry: Arc<NotificationRegistry>,
    activity: Arc<InstanceActivityCache>,
    releases: Arc<dyn ReleaseStore>,
    gray_rules: Arc<GrayReleaseRules>,
    timeout: Duration,
}

impl NotificationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespaces: NamespaceResolver,
        watch_keys: WatchKeyResolver,
        log: Arc<dyn ReleaseMessageLog>,
        registry: Arc<NotificationRegistry>,
        activity: Arc<InstanceActivityCache>,
        releases: Arc<dyn ReleaseStore>,
        gray_rules: Arc<GrayReleaseRules>,
        timeout: Duration,
    ) -> Self {
        NotificationService {
            namespaces,
            watch_keys,
            log,
            registry,
            activity,
            releases,
            gray_rules,
            timeout,
        }
    }

    pub fn log(&self) -> &Arc<dyn ReleaseMessageLog> {
        &self.log
    }

    fn filter_notifications(
        &self,
        app_id: &str,
        notifications: Vec<ClientNotification>,
    ) -> FilteredNotifications {
        let mut filtered = FilteredNotifications::default();

        for notification in notifications {
            if notification.namespace_name.is_empty() {
                continue;
            }
            let stripped = NamespaceResolver::strip_extension(&notification.namespace_name);
            let normalized = self.namespaces.normalize(app_id, stripped);

            // Duplicates keep the lowest id so the client gets the newest state
            if let Some(&existing) = filtered.ids.get(&normalized)
                && existing < notification.notification_id
            {
                continue;
            }

            if stripped != normalized {
                filtered
                    .original_names
                    .insert(normalized.clone(), stripped.to_string());
            } else {
                filtered.original_names.remove(&normalized);
            }
            filtered.ids.insert(normalized, notification.notification_id);
        }

        filtered
    }

    /// Namespaces whose latest message is newer than what the client has seen.
    /// Nothing is reported while none of the watched keys has a message.
    fn newer_notifications(
        client_ids: &IndexMap<String, i64>,
        keys_by_namespace: &HashMap<String, HashSet<WatchKey>>,
        latest_ids: &HashMap<String, i64>,
    ) -> Vec<Notification> {
        let mut newer = Vec::new();
        if latest_ids.is_empty() {
            return newer;
        }

        for (namespace, &client_id) in client_ids {
            let Some(keys) = keys_by_namespace.get(namespace) else {
                continue;
            };
            let known: Vec<(&WatchKey, i64)> = keys
                .iter()
                .filter_map(|key| latest_ids.get(key).map(|&id| (key, id)))
                .collect();

            // Namespaces without messages sit at the placeholder id
            let latest = known
                .iter()
                .map(|(_, id)| *id)
                .fold(NOTIFICATION_ID_PLACEHOLDER, i64::max);
            if latest > client_id {
                let mut notification = Notification::new(namespace.clone(), latest);
                for (key, id) in known {
                    notification.add_message(key.clone(), id);
                }
                newer.push(notification);
            }
        }

        newer
    }

    /// Answers right away if any namespace is behind, otherwise parks until a
    /// release message arrives, the deadline passes or the caller goes away.
    pub async fn poll(&self, request: PollRequest) -> Result<PollOutcome, NotifierError> {
        let PollRequest {
            app_id,
            cluster,
            notifications,
            data_center,
            client_ip,
        } = request;

        let filtered = self.filter_notifications(&app_id, notifications);
        if filtered.ids.is_empty() {
            return Err(NotifierError::BadRequest(
                "no valid namespace in notifications".to_string(),
            ));
        }

        let data_center = data_center.as_deref().filter(|dc| !dc.is_empty());
        let keys_by_namespace = self.watch_keys.resolve_all(
            &app_id,
            &cluster,
            filtered.ids.keys().map(String::as_str),
            data_center,
        );
        let watch_keys: HashSet<WatchKey> = keys_by_namespace.values().flatten().cloned().collect();
        let key_list: Vec<WatchKey> = watch_keys.iter().cloned().collect();

        if let Some(ip) = client_ip.as_deref().filter(|ip| !ip.is_empty()) {
            for key in &watch_keys {
                self.activity.record(key, ip);
            }
        }

        let latest_ids = self.log.find_latest_message_ids(&key_list).await?;
        let newer = Self::newer_notifications(&filtered.ids, &keys_by_namespace, &latest_ids);
        if !newer.is_empty() {
            counter!(LONG_POLL_IMMEDIATE).increment(1);
            let newer = newer
                .into_iter()
                .map(|mut n| {
                    if let Some(original) = filtered.original_names.get(&n.namespace_name) {
                        n.namespace_name = original.clone();
                    }
                    n
                })
                .collect();
            return Ok(PollOutcome::Notified(newer));
        }

        let client_ids: HashMap<String, i64> = filtered
            .ids
            .iter()
            .map(|(ns, id)| (ns.clone(), *id))
            .collect();
        let (watch, mut rx) =
            WatchRequest::new(watch_keys, client_ids, filtered.original_names, self.timeout);
        self.registry.register(&watch);
        let _guard = CancelOnDrop {
            registry: self.registry.clone(),
            watch: watch.clone(),
        };

        // A message appended between the first read and registering would
        // otherwise never reach this watch.
        let latest_ids = self.log.find_latest_message_ids(&key_list).await?;
        let newer = Self::newer_notifications(&filtered.ids, &keys_by_namespace, &latest_ids);
        if !newer.is_empty() {
            self.registry.fulfill(&watch, newer);
        }

        let outcome = match timeout_at(watch.deadline(), &mut rx).await {
            Ok(Ok(notifications)) => PollOutcome::Notified(notifications),
            Ok(Err(_)) => PollOutcome::NotModified,
            Err(_) => {
                if self.registry.expire(&watch) {
                    PollOutcome::NotModified
                } else {
                    // Delivered right at the deadline
                    match rx.try_recv() {
                        Ok(notifications) => PollOutcome::Notified(notifications),
                        Err(_) => PollOutcome::NotModified,
                    }
                }
            }
        };

        tracing::debug!(
            watch_id = watch.id(),
            app_id = %app_id,
            notified = matches!(outcome, PollOutcome::Notified(_)),
            "long poll completed"
        );
        Ok(outcome)
    }

    /// Whether `client_ip` recently polled the namespace a release belongs to.
    /// Unknown releases answer true as inactivity cannot be shown.
    pub fn query_active_instance(
        &self,
        app_id: &str,
        cluster: &str,
        release_id: i64,
        data_center: Option<&str>,
        client_ip: &str,
    ) -> bool {
        let Some(release) = self.releases.find_active_release(release_id) else {
            tracing::info!(release_id, "can not get release for release id");
            return true;
        };
        self.query_active_instance_by_namespace(
            app_id,
            cluster,
            &release.namespace_name,
            data_center,
            client_ip,
        )
    }

    pub fn query_active_instance_by_namespace(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        data_center: Option<&str>,
        client_ip: &str,
    ) -> bool {
        let data_center = data_center.filter(|dc| !dc.is_empty());
        let keys = WatchKeyResolver::resolve(app_id, cluster, namespace, data_center);
        self.activity.is_any_active(&keys, client_ip)
    }

    /// Gray release an instance should load for a namespace, if a branch
    /// selects it. The namespace name goes through the same normalization as
    /// polls.
    pub fn find_gray_release_id(
        &self,
        client_app_id: &str,
        client_ip: &str,
        app_id: &str,
        cluster: &str,
        namespace: &str,
    ) -> Option<i64> {
        let namespace = self
            .namespaces
            .normalize(app_id, NamespaceResolver::strip_extension(namespace));
        self.gray_rules
            .find_release_id(client_app_id, client_ip, app_id, cluster, &namespace)
    }
}
