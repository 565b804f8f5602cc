pub mod activity;
pub mod api;
pub mod bus;
pub mod config;
pub mod gray_release;
pub mod message_log;
pub mod metrics_defs;
pub mod namespace;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod store;
pub mod types;
pub mod watch_keys;

use activity::InstanceActivityCache;
use bus::ReleaseMessageBus;
use config::Config;
use gray_release::GrayReleaseRules;
use message_log::{InMemoryReleaseMessageLog, ReleaseMessageLog};
use namespace::NamespaceResolver;
use registry::NotificationRegistry;
use scanner::ReleaseMessageScanner;
use service::NotificationService;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use store::{InMemoryAppNamespaceStore, InMemoryReleaseStore};
use watch_keys::WatchKeyResolver;

pub use service::NotifierError;

/// Wires the stores, the dispatch path and the poll service together and
/// serves the notification api and the admin endpoints until either fails.
pub async fn run(config: Config) -> Result<(), NotifierError> {
    config.validate()?;

    let namespaces = Arc::new(InMemoryAppNamespaceStore::new(
        config.app_namespaces.iter().cloned(),
    ));
    let releases = Arc::new(InMemoryReleaseStore::new(config.releases.iter().cloned()));
    let gray_rules = Arc::new(GrayReleaseRules::new(
        config.gray_release_rules.iter().cloned(),
    ));
    let log: Arc<dyn ReleaseMessageLog> = Arc::new(InMemoryReleaseMessageLog::new());
    let registry = Arc::new(NotificationRegistry::new());

    let bus = Arc::new(ReleaseMessageBus::new(
        registry.clone(),
        config.scanner.topic.clone(),
        &config.delivery,
    ));
    let mut scanner = ReleaseMessageScanner::new(log.clone(), &config.scanner);
    scanner.add_listener(bus);
    let scanner = scanner.spawn();

    let service = Arc::new(NotificationService::new(
        NamespaceResolver::new(namespaces.clone()),
        WatchKeyResolver::new(namespaces),
        log,
        registry,
        Arc::new(InstanceActivityCache::new(&config.instance_cache)),
        releases,
        gray_rules,
        config.long_poll.timeout(),
    ));

    let ready_scanner = scanner.clone();
    let admin = AdminService::<_, NotifierError>::new(move || ready_scanner.is_ready());

    tracing::info!(
        listener = %format!("{}:{}", config.listener.host, config.listener.port),
        admin_listener = %format!("{}:{}", config.admin_listener.host, config.admin_listener.port),
        "starting notifier"
    );

    let result = tokio::try_join!(
        api::serve(config.listener.clone(), service),
        run_http_service(&config.admin_listener.host, config.admin_listener.port, admin),
    );
    scanner.shutdown().await;
    result.map(|_| ())
}
