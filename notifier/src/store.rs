//! Read-only lookups against configuration metadata owned by other services.
//!
//! The service only ever reads apps' namespaces and releases. The traits are the
//! seam to whatever storage backs them; the in-memory implementations are seeded
//! from config and used by tests.
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppNamespace {
    pub app_id: String,
    pub name: String,
    #[serde(default)]
    pub is_public: bool,
}

impl AppNamespace {
    pub fn new(app_id: impl Into<String>, name: impl Into<String>, is_public: bool) -> Self {
        AppNamespace {
            app_id: app_id.into(),
            name: name.into(),
            is_public,
        }
    }
}

/// Namespace lookups. Matching on the namespace name is case-insensitive, the
/// returned record carries the canonical spelling.
pub trait AppNamespaceStore: Send + Sync {
    fn find_by_app_id_and_namespace(&self, app_id: &str, namespace: &str) -> Option<AppNamespace>;

    fn find_public_namespace_by_name(&self, namespace: &str) -> Option<AppNamespace>;
}

#[derive(Default)]
struct AppNamespaceIndex {
    by_app: HashMap<(String, String), AppNamespace>,
    public: HashMap<String, AppNamespace>,
}

#[derive(Default)]
pub struct InMemoryAppNamespaceStore {
    index: RwLock<AppNamespaceIndex>,
}

impl InMemoryAppNamespaceStore {
    pub fn new(namespaces: impl IntoIterator<Item = AppNamespace>) -> Self {
        let store = InMemoryAppNamespaceStore::default();
        for namespace in namespaces {
            store.upsert(namespace);
        }
        store
    }

    pub fn upsert(&self, namespace: AppNamespace) {
        let mut index = self.index.write();
        let name_key = namespace.name.to_lowercase();
        if namespace.is_public {
            index.public.insert(name_key.clone(), namespace.clone());
        }
        index
            .by_app
            .insert((namespace.app_id.clone(), name_key), namespace);
    }
}

impl AppNamespaceStore for InMemoryAppNamespaceStore {
    fn find_by_app_id_and_namespace(&self, app_id: &str, namespace: &str) -> Option<AppNamespace> {
        self.index
            .read()
            .by_app
            .get(&(app_id.to_string(), namespace.to_lowercase()))
            .cloned()
    }

    fn find_public_namespace_by_name(&self, namespace: &str) -> Option<AppNamespace> {
        self.index
            .read()
            .public
            .get(&namespace.to_lowercase())
            .cloned()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub id: i64,
    pub app_id: String,
    pub cluster_name: String,
    pub namespace_name: String,
    #[serde(default)]
    pub is_abandoned: bool,
}

pub trait ReleaseStore: Send + Sync {
    /// Returns the release unless it is unknown or abandoned.
    fn find_active_release(&self, release_id: i64) -> Option<Release>;
}

#[derive(Default)]
pub struct InMemoryReleaseStore {
    releases: RwLock<HashMap<i64, Release>>,
}

impl InMemoryReleaseStore {
    pub fn new(releases: impl IntoIterator<Item = Release>) -> Self {
        InMemoryReleaseStore {
            releases: RwLock::new(releases.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    pub fn insert(&self, release: Release) {
        self.releases.write().insert(release.id, release);
    }
}

impl ReleaseStore for InMemoryReleaseStore {
    fn find_active_release(&self, release_id: i64) -> Option<Release> {
        self.releases
            .read()
            .get(&release_id)
            .filter(|release| !release.is_abandoned)
            .cloned()
    }
}
