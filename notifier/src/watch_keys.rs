use crate::store::AppNamespaceStore;
use crate::types::{
    CLUSTER_NAME_DEFAULT, NAMESPACE_APPLICATION, NO_APPID_PLACEHOLDER, WatchKey, assemble_key,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Works out which `appId+cluster+namespace` keys a client has to watch.
///
/// A client always watches the default cluster and additionally its own cluster
/// and data center when those differ, so a release to any of them wakes it up.
#[derive(Clone)]
pub struct WatchKeyResolver {
    store: Arc<dyn AppNamespaceStore>,
}

impl WatchKeyResolver {
    pub fn new(store: Arc<dyn AppNamespaceStore>) -> Self {
        WatchKeyResolver { store }
    }

    pub fn resolve(
        app_id: &str,
        cluster: &str,
        namespace: &str,
        data_center: Option<&str>,
    ) -> HashSet<WatchKey> {
        if app_id.eq_ignore_ascii_case(NO_APPID_PLACEHOLDER) {
            return HashSet::new();
        }

        let mut keys = HashSet::with_capacity(3);

        if cluster != CLUSTER_NAME_DEFAULT {
            keys.insert(assemble_key(app_id, cluster, namespace));
        }

        if let Some(dc) = data_center
            && !dc.is_empty()
            && dc != cluster
        {
            keys.insert(assemble_key(app_id, dc, namespace));
        }

        keys.insert(assemble_key(app_id, CLUSTER_NAME_DEFAULT, namespace));

        keys
    }

    /// Keys per namespace for a whole poll. Public namespaces inherited from
    /// another app are watched under the owning app's keys as well.
    pub fn resolve_all<'a>(
        &self,
        app_id: &str,
        cluster: &str,
        namespaces: impl IntoIterator<Item = &'a str>,
        data_center: Option<&str>,
    ) -> HashMap<String, HashSet<WatchKey>> {
        let mut keys_by_namespace: HashMap<String, HashSet<WatchKey>> = namespaces
            .into_iter()
            .map(|ns| {
                (
                    ns.to_string(),
                    Self::resolve(app_id, cluster, ns, data_center),
                )
            })
            .collect();

        // Every app owns an `application` namespace, nothing else to look up
        if keys_by_namespace.len() == 1 && keys_by_namespace.contains_key(NAMESPACE_APPLICATION) {
            return keys_by_namespace;
        }

        for (namespace, keys) in keys_by_namespace.iter_mut() {
            if namespace == NAMESPACE_APPLICATION
                || self
                    .store
                    .find_by_app_id_and_namespace(app_id, namespace)
                    .is_some()
            {
                continue;
            }

            let Some(public) = self.store.find_public_namespace_by_name(namespace) else {
                continue;
            };

            if public.app_id == app_id {
                continue;
            }

            keys.extend(Self::resolve(
                &public.app_id,
                cluster,
                namespace,
                data_center,
            ));
        }

        keys_by_namespace
    }
}
