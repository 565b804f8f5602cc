use crate::store::AppNamespaceStore;
use std::sync::Arc;

const PROPERTIES_SUFFIX: &str = ".properties";

/// Maps the namespace names clients send onto the names the service stores.
#[derive(Clone)]
pub struct NamespaceResolver {
    store: Arc<dyn AppNamespaceStore>,
}

impl NamespaceResolver {
    pub fn new(store: Arc<dyn AppNamespaceStore>) -> Self {
        NamespaceResolver { store }
    }

    /// Drops trailing `.properties` suffixes, matched case-insensitively. Repeated
    /// suffixes are all removed so that stripping twice equals stripping once.
    pub fn strip_extension(name: &str) -> &str {
        let mut stripped = name;
        loop {
            let split_at = stripped.len().saturating_sub(PROPERTIES_SUFFIX.len());
            match stripped.get(split_at..) {
                Some(suffix)
                    if stripped.len() >= PROPERTIES_SUFFIX.len()
                        && suffix.eq_ignore_ascii_case(PROPERTIES_SUFFIX) =>
                {
                    stripped = &stripped[..split_at];
                }
                _ => return stripped,
            }
        }
    }

    /// Fixes character case mismatches such as `FX.foo` vs `fx.foo`. The app's
    /// own namespaces take precedence over public ones.
    pub fn normalize(&self, app_id: &str, name: &str) -> String {
        if let Some(namespace) = self.store.find_by_app_id_and_namespace(app_id, name) {
            return namespace.name;
        }

        if let Some(namespace) = self.store.find_public_namespace_by_name(name) {
            return namespace.name;
        }

        name.to_string()
    }
}
