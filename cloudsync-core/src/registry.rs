//! Explicit provider registration table.
//!
//! A [`ProviderRegistry`] is built at process start: the caller registers one
//! constructor per backend name, then creates providers by name from
//! configuration. There is no process-wide registry and no discovery.

use std::collections::BTreeMap;

use crate::error::RegistryError;
use crate::provider::{Provider, ProviderConfig};

/// Builds a provider instance from its configuration.
pub type ProviderConstructor = fn(ProviderConfig) -> Box<dyn Provider>;

#[derive(Debug, Default, Clone)]
pub struct ProviderRegistry {
    constructors: BTreeMap<String, ProviderConstructor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `constructor` under `name`.
    ///
    /// Returns `RegistryError::DuplicateProvider` if the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: ProviderConstructor,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(RegistryError::DuplicateProvider(name));
        }
        tracing::debug!(provider = %name, "registered provider");
        self.constructors.insert(name, constructor);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Construct the provider registered under `name`.
    pub fn create(
        &self,
        name: &str,
        config: ProviderConfig,
    ) -> Result<Box<dyn Provider>, RegistryError> {
        let constructor =
            self.constructors
                .get(name)
                .ok_or_else(|| RegistryError::UnknownProvider {
                    name: name.to_string(),
                    known: self.known_providers(),
                })?;
        Ok(constructor(config))
    }

    /// Registered names, sorted.
    pub fn known_providers(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::time::Duration;

    use super::*;
    use crate::error::CloudError;
    use crate::provider::{Credentials, EventBatch, Metadata};
    use crate::types::{Cursor, Event, ObjectInfo, Oid};

    /// Provider that only knows its name and config.
    struct Inert(ProviderConfig);

    impl Provider for Inert {
        fn name(&self) -> &str {
            "inert"
        }
        fn config(&self) -> &ProviderConfig {
            &self.0
        }
        fn connect(&mut self, _: &Credentials) -> Result<(), CloudError> {
            Ok(())
        }
        fn connected(&self) -> bool {
            true
        }
        fn disconnect(&mut self) {}
        fn current_cursor(&mut self) -> Result<Cursor, CloudError> {
            Ok(Cursor::from("0"))
        }
        fn events(&mut self, cursor: &Cursor, _: Duration) -> Result<EventBatch, CloudError> {
            Ok(EventBatch {
                events: vec![],
                cursor: cursor.clone(),
            })
        }
        fn walk(&mut self, _: Option<f64>) -> Result<Vec<Event>, CloudError> {
            Ok(vec![])
        }
        fn upload(&mut self, oid: &Oid, _: &mut dyn Read) -> Result<ObjectInfo, CloudError> {
            Err(CloudError::FileNotFound(oid.to_string()))
        }
        fn create(
            &mut self,
            path: &str,
            _: &mut dyn Read,
            _: &Metadata,
        ) -> Result<ObjectInfo, CloudError> {
            Err(CloudError::FileNotFound(path.to_string()))
        }
        fn download(&mut self, oid: &Oid, _: &mut dyn Write) -> Result<(), CloudError> {
            Err(CloudError::FileNotFound(oid.to_string()))
        }
        fn rename(&mut self, oid: &Oid, _: &str) -> Result<Oid, CloudError> {
            Err(CloudError::FileNotFound(oid.to_string()))
        }
        fn mkdir(&mut self, path: &str) -> Result<Oid, CloudError> {
            Err(CloudError::FileNotFound(path.to_string()))
        }
        fn delete(&mut self, _: &Oid) -> Result<(), CloudError> {
            Ok(())
        }
        fn info_path(&mut self, _: &str) -> Result<Option<ObjectInfo>, CloudError> {
            Ok(None)
        }
        fn info_oid(&mut self, _: &Oid) -> Result<Option<ObjectInfo>, CloudError> {
            Ok(None)
        }
        fn listdir(&mut self, _: &Oid) -> Result<Vec<ObjectInfo>, CloudError> {
            Ok(vec![])
        }
    }

    fn inert(config: ProviderConfig) -> Box<dyn Provider> {
        Box::new(Inert(config))
    }

    #[test]
    fn create_passes_config_through() {
        let mut reg = ProviderRegistry::new();
        reg.register("inert", inert).expect("register");
        let prov = reg
            .create("inert", ProviderConfig::default().with_sync_root("/s"))
            .expect("create");
        assert_eq!(prov.name(), "inert");
        assert_eq!(prov.config().sync_root, "/s");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = ProviderRegistry::new();
        reg.register("inert", inert).expect("register");
        let err = reg.register("inert", inert).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateProvider(ref n) if n == "inert"));
    }

    #[test]
    fn unknown_provider_lists_known_names() {
        let mut reg = ProviderRegistry::new();
        reg.register("b", inert).expect("register");
        reg.register("a", inert).expect("register");
        let err = reg.create("gdrive", ProviderConfig::default()).err().expect("error");
        let msg = err.to_string();
        assert!(msg.contains("gdrive is not a registered provider"), "got: {msg}");
        assert!(msg.contains("a, b"), "got: {msg}");
    }

    #[test]
    fn registries_are_independent() {
        let mut one = ProviderRegistry::new();
        one.register("inert", inert).expect("register");
        let two = ProviderRegistry::new();
        assert!(one.contains("inert"));
        assert!(!two.contains("inert"));
        assert!(two.known_providers().is_empty());
    }
}
