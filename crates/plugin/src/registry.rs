use crate::hooks::{Plugin, PluginError};
use relay_core::config::PluginRef;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Builds a fresh plugin instance for one request from its declared
/// options.
pub type PluginFactory =
    Arc<dyn Fn(&Map<String, Value>) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync>;

/// A per-request plugin instance.
#[derive(Clone)]
pub struct PluginInstance {
    pub name: String,
    pub plugin: Arc<dyn Plugin>,
}

/// Process-lifetime plugin registry. Factories are registered at
/// startup; unknown names can be resolved lazily through an optional
/// resolver, with concurrent loads of the same name collapsed to one.
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, PluginFactory>>,
    load_lock: tokio::sync::Mutex<()>,
    resolver: Option<Box<dyn Fn(&str) -> Option<PluginFactory> + Send + Sync>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
            resolver: None,
        }
    }

    pub fn with_resolver(
        resolver: impl Fn(&str) -> Option<PluginFactory> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
            resolver: Some(Box::new(resolver)),
        }
    }

    pub fn register(&self, name: impl Into<String>, factory: PluginFactory) {
        self.factories
            .write()
            .expect("registry lock poisoned")
            .insert(name.into(), factory);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    /// Make sure a plugin is loadable. Concurrent calls for the same
    /// name collapse: the second caller finds the factory registered.
    pub async fn ensure_loaded(&self, name: &str) -> bool {
        if self.is_registered(name) {
            return true;
        }
        let _guard = self.load_lock.lock().await;
        if self.is_registered(name) {
            return true;
        }
        match self.resolver.as_ref().and_then(|r| r(name)) {
            Some(factory) => {
                self.register(name, factory);
                true
            }
            None => false,
        }
    }

    /// Instantiate the referenced plugins for one request. Disabled
    /// references are skipped; unknown or failing plugins are logged and
    /// excluded without aborting the request.
    pub async fn acquire_instances(&self, refs: &[PluginRef]) -> AcquiredPlugins {
        let mut plugins = Vec::new();
        for r in refs {
            if !r.enabled() {
                continue;
            }
            let name = r.name();
            if !self.ensure_loaded(name).await {
                tracing::warn!(plugin = name, "unknown plugin; skipping");
                continue;
            }
            let factory = self
                .factories
                .read()
                .expect("registry lock poisoned")
                .get(name)
                .cloned();
            if let Some(factory) = factory {
                match factory(&r.options()) {
                    Ok(plugin) => plugins.push(PluginInstance {
                        name: name.to_string(),
                        plugin,
                    }),
                    Err(e) => {
                        tracing::warn!(plugin = name, error = %e, "plugin failed to load; skipping");
                    }
                }
            }
        }
        AcquiredPlugins {
            plugins,
            released: false,
        }
    }
}

/// The plugin set acquired for one request. Must be released on every
/// exit path so `on_destroy` runs.
pub struct AcquiredPlugins {
    pub plugins: Vec<PluginInstance>,
    released: bool,
}

impl AcquiredPlugins {
    pub async fn release(mut self) {
        self.released = true;
        for instance in &self.plugins {
            instance.plugin.on_destroy().await;
        }
    }

    pub fn instances(&self) -> Vec<PluginInstance> {
        self.plugins.clone()
    }
}

impl Drop for AcquiredPlugins {
    fn drop(&mut self) {
        if !self.released && !self.plugins.is_empty() {
            tracing::warn!("plugin instances dropped without release()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NamedPlugin {
        name: String,
    }

    #[async_trait]
    impl Plugin for NamedPlugin {
        fn name(&self) -> &str {
            &self.name
        }
    }

    fn factory_for(name: &'static str) -> PluginFactory {
        Arc::new(move |_opts| {
            Ok(Arc::new(NamedPlugin {
                name: name.to_string(),
            }) as Arc<dyn Plugin>)
        })
    }

    #[tokio::test]
    async fn acquire_skips_disabled_and_unknown() {
        let registry = PluginRegistry::new();
        registry.register("known", factory_for("known"));

        let refs = vec![
            PluginRef::Name("known".into()),
            PluginRef::Name("missing".into()),
            PluginRef::Detailed {
                path: "known".into(),
                enabled: false,
                options: Map::new(),
            },
        ];
        let acquired = registry.acquire_instances(&refs).await;
        assert_eq!(acquired.plugins.len(), 1);
        assert_eq!(acquired.plugins[0].name, "known");
        acquired.release().await;
    }

    #[tokio::test]
    async fn resolver_loads_once() {
        static LOADS: AtomicUsize = AtomicUsize::new(0);
        let registry = Arc::new(PluginRegistry::with_resolver(|name| {
            if name == "lazy" {
                LOADS.fetch_add(1, Ordering::SeqCst);
                Some(factory_for("lazy"))
            } else {
                None
            }
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { reg.ensure_loaded("lazy").await }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        assert_eq!(LOADS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_factory_is_excluded() {
        let registry = PluginRegistry::new();
        let broken: PluginFactory = Arc::new(|_opts| Err(PluginError("boom".into())));
        registry.register("broken", broken);
        let acquired = registry
            .acquire_instances(&[PluginRef::Name("broken".into())])
            .await;
        assert!(acquired.plugins.is_empty());
        acquired.release().await;
    }
}
