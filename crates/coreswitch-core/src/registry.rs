use crate::proxy_core::Core;
use crate::error::{Error, Result};
use crate::options::StartOptions;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Default)]
struct RegistryState {
    cores: HashMap<String, Arc<dyn Core>>,
    /// Registration order, for lookups that want "the first external core"
    order: Vec<String>,
    active: String,
}

/// Named cores plus the single active name.
///
/// The lock only guards the map and the active name; it is never held while a
/// core starts or stops.
#[derive(Default)]
pub struct CoreRegistry {
    state: RwLock<RegistryState>,
}

impl CoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by name; the first core registered becomes active
    pub fn register(&self, core: Arc<dyn Core>) {
        let name = core.core_name().to_string();
        let mut state = self.state.write();
        if state.cores.insert(name.clone(), core).is_none() {
            state.order.push(name.clone());
        }
        if state.active.is_empty() {
            state.active = name;
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Core>> {
        self.state
            .read()
            .cores
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Select `name` without starting or stopping anything
    pub fn set_active(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.cores.contains_key(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        state.active = name.to_string();
        Ok(())
    }

    pub fn active_name(&self) -> String {
        self.state.read().active.clone()
    }

    pub fn active(&self) -> Result<Arc<dyn Core>> {
        let state = self.state.read();
        state
            .cores
            .get(&state.active)
            .cloned()
            .ok_or_else(|| Error::NotFound(state.active.clone()))
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<String> {
        self.state.read().order.clone()
    }

    /// Start `name` and make it active once the start has succeeded.
    ///
    /// A failed start leaves the active name untouched. Other running cores
    /// keep running.
    pub async fn start_core(&self, name: &str, opts: &StartOptions, cancel: &CancellationToken) -> Result<Arc<dyn Core>> {
        let core = self.get(name)?;
        core.start(opts, cancel).await?;
        self.set_active(name)?;
        info!(core = name, "core started and activated");
        Ok(core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::PingResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubCore {
        name: &'static str,
        running: AtomicBool,
        fail_start: bool,
    }

    impl StubCore {
        fn new(name: &'static str, fail_start: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                running: AtomicBool::new(false),
                fail_start,
            })
        }
    }

    #[async_trait]
    impl Core for StubCore {
        fn core_name(&self) -> &str {
            self.name
        }

        async fn start(&self, _opts: &StartOptions, _cancel: &CancellationToken) -> Result<()> {
            if self.fail_start {
                return Err(Error::ConfigInvalid("stub".into()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn version(&self) -> String {
            format!("{} 1.0", self.name)
        }

        async fn measure_ping(&self, _urls: &[String], _cancel: &CancellationToken) -> Result<Vec<PingResult>> {
            Ok(Vec::new())
        }

        fn fetch_logs(&self) -> String {
            String::new()
        }

        fn clear_logs(&self) -> bool {
            true
        }
    }

    #[test]
    fn first_registration_is_active() {
        let registry = CoreRegistry::new();
        registry.register(StubCore::new("a", false));
        registry.register(StubCore::new("b", false));
        registry.register(StubCore::new("a", false));

        assert_eq!(registry.active_name(), "a");
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[test]
    fn unknown_names_are_not_found() {
        let registry = CoreRegistry::new();
        registry.register(StubCore::new("a", false));

        assert!(matches!(registry.get("zzz"), Err(Error::NotFound(_))));
        assert!(matches!(registry.set_active("zzz"), Err(Error::NotFound(_))));
        assert_eq!(registry.active_name(), "a");
    }

    #[test]
    fn empty_registry_has_no_active_core() {
        assert!(matches!(CoreRegistry::new().active(), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn switching_does_not_stop_previous_core() {
        let registry = CoreRegistry::new();
        let a = StubCore::new("a", false);
        let b = StubCore::new("b", false);
        registry.register(a.clone());
        registry.register(b.clone());

        let cancel = CancellationToken::new();
        registry.start_core("a", &StartOptions::default(), &cancel).await.unwrap();
        registry.start_core("b", &StartOptions::default(), &cancel).await.unwrap();

        assert!(a.is_running().await);
        assert_eq!(registry.active().unwrap().version(), "b 1.0");
    }

    #[tokio::test]
    async fn failed_start_keeps_previous_active() {
        let registry = CoreRegistry::new();
        registry.register(StubCore::new("good", false));
        registry.register(StubCore::new("broken", true));

        let err = registry
            .start_core("broken", &StartOptions::default(), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert_eq!(registry.active_name(), "good");
    }
}
