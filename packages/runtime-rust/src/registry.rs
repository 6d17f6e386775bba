use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use resilience_core::{ErrorInfo, RetryOptions};

use crate::config::{ConfigError, ResilienceConfig};
use crate::manager::ConcurrencyManager;
use crate::retry::RetryExecutor;

// ---------------------------------------------------------------------------
// ComponentContext
// ---------------------------------------------------------------------------

/// Context handed to components during initialization.
#[derive(Debug, Clone)]
pub struct ComponentContext {
    pub config: Arc<ResilienceConfig>,
}

// ---------------------------------------------------------------------------
// ManagedComponent trait
// ---------------------------------------------------------------------------

/// A process-lifetime singleton owned by a [`ResilienceRegistry`].
///
/// Components are initialized in registration order and shut down in reverse.
/// The `Any` bound enables typed lookup via [`ResilienceRegistry::get`].
#[async_trait]
pub trait ManagedComponent: Send + Sync + Any {
    /// Unique name of the component (e.g. `"concurrency-manager"`).
    fn name(&self) -> &'static str;

    async fn init(&self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ManagedComponent for ConcurrencyManager {
    fn name(&self) -> &'static str {
        "concurrency-manager"
    }

    async fn init(&self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        let status = self.semaphore().status();
        tracing::info!(
            max_concurrency = status.max_concurrency,
            "concurrency manager ready"
        );
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let status = self.status();
        if status.semaphore.in_use > 0 || status.semaphore.queue_length > 0 {
            tracing::warn!(
                in_use = status.semaphore.in_use,
                queue_length = status.semaphore.queue_length,
                "shutting down with operations still in flight"
            );
        }
        if let Some(metrics) = status.metrics {
            tracing::info!(
                total = metrics.total_executions,
                failed = metrics.failed_executions,
                max_wait_ms = metrics.max_wait_time,
                "final concurrency metrics"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ManagedComponent for RetryExecutor {
    fn name(&self) -> &'static str {
        "retry-executor"
    }
}

// ---------------------------------------------------------------------------
// ResilienceRegistry
// ---------------------------------------------------------------------------

/// Explicit registry of the shared resilience singletons.
///
/// Replaces module-level globals: whoever builds the application constructs
/// one registry, and every consumer receives its components from it. Lookup
/// works by concrete type ([`get`](Self::get)) or by name
/// ([`get_by_name`](Self::get_by_name)).
pub struct ResilienceRegistry {
    config: Arc<ResilienceConfig>,
    by_name: DashMap<&'static str, Arc<dyn ManagedComponent>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Registration order for deterministic init/shutdown sequencing.
    order: RwLock<Vec<&'static str>>,
}

impl ResilienceRegistry {
    /// Creates an empty registry carrying the given configuration.
    #[must_use]
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config: Arc::new(config),
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Builds a registry with one shared [`ConcurrencyManager`] and one
    /// [`RetryExecutor`] wired from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn configure(config: &ResilienceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let manager = ConcurrencyManager::new(&config.concurrency)?;
        let registry = Self::new(config.clone());
        registry.register(RetryExecutor::new());
        registry.register(manager);
        Ok(registry)
    }

    #[must_use]
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Registers a component and returns the shared handle. Registering a
    /// second component under an existing name replaces the first.
    pub fn register<T: ManagedComponent>(&self, component: T) -> Arc<T> {
        let name = component.name();
        let component = Arc::new(component);
        let replaced = self.by_name.insert(name, component.clone()).is_some();
        self.by_type.insert(TypeId::of::<T>(), component.clone());
        if replaced {
            tracing::warn!(component = name, "replacing registered component");
        } else {
            self.order.write().push(name);
        }
        component
    }

    /// Retrieves a component by its concrete type.
    pub fn get<T: ManagedComponent>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedComponent>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// The shared concurrency manager, if registered.
    pub fn concurrency_manager(&self) -> Option<Arc<ConcurrencyManager>> {
        self.get::<ConcurrencyManager>()
    }

    /// The shared retry executor, if registered.
    pub fn retry_executor(&self) -> Option<Arc<RetryExecutor>> {
        self.get::<RetryExecutor>()
    }

    /// Retry options built from the configured policy and the default
    /// classifier.
    pub fn retry_options<E: ErrorInfo + 'static>(&self) -> RetryOptions<E> {
        RetryOptions::new(self.config.retry.clone())
    }

    /// Initializes all components in registration order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failing `init()`.
    pub async fn init_all(&self) -> anyhow::Result<()> {
        let ctx = ComponentContext {
            config: Arc::clone(&self.config),
        };
        let order = self.order.read().clone();
        for name in &order {
            if let Some(component) = self.get_by_name(name) {
                component.init(&ctx).await?;
            }
        }
        Ok(())
    }

    /// Shuts down all components in reverse registration order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failing `shutdown()`.
    pub async fn shutdown_all(&self) -> anyhow::Result<()> {
        let order = self.order.read().clone();
        for name in order.iter().rev() {
            if let Some(component) = self.get_by_name(name) {
                component.shutdown().await?;
            }
        }
        Ok(())
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use resilience_core::OperationFailure;

    use super::*;

    /// Records lifecycle calls into a shared log.
    struct Recorder {
        label: &'static str,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ManagedComponent for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn init(&self, ctx: &ComponentContext) -> anyhow::Result<()> {
            self.log.lock().push(format!(
                "init:{}:{}",
                self.label, ctx.config.concurrency.max_concurrency
            ));
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.log.lock().push(format!("shutdown:{}", self.label));
            Ok(())
        }
    }

    #[test]
    fn configure_wires_shared_singletons() {
        let registry = ResilienceRegistry::configure(&ResilienceConfig::default()).unwrap();

        let first = registry.concurrency_manager().unwrap();
        let second = registry.concurrency_manager().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.status().semaphore.max_concurrency, 10);
        assert_eq!(first.semaphore().timeout().as_millis(), 60_000);

        assert!(registry.retry_executor().is_some());
        assert!(registry.get_by_name("concurrency-manager").is_some());
        assert!(registry.get_by_name("retry-executor").is_some());
    }

    #[test]
    fn configure_rejects_invalid_config() {
        let mut config = ResilienceConfig::default();
        config.concurrency.max_concurrency = 0;
        assert!(matches!(
            ResilienceRegistry::configure(&config),
            Err(ConfigError::ZeroConcurrency)
        ));
    }

    #[test]
    fn unregistered_lookups_return_none() {
        let registry = ResilienceRegistry::default();
        assert!(registry.concurrency_manager().is_none());
        assert!(registry.get_by_name("retry-executor").is_none());
    }

    #[test]
    fn retry_options_follow_configured_policy() {
        let mut config = ResilienceConfig::default();
        config.retry.max_attempts = 7;
        let registry = ResilienceRegistry::new(config);

        let options = registry.retry_options::<OperationFailure>();
        assert_eq!(options.policy.max_attempts, 7);
        assert!(options.is_retryable(&OperationFailure::new("x").with_status(502)));
    }

    #[tokio::test]
    async fn lifecycle_runs_in_registration_order_and_reverse() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = ResilienceRegistry::default();
        registry.register(Recorder {
            label: "first",
            log: log.clone(),
        });
        registry.register(Recorder {
            label: "second",
            log: log.clone(),
        });

        registry.init_all().await.unwrap();
        registry.shutdown_all().await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["init:first:10", "init:second:10", "shutdown:second", "shutdown:first"]
        );
    }

    #[tokio::test]
    async fn configured_components_survive_lifecycle() {
        let registry = ResilienceRegistry::configure(&ResilienceConfig::default()).unwrap();
        registry.init_all().await.unwrap();

        let manager = registry.concurrency_manager().unwrap();
        manager
            .execute(|| async { Ok::<_, anyhow::Error>(()) }, Some("probe"))
            .await
            .unwrap();

        registry.shutdown_all().await.unwrap();
        assert_eq!(manager.status().metrics.unwrap().total_executions, 1);
    }

    #[test]
    fn re_registering_a_name_replaces_without_duplicating_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = ResilienceRegistry::default();
        registry.register(Recorder {
            label: "dup",
            log: log.clone(),
        });
        registry.register(Recorder { label: "dup", log });
        assert_eq!(registry.order.read().len(), 1);
    }
}
