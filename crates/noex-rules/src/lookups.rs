//! External data requirements and the lookup cache.

use crate::context::EvaluationContext;
use crate::duration::parse_duration;
use crate::error::{Result, RuleError};
use crate::rule::{DataRequirement, LookupErrorPolicy};
use crate::value::canonical_string;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A service the engine may call to satisfy data requirements.
#[async_trait]
pub trait LookupService: Send + Sync {
    /// Registered service name.
    fn name(&self) -> &str;

    /// Invoke a method with resolved arguments.
    async fn call(&self, method: &str, args: &[Value]) -> Result<Value>;
}

/// Registry of lookup services by name.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn LookupService>>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a service under its name, replacing any previous one.
    pub fn register(&self, service: Arc<dyn LookupService>) {
        let name = service.name().to_string();
        self.services.write().insert(name, service);
    }

    /// Remove a service.
    pub fn unregister(&self, name: &str) -> bool {
        self.services.write().remove(name).is_some()
    }

    /// Get a service by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn LookupService>> {
        self.services.read().get(name).cloned()
    }

    /// Registered service names.
    pub fn names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }
}

/// Deterministic cache key over `(service, method, resolved args)`.
///
/// The canonical form sorts object keys and preserves array order, so equal
/// inputs produce the same key regardless of construction order.
pub fn cache_key(service: &str, method: &str, args: &[Value]) -> String {
    let canonical_args = canonical_string(&Value::Array(args.to_vec()));
    format!("{service}::{method}::{canonical_args}")
}

struct CacheEntry {
    value: Value,
    expires_at: DateTime<Utc>,
}

/// Resolves a rule's data requirements, caching results under TTLs.
pub struct LookupExecutor {
    registry: Arc<ServiceRegistry>,
    cache: DashMap<String, CacheEntry>,
}

impl LookupExecutor {
    /// Create an executor over a service registry.
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            cache: DashMap::new(),
        }
    }

    /// Resolve one requirement.
    ///
    /// Returns `Ok(Some(value))` on success, `Ok(None)` when the lookup
    /// failed under the `skip` policy, and an error under the `fail`
    /// policy.
    pub async fn resolve(
        &self,
        requirement: &DataRequirement,
        ctx: &EvaluationContext,
    ) -> Result<Option<Value>> {
        let args: Vec<Value> = requirement
            .args
            .iter()
            .map(|arg| ctx.resolve_payload(arg))
            .collect();

        let key = cache_key(&requirement.service, &requirement.method, &args);
        if requirement.cache.is_some() {
            if let Some(entry) = self.cache.get(&key) {
                if entry.expires_at > Utc::now() {
                    debug!("Lookup {} served from cache", requirement.name);
                    return Ok(Some(entry.value.clone()));
                }
            }
        }

        let outcome = match self.registry.get(&requirement.service) {
            Some(service) => service.call(&requirement.method, &args).await,
            None => Err(RuleError::UnknownService(requirement.service.clone())),
        };

        match outcome {
            Ok(value) => {
                if let Some(cache) = &requirement.cache {
                    // The ttl was validated at registration.
                    if let Ok(ttl) = parse_duration(&cache.ttl) {
                        self.cache.insert(
                            key,
                            CacheEntry {
                                value: value.clone(),
                                expires_at: Utc::now() + ttl,
                            },
                        );
                    }
                }
                Ok(Some(value))
            }
            Err(err) => match requirement.on_error {
                LookupErrorPolicy::Skip => {
                    warn!(
                        "Lookup {} failed under skip policy: {}",
                        requirement.name, err
                    );
                    Ok(None)
                }
                LookupErrorPolicy::Fail => Err(RuleError::lookup(
                    &requirement.service,
                    &requirement.method,
                    err.to_string(),
                )),
            },
        }
    }

    /// Resolve every requirement into the context, in order.
    ///
    /// A `fail`-policy error aborts immediately; `skip` failures bind an
    /// absent result and continue.
    pub async fn resolve_all(
        &self,
        requirements: &[DataRequirement],
        ctx: &mut EvaluationContext,
    ) -> Result<()> {
        for requirement in requirements {
            let result = self.resolve(requirement, ctx).await?;
            ctx.bind_lookup(requirement.name.clone(), result);
        }
        Ok(())
    }

    /// Number of cached results.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop all cached results.
    pub fn purge_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TriggerContext;
    use crate::events::Event;
    use crate::facts::FactStore;
    use crate::rule::CacheSpec;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingService {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LookupService for CountingService {
        fn name(&self) -> &str {
            "crm"
        }

        async fn call(&self, method: &str, args: &[Value]) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RuleError::internal("connection refused"));
            }
            Ok(json!({"method": method, "args": args}))
        }
    }

    fn ctx() -> EvaluationContext {
        let event = Event::new("order.placed", json!({"customer": {"id": 42}}));
        EvaluationContext::new(TriggerContext::Event { event }, Arc::new(FactStore::new()))
    }

    fn requirement(cache: Option<CacheSpec>, on_error: LookupErrorPolicy) -> DataRequirement {
        DataRequirement {
            name: "customer".into(),
            service: "crm".into(),
            method: "get_customer".into(),
            args: vec![json!({"ref": "event.customer.id"})],
            cache,
            on_error,
        }
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let a = vec![serde_json::from_str::<Value>(r#"{"x": 1, "y": 2}"#).unwrap()];
        let b = vec![serde_json::from_str::<Value>(r#"{"y": 2, "x": 1}"#).unwrap()];
        assert_eq!(cache_key("crm", "get", &a), cache_key("crm", "get", &b));

        // Arrays keep their order in the key.
        assert_ne!(
            cache_key("crm", "get", &[json!([1, 2])]),
            cache_key("crm", "get", &[json!([2, 1])])
        );
    }

    #[tokio::test]
    async fn test_resolves_refs_in_args() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(Arc::new(CountingService {
            calls: AtomicUsize::new(0),
            fail: false,
        }));
        let executor = LookupExecutor::new(registry);

        let result = executor
            .resolve(&requirement(None, LookupErrorPolicy::Fail), &ctx())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["args"], json!([42]));
    }

    #[tokio::test]
    async fn test_ttl_cache_prevents_second_call() {
        let registry = Arc::new(ServiceRegistry::new());
        let service = Arc::new(CountingService {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        registry.register(Arc::clone(&service) as Arc<dyn LookupService>);
        let executor = LookupExecutor::new(registry);

        let req = requirement(
            Some(CacheSpec { ttl: json!("30s") }),
            LookupErrorPolicy::Fail,
        );
        executor.resolve(&req, &ctx()).await.unwrap();
        executor.resolve(&req, &ctx()).await.unwrap();

        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_skip_policy_binds_absent_result() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(Arc::new(CountingService {
            calls: AtomicUsize::new(0),
            fail: true,
        }));
        let executor = LookupExecutor::new(registry);

        let mut ctx = ctx();
        executor
            .resolve_all(
                &[requirement(None, LookupErrorPolicy::Skip)],
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(ctx.lookups.get("customer"), Some(&None));
        assert_eq!(ctx.resolve("lookup.customer"), None);
    }

    #[tokio::test]
    async fn test_fail_policy_surfaces_error() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(Arc::new(CountingService {
            calls: AtomicUsize::new(0),
            fail: true,
        }));
        let executor = LookupExecutor::new(registry);

        let err = executor
            .resolve(&requirement(None, LookupErrorPolicy::Fail), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::Lookup { .. }));
    }

    #[tokio::test]
    async fn test_unknown_service_follows_policy() {
        let executor = LookupExecutor::new(Arc::new(ServiceRegistry::new()));

        let skipped = executor
            .resolve(&requirement(None, LookupErrorPolicy::Skip), &ctx())
            .await
            .unwrap();
        assert!(skipped.is_none());

        assert!(executor
            .resolve(&requirement(None, LookupErrorPolicy::Fail), &ctx())
            .await
            .is_err());
    }
}
