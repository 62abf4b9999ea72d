//! Reconciler (C5, spec §4.5): the process-wide serialization point that turns a normalized
//! [`Service`] into a live data-plane reload, and the only thing in this crate allowed to mutate
//! the in-memory service map.
//!
//! All four mutating operations (`reconfigure`, `reload_all`, `reload_config`, `remove_service`)
//! are serialized by a single [`tokio::sync::Mutex`] guarding the service map (spec §5): fan-out
//! work *inside* a critical section (attribute fetches, registry PUTs) runs concurrently and
//! joins back before the section releases the lock, but two reconciles never interleave their
//! view of the map.

use crate::compose::{compose, Snippets};
use crate::config::{GlobalConfig, Paths};
use crate::dataplane::DataPlane;
use crate::discoverer::Discoverer;
use crate::error::{ProxyError, Result};
use crate::registry::Registry;
use crate::service::{normalize, AttrMap, NormalizeContext, Service};
use futures_util::future::join_all;
use hickory_resolver::TokioResolver;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A resolver seam for the swarm-mode hostname check (spec §4.5 step 1). Behind a trait so
/// tests can skip or fake DNS resolution without a real resolver.
#[async_trait::async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> std::result::Result<(), anyhow::Error>;
}

pub struct SystemResolver(TokioResolver);

impl SystemResolver {
    pub fn from_system_config() -> std::result::Result<Self, anyhow::Error> {
        Ok(Self(TokioResolver::builder_tokio()?.build()))
    }
}

#[async_trait::async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::result::Result<(), anyhow::Error> {
        self.0.lookup_ip(host).await?;
        Ok(())
    }
}

/// The external collaborators the Reconciler is threaded through, per spec §9's
/// `Deps{proxy, registry, discoverer, clock, fs}` design note. `clock`/`fs` are folded into
/// `paths`/ambient tokio IO, since nothing here needs a mockable clock.
pub struct Deps {
    pub dataplane: Arc<dyn DataPlane>,
    pub registry: Arc<dyn Registry>,
    pub discoverer: Arc<dyn Discoverer>,
    pub resolver: Arc<dyn HostResolver>,
    pub paths: Paths,
    pub global: GlobalConfig,
    pub normalize_ctx: NormalizeContext,
    /// Test-only escape hatch for the swarm-mode DNS check (spec §4.5 step 1, "skippable via a
    /// test-only flag").
    pub skip_dns_check: bool,
}

/// One service together with its already-rendered snippets, so a reconcile that touches one
/// service doesn't have to recompose every other service in the map.
struct Entry {
    service: Service,
    snippets: Snippets,
}

/// A read-only view of the reconciler's current service map, returned by
/// [`Reconciler::get_services`].
pub type ServiceSnapshot = HashMap<String, Service>;

pub struct Reconciler {
    deps: Deps,
    services: Mutex<HashMap<String, Entry>>,
}

impl Reconciler {
    pub fn new(deps: Deps) -> Self {
        Self { deps, services: Mutex::new(HashMap::new()) }
    }

    /// `Reconfigure(service)` (spec §4.5): normalize, compose, write snippets, assemble +
    /// reload, then best-effort persist to the registry.
    #[tracing::instrument(level = "info", skip(self, attrs))]
    pub async fn reconfigure(&self, attrs: &AttrMap) -> Result<()> {
        let service = normalize(attrs, &self.deps.normalize_ctx).await?;

        if service.mode == crate::service::Mode::Swarm && !self.deps.skip_dns_check {
            let host = service.outbound_host().to_string();
            self.deps.resolver.resolve(&host).await.map_err(|source| {
                ProxyError::UpstreamUnreachable { host: host.clone(), source }
            })?;
        }

        let snippets = compose(&service, &self.deps.global).await?;

        let mut guard = self.services.lock().await;

        if service.mode.is_single_host() {
            crate::assemble::write_service_snippets(
                &self.deps.paths,
                &service,
                &snippets.frontend,
                &snippets.backend,
            )
            .await?;
        } else {
            self.deps
                .registry
                .create_configs(
                    &self.deps.paths.consul_addresses,
                    &self.deps.paths.proxy_instance_name,
                    &service,
                    &snippets.frontend,
                    &snippets.backend,
                )
                .await
                .unwrap_or_else(|err| tracing::warn!(%err, "create_configs failed, continuing"));
        }

        guard.insert(service.service_name.clone(), Entry { service: service.clone(), snippets });
        self.assemble_and_reload(&guard).await?;

        let registry_needed = service.mode != crate::service::Mode::Swarm
            || !self.deps.paths.consul_addresses.is_empty();
        drop(guard);

        if registry_needed {
            self.deps
                .registry
                .put_service(&self.deps.paths.consul_addresses, &self.deps.paths.proxy_instance_name, &service)
                .await?;
        }

        Ok(())
    }

    /// `RemoveService(name)` (spec §4.5): drop from the map, recompose+reload, then best-effort
    /// delete from the registry.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn remove_service(&self, name: &str) -> Result<()> {
        let mut guard = self.services.lock().await;
        guard.remove(name);
        self.assemble_and_reload(&guard).await?;
        drop(guard);

        self.deps
            .registry
            .delete_service(&self.deps.paths.consul_addresses, &self.deps.paths.proxy_instance_name, name)
            .await?;
        Ok(())
    }

    /// `GetServices()` (spec §4.5): a cheap snapshot of the in-memory map for read-only callers
    /// (the `GET /v1/docker-flow-proxy/config` and `/certs` HTTP handlers).
    pub async fn get_services(&self) -> ServiceSnapshot {
        self.services.lock().await.iter().map(|(k, v)| (k.clone(), v.service.clone())).collect()
    }

    /// `ReloadAll(addresses, instance, mode, listenerAddr)` (spec §4.5): if a discoverer
    /// listener address is given, fire-and-forget a notify (the listener calls back into
    /// `reconfigure` asynchronously); otherwise pull the full catalog from the registry, fan out
    /// attribute fetches, and do one combined assemble+reload.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn reload_all(&self, listener_addr: Option<&str>) -> Result<()> {
        if let Some(addr) = listener_addr.filter(|a| !a.is_empty()) {
            return self.deps.discoverer.notify(addr).await;
        }

        let names = self
            .deps
            .registry
            .list_services(&self.deps.paths.consul_addresses, &self.deps.paths.proxy_instance_name)
            .await?;

        // Bounded fan-out (spec §9: "cap at ~64 simultaneous fetches").
        const MAX_CONCURRENT_FETCHES: usize = 64;
        let mut fetched: Vec<(String, AttrMap)> = Vec::with_capacity(names.len());
        for chunk in names.chunks(MAX_CONCURRENT_FETCHES) {
            let tasks = chunk.iter().map(|name| {
                let name = name.clone();
                let registry = Arc::clone(&self.deps.registry);
                let addresses = self.deps.paths.consul_addresses.clone();
                let instance = self.deps.paths.proxy_instance_name.clone();
                tokio::spawn(async move {
                    let attrs = fetch_attributes(registry.as_ref(), &addresses, &instance, &name).await;
                    (name, attrs)
                })
            });
            for result in join_all(tasks).await {
                if let Ok((name, attrs)) = result {
                    fetched.push((name, attrs));
                }
            }
        }

        let mut guard = self.services.lock().await;
        for (name, attrs) in fetched {
            match normalize(&attrs, &self.deps.normalize_ctx).await {
                Ok(service) => match compose(&service, &self.deps.global).await {
                    Ok(snippets) => {
                        guard.insert(name, Entry { service, snippets });
                    }
                    Err(err) => tracing::warn!(%name, %err, "compose failed while reloading, skipping"),
                },
                Err(err) => tracing::warn!(%name, %err, "normalize failed while reloading, skipping"),
            }
        }
        self.assemble_and_reload(&guard).await
    }

    /// `ReloadConfig(base, mode, listenerAddr)` (spec §4.5): the inverse of `reload_all` — pull
    /// the catalog from the discoverer sidecar rather than the registry, reconcile each service
    /// individually, then do one final reload.
    ///
    /// Per the open question in spec §9, entries no longer reported by the discoverer are left
    /// in place (union, not replacement) — this mirrors the ambiguity noted in the original.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn reload_config(&self, listener_addr: &str) -> Result<()> {
        let records = self.deps.discoverer.get_services(listener_addr).await?;
        for attrs in &records {
            if let Err(err) = self.reconfigure(attrs).await {
                tracing::warn!(%err, "reconfigure failed while rebuilding from discoverer, continuing");
            }
        }
        let guard = self.services.lock().await;
        self.assemble_and_reload(&guard).await
    }

    /// Recompute the ordering, assemble the global config against the current map, write it
    /// atomically, and reload the data plane. Must be called with `services` already locked.
    async fn assemble_and_reload(&self, services: &HashMap<String, Entry>) -> Result<()> {
        let mut ordered: Vec<crate::assemble::OrderedService<'_>> = services
            .values()
            .map(|e| crate::assemble::OrderedService {
                service: &e.service,
                frontend: &e.snippets.frontend,
                backend: &e.snippets.backend,
            })
            .collect();
        crate::assemble::order_services(&mut ordered);

        crate::assemble::assemble_and_write(&self.deps.paths, &self.deps.global, &ordered).await?;
        self.deps.dataplane.reload().await
    }
}

async fn fetch_attributes(
    registry: &dyn Registry,
    addresses: &[String],
    instance: &str,
    service_name: &str,
) -> AttrMap {
    const KEYS: &[&str] = &[
        "path", "color", "domain", "cert", "hostname", "pathType", "skipCheck",
        "consulTemplateFePath", "consulTemplateBePath", "port",
    ];
    let mut attrs = AttrMap::new();
    attrs.insert("serviceName".to_string(), service_name.to_string());
    for &key in KEYS {
        // Per the open question in spec §9, a missing PATH attribute does not abort the
        // service's reconcile — the key is simply omitted and normalization applies its default.
        if let Ok(Some(value)) = registry.get_service_attribute(addresses, instance, service_name, key).await {
            let attr_key = match key {
                "path" => "servicePath",
                "color" => "serviceColor",
                "domain" => "serviceDomain",
                "cert" => "serviceCert",
                "hostname" => "outboundHostname",
                other => other,
            };
            attrs.insert(attr_key.to_string(), value);
        }
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::DataPlane;
    use crate::discoverer::Discoverer;
    use crate::registry::Registry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDataPlane {
        reload_count: AtomicUsize,
    }

    #[async_trait]
    impl DataPlane for FakeDataPlane {
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn reload(&self) -> Result<()> {
            self.reload_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRegistry {
        puts: tokio::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Registry for FakeRegistry {
        async fn put_service(&self, _addresses: &[String], _instance: &str, service: &Service) -> Result<()> {
            self.puts.lock().await.push(service.service_name.clone());
            Ok(())
        }
        async fn delete_service(&self, _addresses: &[String], _instance: &str, _service_name: &str) -> Result<()> {
            Ok(())
        }
        async fn create_configs(
            &self,
            _addresses: &[String],
            _instance: &str,
            _service: &Service,
            _frontend: &str,
            _backend: &str,
        ) -> Result<()> {
            Ok(())
        }
        async fn get_service_attribute(
            &self,
            _addresses: &[String],
            _instance: &str,
            _service_name: &str,
            _key: &str,
        ) -> Result<Option<String>> {
            Ok(None)
        }
        async fn list_services(&self, _addresses: &[String], _instance: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct FakeDiscoverer;

    #[async_trait]
    impl Discoverer for FakeDiscoverer {
        async fn notify(&self, _listener_addr: &str) -> Result<()> {
            Ok(())
        }
        async fn get_services(&self, _listener_addr: &str) -> Result<Vec<AttrMap>> {
            Ok(Vec::new())
        }
    }

    struct FakeResolver;

    #[async_trait]
    impl HostResolver for FakeResolver {
        async fn resolve(&self, _host: &str) -> std::result::Result<(), anyhow::Error> {
            Ok(())
        }
    }

    async fn test_reconciler(dir: &std::path::Path) -> Reconciler {
        tokio::fs::write(dir.join("haproxy.tmpl"), "global\n%%FRONTEND%%\n%%BACKEND%%\n").await.unwrap();
        let paths = Paths {
            configs_path: dir.to_path_buf(),
            templates_path: dir.to_path_buf(),
            pid_path: dir.join("haproxy.pid"),
            ..Paths::default()
        };
        let deps = Deps {
            dataplane: Arc::new(FakeDataPlane { reload_count: AtomicUsize::new(0) }),
            registry: Arc::new(FakeRegistry::default()),
            discoverer: Arc::new(FakeDiscoverer),
            resolver: Arc::new(FakeResolver),
            paths,
            global: GlobalConfig::default(),
            normalize_ctx: NormalizeContext::default(),
            skip_dns_check: true,
        };
        Reconciler::new(deps)
    }

    fn attrs(pairs: &[(&str, &str)]) -> AttrMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn reconfigure_then_get_services_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let rec = test_reconciler(dir.path()).await;
        rec.reconfigure(&attrs(&[("serviceName", "svcA"), ("servicePath", "/a"), ("port", "1000")]))
            .await
            .unwrap();
        let snapshot = rec.get_services().await;
        assert!(snapshot.contains_key("svcA"));
    }

    #[tokio::test]
    async fn remove_service_drops_it_from_the_map() {
        let dir = tempfile::tempdir().unwrap();
        let rec = test_reconciler(dir.path()).await;
        rec.reconfigure(&attrs(&[("serviceName", "svcA"), ("servicePath", "/a"), ("port", "1000")]))
            .await
            .unwrap();
        rec.remove_service("svcA").await.unwrap();
        assert!(!rec.get_services().await.contains_key("svcA"));
    }

    #[tokio::test]
    async fn reconfigure_writes_assembled_config_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let rec = test_reconciler(dir.path()).await;
        rec.reconfigure(&attrs(&[("serviceName", "svcA"), ("servicePath", "/a"), ("port", "1000")]))
            .await
            .unwrap();
        let cfg = tokio::fs::read_to_string(dir.path().join("haproxy.cfg")).await.unwrap();
        assert!(cfg.contains("url_svcA1000"));
    }
}
