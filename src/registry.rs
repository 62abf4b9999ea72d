//! Registry Adapter (C4, spec §4.4): reads/writes per-service attributes in an external ordered
//! KV store (a Consul-compatible HTTP API) and lists known services.

use crate::error::{ProxyError, Result};
use crate::service::Service;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;

/// The fixed set of per-service attributes mirrored into the registry (spec §6 "Registry wire
/// interface").
const ATTRIBUTES: &[&str] = &[
    "path", "color", "domain", "cert", "hostname", "pathType", "skipCheck",
    "consulTemplateFePath", "consulTemplateBePath", "port",
];

/// The Registry Adapter's operations, behind a trait so the Reconciler (C5) can inject a fake
/// in tests (spec §9 "Deps record").
#[async_trait]
pub trait Registry: Send + Sync {
    async fn put_service(&self, addresses: &[String], instance: &str, service: &Service) -> Result<()>;
    async fn delete_service(&self, addresses: &[String], instance: &str, service_name: &str) -> Result<()>;
    async fn create_configs(&self, addresses: &[String], instance: &str, service: &Service, frontend: &str, backend: &str) -> Result<()>;
    async fn get_service_attribute(&self, addresses: &[String], instance: &str, service_name: &str, key: &str) -> Result<Option<String>>;
    async fn list_services(&self, addresses: &[String], instance: &str) -> Result<Vec<String>>;
}

/// A `reqwest`-backed client speaking the Consul-compatible KV HTTP API.
pub struct ConsulRegistry {
    client: reqwest::Client,
}

impl Default for ConsulRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsulRegistry {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    #[allow(clippy::expect_used)]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            // Only fails on a bad TLS backend/DNS resolver build, which means the process can't
            // do anything useful anyway.
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builder"),
        }
    }

    fn kv_url(address: &str, instance: &str, service_name: &str, key: &str) -> String {
        format!("{}/v1/kv/{instance}/{service_name}/{key}", address.trim_end_matches('/'))
    }

    fn attribute_value(service: &Service, key: &str) -> Option<String> {
        match key {
            "path" => Some(
                service
                    .service_dest
                    .iter()
                    .flat_map(|d| d.service_path.iter())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            "color" => service.service_color.clone(),
            "domain" => (!service.service_domain.is_empty()).then(|| service.service_domain.join(",")),
            "cert" => service.service_cert.clone(),
            "hostname" => service.outbound_hostname.clone(),
            "pathType" => Some(service.path_type.clone()),
            "skipCheck" => Some(service.skip_check.to_string()),
            "consulTemplateFePath" => service.consul_template_fe_path.clone(),
            "consulTemplateBePath" => service.consul_template_be_path.clone(),
            "port" => service.service_dest.first().map(|d| d.port.clone()),
            _ => None,
        }
    }

    /// Try every endpoint in order, retrying each one with a short exponential backoff before
    /// moving on — a single flaky PUT shouldn't fail an attribute that a retry would have saved
    /// (spec §4.4: "succeeds iff every individual PUT eventually reports success").
    async fn put_one(&self, addresses: &[String], url_path: &str, value: String) -> bool {
        for address in addresses {
            let url = format!("{}{}", address.trim_end_matches('/'), url_path);
            let attempt = || async {
                let resp = self.client.put(&url).body(value.clone()).send().await?;
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("status {}", resp.status()))
                }
            };
            match attempt
                .retry(ExponentialBuilder::default().with_max_times(3))
                .notify(|err, dur| tracing::debug!(%url, %err, ?dur, "retrying registry PUT"))
                .await
            {
                Ok(()) => return true,
                Err(err) => tracing::debug!(%url, %err, "registry PUT failed after retries"),
            }
        }
        false
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    /// Fan out one task per attribute, each trying every endpoint in order until one succeeds;
    /// the overall operation succeeds iff every attribute eventually reports success (spec
    /// §4.4: "succeeds iff every individual PUT eventually reports success").
    #[tracing::instrument(level = "debug", skip(self, service))]
    async fn put_service(&self, addresses: &[String], instance: &str, service: &Service) -> Result<()> {
        if addresses.is_empty() {
            return Err(ProxyError::RegistryError("no registry addresses configured".into()));
        }

        let mut tasks = Vec::new();
        for &attr in ATTRIBUTES {
            let Some(value) = Self::attribute_value(service, attr) else { continue };
            let url_path = format!("/v1/kv/{instance}/{}/{attr}", service.service_name);
            let addresses = addresses.to_vec();
            let client = self.client.clone();
            tasks.push(tokio::spawn(async move {
                let registry = ConsulRegistry { client };
                registry.put_one(&addresses, &url_path, value).await
            }));
        }

        let mut all_ok = true;
        for task in tasks {
            match task.await {
                Ok(ok) => all_ok &= ok,
                Err(_join_err) => all_ok = false,
            }
        }

        if all_ok {
            Ok(())
        } else {
            Err(ProxyError::RegistryError(format!(
                "one or more attribute PUTs failed for service '{}'",
                service.service_name
            )))
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_service(&self, addresses: &[String], instance: &str, service_name: &str) -> Result<()> {
        for address in addresses {
            let url = format!("{}/v1/kv/{instance}/{service_name}?recurse", address.trim_end_matches('/'));
            match self.client.delete(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => tracing::debug!(%url, status = %resp.status(), "registry DELETE rejected"),
                Err(err) => tracing::debug!(%url, error = %err, "registry DELETE failed"),
            }
        }
        Err(ProxyError::RegistryError(format!("delete failed for service '{service_name}' across all endpoints")))
    }

    /// Upload the built template files so a sidecar renderer can consume them (non-swarm
    /// mode). Uses the same fan-out-per-key PUT primitive as `put_service`.
    async fn create_configs(
        &self,
        addresses: &[String],
        instance: &str,
        service: &Service,
        frontend: &str,
        backend: &str,
    ) -> Result<()> {
        if service.mode.is_single_host() {
            return Ok(());
        }
        let fe_path = format!("/v1/kv/{instance}/{}/templateFe", service.service_name);
        let be_path = format!("/v1/kv/{instance}/{}/templateBe", service.service_name);
        let fe_ok = self.put_one(addresses, &fe_path, frontend.to_string()).await;
        let be_ok = self.put_one(addresses, &be_path, backend.to_string()).await;
        if fe_ok && be_ok {
            Ok(())
        } else {
            Err(ProxyError::RegistryError(format!(
                "failed uploading template config for service '{}'",
                service.service_name
            )))
        }
    }

    async fn get_service_attribute(
        &self,
        addresses: &[String],
        instance: &str,
        service_name: &str,
        key: &str,
    ) -> Result<Option<String>> {
        for address in addresses {
            let url = format!("{}?raw", Self::kv_url(address, instance, service_name, key));
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(Some(resp.text().await.map_err(|e| ProxyError::RegistryError(e.to_string()))?));
                }
                Ok(_) => continue,
                Err(err) => {
                    tracing::debug!(%url, error = %err, "registry GET failed");
                    continue;
                }
            }
        }
        Ok(None)
    }

    async fn list_services(&self, addresses: &[String], instance: &str) -> Result<Vec<String>> {
        for address in addresses {
            let url = format!("{}/v1/kv/{instance}?keys", address.trim_end_matches('/'));
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let keys: Vec<String> = resp
                        .json()
                        .await
                        .map_err(|err| ProxyError::RegistryError(err.to_string()))?;
                    let mut names: Vec<String> = keys
                        .iter()
                        .filter_map(|k| k.strip_prefix(&format!("{instance}/")))
                        .filter_map(|rest| rest.split('/').next())
                        .map(|s| s.to_string())
                        .collect();
                    names.sort();
                    names.dedup();
                    return Ok(names);
                }
                Ok(_) => continue,
                Err(err) => {
                    tracing::debug!(%url, error = %err, "registry list failed");
                    continue;
                }
            }
        }
        Err(ProxyError::RegistryError("no registry endpoint returned the service list".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_value_extracts_port() {
        let service = crate::service::Service {
            service_name: "s".into(),
            acl_name: "s".into(),
            mode: crate::service::Mode::Default,
            req_mode: crate::service::ReqMode::Http,
            service_dest: vec![crate::service::ServiceDest { port: "1234".into(), service_path: vec!["/".into()], src_port: None }],
            service_domain: vec![],
            service_domain_match_all: false,
            https_port: 0,
            https_only: false,
            ssl_verify_none: false,
            path_type: "path_beg".into(),
            skip_check: false,
            users: vec![],
            timeout_server: None,
            timeout_tunnel: None,
            req_path_search: None,
            req_path_replace: None,
            req_rep_search: None,
            req_rep_replace: None,
            consul_template_fe_path: None,
            consul_template_be_path: None,
            template_fe_path: None,
            template_be_path: None,
            service_color: None,
            outbound_hostname: None,
            distribute: false,
            service_cert: None,
            add_req_header: vec![],
            add_res_header: vec![],
            is_default_backend: false,
        };
        assert_eq!(ConsulRegistry::attribute_value(&service, "port"), Some("1234".into()));
        assert_eq!(ConsulRegistry::attribute_value(&service, "path"), Some("/".into()));
    }
}
