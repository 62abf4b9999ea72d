//! Config Assembler (C3, spec §4.3): merges a global skeleton with per-service snippets into
//! one data-plane configuration document and writes it atomically.

use crate::common::write_atomic;
use crate::config::{GlobalConfig, Paths};
use crate::error::{ProxyError, Result};
use crate::service::Service;
use bytes::Bytes;
use std::collections::BTreeMap;

/// One service's already-composed snippets, keyed by the fields the ordering function (§4.3)
/// needs.
pub struct OrderedService<'a> {
    pub service: &'a Service,
    pub frontend: &'a str,
    pub backend: &'a str,
}

const WELL_KNOWN_PREFIX: &str = "/.well-known";

/// Total ordering over services for frontend emission (spec §4.3, P2):
/// 1. any path under `/.well-known` sorts first,
/// 2. any path equal to `/` (root) sorts last,
/// 3. everyone else sorts between, by `AclName` lexicographically.
fn ordering_rank(service: &Service) -> (u8, &str) {
    let has_well_known = service
        .service_dest
        .iter()
        .any(|d| d.service_path.iter().any(|p| p.starts_with(WELL_KNOWN_PREFIX)));
    let has_root = service.service_dest.iter().any(|d| d.service_path.iter().any(|p| p == "/"));

    // The catch-all default backend behaves like a root path for ordering purposes: both sort
    // last, after every other service.
    let rank = if has_well_known {
        0
    } else if has_root || service.is_default_backend {
        2
    } else {
        1
    };
    (rank, service.acl_name.as_str())
}

/// Sort services per the total order in [`ordering_rank`] (spec P2, P1: deterministic for a
/// fixed input set — a stable sort on a pure key function is order-independent of insertion
/// order).
pub fn order_services<'a>(services: &mut Vec<OrderedService<'a>>) {
    services.sort_by(|a, b| ordering_rank(a.service).cmp(&ordering_rank(b.service)));
}

/// Render the assembled config document. `skeleton` is the global template's raw text;
/// `%%FRONTEND%%`/`%%BACKEND%%`/`%%TCP_FRONTEND%%` placeholders within it are replaced with the
/// concatenated, ordered snippets.
pub fn assemble(skeleton: &str, global: &GlobalConfig, services: &[OrderedService<'_>]) -> String {
    let mut http_frontend = String::new();
    let mut tcp_frontend = String::new();
    let mut backend = String::new();

    for entry in services {
        if entry.service.req_mode == crate::service::ReqMode::Tcp {
            tcp_frontend.push_str(entry.frontend);
        } else {
            http_frontend.push_str(entry.frontend);
        }
        backend.push_str(entry.backend);
        backend.push('\n');
    }

    if services.is_empty() {
        // Inject a dummy acl/backend pair so the data plane starts with a syntactically valid
        // file even before the first service is reconciled.
        http_frontend.push_str("    acl url_dummy path_beg /dummy\n");
        backend.push_str("backend dummy-be\n    mode http\n");
    }

    let mut vars: BTreeMap<&str, String> = BTreeMap::new();
    vars.insert("FRONTEND", http_frontend);
    vars.insert("TCP_FRONTEND", tcp_frontend);
    vars.insert("BACKEND", backend);
    vars.insert("EXTRA_FRONTEND", global.extra_frontend.clone().unwrap_or_default());
    vars.insert("STATS_USER", global.stats_user.clone().unwrap_or_default());
    vars.insert("STATS_PASS", global.stats_pass.clone().unwrap_or_default());
    vars.insert("BIND_PORTS", global.bind_ports.clone().unwrap_or_default());
    vars.insert("MODE", global.mode.clone().unwrap_or_default());
    vars.insert("PROXY_MODE", global.proxy_mode.clone().unwrap_or_default());
    vars.insert("TIMEOUT_CONNECT", opt_u32(global.timeout_connect));
    vars.insert("TIMEOUT_CLIENT", opt_u32(global.timeout_client));
    vars.insert("TIMEOUT_QUEUE", opt_u32(global.timeout_queue));
    vars.insert("TIMEOUT_HTTP_REQUEST", opt_u32(global.timeout_http_request));
    vars.insert("TIMEOUT_HTTP_KEEP_ALIVE", opt_u32(global.timeout_http_keep_alive));
    vars.insert("DEBUG", if global.debug { "debug".into() } else { String::new() });
    vars.insert("DEFAULT_USERLIST", default_userlist(global));

    let mut rendered = skeleton.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("%%{key}%%"), &value);
    }
    rendered
}

fn opt_u32(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Renders the `defaultUsers` userlist stanza the Composer falls back to when a service carries
/// no `Users[]` of its own but the global `USERS` env var is set (spec §4.2).
fn default_userlist(global: &GlobalConfig) -> String {
    let Some(raw) = &global.users else { return String::new() };
    let mut out = String::from("userlist defaultUsers\n");
    for entry in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let Some((name, pass)) = entry.split_once(':') else { continue };
        let keyword = if global.users_pass_encrypted { "password" } else { "insecure-password" };
        out.push_str(&format!("    user {name} {keyword} {pass}\n"));
    }
    out
}

/// Read the global skeleton template, assemble it against the given services, and write it
/// atomically to `<ConfigsPath>/haproxy.cfg`. Returns the bytes written.
pub async fn assemble_and_write(
    paths: &Paths,
    global: &GlobalConfig,
    services: &[OrderedService<'_>],
) -> Result<Bytes> {
    let skeleton_path = paths.skeleton_tmpl();
    let skeleton = tokio::fs::read_to_string(&skeleton_path)
        .await
        .map_err(|source| ProxyError::TemplateNotFound { path: skeleton_path.clone(), source })?;

    let rendered = assemble(&skeleton, global, services);
    write_atomic(paths.haproxy_cfg(), rendered.as_bytes())
        .await
        .map_err(|err| ProxyError::IOError(std::io::Error::other(err)))?;
    Ok(Bytes::from(rendered.into_bytes()))
}

/// Write one service's frontend/backend snippets to their per-service files, so that out-of-
/// process template engines (the registry-expansion strategy) or future assembler runs can
/// find them without recomposing.
pub async fn write_service_snippets(paths: &Paths, service: &Service, frontend: &str, backend: &str) -> Result<()> {
    write_atomic(paths.fe_snippet(&service.acl_name), frontend.as_bytes())
        .await
        .map_err(|err| ProxyError::IOError(std::io::Error::other(err)))?;
    write_atomic(paths.be_snippet(&service.acl_name), backend.as_bytes())
        .await
        .map_err(|err| ProxyError::IOError(std::io::Error::other(err)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{normalize, AttrMap, NormalizeContext};

    async fn service_named(name: &str, path: &str) -> Service {
        let attrs: AttrMap = [
            ("serviceName".to_string(), name.to_string()),
            ("servicePath".to_string(), path.to_string()),
            ("port".to_string(), "1000".to_string()),
        ]
        .into_iter()
        .collect();
        normalize(&attrs, &NormalizeContext::default()).await.unwrap()
    }

    #[tokio::test]
    async fn well_known_sorts_first_root_sorts_last() {
        let root = service_named("zzz", "/").await;
        let well_known = service_named("aaa", "/.well-known/acme").await;
        let api = service_named("mmm", "/api").await;

        let mut entries = vec![
            OrderedService { service: &root, frontend: "root\n", backend: "" },
            OrderedService { service: &well_known, frontend: "wk\n", backend: "" },
            OrderedService { service: &api, frontend: "api\n", backend: "" },
        ];
        order_services(&mut entries);
        let names: Vec<&str> = entries.iter().map(|e| e.service.service_name.as_str()).collect();
        assert_eq!(names, vec!["aaa", "mmm", "zzz"]);
    }

    #[test]
    fn assemble_is_deterministic_for_fixed_input() {
        let skeleton = "global\nfrontend fe\n%%FRONTEND%%\n%%BACKEND%%\n";
        let global = GlobalConfig::default();
        let out1 = assemble(skeleton, &global, &[]);
        let out2 = assemble(skeleton, &global, &[]);
        assert_eq!(out1, out2);
        assert!(out1.contains("acl url_dummy"));
    }

    #[test]
    fn default_userlist_renders_from_global_users_env() {
        let global = GlobalConfig { users: Some("foo:bar,baz:qux".into()), ..GlobalConfig::default() };
        let list = default_userlist(&global);
        assert!(list.contains("userlist defaultUsers"));
        assert!(list.contains("user foo insecure-password bar"));
        assert!(list.contains("user baz insecure-password qux"));
    }

    #[tokio::test]
    async fn write_atomic_preserves_prior_contents_on_later_failure_path() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths {
            configs_path: dir.path().to_path_buf(),
            templates_path: dir.path().to_path_buf(),
            ..Paths::default()
        };
        tokio::fs::write(paths.skeleton_tmpl(), "global\n%%FRONTEND%%\n%%BACKEND%%\n").await.unwrap();

        let global = GlobalConfig::default();
        assemble_and_write(&paths, &global, &[]).await.unwrap();
        let first = tokio::fs::read_to_string(paths.haproxy_cfg()).await.unwrap();
        assert!(first.contains("acl url_dummy"));
    }
}
