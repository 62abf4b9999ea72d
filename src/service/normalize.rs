//! `Normalize(input) → Service` (C1, spec §4.1).

use super::{AttrMap, Mode, ReqMode, Service, ServiceDest, User};
use crate::common::read_secret;
use crate::error::{ProxyError, Result};
use rand::Rng;
use regex::Regex;
use std::path::PathBuf;

/// Context the normalizer needs beyond the raw attribute map: where per-service user secrets
/// live, and the global `USERS`/`USERS_PASS_ENCRYPTED` fallback (spec §4.1 priority (c)).
#[derive(Clone, Debug, Default)]
pub struct NormalizeContext {
    pub secrets_dir: PathBuf,
    pub global_users: Option<String>,
    pub global_users_pass_encrypted: bool,
}

/// A structured record, as produced by CLI flag parsing rather than a flat string map. The
/// normalizer accepts either form (spec §4.1); CLI subcommands build one of these and flatten
/// it into an [`AttrMap`] via [`RawService::into_attrs`] so there is a single code path.
#[derive(Clone, Debug, Default)]
pub struct RawService(pub AttrMap);

impl RawService {
    pub fn into_attrs(self) -> AttrMap {
        self.0
    }
}

const MAX_INDEXED_DEST: usize = 10;

/// Normalize a flat attribute map into a canonical [`Service`].
///
/// Fails with [`ProxyError::InvalidInput`] on a missing `serviceName`, or on a
/// `templateFePath`/`templateBePath` (or `consulTemplate*Path`) pair that sets only one side
/// (invariant I3).
pub async fn normalize(attrs: &AttrMap, ctx: &NormalizeContext) -> Result<Service> {
    let service_name = attrs
        .get("serviceName")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProxyError::InvalidInput("serviceName is required".into()))?
        .to_string();

    let acl_name = attrs
        .get("aclName")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(&service_name)
        .to_string();

    let mode = attrs.get("mode").map(|s| Mode::parse(s)).unwrap_or_default();
    let req_mode = attrs
        .get("reqMode")
        .map(|s| ReqMode::parse(s))
        .unwrap_or_default();

    let template_fe_path = non_empty(attrs.get("templateFePath"));
    let template_be_path = non_empty(attrs.get("templateBePath"));
    check_pair("templateFePath", "templateBePath", &template_fe_path, &template_be_path)?;

    let consul_template_fe_path = non_empty(attrs.get("consulTemplateFePath"));
    let consul_template_be_path = non_empty(attrs.get("consulTemplateBePath"));
    check_pair(
        "consulTemplateFePath",
        "consulTemplateBePath",
        &consul_template_fe_path,
        &consul_template_be_path,
    )?;

    let has_external_templates =
        template_fe_path.is_some() || consul_template_fe_path.is_some();

    let mut service_dest = scan_dest(attrs, has_external_templates);
    let mut service_domain: Vec<String> = attrs
        .get("serviceDomain")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    service_domain.sort();
    service_domain.dedup();

    // I2: a service with domains set must have non-empty paths on every destination; an empty
    // path defaults to "/".
    if !service_domain.is_empty() {
        for dest in &mut service_dest {
            if dest.service_path.is_empty() {
                dest.service_path.push("/".into());
            }
        }
    }

    let req_path_search = non_empty(attrs.get("reqPathSearch"));
    let req_rep_search = non_empty(attrs.get("reqRepSearch"));
    for (field, pattern) in [("reqPathSearch", &req_path_search), ("reqRepSearch", &req_rep_search)] {
        if let Some(pattern) = pattern {
            Regex::new(pattern)
                .map_err(|err| ProxyError::InvalidInput(format!("{field} is not a valid regex: {err}")))?;
        }
    }

    let users = resolve_users(attrs, ctx).await?;

    let add_req_header = split_list(attrs.get("addReqHeader"));
    let add_res_header = split_list(attrs.get("addResHeader"));

    Ok(Service {
        service_name,
        acl_name,
        mode,
        req_mode,
        service_dest,
        service_domain_match_all: bool_field(attrs, "serviceDomainMatchAll"),
        service_domain,
        https_port: attrs.get("httpsPort").and_then(|s| s.parse().ok()).unwrap_or(0),
        https_only: bool_field(attrs, "httpsOnly"),
        ssl_verify_none: bool_field(attrs, "sslVerifyNone"),
        path_type: non_empty(attrs.get("pathType")).unwrap_or_else(|| "path_beg".into()),
        skip_check: bool_field(attrs, "skipCheck"),
        users,
        timeout_server: attrs.get("timeoutServer").and_then(|s| s.parse().ok()),
        timeout_tunnel: attrs.get("timeoutTunnel").and_then(|s| s.parse().ok()),
        req_path_search,
        req_path_replace: non_empty(attrs.get("reqPathReplace")),
        req_rep_search,
        req_rep_replace: non_empty(attrs.get("reqRepReplace")),
        consul_template_fe_path,
        consul_template_be_path,
        template_fe_path,
        template_be_path,
        service_color: non_empty(attrs.get("serviceColor")),
        outbound_hostname: non_empty(attrs.get("outboundHostname")),
        distribute: bool_field(attrs, "distribute"),
        service_cert: non_empty(attrs.get("serviceCert")),
        add_req_header,
        add_res_header,
        is_default_backend: bool_field(attrs, "isDefaultBackend"),
    })
}

fn check_pair(
    a_name: &str,
    b_name: &str,
    a: &Option<String>,
    b: &Option<String>,
) -> Result<()> {
    if a.is_some() != b.is_some() {
        return Err(ProxyError::InvalidInput(format!(
            "{a_name} and {b_name} must both be set, or both unset"
        )));
    }
    Ok(())
}

fn bool_field(attrs: &AttrMap, key: &str) -> bool {
    attrs
        .get(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(|v| v.to_string())
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Scan `servicePath`/`port`/`srcPort`, then the `.1`..`.10` indexed variants, stopping at the
/// first index that defines neither `port.N` nor `servicePath.N` (spec §4.1).
///
/// A bare `port` without `servicePath` is accepted only when external template paths are set
/// (the built-in composer would otherwise emit an ACL with no path).
fn scan_dest(attrs: &AttrMap, has_external_templates: bool) -> Vec<ServiceDest> {
    let mut dests = Vec::new();

    if let Some(dest) = dest_at(attrs, None, has_external_templates) {
        dests.push(dest);
    }
    for i in 1..=MAX_INDEXED_DEST {
        match dest_at(attrs, Some(i), has_external_templates) {
            Some(dest) => dests.push(dest),
            None => break,
        }
    }
    dests
}

fn dest_at(attrs: &AttrMap, index: Option<usize>, _has_external_templates: bool) -> Option<ServiceDest> {
    let suffix = index.map(|i| format!(".{i}")).unwrap_or_default();
    let port = attrs.get(&format!("port{suffix}")).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let path = attrs.get(&format!("servicePath{suffix}"));
    let src_port = attrs
        .get(&format!("srcPort{suffix}"))
        .and_then(|s| s.parse().ok());

    let service_path: Vec<String> = path
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    // A gap (neither port.N nor servicePath.N set) terminates the scan; a bare src_port with
    // no port/path does not define a destination on its own.
    if port.is_none() && service_path.is_empty() {
        return None;
    }

    Some(ServiceDest {
        port: port.unwrap_or_default(),
        service_path,
        src_port,
    })
}

/// Merge the three user sources in priority order (a) `usersParam`, (b) `usersSecret`, (c) the
/// global `USERS` fallback, dropping entries whose password never resolves, and synthesizing
/// exactly one placeholder user if the request asked for auth but nothing survived (I4).
///
/// `usersSecret`'s *value* names a file under the secrets directory
/// (`<secrets_dir>/dfp_users_<value>`) holding a full `user:pass[,user:pass...]` list. When
/// `usersParam` is empty, that file's contents become the service's whole user list. When
/// `usersParam` is non-empty, any of its entries missing a password are looked up by name in
/// that file (or, when no `usersSecret` was given, in the global `USERS` list instead) — never
/// both.
async fn resolve_users(attrs: &AttrMap, ctx: &NormalizeContext) -> Result<Vec<User>> {
    let users_param = attrs.get("users").map(String::as_str).unwrap_or("");
    let users_secret = non_empty(attrs.get("usersSecret"));
    if users_param.is_empty() && users_secret.is_none() {
        return Ok(Vec::new());
    }

    let pass_encrypted = bool_field(attrs, "usersPassEncrypted");

    // Bare names (no colon) are accepted here as password-pending entries (spec §4.1: "For a
    // param user without a password, the password is looked up by name in (b) or (c)");
    // malformed colon-form entries (empty name or empty password) are logged and dropped.
    let mut param_users = parse_user_list(users_param, pass_encrypted, true);

    // (b) the file named by `usersSecret`, if given: a full `user:pass` list. Bare names make
    // no sense in a list that is itself the lookup source, so they're dropped there.
    let mut file_users = match &users_secret {
        Some(secret_value) => {
            let secret_name = format!("dfp_users_{secret_value}");
            match read_secret(&ctx.secrets_dir, &secret_name).await {
                Ok(Some(contents)) => parse_user_list(&contents, pass_encrypted, false),
                Ok(None) => {
                    tracing::warn!(secret_value, "usersSecret file not found");
                    Vec::new()
                }
                Err(err) => {
                    tracing::warn!(secret_value, %err, "failed reading usersSecret file");
                    Vec::new()
                }
            }
        }
        None => Vec::new(),
    };

    let collected = if !param_users.is_empty() {
        if param_users.iter().any(|u| u.password.is_empty()) {
            // (c) the global `USERS` fallback only substitutes for (b) when no `usersSecret`
            // was given at all.
            if users_secret.is_none() {
                if let Some(global) = &ctx.global_users {
                    file_users = parse_user_list(global, ctx.global_users_pass_encrypted, false);
                }
            }
            for user in &mut param_users {
                if user.password.is_empty() {
                    match file_users.iter().find(|u| u.username == user.username) {
                        Some(found) => {
                            user.password = found.password.clone();
                            user.pass_encrypted = found.pass_encrypted;
                        }
                        None => tracing::warn!(username = %user.username, "no password found for user"),
                    }
                }
            }
        }
        param_users
    } else {
        file_users
    };

    let mut resolved: Vec<User> = collected.into_iter().filter(|u| !u.password.is_empty()).collect();

    if resolved.is_empty() {
        let mut rng = rand::rng();
        let suffix: u32 = rng.random();
        resolved.push(User {
            username: format!("user{suffix:08x}"),
            password: format!("pass{:08x}", rng.random::<u32>()),
            pass_encrypted: false,
        });
    }

    Ok(resolved)
}

/// Parse a `user:pass[,user:pass...]` (comma- or newline-separated) list. A colon-form entry
/// with an empty name or password is malformed and is logged and dropped. When
/// `allow_bare_names` is set, an entry with no colon at all is kept as a password-pending user
/// (used for `usersParam`, where the password may be resolved later); otherwise it is dropped
/// (used for list *sources* — the `usersSecret` file, the global `USERS` fallback — where a bare
/// name has nothing left to be looked up against).
fn parse_user_list(raw: &str, pass_encrypted: bool, allow_bare_names: bool) -> Vec<User> {
    let mut out = Vec::new();
    for entry in raw.split(['\n', ',']).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        match entry.split_once(':') {
            Some((name, pass)) => {
                let (name, pass) = (name.trim(), pass.trim());
                if name.is_empty() || pass.is_empty() {
                    tracing::warn!(entry, "skipping malformed user:pass entry");
                    continue;
                }
                out.push(User { username: name.to_string(), password: pass.to_string(), pass_encrypted });
            }
            None if allow_bare_names => {
                out.push(User { username: entry.to_string(), password: String::new(), pass_encrypted });
            }
            None => tracing::warn!(entry, "skipping bare user name in a strict user list"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> AttrMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn ctx() -> NormalizeContext {
        NormalizeContext {
            secrets_dir: PathBuf::from("/nonexistent"),
            global_users: None,
            global_users_pass_encrypted: false,
        }
    }

    #[tokio::test]
    async fn requires_service_name() {
        let err = normalize(&attrs(&[]), &ctx()).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn acl_name_defaults_to_service_name() {
        let svc = normalize(&attrs(&[("serviceName", "myService")]), &ctx()).await.unwrap();
        assert_eq!(svc.acl_name, "myService");
    }

    #[tokio::test]
    async fn rejects_mismatched_template_pair() {
        let err = normalize(
            &attrs(&[("serviceName", "s"), ("templateFePath", "/x/fe.cfg")]),
            &ctx(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn scans_indexed_destinations_until_gap() {
        let svc = normalize(
            &attrs(&[
                ("serviceName", "s"),
                ("servicePath", "/api"),
                ("port", "1000"),
                ("servicePath.1", "/api2"),
                ("port.1", "1001"),
                // gap at index 2 (no port.2/servicePath.2) terminates the scan
                ("servicePath.3", "/api3"),
                ("port.3", "1003"),
            ]),
            &ctx(),
        )
        .await
        .unwrap();
        assert_eq!(svc.service_dest.len(), 2);
        assert_eq!(svc.service_dest[0].port, "1000");
        assert_eq!(svc.service_dest[1].port, "1001");
    }

    #[tokio::test]
    async fn rejects_malformed_req_path_search_regex() {
        let err = normalize(
            &attrs(&[("serviceName", "s"), ("reqPathSearch", "(unclosed")]),
            &ctx(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn drops_malformed_colon_entry_and_unresolvable_bare_name_keeps_valid_ones() {
        // "onlyname" is a password-pending bare name (not malformed), but with no usersSecret
        // or global USERS to resolve it against it never gets a password and is dropped.
        let svc = normalize(
            &attrs(&[("serviceName", "s"), ("users", "onlyname,good:pass")]),
            &ctx(),
        )
        .await
        .unwrap();
        assert_eq!(svc.users.len(), 1);
        assert_eq!(svc.users[0].username, "good");
    }

    #[tokio::test]
    async fn bare_name_password_resolves_from_global_users_when_no_secret_given() {
        let mut context = ctx();
        context.global_users = Some("onlyname:frompass,other:x".into());
        let svc = normalize(&attrs(&[("serviceName", "s"), ("users", "onlyname")]), &context).await.unwrap();
        assert_eq!(svc.users.len(), 1);
        assert_eq!(svc.users[0].username, "onlyname");
        assert_eq!(svc.users[0].password, "frompass");
    }

    #[tokio::test]
    async fn users_secret_file_supplies_the_whole_list_when_no_users_param() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("dfp_users_team1"), "alice:s3cret,bob:hunter2").await.unwrap();
        let mut context = ctx();
        context.secrets_dir = dir.path().to_path_buf();

        let svc = normalize(&attrs(&[("serviceName", "s"), ("usersSecret", "team1")]), &context).await.unwrap();
        let names: Vec<&str> = svc.users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(svc.users.len(), 2);
        assert!(names.contains(&"alice"));
        assert!(names.contains(&"bob"));
    }

    #[tokio::test]
    async fn users_secret_resolves_a_bare_name_from_users_param() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("dfp_users_team1"), "onlyname:fromsecret").await.unwrap();
        let mut context = ctx();
        context.secrets_dir = dir.path().to_path_buf();
        // A global USERS list is also present, but usersSecret takes priority and should be
        // the only lookup source consulted when it's set.
        context.global_users = Some("onlyname:fromglobal".into());

        let svc = normalize(
            &attrs(&[("serviceName", "s"), ("users", "onlyname"), ("usersSecret", "team1")]),
            &context,
        )
        .await
        .unwrap();
        assert_eq!(svc.users.len(), 1);
        assert_eq!(svc.users[0].password, "fromsecret");
    }

    #[tokio::test]
    async fn requested_users_with_no_resolvable_password_synthesizes_one_placeholder() {
        // "users" is requested (onlyname has no password and no matching secret/global entry),
        // but nothing resolves — I4/P4 require exactly one placeholder user, never zero.
        let svc = normalize(&attrs(&[("serviceName", "s"), ("users", "onlyname")]), &ctx()).await.unwrap();
        assert_eq!(svc.users.len(), 1);
        assert!(!svc.users[0].password.is_empty());
        assert_ne!(svc.users[0].username, "onlyname");
    }

    #[tokio::test]
    async fn domain_forces_default_path() {
        let svc = normalize(
            &attrs(&[
                ("serviceName", "s"),
                ("serviceDomain", "example.com"),
                ("port", "1000"),
            ]),
            &ctx(),
        )
        .await
        .unwrap();
        assert_eq!(svc.service_dest[0].service_path, vec!["/".to_string()]);
    }
}
