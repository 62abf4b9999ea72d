//! Template Composer (C2, spec §4.2): `Compose(service) → (frontSnippet, backSnippet)`.
//!
//! Three emission strategies, tried in priority order: external literal templates, external
//! registry-expansion templates, then the built-in composition. Composition never fails except
//! when an external template file can't be read.

use crate::config::GlobalConfig;
use crate::error::{ProxyError, Result};
use crate::service::{Mode, ReqMode, Service};
use std::path::Path;

/// The two snippets a composed service contributes to the assembled config (spec §4.2/§4.3).
pub struct Snippets {
    pub frontend: String,
    pub backend: String,
}

/// Compose a service into its frontend/backend snippets.
pub async fn compose(service: &Service, global: &GlobalConfig) -> Result<Snippets> {
    if service.has_literal_templates() {
        return compose_literal(service).await;
    }
    if service.has_registry_expansion_templates() {
        return compose_registry_expansion(service).await;
    }
    Ok(compose_builtin(service, global))
}

/// Strategy 1: read both external files and substitute `Service` fields as plain text (no
/// control flow beyond iterating `ServiceDest`). The built-in composer contributes nothing
/// (spec P5).
#[allow(clippy::expect_used)]
async fn compose_literal(service: &Service) -> Result<Snippets> {
    // Caller only reaches this strategy when `has_literal_templates()` is true.
    let fe_path = service.template_fe_path.as_deref().expect("checked by has_literal_templates");
    let be_path = service.template_be_path.as_deref().expect("checked by has_literal_templates");
    let frontend = render_template(fe_path, service).await?;
    let backend = render_template(be_path, service).await?;
    Ok(Snippets { frontend, backend })
}

/// Strategy 2: read both files verbatim, with no local rendering — the data plane expects an
/// external template engine (a sidecar) to evaluate them against the registry.
#[allow(clippy::expect_used)]
async fn compose_registry_expansion(service: &Service) -> Result<Snippets> {
    // Caller only reaches this strategy when `has_registry_expansion_templates()` is true.
    let fe_path = service
        .consul_template_fe_path
        .as_deref()
        .expect("checked by has_registry_expansion_templates");
    let be_path = service
        .consul_template_be_path
        .as_deref()
        .expect("checked by has_registry_expansion_templates");
    let frontend = read_verbatim(fe_path).await?;
    let backend = read_verbatim(be_path).await?;
    Ok(Snippets { frontend, backend })
}

async fn read_verbatim(path: &str) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProxyError::TemplateNotFound { path: path.into(), source })
}

/// Field substitution only: `{{ServiceName}}`, `{{AclName}}`, and one `{{#each ServiceDest}}`
/// block, which is the only control flow the spec requires external literal templates to
/// support.
async fn render_template(path: &str, service: &Service) -> Result<String> {
    let raw = read_verbatim(path).await?;
    Ok(substitute_fields(&raw, service))
}

fn substitute_fields(template: &str, service: &Service) -> String {
    let mut out = template
        .replace("{{ServiceName}}", &service.service_name)
        .replace("{{AclName}}", &service.acl_name)
        .replace("{{ReqMode}}", service.req_mode.as_str());

    if let Some(dest) = service.service_dest.first() {
        out = out.replace("{{Port}}", &dest.port);
    }
    out
}

/// Strategy 3: the default built-in composition described in full in spec §4.2.
fn compose_builtin(service: &Service, global: &GlobalConfig) -> Snippets {
    Snippets {
        frontend: compose_frontend(service),
        backend: compose_backend(service, global),
    }
}

fn compose_frontend(service: &Service) -> String {
    // Frontend snippets only apply in non-service/non-swarm modes.
    if service.mode.is_single_host() {
        return String::new();
    }

    let mut out = String::new();
    let acl_condition = domain_acl(service, &mut out);

    for dest in &service.service_dest {
        let mut acl_line = format!(
            "    acl url_{}{} {} {}",
            service.acl_name,
            dest.port,
            service.path_type,
            dest.service_path.join(" "),
        );
        if let Some(src_port) = dest.src_port {
            acl_line.push_str(&format!(" src_port {src_port}"));
        }
        out.push_str(&acl_line);
        out.push('\n');
    }

    if service.https_port > 0 {
        out.push_str(&format!("    acl http_{} src_port 80\n", service.service_name));
        out.push_str(&format!("    acl https_{} src_port 443\n", service.service_name));
        for dest in &service.service_dest {
            out.push_str(&format!(
                "    use_backend {}-be{} if url_{}{}{} http_{}\n",
                service.acl_name, dest.port, service.acl_name, dest.port, acl_condition, service.service_name,
            ));
            out.push_str(&format!(
                "    use_backend https-{}-be{} if url_{}{}{} https_{}\n",
                service.acl_name, dest.port, service.acl_name, dest.port, acl_condition, service.service_name,
            ));
        }
    } else {
        for dest in &service.service_dest {
            out.push_str(&format!(
                "    use_backend {}-be{} if url_{}{}{}\n",
                service.acl_name, dest.port, service.acl_name, dest.port, acl_condition,
            ));
        }
    }

    if service.https_only {
        for _dest in &service.service_dest {
            out.push_str("    redirect scheme https if !{ ssl_fc }\n");
        }
    }

    out
}

/// Emit the domain ACL (if any) and return the trailing `AclCondition` fragment appended to
/// every `use_backend` line.
fn domain_acl(service: &Service, out: &mut String) -> String {
    if service.service_domain.is_empty() {
        return String::new();
    }
    let any_wildcard = service.service_domain.iter().any(|d| d.starts_with('*'));
    if any_wildcard {
        let suffixes: Vec<String> = service
            .service_domain
            .iter()
            .map(|d| d.trim_start_matches('*').to_string())
            .collect();
        out.push_str(&format!(
            "    acl domain_{} hdr_end(host) -i {}\n",
            service.service_name,
            suffixes.join(" ")
        ));
    } else {
        out.push_str(&format!(
            "    acl domain_{} hdr_dom(host) -i {}\n",
            service.service_name,
            service.service_domain.join(" ")
        ));
    }
    format!(" domain_{}", service.service_name)
}

fn compose_backend(service: &Service, global: &GlobalConfig) -> String {
    let mut out = String::new();

    let (user_list, realm) = if !service.users.is_empty() {
        (format!("{}Users", service.service_name), format!("{}Realm", service.service_name))
    } else if global.has_default_users() {
        ("defaultUsers".to_string(), "defaultRealm".to_string())
    } else {
        (String::new(), String::new())
    };

    if !service.users.is_empty() {
        out.push_str(&format!("userlist {user_list}\n"));
        for user in &service.users {
            if user.pass_encrypted {
                out.push_str(&format!("    user {} password {}\n", user.username, user.password));
            } else {
                out.push_str(&format!("    user {} insecure-password {}\n", user.username, user.password));
            }
        }
    }

    for dest in &service.service_dest {
        out.push_str(&backend_stanza(service, dest, &user_list, &realm, false, global));
    }

    if service.https_port > 0 {
        if let Some(dest) = service.service_dest.first() {
            out.push_str(&backend_stanza(service, dest, &user_list, &realm, true, global));
        }
    }

    out
}

fn backend_stanza(
    service: &Service,
    dest: &crate::service::ServiceDest,
    user_list: &str,
    realm: &str,
    https: bool,
    global: &GlobalConfig,
) -> String {
    let name_prefix = if https { "https-" } else { "" };
    let port_suffix = if dest.port.is_empty() { String::new() } else { dest.port.clone() };
    let mut out = format!("backend {name_prefix}{}-be{port_suffix}\n", service.acl_name);
    out.push_str(&format!("    mode {}\n", service.req_mode.as_str()));

    if service.req_mode == ReqMode::Http {
        out.push_str("    http-request add-header X-Forwarded-Proto https if { ssl_fc }\n");
    }

    let timeout_server = service.timeout_server.or(global.timeout_server);
    if let Some(timeout) = timeout_server {
        out.push_str(&format!("    timeout server {timeout}s\n"));
    }
    let timeout_tunnel = service.timeout_tunnel.or(global.timeout_tunnel);
    if let Some(timeout) = timeout_tunnel {
        out.push_str(&format!("    timeout tunnel {timeout}s\n"));
    }

    if let (Some(search), Some(replace)) = (&service.req_rep_search, &service.req_rep_replace) {
        out.push_str(&format!("    reqrep {search}     {replace}\n"));
    }
    if let (Some(search), Some(replace)) = (&service.req_path_search, &service.req_path_replace) {
        out.push_str(&format!(
            "    http-request set-path %[path,regsub({search},{replace})]\n"
        ));
    }

    for header in &service.add_req_header {
        out.push_str(&format!("    http-request add-header {header}\n"));
    }
    for header in &service.add_res_header {
        out.push_str(&format!("    http-response set-header {header}\n"));
    }

    out.push_str(&server_line(service, dest, https));

    if !user_list.is_empty() {
        let acl_name = if user_list == "defaultUsers" {
            "defaultUsersAcl".to_string()
        } else {
            format!("{}UsersAcl", service.service_name)
        };
        out.push_str(&format!("    acl {acl_name} http_auth({user_list})\n"));
        out.push_str(&format!("    http-request auth realm {realm} if !{acl_name}\n"));
        out.push_str("    http-request del-header Authorization\n");
    }

    out
}

fn server_line(service: &Service, dest: &crate::service::ServiceDest, https: bool) -> String {
    match service.mode {
        Mode::Service | Mode::Swarm => {
            let host = service.outbound_host();
            let port = if https { service.https_port } else { dest.port.parse().unwrap_or(0) };
            let verify = if service.ssl_verify_none { " ssl verify none" } else { "" };
            format!("    server {} {host}:{port}{verify}\n", service.service_name)
        }
        Mode::Default => {
            let check = if service.skip_check { "" } else { " check" };
            format!(
                "    server {{{{range $i, $e := service \"{}\" \"any\"}}}}{{{{$e.Node}}}}_{{{{$i}}}}_{{{{$e.Port}}}} {{{{$e.Address}}}}:{{{{$e.Port}}}}{check}\n{{{{end}}}}\n",
                service.registry_lookup_name(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{normalize, AttrMap, NormalizeContext};
    use rstest::rstest;

    async fn service_from(pairs: &[(&str, &str)]) -> Service {
        let attrs: AttrMap = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        normalize(&attrs, &NormalizeContext::default()).await.unwrap()
    }

    #[rstest]
    #[case("default", "1000", true)]
    #[case("service", "1000", false)]
    #[case("swarm", "1000", false)]
    #[tokio::test]
    async fn server_line_check_suffix_follows_mode(#[case] mode: &str, #[case] port: &str, #[case] expect_check: bool) {
        let svc = service_from(&[("serviceName", "modeSvc"), ("mode", mode), ("port", port)]).await;
        let snippets = compose(&svc, &GlobalConfig::default()).await.unwrap();
        assert_eq!(snippets.backend.contains(" check"), expect_check, "mode={mode}");
    }

    #[tokio::test]
    async fn default_mode_emits_registry_expansion_server_line() {
        let svc = service_from(&[("serviceName", "myService"), ("servicePath", "/api"), ("port", "1000")]).await;
        let snippets = compose(&svc, &GlobalConfig::default()).await.unwrap();
        assert!(snippets.frontend.contains("acl url_myService1000 path_beg /api"));
        assert!(snippets.backend.contains("$e.Node"));
        assert!(snippets.backend.contains(" check"));
    }

    #[tokio::test]
    async fn swarm_mode_emits_single_host_server_line_without_check() {
        let svc = service_from(&[("serviceName", "myService"), ("mode", "swarm"), ("port", "1234")]).await;
        let snippets = compose(&svc, &GlobalConfig::default()).await.unwrap();
        assert!(snippets.backend.contains("server myService myService:1234"));
        assert!(!snippets.backend.contains(" check"));
        assert!(snippets.frontend.is_empty());
    }

    #[tokio::test]
    async fn service_mode_with_https_port_emits_two_stanzas() {
        let svc =
            service_from(&[("serviceName", "myService"), ("mode", "service"), ("port", "1234"), ("httpsPort", "4321")])
                .await;
        let snippets = compose(&svc, &GlobalConfig::default()).await.unwrap();
        assert!(snippets.backend.contains("backend myService-be1234"));
        assert!(snippets.backend.contains(":1234"));
        assert!(snippets.backend.contains("backend https-myService-be1234"));
        assert!(snippets.backend.contains(":4321"));
    }

    #[tokio::test]
    async fn https_port_frontend_gates_every_destination_on_its_own_url_acl() {
        let svc = service_from(&[
            ("serviceName", "myService"),
            ("servicePath", "/api"),
            ("port", "1000"),
            ("servicePath.1", "/other"),
            ("port.1", "2000"),
            ("httpsPort", "4321"),
        ])
        .await;
        let snippets = compose(&svc, &GlobalConfig::default()).await.unwrap();

        // scheme ACLs key off the incoming connection's source port, not the destination port.
        assert!(snippets.frontend.contains("acl http_myService src_port 80"));
        assert!(snippets.frontend.contains("acl https_myService src_port 443"));

        // every destination's use_backend is gated on both its own path ACL and the scheme ACL
        // -- losing either would either drop routing for non-first destinations or route any
        // request on the scheme port regardless of path.
        assert!(snippets.frontend.contains("use_backend myService-be1000 if url_myService1000 http_myService"));
        assert!(snippets
            .frontend
            .contains("use_backend https-myService-be1000 if url_myService1000 https_myService"));
        assert!(snippets.frontend.contains("use_backend myService-be2000 if url_myService2000 http_myService"));
        assert!(snippets
            .frontend
            .contains("use_backend https-myService-be2000 if url_myService2000 https_myService"));
    }

    #[tokio::test]
    async fn wildcard_domain_uses_hdr_end_and_tags_use_backend() {
        let svc = service_from(&[
            ("serviceName", "myService"),
            ("serviceDomain", "*.acme.com"),
            ("port", "1000"),
        ])
        .await;
        let snippets = compose(&svc, &GlobalConfig::default()).await.unwrap();
        assert!(snippets.frontend.contains("acl domain_myService hdr_end(host) -i .acme.com"));
        assert!(snippets.frontend.contains("domain_myService"));
    }

    #[tokio::test]
    async fn global_users_env_uses_default_users_list() {
        let svc = service_from(&[("serviceName", "myService"), ("servicePath", "/api"), ("port", "1000")]).await;
        let global = GlobalConfig { users: Some("foo:bar".into()), ..GlobalConfig::default() };
        let snippets = compose(&svc, &global).await.unwrap();
        assert!(snippets.backend.contains("acl defaultUsersAcl http_auth(defaultUsers)"));
        assert!(snippets.backend.contains("http-request del-header Authorization"));
    }
}
