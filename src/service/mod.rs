//! The canonical in-memory description of one routed service (C1), and its normalization from
//! heterogeneous inputs (HTTP query params, swarm-listener notifications, CLI flags).

mod normalize;

pub use normalize::{normalize, NormalizeContext, RawService};

use std::collections::HashMap;

/// How the backend's upstream servers are sourced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// The backend is rendered with a registry-expansion directive that is filled in by an
    /// external template engine at data-plane config time.
    #[default]
    Default,
    /// The backend points at a single logical upstream addressed by hostname.
    Service,
    /// Same as `Service`, for container-swarm deployments.
    Swarm,
}

impl Mode {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "service" => Mode::Service,
            "swarm" => Mode::Swarm,
            _ => Mode::Default,
        }
    }

    pub fn is_single_host(self) -> bool {
        matches!(self, Mode::Service | Mode::Swarm)
    }
}

/// The frontend wire protocol of a service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReqMode {
    #[default]
    Http,
    Tcp,
    Sni,
}

impl ReqMode {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => ReqMode::Tcp,
            "sni" => ReqMode::Sni,
            _ => ReqMode::Http,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReqMode::Http => "http",
            ReqMode::Tcp => "tcp",
            ReqMode::Sni => "sni",
        }
    }
}

/// One routing destination of a service: a backend port plus the path prefixes and (for
/// multi-listener TCP frontends) the source port that route to it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceDest {
    pub port: String,
    pub service_path: Vec<String>,
    pub src_port: Option<u16>,
}

impl ServiceDest {
    /// The ACL name used for a src-port-scoped frontend (`src_port_<AclName><SrcPort>`).
    pub fn src_port_acl_name(&self, acl_name: &str) -> Option<String> {
        self.src_port
            .map(|port| format!("src_port_{acl_name}{port}"))
    }
}

/// A resolved HTTP Basic auth credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub password: String,
    pub pass_encrypted: bool,
}

/// A single routed service — the unit the Template Composer (C2) and Config Assembler (C3)
/// operate on. See spec §3 for the full field-by-field contract.
#[derive(Clone, Debug)]
pub struct Service {
    pub service_name: String,
    pub acl_name: String,
    pub mode: Mode,
    pub req_mode: ReqMode,
    pub service_dest: Vec<ServiceDest>,
    pub service_domain: Vec<String>,
    pub service_domain_match_all: bool,
    pub https_port: u32,
    pub https_only: bool,
    pub ssl_verify_none: bool,
    pub path_type: String,
    pub skip_check: bool,
    pub users: Vec<User>,
    pub timeout_server: Option<u32>,
    pub timeout_tunnel: Option<u32>,
    pub req_path_search: Option<String>,
    pub req_path_replace: Option<String>,
    pub req_rep_search: Option<String>,
    pub req_rep_replace: Option<String>,
    pub consul_template_fe_path: Option<String>,
    pub consul_template_be_path: Option<String>,
    pub template_fe_path: Option<String>,
    pub template_be_path: Option<String>,
    pub service_color: Option<String>,
    pub outbound_hostname: Option<String>,
    pub distribute: bool,
    /// Optional cert bundle name, threaded through for the `/certs` endpoint; TLS termination
    /// itself is out of scope (spec non-goal).
    pub service_cert: Option<String>,
    pub add_req_header: Vec<String>,
    pub add_res_header: Vec<String>,
    /// Marks this service as the catch-all default backend (affects assembly ordering, §4.3).
    pub is_default_backend: bool,
}

impl Service {
    /// The name used to look up this service's upstream endpoints in the registry — the
    /// blue/green selector (`ServiceColor`) is folded in when present.
    pub fn registry_lookup_name(&self) -> String {
        match &self.service_color {
            Some(color) if !color.is_empty() => format!("{}-{color}", self.service_name),
            _ => self.service_name.clone(),
        }
    }

    /// The hostname used in `service`/`swarm` backend server lines.
    pub fn outbound_host(&self) -> &str {
        self.outbound_hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(&self.service_name)
    }

    /// `true` when both members of an external-template pair are set (I3: both-or-neither is
    /// validated at normalization time, so by the time a `Service` exists this is just a
    /// convenience query).
    pub fn has_literal_templates(&self) -> bool {
        self.template_fe_path.is_some() && self.template_be_path.is_some()
    }

    pub fn has_registry_expansion_templates(&self) -> bool {
        self.consul_template_fe_path.is_some() && self.consul_template_be_path.is_some()
    }
}

/// A flat string map, as received from an HTTP query string or a swarm-listener notification
/// (spec §4.1 "Input may be a flat string→string mapping").
pub type AttrMap = HashMap<String, String>;
