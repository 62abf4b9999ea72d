//! Layered configuration.
//!
//! Following the same layering principle as a typical Rust CLI tool: reasonable defaults,
//! superseded by environment variables, superseded by CLI flags. There is no configuration
//! *file* for this engine — the original spec is pure env + CLI (§6 "Environment variables"),
//! so unlike a config-file-driven tool this layer only has two levels: env, then CLI.
//!
//! [`GlobalConfig`] holds the knobs the Config Assembler (C3) needs to render the global
//! skeleton (timeouts, stats credentials, extra frontend stanzas, `USERS`, `BIND_PORTS`, debug).
//! [`Paths`] holds the on-disk layout (§6 "On-disk layout") and the registry/discoverer
//! addressing needed by C4/C7.

use std::path::PathBuf;

/// Global knobs derived from the process environment, consumed by the Config Assembler (C3)
/// when rendering the skeleton template.
#[derive(Clone, Debug, Default)]
pub struct GlobalConfig {
    pub mode: Option<String>,
    pub users: Option<String>,
    pub users_pass_encrypted: bool,
    pub timeout_connect: Option<u32>,
    pub timeout_client: Option<u32>,
    pub timeout_server: Option<u32>,
    pub timeout_queue: Option<u32>,
    pub timeout_tunnel: Option<u32>,
    pub timeout_http_request: Option<u32>,
    pub timeout_http_keep_alive: Option<u32>,
    pub stats_user: Option<String>,
    pub stats_pass: Option<String>,
    pub proxy_mode: Option<String>,
    pub extra_frontend: Option<String>,
    pub bind_ports: Option<String>,
    pub debug: bool,
}

impl GlobalConfig {
    /// Load every recognized knob from the process environment (spec §6 "Environment
    /// variables"). Unknown/absent variables keep their default (`None`/`false`).
    pub fn from_env() -> Self {
        Self {
            mode: env_string("MODE"),
            users: env_string("USERS"),
            users_pass_encrypted: env_bool("USERS_PASS_ENCRYPTED"),
            timeout_connect: env_u32("TIMEOUT_CONNECT"),
            timeout_client: env_u32("TIMEOUT_CLIENT"),
            timeout_server: env_u32("TIMEOUT_SERVER"),
            timeout_queue: env_u32("TIMEOUT_QUEUE"),
            timeout_tunnel: env_u32("TIMEOUT_TUNNEL"),
            timeout_http_request: env_u32("TIMEOUT_HTTP_REQUEST"),
            timeout_http_keep_alive: env_u32("TIMEOUT_HTTP_KEEP_ALIVE"),
            stats_user: env_string("STATS_USER"),
            stats_pass: env_string("STATS_PASS"),
            proxy_mode: env_string("PROXY_MODE"),
            extra_frontend: env_string("EXTRA_FRONTEND"),
            bind_ports: env_string("BIND_PORTS"),
            debug: env_bool("DEBUG"),
        }
    }

    /// `true` when a global default user string is configured (used by the Composer to decide
    /// whether the built-in `defaultUsers`/`defaultRealm` fallback applies).
    pub fn has_default_users(&self) -> bool {
        self.users.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// On-disk layout & addressing, combining CLI flags with their environment-variable fallbacks.
#[derive(Clone, Debug)]
pub struct Paths {
    pub configs_path: PathBuf,
    pub templates_path: PathBuf,
    pub pid_path: PathBuf,
    pub proxy_instance_name: String,
    pub consul_addresses: Vec<String>,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            configs_path: PathBuf::from("/cfg"),
            templates_path: PathBuf::from("/cfg/tmpl"),
            pid_path: PathBuf::from("/var/run/haproxy.pid"),
            proxy_instance_name: "docker-flow".into(),
            consul_addresses: Vec::new(),
        }
    }
}

impl Paths {
    pub fn haproxy_cfg(&self) -> PathBuf {
        self.configs_path.join("haproxy.cfg")
    }

    pub fn skeleton_tmpl(&self) -> PathBuf {
        self.templates_path.join("haproxy.tmpl")
    }

    pub fn fe_snippet(&self, acl_name: &str) -> PathBuf {
        self.templates_path.join(format!("{acl_name}-fe.cfg"))
    }

    pub fn be_snippet(&self, acl_name: &str) -> PathBuf {
        self.templates_path.join(format!("{acl_name}-be.cfg"))
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_global_users() {
        let cfg = GlobalConfig::default();
        assert!(!cfg.has_default_users());
    }

    #[test]
    fn paths_join_configs_path_for_haproxy_cfg() {
        let paths = Paths {
            configs_path: PathBuf::from("/etc/haproxy"),
            ..Paths::default()
        };
        assert_eq!(paths.haproxy_cfg(), PathBuf::from("/etc/haproxy/haproxy.cfg"));
    }
}
