//! The command-line front-end (spec §6.1, ambient — argument parsing itself is an out-of-scope
//! concern per spec §1; this module is the thin wrapper gluing `clap` onto the core engine).
//!
//! `server` owns the long-lived [`Reconciler`] behind the axum HTTP surface; `reconfigure`,
//! `remove`, and `reload` are one-shot invocations that build the same `Reconciler` over the
//! same adapters and call the corresponding method directly — mirroring how the original
//! `docker-flow-proxy` CLI subcommands wrap the same package functions the HTTP handlers use.

use crate::config::{GlobalConfig, Paths};
use crate::dataplane::HaProxyDriver;
use crate::discoverer::SwarmListenerClient;
use crate::error::Result;
use crate::http;
use crate::reconciler::{Deps, Reconciler, SystemResolver};
use crate::registry::ConsulRegistry;
use crate::service::{AttrMap, NormalizeContext};
use clap::{ArgAction, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "proxy-reconciler", about, author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub action: Commands,

    /// Registry (Consul-compatible KV store) endpoints to read/write service metadata.
    #[arg(long = "consul-address", global = true, env = "CONSUL_ADDRESS", value_delimiter = ',')]
    pub consul_address: Vec<String>,

    /// Directory the assembled `haproxy.cfg` is written into.
    #[arg(long, global = true, env = "CONFIGS_PATH", default_value = "/cfg")]
    pub configs_path: PathBuf,

    /// Directory holding the global skeleton and per-service snippet templates.
    #[arg(long, global = true, env = "TEMPLATES_PATH", default_value = "/cfg/tmpl")]
    pub templates_path: PathBuf,

    /// Namespaces this instance's keys within the registry.
    #[arg(long, global = true, env = "PROXY_INSTANCE_NAME", default_value = "docker-flow")]
    pub proxy_instance_name: String,

    /// Directory holding `/run/secrets`-style per-user secret files.
    #[arg(long, global = true, env = "SECRETS_DIR", default_value = "/run/secrets")]
    pub secrets_dir: PathBuf,

    /// Timeout applied to outbound registry/discoverer HTTP calls (humantime syntax, e.g. `5s`).
    #[arg(long, global = true, env = "HTTP_TIMEOUT", default_value = "5s")]
    pub http_timeout: humantime::Duration,

    /// Enable verbose logging.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Be quieter; conflicts with --verbose.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// A raw `RUST_LOG`-style filter; conflicts with --verbose and --quiet.
    #[arg(long, global = true, conflicts_with_all(["verbose", "quiet"]), env = "RUST_LOG")]
    pub log: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the long-lived reconciler behind the control-plane HTTP API.
    Server(ServerArgs),
    /// One-shot: normalize and reconcile a single service, then exit.
    Reconfigure(AttrArgs),
    /// One-shot: remove a service by name, then exit.
    Remove(RemoveArgs),
    /// One-shot: reload the assembled config from the registry or the discoverer, then exit.
    Reload(ReloadArgs),
}

#[derive(clap::Args)]
pub struct ServerArgs {
    /// Address the control-plane HTTP API listens on.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,
}

/// `key=value` attribute pairs, the structured-record form of normalization input (spec §4.1).
#[derive(clap::Args)]
pub struct AttrArgs {
    /// A `key=value` service attribute (recognized keys: spec §3); repeatable.
    #[arg(long = "attr", value_parser = parse_attr)]
    pub attrs: Vec<(String, String)>,
}

#[derive(clap::Args)]
pub struct RemoveArgs {
    #[arg(long)]
    pub service_name: String,
}

#[derive(clap::Args)]
pub struct ReloadArgs {
    /// Rebuild the whole map from the discoverer sidecar instead of the registry.
    #[arg(long)]
    pub recreate: bool,
    /// The swarm-listener sidecar address (required when `--recreate`, optional otherwise).
    #[arg(long)]
    pub listener_addr: Option<String>,
}

fn parse_attr(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

impl Cli {
    pub fn init_logging(&self) -> tracing_subscriber::EnvFilter {
        if let Some(directives) = &self.log {
            return tracing_subscriber::EnvFilter::new(directives);
        }
        let directives = match (self.verbose, self.quiet) {
            (_, true) => "warn,proxy_reconciler=warn",
            (0, false) => "warn,proxy_reconciler=info",
            (1, false) => "warn,proxy_reconciler=debug",
            (_, false) => "warn,proxy_reconciler=trace",
        };
        tracing_subscriber::EnvFilter::new(directives)
    }

    fn paths(&self) -> Paths {
        Paths {
            configs_path: self.configs_path.clone(),
            templates_path: self.templates_path.clone(),
            pid_path: PathBuf::from("/var/run/haproxy.pid"),
            proxy_instance_name: self.proxy_instance_name.clone(),
            consul_addresses: self.consul_address.clone(),
        }
    }

    fn build_reconciler(&self) -> Arc<Reconciler> {
        let timeout: Duration = *self.http_timeout;
        let resolver: Arc<dyn crate::reconciler::HostResolver> = match SystemResolver::from_system_config() {
            Ok(resolver) => Arc::new(resolver),
            Err(err) => {
                tracing::warn!(%err, "falling back to a resolver that always fails swarm-mode DNS checks");
                Arc::new(UnavailableResolver)
            }
        };

        let global = GlobalConfig::from_env();
        let deps = Deps {
            dataplane: Arc::new(HaProxyDriver::new(self.paths())),
            registry: Arc::new(ConsulRegistry::with_timeout(timeout)),
            discoverer: Arc::new(SwarmListenerClient::with_timeout(timeout)),
            resolver,
            paths: self.paths(),
            normalize_ctx: NormalizeContext {
                secrets_dir: self.secrets_dir.clone(),
                global_users: global.users.clone(),
                global_users_pass_encrypted: global.users_pass_encrypted,
            },
            global,
            skip_dns_check: false,
        };
        Arc::new(Reconciler::new(deps))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn run(self) -> Result<()> {
        match &self.action {
            Commands::Server(args) => self.run_server(args).await,
            Commands::Reconfigure(args) => self.run_reconfigure(args).await,
            Commands::Remove(args) => self.run_remove(args).await,
            Commands::Reload(args) => self.run_reload(args).await,
        }
    }

    async fn run_server(&self, args: &ServerArgs) -> Result<()> {
        let reconciler = self.build_reconciler();
        let state = http::AppState { reconciler, paths: self.paths() };
        let app = http::router(state);

        let listener = tokio::net::TcpListener::bind(args.listen_addr)
            .await
            .map_err(crate::error::ProxyError::IOError)?;
        tracing::info!(addr = %args.listen_addr, "control-plane HTTP API listening");
        axum::serve(listener, app).await.map_err(crate::error::ProxyError::IOError)?;
        Ok(())
    }

    async fn run_reconfigure(&self, args: &AttrArgs) -> Result<()> {
        let reconciler = self.build_reconciler();
        let attrs: AttrMap = args.attrs.iter().cloned().collect();
        reconciler.reconfigure(&attrs).await
    }

    async fn run_remove(&self, args: &RemoveArgs) -> Result<()> {
        let reconciler = self.build_reconciler();
        reconciler.remove_service(&args.service_name).await
    }

    async fn run_reload(&self, args: &ReloadArgs) -> Result<()> {
        let reconciler = self.build_reconciler();
        if args.recreate {
            let addr = args.listener_addr.as_deref().ok_or_else(|| {
                crate::error::ProxyError::InvalidInput("--listener-addr is required with --recreate".into())
            })?;
            reconciler.reload_config(addr).await
        } else {
            reconciler.reload_all(args.listener_addr.as_deref()).await
        }
    }
}

struct UnavailableResolver;

#[async_trait::async_trait]
impl crate::reconciler::HostResolver for UnavailableResolver {
    async fn resolve(&self, host: &str) -> std::result::Result<(), anyhow::Error> {
        Err(anyhow::anyhow!("no DNS resolver available to resolve '{host}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_attr_splits_on_first_equals() {
        assert_eq!(parse_attr("servicePath=/a=b").unwrap(), ("servicePath".to_string(), "/a=b".to_string()));
        assert!(parse_attr("noequals").is_err());
    }
}
