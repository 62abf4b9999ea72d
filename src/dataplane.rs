//! Data-plane Driver (C6, spec §4.6): starts the HAProxy-family process and reloads it via the
//! graceful `-sf <pid>` handoff, so an in-flight connection survives a config change.

use crate::common::run_command;
use crate::config::Paths;
use crate::error::{ProxyError, Result};

/// The Data-plane Driver's operations, behind a trait so the Reconciler (C5) can inject a fake
/// in tests.
#[async_trait::async_trait]
pub trait DataPlane: Send + Sync {
    /// First start of the data-plane process (no prior PID to hand off from).
    async fn start(&self) -> Result<()>;
    /// Graceful reload: re-exec with `-sf <old pid>` so the old process finishes draining
    /// in-flight connections before exiting (spec P5 "in-flight requests are not dropped").
    async fn reload(&self) -> Result<()>;
}

pub struct HaProxyDriver {
    paths: Paths,
    binary: String,
}

impl HaProxyDriver {
    pub fn new(paths: Paths) -> Self {
        Self { paths, binary: "haproxy".into() }
    }

    #[cfg(test)]
    fn with_binary(paths: Paths, binary: impl Into<String>) -> Self {
        Self { paths, binary: binary.into() }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-f".into(),
            self.paths.haproxy_cfg().to_string_lossy().into_owned(),
            "-D".into(),
            "-p".into(),
            self.paths.pid_path.to_string_lossy().into_owned(),
        ]
    }

    async fn run_cmd(&self, extra_args: &[String]) -> Result<()> {
        let mut args = self.base_args();
        args.extend_from_slice(extra_args);
        let command_line = format!("{} {}", self.binary, args.join(" "));

        run_command(&self.binary, &self.binary, args.as_slice()).await.map_err(|err| {
            let config_excerpt = std::fs::read_to_string(self.paths.haproxy_cfg())
                .unwrap_or_else(|_| "<config unreadable>".to_string());
            ProxyError::ReloadFailed {
                message: err.to_string(),
                command: command_line.clone(),
                config_excerpt,
            }
        })
    }

    async fn read_pid(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.paths.pid_path)
            .await
            .map(|s| s.trim().to_string())
            .map_err(ProxyError::IOError)
    }
}

#[async_trait::async_trait]
impl DataPlane for HaProxyDriver {
    #[tracing::instrument(level = "info", skip(self))]
    async fn start(&self) -> Result<()> {
        self.run_cmd(&[]).await
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn reload(&self) -> Result<()> {
        let pid = self.read_pid().await?;
        self.run_cmd(&["-sf".to_string(), pid]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_args_reference_configured_paths() {
        let paths = Paths {
            configs_path: "/etc/haproxy".into(),
            pid_path: "/run/haproxy.pid".into(),
            ..Paths::default()
        };
        let driver = HaProxyDriver::with_binary(paths, "haproxy");
        let args = driver.base_args();
        assert_eq!(args, vec!["-f", "/etc/haproxy/haproxy.cfg", "-D", "-p", "/run/haproxy.pid"]);
    }

    #[tokio::test]
    async fn reload_fails_with_message_when_pid_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths {
            configs_path: dir.path().to_path_buf(),
            pid_path: dir.path().join("missing.pid"),
            ..Paths::default()
        };
        tokio::fs::write(paths.haproxy_cfg(), "global\n").await.unwrap();
        let driver = HaProxyDriver::with_binary(paths, "haproxy");
        let err = driver.reload().await.unwrap_err();
        assert!(matches!(err, ProxyError::IOError(_)));
    }
}
