//! Small filesystem and process helpers shared across the reconciliation engine.

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

/// Write `contents` to `path` atomically: write to a sibling temp file, then rename over the
/// target. Either the previous contents or the new contents are observable at `path`, never a
/// partial write (spec P6).
pub async fn write_atomic(path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("error creating directory {dir:?}"))?;

    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "swap".into())
    ));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("error creating temp file {tmp_path:?}"))?;
    file.write_all(contents)
        .await
        .with_context(|| format!("error writing temp file {tmp_path:?}"))?;
    file.sync_all()
        .await
        .with_context(|| format!("error syncing temp file {tmp_path:?}"))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("error renaming {tmp_path:?} to {path:?}"))?;
    Ok(())
}

/// Checks if path exists, swallowing the "not found" case into `Ok(false)`.
pub async fn path_exists(path: impl AsRef<Path>) -> Result<bool> {
    match tokio::fs::metadata(path.as_ref()).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => {
            Err(err).with_context(|| format!("error checking existence of {:?}", path.as_ref()))
        }
    }
}

/// Run a child process to completion and fail loudly (with the full command line) if it exits
/// non-zero or can't be spawned.
#[tracing::instrument(level = "trace", skip(args))]
pub async fn run_command(
    name: &str,
    path: impl AsRef<OsStr> + std::fmt::Debug,
    args: &[impl AsRef<OsStr> + std::fmt::Debug],
) -> Result<()> {
    let status = tokio::process::Command::new(path.as_ref())
        .args(args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("error spawning {name} ({path:?}) with args {args:?}"))?
        .wait()
        .await
        .with_context(|| format!("error waiting on {name}"))?;

    if !status.success() {
        anyhow::bail!("{name} ({path:?}) with args {args:?} exited with {status}");
    }
    Ok(())
}

/// Read a secret file under a well-known directory, returning `None` when it doesn't exist.
pub async fn read_secret(dir: &Path, name: &str) -> Result<Option<String>> {
    let path = dir.join(name);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(Some(contents.trim().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("error reading secret {path:?}")),
    }
}

/// Resolve a path relative to a base directory, creating it if missing.
pub fn resolve_path(base: &Path, name: &str) -> PathBuf {
    base.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haproxy.cfg");

        write_atomic(&path, b"first").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"first");

        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");

        // no leftover temp file
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from("haproxy.cfg")]);
    }

    #[tokio::test]
    async fn path_exists_false_for_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!path_exists(dir.path().join("nope")).await.unwrap());
    }
}
