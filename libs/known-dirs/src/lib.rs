#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Where the daemons keep their state on the workstation.
//!
//! All locations honour the `DEV_TELEPRESENCE_CONFIG_DIR` and
//! `DEV_TELEPRESENCE_LOG_DIR` overrides so tests and development setups can
//! relocate them wholesale.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_DIR_OVERRIDE: &str = "DEV_TELEPRESENCE_CONFIG_DIR";
const LOG_DIR_OVERRIDE: &str = "DEV_TELEPRESENCE_LOG_DIR";

/// Per-user configuration, including session tokens.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_OVERRIDE) {
        return Some(PathBuf::from(dir));
    }

    Some(dirs::config_dir()?.join("telepresence"))
}

/// Per-user caches, including the daemon info files.
pub fn cache_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_OVERRIDE) {
        return Some(PathBuf::from(dir).join("cache"));
    }

    Some(dirs::cache_dir()?.join("telepresence"))
}

pub fn log_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(LOG_DIR_OVERRIDE) {
        return Some(PathBuf::from(dir));
    }

    Some(dirs::cache_dir()?.join("telepresence").join("logs"))
}

/// Where the control sockets live.
pub fn runtime_dir() -> Option<PathBuf> {
    if let Some(dir) = dirs::runtime_dir() {
        return Some(dir.join("telepresence"));
    }

    cache_dir()
}

/// Whether telemetry is suppressed. The core only passes this through.
pub fn telemetry_disabled() -> bool {
    std::env::var_os("SCOUT_DISABLE").is_some_and(|value| !value.is_empty())
}

/// Applies the `TELEPRESENCE_UID` / `TELEPRESENCE_GID` overrides to a freshly
/// created file, so a daemon started with elevated privileges leaves caches
/// owned by the invoking user.
#[cfg(unix)]
pub fn chown_to_env(path: &Path) -> Result<()> {
    use nix::unistd::{Gid, Uid, chown};

    let uid = std::env::var("TELEPRESENCE_UID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .map(Uid::from_raw);
    let gid = std::env::var("TELEPRESENCE_GID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .map(Gid::from_raw);

    if uid.is_none() && gid.is_none() {
        return Ok(());
    }

    chown(path, uid, gid).with_context(|| format!("Failed to chown '{}'", path.display()))?;

    Ok(())
}

#[cfg(not(unix))]
pub fn chown_to_env(_path: &Path) -> Result<()> {
    Ok(())
}

/// One file per active daemon, describing how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub name: String,
    pub kube_context: String,
    pub namespace: String,
    pub socket_path: PathBuf,
    pub in_container: bool,
}

fn daemons_dir() -> Result<PathBuf> {
    let dir = cache_dir()
        .context("No cache directory on this platform")?
        .join("daemons");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create '{}'", dir.display()))?;

    Ok(dir)
}

pub fn save_daemon_info(info: &DaemonInfo) -> Result<PathBuf> {
    let path = daemons_dir()?.join(format!("{}.json", info.name));

    let json = serde_json::to_vec_pretty(info).context("Failed to serialise daemon info")?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write '{}'", path.display()))?;
    chown_to_env(&path)?;

    Ok(path)
}

pub fn load_daemon_infos() -> Result<Vec<DaemonInfo>> {
    let mut infos = Vec::new();

    for entry in std::fs::read_dir(daemons_dir()?).context("Failed to read daemons dir")? {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }

        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read '{}'", path.display()))?;
        let info = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse '{}'", path.display()))?;

        infos.push(info);
    }

    Ok(infos)
}

pub fn remove_daemon_info(name: &str) -> Result<()> {
    let path = daemons_dir()?.join(format!("{name}.json"));

    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove '{}'", path.display())),
    }
}

/// Session tokens are kept out of the cache, under the config directory with
/// owner-only permissions.
pub fn save_session_token(name: &str, token: &str) -> Result<PathBuf> {
    let dir = config_dir()
        .context("No config directory on this platform")?
        .join("tokens");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create '{}'", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;

        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            .context("Failed to restrict token dir permissions")?;
    }

    let path = dir.join(format!("{name}.token"));
    std::fs::write(&path, token)
        .with_context(|| format!("Failed to write '{}'", path.display()))?;
    chown_to_env(&path)?;

    Ok(path)
}

pub fn load_session_token(name: &str) -> Result<Option<String>> {
    let Some(dir) = config_dir() else {
        return Ok(None);
    };
    let path = dir.join("tokens").join(format!("{name}.token"));

    match std::fs::read_to_string(&path) {
        Ok(token) => Ok(Some(token)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read '{}'", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_info_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        // Serialise access to the env var across tests in this module.
        unsafe { std::env::set_var(CONFIG_DIR_OVERRIDE, dir.path()) };

        let info = DaemonInfo {
            name: "default".to_owned(),
            kube_context: "kind-test".to_owned(),
            namespace: "ambassador".to_owned(),
            socket_path: "/tmp/connector.sock".into(),
            in_container: false,
        };

        save_daemon_info(&info).unwrap();
        let loaded = load_daemon_infos().unwrap();

        assert_eq!(loaded, vec![info]);

        remove_daemon_info("default").unwrap();
        assert!(load_daemon_infos().unwrap().is_empty());

        unsafe { std::env::remove_var(CONFIG_DIR_OVERRIDE) };
    }
}
