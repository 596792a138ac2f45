//! Mounting the remote container's filesystem over SFTP.
//!
//! The agent exposes an SFTP server on a pod port; a tunnel stream forwards
//! it to a local TCP port and `sshfs` turns that port into a mount.

use anyhow::{Context as _, Result, bail};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use telepresence_model::MountIntent;
use tempfile::TempDir;

pub struct Mount {
    child: tokio::process::Child,
    mount_point: PathBuf,
    /// Keeps a generated temporary mount directory alive.
    _temp: Option<TempDir>,
}

impl Mount {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Unmounts and reaps the sshfs process.
    pub async fn unmount(mut self) -> Result<()> {
        let status = tokio::process::Command::new("fusermount")
            .arg("-u")
            .arg(&self.mount_point)
            .status()
            .await
            .context("Failed to run fusermount")?;

        if !status.success() {
            self.child.start_kill().ok();
        }

        self.child
            .wait()
            .await
            .context("Failed to wait for sshfs")?;

        Ok(())
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        // Last resort; the graceful path is `unmount`.
        self.child.start_kill().ok();
    }
}

/// Mounts the remote container root from the forwarded SFTP port.
pub async fn mount_remote(intent: &MountIntent, sftp_port: u16) -> Result<Option<Mount>> {
    let (mount_point, temp) = match intent {
        MountIntent::None => return Ok(None),
        MountIntent::Path(path) => {
            std::fs::create_dir_all(path)
                .with_context(|| format!("Failed to create '{}'", path.display()))?;

            (path.clone(), None)
        }
        MountIntent::TempDir => {
            let temp = tempfile::Builder::new()
                .prefix("telepresence-mount-")
                .tempdir()
                .context("Failed to create temporary mount dir")?;

            (temp.path().to_owned(), Some(temp))
        }
    };

    let child = tokio::process::Command::new("sshfs")
        .arg("-o")
        .arg(format!("directport={sftp_port}"))
        .arg("-f") // stay in the foreground so we can reap it
        .arg("localhost:/")
        .arg(&mount_point)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to spawn sshfs; is it installed?")?;

    tracing::info!(mount_point = %mount_point.display(), %sftp_port, "Mounted remote filesystem");

    Ok(Some(Mount {
        child,
        mount_point,
        _temp: temp,
    }))
}

/// Rejects a mount point that equals or nests within an existing one.
///
/// Overlapping mounts across simultaneous intercepts are forbidden.
pub fn check_overlap<'a>(
    candidate: &Path,
    existing: impl Iterator<Item = &'a Path>,
) -> Result<()> {
    for other in existing {
        if candidate.starts_with(other) || other.starts_with(candidate) {
            bail!(
                "mount point '{}' overlaps existing mount '{}'",
                candidate.display(),
                other.display()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_mount_points_are_rejected() {
        let existing = [PathBuf::from("/home/user/project/mnt")];
        let existing_refs = || existing.iter().map(PathBuf::as_path);

        assert!(check_overlap(Path::new("/home/user/project/mnt"), existing_refs()).is_err());
        assert!(check_overlap(Path::new("/home/user/project/mnt/sub"), existing_refs()).is_err());
        assert!(check_overlap(Path::new("/home/user"), existing_refs()).is_err());
        assert!(check_overlap(Path::new("/home/user/other"), existing_refs()).is_ok());
    }
}
