use crate::init::Workspace;
use crate::platform;
use crate::{logi, logw};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const DELETE_ATTEMPTS: u32 = 3;
const DELETE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Working directories for one keyword's intermediate files.
///
/// Sequential runs share the workspace-level `output/`, `audio/` and
/// `videos/` directories. Concurrent runs get one directory per keyword
/// under `output/sessions/`, stable across runs so a resumed keyword finds
/// its earlier artifacts.
#[derive(Debug, Clone)]
pub struct SessionDirs {
    session_root: Option<PathBuf>,
    pub output: PathBuf,
    pub audio: PathBuf,
    pub videos: PathBuf,
}

impl SessionDirs {
    pub fn shared(ws: &Workspace) -> Self {
        Self {
            session_root: None,
            output: ws.output_dir(),
            audio: ws.audio_dir(),
            videos: ws.videos_dir(),
        }
    }

    pub fn isolated(ws: &Workspace, keyword: &str) -> Self {
        let root = ws.output_dir().join("sessions").join(session_name(keyword));
        Self {
            output: root.join("output"),
            audio: root.join("audio"),
            videos: root.join("videos"),
            session_root: Some(root),
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.session_root.is_some()
    }

    fn transient_dirs(&self) -> Vec<&Path> {
        match &self.session_root {
            Some(root) => vec![root.as_path()],
            None => vec![self.output.as_path(), self.audio.as_path(), self.videos.as_path()],
        }
    }

    /// Wipes anything left over from a previous keyword and recreates the
    /// directories empty.
    pub async fn prepare(&self) -> Result<()> {
        self.cleanup().await;
        for dir in [&self.output, &self.audio, &self.videos] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create dir {}", dir.display()))?;
        }
        Ok(())
    }

    /// Creates the directories without touching their contents. Used when a
    /// keyword resumes after its first step.
    pub async fn ensure(&self) -> Result<()> {
        for dir in [&self.output, &self.audio, &self.videos] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create dir {}", dir.display()))?;
        }
        Ok(())
    }

    /// Best-effort removal; failures are logged, never returned.
    pub async fn cleanup(&self) {
        for dir in self.transient_dirs() {
            if !force_delete_directory(dir).await {
                logw(format!("Could not fully remove {}", dir.display()));
            }
        }
    }
}

fn session_name(keyword: &str) -> String {
    keyword
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Removes `path` recursively, retrying a few times before falling back to
/// the OS shell. Returns whether the directory is gone.
pub async fn force_delete_directory(path: &Path) -> bool {
    force_delete_with_delay(path, DELETE_RETRY_DELAY).await
}

async fn force_delete_with_delay(path: &Path, delay: Duration) -> bool {
    if !path.exists() {
        return true;
    }

    for attempt in 1..=DELETE_ATTEMPTS {
        match fs::remove_dir_all(path).await {
            Ok(()) => return true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return true,
            Err(err) => {
                logw(format!(
                    "Delete attempt {}/{} failed for {}: {}",
                    attempt,
                    DELETE_ATTEMPTS,
                    path.display(),
                    err
                ));
                if attempt < DELETE_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    logi(format!("Falling back to shell delete for {}", path.display()));
    platform::force_remove_dir(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn isolated_sessions_live_under_output() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());

        let a = SessionDirs::isolated(&ws, "Wireless Mouse");
        let b = SessionDirs::isolated(&ws, "usb/c hub");
        assert!(a.is_isolated());
        assert_ne!(a.output, b.output);
        assert_eq!(a.output, SessionDirs::isolated(&ws, "wireless mouse ").output);

        let root = a.output.parent().unwrap().to_path_buf();
        assert_eq!(root, ws.output_dir().join("sessions").join("wireless_mouse"));
        assert!(b.output.starts_with(ws.output_dir().join("sessions").join("usb_c_hub")));

        a.prepare().await.unwrap();
        std::fs::write(a.audio.join("product_1_audio.wav"), b"pcm").unwrap();
        a.cleanup().await;
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn shared_prepare_wipes_previous_keyword() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let dirs = SessionDirs::shared(&ws);

        dirs.prepare().await.unwrap();
        std::fs::write(dirs.videos.join("stale.mp4"), b"old").unwrap();
        std::fs::write(dirs.output.join("product.json"), b"[]").unwrap();

        dirs.prepare().await.unwrap();
        assert!(!dirs.videos.join("stale.mp4").exists());
        assert!(!dirs.output.join("product.json").exists());
        assert!(dirs.audio.is_dir());
    }

    #[tokio::test]
    async fn ensure_keeps_artifacts() {
        let dir = TempDir::new().unwrap();
        let dirs = SessionDirs::shared(&Workspace::new(dir.path()));
        dirs.prepare().await.unwrap();
        std::fs::write(dirs.output.join("final.mp4"), b"v").unwrap();

        dirs.ensure().await.unwrap();
        assert!(dirs.output.join("final.mp4").exists());
    }

    #[tokio::test]
    async fn deleting_a_missing_directory_succeeds() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(force_delete_with_delay(&missing, Duration::from_millis(1)).await);
    }
}
