use crate::{logi, logok, logw};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

const REQUIRED_DIRS: &[&str] = &[
    "keywords",
    "keywords/done",
    "credentials",
    "tokens",
    "output",
    "prompts",
    "thumbnail",
];

/// File layout of a pipeline working directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a configured relative path (music, transition clip) against the root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn keyword_file(&self, language: &str, channel: &str) -> PathBuf {
        self.root
            .join("keywords")
            .join(language)
            .join(format!("{}.txt", channel))
    }

    pub fn done_dir(&self) -> PathBuf {
        self.root.join("keywords").join("done")
    }

    pub fn done_file(&self, language: &str, channel: &str) -> PathBuf {
        self.done_dir()
            .join(format!("keywords_{}_{}_done.txt", language, channel))
    }

    pub fn credentials_file(&self, channel: &str) -> PathBuf {
        self.root.join("credentials").join(format!("{}.json", channel))
    }

    pub fn tokens_dir(&self) -> PathBuf {
        self.root.join("tokens")
    }

    pub fn token_file(&self, channel: &str) -> PathBuf {
        self.tokens_dir().join(format!("token_{}.json", channel))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.root.join("audio")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.root.join("videos")
    }

    pub fn prompt_file(&self, kind: &str, language: &str) -> PathBuf {
        self.root
            .join("prompts")
            .join(format!("{}_prompt_{}.txt", kind, language))
    }

    pub fn browser_profile_config(&self, profile: &str) -> PathBuf {
        self.root
            .join("antidetect_browser")
            .join("profiles")
            .join(profile)
            .join("config.json")
    }
}

pub async fn ensure_directories(ws: &Workspace) -> Result<()> {
    for dir in REQUIRED_DIRS {
        let path = ws.root().join(dir);
        if !path.exists() {
            fs::create_dir_all(&path)
                .await
                .with_context(|| format!("Failed to create dir {}", path.display()))?;
            logi(format!("Created directory: {}", path.display()));
        }
    }
    Ok(())
}

pub async fn check_ffmpeg() -> bool {
    match tokio::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Deletes all generated state: the output tree, every completion log and
/// the OAuth tokens. Output and tokens come back as empty directories.
pub async fn reset_workspace(ws: &Workspace) -> Result<()> {
    for dir in [ws.output_dir(), ws.tokens_dir()] {
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to delete {}", dir.display()))?;
            logok(format!("Deleted {}", dir.display()));
        }
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to recreate {}", dir.display()))?;
    }

    let done_dir = ws.done_dir();
    if done_dir.exists() {
        let mut removed = 0usize;
        for entry in WalkDir::new(&done_dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            let is_log = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with("_done.txt"));
            if entry.file_type().is_file() && is_log {
                if let Err(err) = fs::remove_file(entry.path()).await {
                    logw(format!("Could not delete {}: {}", entry.path().display(), err));
                } else {
                    removed += 1;
                }
            }
        }
        logok(format!("Deleted {} completion log(s)", removed));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reset_clears_generated_state() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ensure_directories(&ws).await.unwrap();

        std::fs::create_dir_all(ws.output_dir().join("session_1")).unwrap();
        std::fs::write(ws.output_dir().join("session_1/final.mp4"), b"x").unwrap();
        std::fs::write(ws.done_file("en", "demo"), "mouse:step5_upload\n").unwrap();
        std::fs::write(ws.done_dir().join("notes.txt"), "keep me").unwrap();
        std::fs::write(ws.token_file("demo"), "{}").unwrap();
        std::fs::create_dir_all(ws.keyword_file("en", "demo").parent().unwrap()).unwrap();
        std::fs::write(ws.keyword_file("en", "demo"), "mouse\n").unwrap();

        reset_workspace(&ws).await.unwrap();

        assert!(ws.output_dir().is_dir());
        assert_eq!(std::fs::read_dir(ws.output_dir()).unwrap().count(), 0);
        assert!(ws.tokens_dir().is_dir());
        assert_eq!(std::fs::read_dir(ws.tokens_dir()).unwrap().count(), 0);
        assert!(!ws.done_file("en", "demo").exists());
        assert!(ws.done_dir().join("notes.txt").exists());
        assert!(ws.keyword_file("en", "demo").exists());
    }

    #[test]
    fn paths_follow_channel_conventions() {
        let ws = Workspace::new("/work");
        assert_eq!(
            ws.done_file("fr", "top3cuisine"),
            PathBuf::from("/work/keywords/done/keywords_fr_top3cuisine_done.txt")
        );
        assert_eq!(
            ws.keyword_file("fr", "top3cuisine"),
            PathBuf::from("/work/keywords/fr/top3cuisine.txt")
        );
        assert_eq!(
            ws.prompt_file("script", "fr"),
            PathBuf::from("/work/prompts/script_prompt_fr.txt")
        );
    }
}
