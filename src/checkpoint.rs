//! Per-channel step-completion log.
//!
//! One `keyword:step` line per keyword. Every update rewrites the whole file
//! through a temp file in the same directory, so readers only ever see the old
//! or the new contents, and an in-process lock serializes concurrent writers.

use anyhow::{Context, Result};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tokio::sync::Mutex;

/// Pipeline steps that leave a record, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    Content,
    Video,
    Thumbnail,
    Upload,
}

impl Step {
    pub const ALL: [Step; 4] = [Step::Content, Step::Video, Step::Thumbnail, Step::Upload];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Content => "step2_content",
            Step::Video => "step3_video",
            Step::Thumbnail => "step4_thumbnail",
            Step::Upload => "step5_upload",
        }
    }

    /// Steps still to run after `last` was completed.
    pub fn remaining_after(last: Option<Step>) -> impl Iterator<Item = Step> {
        Step::ALL
            .into_iter()
            .filter(move |step| last.is_none_or(|done| *step > done))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("unknown pipeline step: {}", s))
    }
}

fn split_record(line: &str) -> Option<(&str, &str)> {
    let (keyword, step) = line.rsplit_once(':')?;
    Some((keyword.trim(), step.trim()))
}

pub struct CheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_log(&self) -> Result<String> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to read completion log: {}", self.path.display())),
        }
    }

    pub async fn get_last_completed_step(&self, keyword: &str) -> Result<Option<Step>> {
        let text = self.read_log().await?;
        let keyword = keyword.trim();

        for line in text.lines() {
            if let Some((kw, step)) = split_record(line) {
                if kw == keyword {
                    return Ok(step.parse().ok());
                }
            }
        }
        Ok(None)
    }

    pub async fn mark_step_as_done(&self, keyword: &str, step: Step) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let keyword = keyword.trim();
        let text = self.read_log().await?;
        let record = format!("{}:{}", keyword, step.as_str());

        let mut lines: Vec<String> = Vec::new();
        let mut replaced = false;
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match split_record(line) {
                Some((kw, _)) if kw == keyword => {
                    if !replaced {
                        lines.push(record.clone());
                        replaced = true;
                    }
                }
                _ => lines.push(line.to_string()),
            }
        }
        if !replaced {
            lines.push(record);
        }

        let mut body = lines.join("\n");
        body.push('\n');
        self.replace_contents(body).await
    }

    /// Number of keywords whose last completed step is `step`.
    pub async fn count_at_step(&self, step: Step) -> Result<usize> {
        let text = self.read_log().await?;
        Ok(text
            .lines()
            .filter_map(split_record)
            .filter(|(_, s)| *s == step.as_str())
            .count())
    }

    async fn replace_contents(&self, body: String) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create dir {}", dir.display()))?;

            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(body.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path)
                .with_context(|| format!("Failed to replace {}", path.display()))?;
            Ok(())
        })
        .await
        .context("completion log writer panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path().join("done").join("keywords_en_demo_done.txt"))
    }

    #[tokio::test]
    async fn missing_log_means_no_step() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.get_last_completed_step("wireless mouse").await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_marked_step_wins() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        for step in Step::ALL {
            store.mark_step_as_done("wireless mouse", step).await.unwrap();
            assert_eq!(
                store.get_last_completed_step("wireless mouse").await.unwrap(),
                Some(step)
            );
        }

        store.mark_step_as_done("wireless mouse", Step::Upload).await.unwrap();
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(text, "wireless mouse:step5_upload\n");
    }

    #[tokio::test]
    async fn one_line_per_keyword() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.mark_step_as_done("mouse", Step::Content).await.unwrap();
        store.mark_step_as_done("wireless mouse", Step::Content).await.unwrap();
        store.mark_step_as_done("mouse", Step::Video).await.unwrap();
        store.mark_step_as_done("wireless mouse", Step::Thumbnail).await.unwrap();
        store.mark_step_as_done("mouse", Step::Video).await.unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["mouse:step3_video", "wireless mouse:step4_thumbnail"]);

        // a keyword that is a prefix of another must not match it
        assert_eq!(
            store.get_last_completed_step("mouse").await.unwrap(),
            Some(Step::Video)
        );
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .mark_step_as_done(&format!("keyword {i}"), Step::Content)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.count_at_step(Step::Content).await.unwrap(), 16);
    }

    #[tokio::test]
    async fn counts_uploads_only() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.mark_step_as_done("a", Step::Upload).await.unwrap();
        store.mark_step_as_done("b", Step::Video).await.unwrap();
        store.mark_step_as_done("c", Step::Upload).await.unwrap();
        assert_eq!(store.count_at_step(Step::Upload).await.unwrap(), 2);
    }

    #[test]
    fn remaining_steps_follow_the_last_record() {
        let rest: Vec<Step> = Step::remaining_after(Some(Step::Video)).collect();
        assert_eq!(rest, vec![Step::Thumbnail, Step::Upload]);
        assert_eq!(Step::remaining_after(None).count(), 4);
        assert_eq!(Step::remaining_after(Some(Step::Upload)).count(), 0);
        assert_eq!("step3_video".parse::<Step>().unwrap(), Step::Video);
    }
}
