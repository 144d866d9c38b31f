use crate::checkpoint::{CheckpointStore, Step};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;

/// A search term queued for one channel. Identity is the (channel, keyword)
/// pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeywordTask {
    pub language: String,
    pub channel: String,
    pub keyword: String,
}

impl AsRef<str> for KeywordTask {
    fn as_ref(&self) -> &str {
        &self.keyword
    }
}

/// Tasks for one channel in file order. Repeated keywords are queued once.
pub fn keyword_tasks(language: &str, channel: &str, keywords: Vec<String>) -> Vec<KeywordTask> {
    let mut seen = HashSet::new();
    keywords
        .into_iter()
        .map(|keyword| KeywordTask {
            language: language.to_string(),
            channel: channel.to_string(),
            keyword,
        })
        .filter(|task| seen.insert(task.clone()))
        .collect()
}

/// One keyword per line; blank lines and surrounding whitespace are ignored.
pub fn parse_keywords(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn load_keywords(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("Keyword file not found: {}", path.display()))?;
    Ok(parse_keywords(&text))
}

/// Keywords not yet uploaded, in file order, optionally capped at `max`.
pub async fn pending_keywords<K: AsRef<str>>(
    keywords: Vec<K>,
    store: &CheckpointStore,
    max: Option<usize>,
) -> Result<Vec<K>> {
    let mut pending = Vec::new();
    for keyword in keywords {
        if store.get_last_completed_step(keyword.as_ref()).await? == Some(Step::Upload) {
            continue;
        }
        pending.push(keyword);
        if max.is_some_and(|m| pending.len() >= m) {
            break;
        }
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn blank_lines_are_skipped() {
        let text = "wireless mouse\n\n  usb hub  \n\r\n";
        assert_eq!(parse_keywords(text), vec!["wireless mouse", "usb hub"]);
    }

    #[tokio::test]
    async fn uploaded_keywords_are_not_pending() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("done.txt"));
        store.mark_step_as_done("usb hub", Step::Upload).await.unwrap();
        store.mark_step_as_done("keyboard", Step::Video).await.unwrap();

        let all = vec![
            "usb hub".to_string(),
            "keyboard".to_string(),
            "webcam".to_string(),
            "monitor".to_string(),
        ];
        let pending = pending_keywords(all.clone(), &store, None).await.unwrap();
        assert_eq!(pending, vec!["keyboard", "webcam", "monitor"]);

        let capped = pending_keywords(all, &store, Some(2)).await.unwrap();
        assert_eq!(capped, vec!["keyboard", "webcam"]);
    }

    #[tokio::test]
    async fn repeated_keywords_queue_once() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("done.txt"));
        store.mark_step_as_done("usb hub", Step::Upload).await.unwrap();

        let text = "webcam\nusb hub\nwebcam\nmonitor\n";
        let tasks = keyword_tasks("de", "kanal1", parse_keywords(text));
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.language == "de" && t.channel == "kanal1"));

        let pending = pending_keywords(tasks, &store, None).await.unwrap();
        let names: Vec<&str> = pending.iter().map(AsRef::as_ref).collect();
        assert_eq!(names, vec!["webcam", "monitor"]);
    }

    #[tokio::test]
    async fn missing_keyword_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(load_keywords(&dir.path().join("en/demo.txt")).await.is_err());
    }
}
