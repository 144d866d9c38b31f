//! Per-keyword state machine over the checkpoint log.
//!
//! Each keyword resumes after its last recorded step. A stage failure stops
//! that keyword without advancing its record; too few products skips it; an
//! upload failure or exhausted API quota stops the whole run.

use crate::api::gemini::Gemini;
use crate::assembler::VideoAssembler;
use crate::checkpoint::{CheckpointStore, Step};
use crate::config::Config;
use crate::content::ContentGenerator;
use crate::error::{StageOutcome, is_fatal};
use crate::init::Workspace;
use crate::keywords::{KeywordTask, keyword_tasks, load_keywords, pending_keywords};
use crate::schedule::{PublishSchedule, default_base, format_publish_at, next_publish_slot};
use crate::scraper::AmazonScraper;
use crate::session::SessionDirs;
use crate::thumbnail::ThumbnailGenerator;
use crate::uploader::{UploadCredentials, YoutubeUploader};
use crate::{loge, logi, logok, logw};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};

/// Uploads per Gemini key before the starting key moves on.
const UPLOADS_PER_KEY: usize = 5;

/// The four checkpointed stages of one keyword.
#[async_trait]
pub trait PipelineStages: Send + Sync {
    /// Scrapes products and writes narration scripts and audio.
    async fn scrape_and_content(&self, keyword: &str, dirs: &SessionDirs) -> Result<()>;
    async fn video(&self, keyword: &str, dirs: &SessionDirs) -> Result<()>;
    async fn thumbnail(&self, keyword: &str, dirs: &SessionDirs) -> Result<()>;
    async fn upload(&self, keyword: &str, dirs: &SessionDirs, publish_at: &str) -> Result<()>;
}

/// Stages backed by Amazon, Gemini, ffmpeg and the YouTube API.
pub struct ProductionStages {
    cfg: Config,
    ws: Workspace,
    channel: String,
    gemini: Gemini,
}

impl ProductionStages {
    pub fn new(cfg: Config, ws: Workspace, channel: &str, key_start: usize) -> Result<Self> {
        let gemini = Gemini::from_keys(cfg.gemini_keys(), key_start)?;
        Ok(Self {
            cfg,
            ws,
            channel: channel.to_string(),
            gemini,
        })
    }
}

#[async_trait]
impl PipelineStages for ProductionStages {
    async fn scrape_and_content(&self, keyword: &str, dirs: &SessionDirs) -> Result<()> {
        logi(format!("[1-2/5] Scraping and writing content for '{}'", keyword));
        let scraper = AmazonScraper::new(&self.cfg)?;
        scraper.scrape(keyword, &dirs.output, &dirs.videos).await?;

        let content = ContentGenerator::new(self.cfg.clone(), self.ws.clone(), self.gemini.clone());
        content.generate(keyword, &dirs.output, &dirs.audio, false).await?;
        Ok(())
    }

    async fn video(&self, keyword: &str, dirs: &SessionDirs) -> Result<()> {
        logi(format!("[3/5] Assembling video for '{}'", keyword));
        VideoAssembler::new(self.cfg.clone(), self.ws.clone())
            .assemble(&dirs.output)
            .await?;
        Ok(())
    }

    async fn thumbnail(&self, keyword: &str, dirs: &SessionDirs) -> Result<()> {
        logi(format!("[4/5] Generating thumbnail for '{}'", keyword));
        ThumbnailGenerator::new(self.cfg.clone(), Some(self.gemini.clone()))
            .generate(&dirs.output)
            .await?;
        Ok(())
    }

    async fn upload(&self, keyword: &str, dirs: &SessionDirs, publish_at: &str) -> Result<()> {
        logi(format!("[5/5] Uploading '{}' for channel '{}'", keyword, self.channel));
        let uploader = YoutubeUploader::new(
            self.cfg.clone(),
            self.ws.clone(),
            &self.channel,
            UploadCredentials::for_channel(&self.ws, &self.channel),
        );
        uploader.upload(&dirs.output, Some(publish_at.to_string())).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub language: String,
    pub channel: String,
    /// Fixed first publish time; otherwise derived from the upload history.
    pub start_date: Option<NaiveDateTime>,
    pub base_date: Option<NaiveDateTime>,
    pub max_videos: Option<usize>,
    pub num_workers: usize,
}

impl RunOptions {
    pub fn new(language: &str, channel: &str) -> Self {
        Self {
            language: language.to_string(),
            channel: channel.to_string(),
            start_date: None,
            base_date: None,
            max_videos: None,
            num_workers: 1,
        }
    }
}

#[derive(Debug)]
enum KeywordOutcome {
    Uploaded,
    Insufficient,
    Failed,
    Fatal(String),
    NotStarted,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Set when the run stopped early; holds the reason.
    pub stopped: Option<String>,
}

pub struct Orchestrator {
    ws: Workspace,
    opts: RunOptions,
    store: CheckpointStore,
    prior_uploads: usize,
    schedule: PublishSchedule,
    stop: AtomicBool,
}

impl Orchestrator {
    /// Checks the channel's credentials and fixes the publish schedule from
    /// the uploads already recorded in the checkpoint log.
    pub async fn new(ws: Workspace, opts: RunOptions, now: NaiveDateTime) -> Result<Self> {
        let secrets = ws.credentials_file(&opts.channel);
        if !secrets.exists() {
            anyhow::bail!(
                "Credential file not found for channel '{}': expected {}",
                opts.channel,
                secrets.display()
            );
        }
        logi(format!("Found credentials for '{}': {}", opts.channel, secrets.display()));

        let store = CheckpointStore::new(ws.done_file(&opts.language, &opts.channel));
        let prior_uploads = store.count_at_step(Step::Upload).await?;

        let start = match opts.start_date {
            Some(start) => {
                logi(format!("Using provided start date: {}", start.format("%Y-%m-%d %H:%M")));
                start
            }
            None => {
                let base = opts.base_date.unwrap_or_else(default_base);
                let start = next_publish_slot(base, prior_uploads, now);
                logi(format!(
                    "Continuing schedule after {} upload(s): {}",
                    prior_uploads,
                    start.format("%Y-%m-%d %H:%M")
                ));
                start
            }
        };

        Ok(Self {
            ws,
            opts,
            store,
            prior_uploads,
            schedule: PublishSchedule::new(start),
            stop: AtomicBool::new(false),
        })
    }

    pub fn prior_uploads(&self) -> usize {
        self.prior_uploads
    }

    /// Index of the Gemini key this run starts with.
    pub fn key_start_index(&self, key_count: usize) -> usize {
        if key_count == 0 {
            0
        } else {
            (self.prior_uploads / UPLOADS_PER_KEY) % key_count
        }
    }

    pub fn schedule(&self) -> &PublishSchedule {
        &self.schedule
    }

    pub async fn run<S: PipelineStages + ?Sized>(&self, stages: &S) -> Result<RunSummary> {
        let keyword_file = self.ws.keyword_file(&self.opts.language, &self.opts.channel);
        let all = load_keywords(&keyword_file).await?;
        let total = all.len();

        let tasks = keyword_tasks(&self.opts.language, &self.opts.channel, all);
        let tasks = pending_keywords(tasks, &self.store, self.opts.max_videos).await?;
        logi(format!(
            "Processing {} of {} keyword(s) for channel '{}' ({})",
            tasks.len(),
            total,
            self.opts.channel,
            self.opts.language
        ));

        let workers = self.opts.num_workers.max(1);
        let count = tasks.len();
        let outcomes: Vec<KeywordOutcome> = stream::iter(tasks.into_iter().enumerate())
            .map(|(i, task)| async move {
                logi(format!("=== Keyword {}/{}: '{}' ({}) ===", i + 1, count, task.keyword, task.channel));
                self.process_keyword(stages, &task, workers > 1).await
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for outcome in outcomes {
            match outcome {
                KeywordOutcome::Uploaded => summary.uploaded += 1,
                KeywordOutcome::Insufficient => summary.skipped += 1,
                KeywordOutcome::Failed => summary.failed += 1,
                KeywordOutcome::Fatal(reason) => {
                    summary.failed += 1;
                    summary.stopped.get_or_insert(reason);
                }
                KeywordOutcome::NotStarted => {}
            }
        }

        logi(format!(
            "Run finished: {} uploaded, {} skipped, {} failed",
            summary.uploaded, summary.skipped, summary.failed
        ));
        if let Some(reason) = &summary.stopped {
            loge(format!("Pipeline stopped early: {}", reason));
        }
        Ok(summary)
    }

    async fn process_keyword<S: PipelineStages + ?Sized>(
        &self,
        stages: &S,
        task: &KeywordTask,
        isolated: bool,
    ) -> KeywordOutcome {
        let keyword = task.keyword.as_str();
        if self.stop.load(Ordering::SeqCst) {
            return KeywordOutcome::NotStarted;
        }

        let dirs = if isolated {
            SessionDirs::isolated(&self.ws, keyword)
        } else {
            SessionDirs::shared(&self.ws)
        };
        if dirs.is_isolated() {
            logi(format!("'{}' works in {}", keyword, dirs.output.display()));
        }

        match self.run_steps(stages, keyword, &dirs).await {
            Ok(outcome) => outcome,
            Err(err) => {
                loge(format!("'{}' failed: {:#}", keyword, err));
                KeywordOutcome::Failed
            }
        }
    }

    async fn run_steps<S: PipelineStages + ?Sized>(
        &self,
        stages: &S,
        keyword: &str,
        dirs: &SessionDirs,
    ) -> Result<KeywordOutcome> {
        let last = self.store.get_last_completed_step(keyword).await?;
        match last {
            None => {
                logi("Wiping previous run data");
                dirs.prepare().await?;
            }
            Some(step) => {
                logi(format!("Resuming '{}' after {}", keyword, step));
                dirs.ensure().await?;
            }
        }

        for step in Step::remaining_after(last) {
            let result = match step {
                Step::Content => stages.scrape_and_content(keyword, dirs).await,
                Step::Video => stages.video(keyword, dirs).await,
                Step::Thumbnail => stages.thumbnail(keyword, dirs).await,
                Step::Upload => {
                    let publish_at = format_publish_at(self.schedule.claim());
                    logi(format!("Publishing '{}' at {}", keyword, publish_at));
                    stages.upload(keyword, dirs, &publish_at).await
                }
            };

            match StageOutcome::from_result(result) {
                StageOutcome::Success(()) => {
                    self.store.mark_step_as_done(keyword, step).await?;
                    logok(format!("'{}': {} done", keyword, step));
                }
                StageOutcome::InsufficientData { found, target } => {
                    logw(format!(
                        "Not enough products with videos for '{}' ({}/{}); skipping keyword",
                        keyword, found, target
                    ));
                    return Ok(KeywordOutcome::Insufficient);
                }
                StageOutcome::HardFailure(err) => {
                    if is_fatal(&err) {
                        self.stop.store(true, Ordering::SeqCst);
                        loge(format!("'{}' failed at {}: {:#}", keyword, step, err));
                        return Ok(KeywordOutcome::Fatal(format!("{:#}", err)));
                    }
                    loge(format!(
                        "'{}' failed at {}: {:#}; will resume from here next run",
                        keyword, step, err
                    ));
                    return Ok(KeywordOutcome::Failed);
                }
            }
        }

        dirs.cleanup().await;
        logok(format!("Processed and scheduled '{}'", keyword));
        Ok(KeywordOutcome::Uploaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeStages {
        calls: Mutex<Vec<String>>,
        insufficient: Vec<&'static str>,
        video_fails: Vec<&'static str>,
        upload_fails: Vec<&'static str>,
    }

    impl FakeStages {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PipelineStages for FakeStages {
        async fn scrape_and_content(&self, keyword: &str, _dirs: &SessionDirs) -> Result<()> {
            self.record(format!("content:{keyword}"));
            if self.insufficient.contains(&keyword) {
                return Err(PipelineError::InsufficientProducts { found: 1, target: 3 }.into());
            }
            Ok(())
        }

        async fn video(&self, keyword: &str, dirs: &SessionDirs) -> Result<()> {
            self.record(format!("video:{keyword}"));
            if self.video_fails.contains(&keyword) {
                anyhow::bail!("ffmpeg exited with 1");
            }
            std::fs::write(dirs.output.join("final.mp4"), b"video")?;
            Ok(())
        }

        async fn thumbnail(&self, keyword: &str, dirs: &SessionDirs) -> Result<()> {
            let kept = dirs.output.join("final.mp4").exists();
            self.record(format!("thumbnail:{keyword}:{kept}"));
            Ok(())
        }

        async fn upload(&self, keyword: &str, _dirs: &SessionDirs, publish_at: &str) -> Result<()> {
            self.record(format!("upload:{keyword}@{publish_at}"));
            if self.upload_fails.contains(&keyword) {
                return Err(PipelineError::UploadFailed("quotaExceeded".to_string()).into());
            }
            Ok(())
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 9, 20)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn workspace(dir: &TempDir, keywords: &str) -> Workspace {
        let ws = Workspace::new(dir.path());
        let kw = ws.keyword_file("en", "demo");
        std::fs::create_dir_all(kw.parent().unwrap()).unwrap();
        std::fs::write(kw, keywords).unwrap();
        let secrets = ws.credentials_file("demo");
        std::fs::create_dir_all(secrets.parent().unwrap()).unwrap();
        std::fs::write(secrets, "{}").unwrap();
        ws
    }

    fn options() -> RunOptions {
        let mut opts = RunOptions::new("en", "demo");
        opts.start_date = Some(
            NaiveDate::from_ymd_opt(2025, 10, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        );
        opts
    }

    fn store(ws: &Workspace) -> CheckpointStore {
        CheckpointStore::new(ws.done_file("en", "demo"))
    }

    #[tokio::test]
    async fn insufficient_products_leave_log_unchanged() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "wireless mouse\n");
        let stages = FakeStages {
            insufficient: vec!["wireless mouse"],
            ..Default::default()
        };

        let orch = Orchestrator::new(ws.clone(), options(), now()).await.unwrap();
        let summary = orch.run(&stages).await.unwrap();

        assert_eq!(stages.calls(), vec!["content:wireless mouse"]);
        assert_eq!(summary.skipped, 1);
        assert!(summary.stopped.is_none());
        assert_eq!(store(&ws).get_last_completed_step("wireless mouse").await.unwrap(), None);
    }

    #[tokio::test]
    async fn resumes_after_recorded_video_step() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "wireless mouse\n");
        store(&ws).mark_step_as_done("wireless mouse", Step::Video).await.unwrap();
        std::fs::create_dir_all(ws.output_dir()).unwrap();
        std::fs::write(ws.output_dir().join("final.mp4"), b"video").unwrap();

        let stages = FakeStages::default();
        let orch = Orchestrator::new(ws.clone(), options(), now()).await.unwrap();
        let summary = orch.run(&stages).await.unwrap();

        assert_eq!(
            stages.calls(),
            vec![
                "thumbnail:wireless mouse:true",
                "upload:wireless mouse@2025-10-01T00:00:00Z",
            ]
        );
        assert_eq!(summary.uploaded, 1);
        assert_eq!(
            store(&ws).get_last_completed_step("wireless mouse").await.unwrap(),
            Some(Step::Upload)
        );
        assert!(!ws.output_dir().exists());
    }

    #[tokio::test]
    async fn upload_failure_stops_the_run() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "usb hub\nwebcam\n");
        let stages = FakeStages {
            upload_fails: vec!["usb hub"],
            ..Default::default()
        };

        let orch = Orchestrator::new(ws.clone(), options(), now()).await.unwrap();
        let summary = orch.run(&stages).await.unwrap();

        assert!(summary.stopped.is_some());
        assert!(stages.calls().iter().all(|c| !c.contains("webcam")));
        let store = store(&ws);
        assert_eq!(store.get_last_completed_step("usb hub").await.unwrap(), Some(Step::Thumbnail));
        assert_eq!(store.get_last_completed_step("webcam").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stage_failure_moves_to_next_keyword() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "usb hub\nwebcam\nusb hub\n");
        let stages = FakeStages {
            video_fails: vec!["usb hub"],
            ..Default::default()
        };

        let orch = Orchestrator::new(ws.clone(), options(), now()).await.unwrap();
        let summary = orch.run(&stages).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.uploaded, 1);
        assert!(summary.stopped.is_none());
        assert_eq!(stages.calls().iter().filter(|c| c.starts_with("content:usb hub")).count(), 1);
        assert_eq!(
            store(&ws).get_last_completed_step("usb hub").await.unwrap(),
            Some(Step::Content)
        );
        assert!(stages.calls().contains(&"upload:webcam@2025-10-01T00:00:00Z".to_string()));
    }

    #[tokio::test]
    async fn publish_slots_follow_upload_order() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "a\nb\nc\n");
        let mut opts = options();
        opts.max_videos = Some(2);

        let stages = FakeStages::default();
        let orch = Orchestrator::new(ws, opts, now()).await.unwrap();
        orch.run(&stages).await.unwrap();

        let uploads: Vec<String> = stages.calls().into_iter().filter(|c| c.starts_with("upload:")).collect();
        assert_eq!(uploads, vec!["upload:a@2025-10-01T00:00:00Z", "upload:b@2025-10-01T12:00:00Z"]);
        assert_eq!(orch.schedule().claimed(), 2);
    }

    #[tokio::test]
    async fn concurrent_workers_use_isolated_dirs() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "a\nb\nc\n");
        let mut opts = options();
        opts.num_workers = 3;

        let stages = FakeStages::default();
        let orch = Orchestrator::new(ws.clone(), opts, now()).await.unwrap();
        let summary = orch.run(&stages).await.unwrap();

        assert_eq!(summary.uploaded, 3);
        assert_eq!(store(&ws).count_at_step(Step::Upload).await.unwrap(), 3);
        assert!(!ws.output_dir().join("sessions").join("a").exists());
    }

    #[tokio::test]
    async fn history_drives_schedule_and_key_index() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "z\n");
        let store = store(&ws);
        for i in 0..6 {
            store.mark_step_as_done(&format!("old {i}"), Step::Upload).await.unwrap();
        }

        let mut opts = options();
        opts.start_date = None;
        let orch = Orchestrator::new(ws, opts, now()).await.unwrap();
        assert_eq!(orch.prior_uploads(), 6);
        assert_eq!(orch.key_start_index(4), 1);
        assert_eq!(orch.key_start_index(1), 0);
        assert_eq!(orch.schedule().start(), next_publish_slot(default_base(), 6, now()));
    }

    #[tokio::test]
    async fn missing_credentials_abort_before_any_work() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let err = Orchestrator::new(ws, options(), now()).await.err().unwrap();
        assert!(err.to_string().contains("demo.json"));
    }

    #[tokio::test]
    async fn missing_keyword_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "");
        std::fs::remove_file(ws.keyword_file("en", "demo")).unwrap();
        let orch = Orchestrator::new(ws, options(), now()).await.unwrap();
        assert!(orch.run(&FakeStages::default()).await.is_err());
    }
}
