use crate::api::gemini::Gemini;
use crate::assembler::VideoAssembler;
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::content::ContentGenerator;
use crate::error::{PipelineError, pipeline_error};
use crate::init::{self, Workspace};
use crate::keywords::{load_keywords, pending_keywords};
use crate::pipeline::{Orchestrator, ProductionStages, RunOptions};
use crate::schedule::parse_date;
use crate::scraper::AmazonScraper;
use crate::scraper::suggest::base_keywords;
use crate::thumbnail::ThumbnailGenerator;
use crate::uploader::comments::CommentPoster;
use crate::uploader::{UploadCredentials, YoutubeUploader};
use crate::{loge, logi, logok, logw};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exit code of `scrape` when too few qualifying products were found.
pub const EXIT_INSUFFICIENT_PRODUCTS: i32 = 10;

#[derive(Parser, Debug)]
#[command(name = "topn-autovideo")]
#[command(about = "Builds and uploads Top-N Amazon product videos", long_about = None)]
pub struct Cli {
    /// Working directory holding keywords/, credentials/, tokens/ and output/
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every pending keyword of a channel through all stages
    Run {
        language: String,
        channel: String,
        /// First publish date (YYYY-MM-DD); overrides the derived schedule
        #[arg(long)]
        start_date: Option<String>,
        /// Base date the schedule is derived from (YYYY-MM-DD)
        #[arg(long)]
        base_date: Option<String>,
        #[arg(long)]
        max_videos: Option<usize>,
        #[arg(long, default_value_t = 1)]
        num_workers: usize,
        /// Delete all generated state before running
        #[arg(long)]
        reset: bool,
    },
    /// Scrape products for one keyword
    Scrape {
        language: String,
        keyword: Option<String>,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        videos_dir: Option<PathBuf>,
    },
    /// Write titles, scripts and narration for scraped products
    Content {
        language: String,
        #[arg(long)]
        keyword: Option<String>,
        #[arg(long)]
        channel: Option<String>,
        /// Use only this Gemini key
        #[arg(long)]
        api_key: Option<String>,
        /// Skip audio synthesis
        #[arg(long)]
        preview: bool,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        audio_dir: Option<PathBuf>,
    },
    /// Assemble the final video
    Video {
        language: String,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Generate the thumbnail
    Thumbnail {
        language: String,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Upload the final video to the channel
    Upload {
        language: String,
        #[arg(long)]
        channel: String,
        /// RFC 3339 publish time; the video stays private until then
        #[arg(long)]
        publish_at: Option<String>,
        #[arg(long)]
        secrets_path: Option<PathBuf>,
        #[arg(long)]
        token_path: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Post affiliate comments on recent public videos that lack one
    PostComments {
        language: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        secrets_path: Option<PathBuf>,
        #[arg(long)]
        token_path: Option<PathBuf>,
        /// How many recent uploads to check
        #[arg(long, default_value_t = 20)]
        max_videos: usize,
    },
    /// Grow a keyword list with the marketplace's search suggestions
    ExpandKeywords {
        language: String,
        /// Base keywords, one per line
        input: PathBuf,
        /// Defaults to `<input>_expanded.txt`
        #[arg(long)]
        output: Option<PathBuf>,
        /// Seconds between suggestion requests
        #[arg(long, default_value_t = 1.5)]
        delay: f64,
    },
    /// Delete generated output, completion logs and tokens
    Reset,
}

fn credentials(ws: &Workspace, channel: &str, secrets: Option<PathBuf>, token: Option<PathBuf>) -> UploadCredentials {
    let defaults = UploadCredentials::for_channel(ws, channel);
    UploadCredentials {
        secrets: secrets.unwrap_or(defaults.secrets),
        token: token.unwrap_or(defaults.token),
    }
}

/// `keywords.txt` -> `keywords_expanded.txt`, next to the input.
fn expanded_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("keywords");
    input.with_file_name(format!("{}_expanded.txt", stem))
}

async fn expand_keywords(cfg: &Config, input: &Path, output: &Path, delay: f64) -> Result<usize> {
    let text = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Keyword file not found: {}", input.display()))?;
    let base = base_keywords(&text);
    logi(format!("{} base keyword(s) from {}", base.len(), input.display()));

    let scraper = AmazonScraper::new(cfg)?;
    let expanded = scraper
        .expand_keywords(&base, Duration::from_secs_f64(delay.max(0.0)))
        .await;

    let mut body = expanded.join("\n");
    body.push('\n');
    tokio::fs::write(output, body)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    logok(format!(
        "Saved {} keyword(s) ({} new) to {}",
        expanded.len(),
        expanded.len().saturating_sub(base.len()),
        output.display()
    ));
    Ok(expanded.len())
}

/// Explicit keyword, else the channel's first keyword not yet uploaded.
async fn resolve_keyword(ws: &Workspace, language: &str, keyword: Option<String>, channel: Option<&str>) -> Result<String> {
    if let Some(keyword) = keyword.filter(|k| !k.trim().is_empty()) {
        return Ok(keyword.trim().to_string());
    }
    let Some(channel) = channel else {
        anyhow::bail!("pass a keyword or --channel to pick the next pending one");
    };
    let keywords = load_keywords(&ws.keyword_file(language, channel)).await?;
    let store = CheckpointStore::new(ws.done_file(language, channel));
    pending_keywords(keywords, &store, Some(1))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no pending keywords for channel '{}'", channel))
}

async fn run_all(ws: &Workspace, language: &str, channel: &str, opts: RunOptions, reset: bool) -> Result<i32> {
    if reset {
        init::reset_workspace(ws).await?;
    }
    let cfg = Config::for_language(ws.root(), language).await?;
    let orchestrator = Orchestrator::new(ws.clone(), opts, chrono::Utc::now().naive_utc()).await?;
    let key_start = orchestrator.key_start_index(cfg.gemini_keys().len());
    let stages = ProductionStages::new(cfg, ws.clone(), channel, key_start)?;

    let summary = orchestrator.run(&stages).await?;
    Ok(if summary.stopped.is_some() { 1 } else { 0 })
}

async fn scrape(cfg: &Config, keyword: &str, output: &Path, videos: &Path) -> Result<i32> {
    tokio::fs::create_dir_all(output).await?;
    tokio::fs::create_dir_all(videos).await?;
    let scraper = AmazonScraper::new(cfg)?;
    match scraper.scrape(keyword, output, videos).await {
        Ok(path) => {
            logok(format!("Products saved to {}", path.display()));
            Ok(0)
        }
        Err(err) => match pipeline_error(&err) {
            Some(PipelineError::InsufficientProducts { found, target }) => {
                logw(format!("Only {}/{} products with videos for '{}'", found, target, keyword));
                Ok(EXIT_INSUFFICIENT_PRODUCTS)
            }
            _ => Err(err),
        },
    }
}

/// Runs one command and returns the process exit code.
pub async fn execute(cli: Cli) -> Result<i32> {
    let ws = Workspace::new(cli.root);
    init::ensure_directories(&ws).await?;

    match cli.command {
        Commands::Reset => {
            init::reset_workspace(&ws).await?;
            logok("Pipeline state reset");
            Ok(0)
        }
        Commands::Run {
            language,
            channel,
            start_date,
            base_date,
            max_videos,
            num_workers,
            reset,
        } => {
            if !init::check_ffmpeg().await {
                logw("FFmpeg not found in PATH. Please install FFmpeg.");
            }
            let mut opts = RunOptions::new(&language, &channel);
            opts.start_date = start_date.as_deref().map(parse_date).transpose()?;
            opts.base_date = base_date.as_deref().map(parse_date).transpose()?;
            opts.max_videos = max_videos.filter(|n| *n > 0);
            opts.num_workers = num_workers.max(1);
            run_all(&ws, &language, &channel, opts, reset).await
        }
        Commands::Scrape {
            language,
            keyword,
            channel,
            output_dir,
            videos_dir,
        } => {
            let cfg = Config::for_language(ws.root(), &language).await?;
            let keyword = resolve_keyword(&ws, &language, keyword, channel.as_deref()).await?;
            let output = output_dir.unwrap_or_else(|| ws.output_dir());
            let videos = videos_dir.unwrap_or_else(|| ws.videos_dir());
            scrape(&cfg, &keyword, &output, &videos).await
        }
        Commands::Content {
            language,
            keyword,
            channel,
            api_key,
            preview,
            output_dir,
            audio_dir,
        } => {
            let cfg = Config::for_language(ws.root(), &language).await?;
            let keyword = resolve_keyword(&ws, &language, keyword, channel.as_deref()).await?;
            let keys = match api_key {
                Some(key) => vec![key],
                None => cfg.gemini_keys(),
            };
            let gemini = Gemini::from_keys(keys, 0)?;
            let output = output_dir.unwrap_or_else(|| ws.output_dir());
            let audio = audio_dir.unwrap_or_else(|| ws.audio_dir());
            tokio::fs::create_dir_all(&audio).await?;
            let path = ContentGenerator::new(cfg, ws.clone(), gemini)
                .generate(&keyword, &output, &audio, preview)
                .await?;
            logok(format!("Content saved to {}", path.display()));
            Ok(0)
        }
        Commands::Video { language, output_dir } => {
            let cfg = Config::for_language(ws.root(), &language).await?;
            let output = output_dir.unwrap_or_else(|| ws.output_dir());
            let path = VideoAssembler::new(cfg, ws.clone()).assemble(&output).await?;
            logok(format!("Video saved to {}", path.display()));
            Ok(0)
        }
        Commands::Thumbnail { language, output_dir } => {
            let cfg = Config::for_language(ws.root(), &language).await?;
            let gemini = match Gemini::from_keys(cfg.gemini_keys(), 0) {
                Ok(gemini) => Some(gemini),
                Err(err) => {
                    logw(format!("{:#}; using the plain thumbnail", err));
                    None
                }
            };
            let output = output_dir.unwrap_or_else(|| ws.output_dir());
            let path = ThumbnailGenerator::new(cfg, gemini).generate(&output).await?;
            logok(format!("Thumbnail saved to {}", path.display()));
            Ok(0)
        }
        Commands::Upload {
            language,
            channel,
            publish_at,
            secrets_path,
            token_path,
            output_dir,
        } => {
            let cfg = Config::for_language(ws.root(), &language).await?;
            let credentials = credentials(&ws, &channel, secrets_path, token_path);
            let output = output_dir.unwrap_or_else(|| ws.output_dir());
            let uploader = YoutubeUploader::new(cfg, ws.clone(), &channel, credentials);
            match uploader.upload(&output, publish_at).await {
                Ok(id) => {
                    logok(format!("Video id: {}", id));
                    Ok(0)
                }
                Err(err) => {
                    loge(format!("{:#}", err));
                    Ok(1)
                }
            }
        }
        Commands::PostComments {
            language,
            channel,
            secrets_path,
            token_path,
            max_videos,
        } => {
            let cfg = Config::for_language(ws.root(), &language).await?;
            let credentials = credentials(&ws, &channel, secrets_path, token_path);
            CommentPoster::new(cfg, ws.clone(), &channel, credentials)
                .run(max_videos)
                .await?;
            Ok(0)
        }
        Commands::ExpandKeywords {
            language,
            input,
            output,
            delay,
        } => {
            let cfg = Config::for_language(ws.root(), &language).await?;
            let output = output.unwrap_or_else(|| expanded_path(&input));
            expand_keywords(&cfg, &input, &output, delay).await?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags() {
        let cli = Cli::try_parse_from([
            "topn-autovideo",
            "--root",
            "/srv/work",
            "run",
            "de",
            "kanal1",
            "--start-date",
            "2025-10-01",
            "--max-videos",
            "4",
            "--num-workers",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.root, PathBuf::from("/srv/work"));
        match cli.command {
            Commands::Run {
                language,
                channel,
                start_date,
                max_videos,
                num_workers,
                reset,
                ..
            } => {
                assert_eq!(language, "de");
                assert_eq!(channel, "kanal1");
                assert_eq!(start_date.as_deref(), Some("2025-10-01"));
                assert_eq!(max_videos, Some(4));
                assert_eq!(num_workers, 2);
                assert!(!reset);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn stage_commands() {
        let cli = Cli::try_parse_from(["topn-autovideo", "scrape", "en", "wireless mouse"]).unwrap();
        assert_eq!(cli.root, PathBuf::from("."));
        assert!(matches!(cli.command, Commands::Scrape { keyword: Some(ref k), .. } if k == "wireless mouse"));

        let cli = Cli::try_parse_from(["topn-autovideo", "upload", "en", "--channel", "demo"]).unwrap();
        assert!(matches!(cli.command, Commands::Upload { ref channel, publish_at: None, .. } if channel == "demo"));

        assert!(Cli::try_parse_from(["topn-autovideo", "upload", "en"]).is_err());
        assert!(Cli::try_parse_from(["topn-autovideo", "content", "en", "--preview"]).is_ok());
    }

    #[test]
    fn maintenance_commands() {
        let cli = Cli::try_parse_from(["topn-autovideo", "post-comments", "fr", "--channel", "maison"]).unwrap();
        assert!(matches!(cli.command, Commands::PostComments { ref channel, max_videos: 20, .. } if channel == "maison"));
        assert!(Cli::try_parse_from(["topn-autovideo", "post-comments", "fr"]).is_err());

        let cli = Cli::try_parse_from(["topn-autovideo", "expand-keywords", "fr", "keywords/fr/base.txt", "--delay", "2"])
            .unwrap();
        match cli.command {
            Commands::ExpandKeywords { input, output, delay, .. } => {
                assert_eq!(input, PathBuf::from("keywords/fr/base.txt"));
                assert!(output.is_none());
                assert_eq!(delay, 2.0);
                assert_eq!(expanded_path(&input), PathBuf::from("keywords/fr/base_expanded.txt"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn credential_paths_default_per_channel() {
        let ws = Workspace::new("/srv/work");
        let creds = credentials(&ws, "maison", None, Some(PathBuf::from("/tmp/t.json")));
        assert_eq!(creds.secrets, UploadCredentials::for_channel(&ws, "maison").secrets);
        assert_eq!(creds.token, PathBuf::from("/tmp/t.json"));
    }

    #[tokio::test]
    async fn keyword_comes_from_channel_file() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let file = ws.keyword_file("en", "demo");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "usb hub\nwebcam\n").unwrap();
        CheckpointStore::new(ws.done_file("en", "demo"))
            .mark_step_as_done("usb hub", crate::checkpoint::Step::Upload)
            .await
            .unwrap();

        let picked = resolve_keyword(&ws, "en", None, Some("demo")).await.unwrap();
        assert_eq!(picked, "webcam");
        let explicit = resolve_keyword(&ws, "en", Some(" mouse ".to_string()), None).await.unwrap();
        assert_eq!(explicit, "mouse");
        assert!(resolve_keyword(&ws, "en", None, None).await.is_err());
    }
}
