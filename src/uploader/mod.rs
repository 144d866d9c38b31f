pub mod auth;
pub mod comments;
pub mod metadata;

use crate::assembler::final_video_path;
use crate::config::Config;
use crate::error::PipelineError;
use crate::init::Workspace;
use crate::model::{ENHANCED_PRODUCTS_FILE, EnhancedProducts};
use crate::thumbnail::find_thumbnail;
use crate::{logi, logok, logw};
use anyhow::{Context, Result};
use metadata::{build_metadata, chapters_block};
use reqwest::{Client, header};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

const UPLOAD_URL: &str = "https://www.googleapis.com/upload/youtube/v3/videos";
const VIDEOS_URL: &str = "https://www.googleapis.com/youtube/v3/videos";
const CHANNELS_URL: &str = "https://www.googleapis.com/youtube/v3/channels";
const THUMBNAIL_URL: &str = "https://www.googleapis.com/upload/youtube/v3/thumbnails/set";
const UPLOAD_TIMEOUT_SECS: u64 = 1800;

/// Where the uploader finds the channel's OAuth material.
#[derive(Debug, Clone)]
pub struct UploadCredentials {
    pub secrets: PathBuf,
    pub token: PathBuf,
}

impl UploadCredentials {
    pub fn for_channel(ws: &Workspace, channel: &str) -> Self {
        Self {
            secrets: ws.credentials_file(channel),
            token: ws.token_file(channel),
        }
    }
}

/// Most recently modified `.mp4` directly inside `dir`.
pub fn latest_video(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|x| x == "mp4"))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.into_path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

pub struct YoutubeUploader {
    cfg: Config,
    ws: Workspace,
    channel: String,
    credentials: UploadCredentials,
}

impl YoutubeUploader {
    pub fn new(cfg: Config, ws: Workspace, channel: &str, credentials: UploadCredentials) -> Self {
        Self {
            cfg,
            ws,
            channel: channel.to_string(),
            credentials,
        }
    }

    async fn client(&self) -> Result<Client> {
        let proxy = auth::channel_proxy(&self.ws, &self.cfg, &self.channel).await?;
        auth::build_client(proxy.as_ref())
    }

    async fn channel_title(&self, client: &Client, token: &str) -> Option<String> {
        let resp = client
            .get(CHANNELS_URL)
            .query(&[("part", "snippet"), ("mine", "true")])
            .bearer_auth(token)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .ok()?;
        let body: Value = resp.json().await.ok()?;
        body["items"][0]["snippet"]["title"].as_str().map(str::to_string)
    }

    async fn insert_video(&self, client: &Client, token: &str, body: &Value, video: &Path) -> Result<String> {
        let bytes = tokio::fs::read(video)
            .await
            .with_context(|| format!("Failed to read {}", video.display()))?;

        let session = client
            .post(UPLOAD_URL)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(token)
            .header("X-Upload-Content-Type", "video/mp4")
            .header("X-Upload-Content-Length", bytes.len().to_string())
            .json(body)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .context("upload session request failed")?;

        let status = session.status();
        if !status.is_success() {
            let text = session.text().await.unwrap_or_default();
            anyhow::bail!("upload session HTTP {}: {}", status.as_u16(), text);
        }
        let Some(location) = session
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            anyhow::bail!("upload session returned no Location header");
        };

        logi(format!("Uploading {} ({} MB)", video.display(), bytes.len() / 1_048_576));
        let resp = client
            .put(&location)
            .bearer_auth(token)
            .header(header::CONTENT_TYPE, "video/mp4")
            .body(bytes)
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .send()
            .await
            .context("video upload request failed")?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("video upload HTTP {}: {}", status.as_u16(), text);
        }
        let uploaded: Value = serde_json::from_str(&text).context("invalid upload response")?;
        uploaded["id"]
            .as_str()
            .map(str::to_string)
            .context("upload response had no video id")
    }

    async fn add_chapters(&self, client: &Client, token: &str, body: &Value) -> Result<()> {
        let resp = client
            .put(VIDEOS_URL)
            .query(&[("part", "snippet")])
            .bearer_auth(token)
            .json(body)
            .timeout(Duration::from_secs(60))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("videos.update HTTP {}: {}", status.as_u16(), text);
        }
        Ok(())
    }

    async fn set_thumbnail(&self, client: &Client, token: &str, video_id: &str, image: &Path) -> Result<()> {
        let bytes = tokio::fs::read(image).await?;
        let resp = client
            .post(THUMBNAIL_URL)
            .query(&[("videoId", video_id)])
            .bearer_auth(token)
            .header(header::CONTENT_TYPE, "image/png")
            .body(bytes)
            .timeout(Duration::from_secs(120))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("thumbnails.set HTTP {}: {}", status.as_u16(), text);
        }
        Ok(())
    }

    async fn upload_inner(&self, output_dir: &Path, publish_at: Option<String>) -> Result<String> {
        let data_path = output_dir.join(ENHANCED_PRODUCTS_FILE);
        if !data_path.exists() {
            return Err(PipelineError::MissingInput(data_path).into());
        }
        let data = EnhancedProducts::load(&data_path).await?;

        let expected = final_video_path(output_dir, &data.keyword);
        let video = if expected.exists() {
            expected
        } else {
            latest_video(output_dir).ok_or_else(|| PipelineError::MissingInput(expected.clone()))?
        };

        let client = self.client().await?;
        let token = auth::access_token(&client, &self.credentials.secrets, &self.credentials.token).await?;
        if let Some(title) = self.channel_title(&client, &token).await {
            logok(format!("Authenticated as YouTube channel '{}'", title));
        }

        if let Some(at) = &publish_at {
            logi(format!("Scheduled: private until {}", at));
        }
        let meta = build_metadata(&self.cfg, &data, publish_at);
        let video_id = self.insert_video(&client, &token, &meta.insert_body(), &video).await?;
        logok(format!("Uploaded '{}': https://www.youtube.com/watch?v={}", meta.title, video_id));

        let described = format!("{}{}", meta.description, chapters_block(&self.cfg.youtube.intro_chapter, &data));
        match self.add_chapters(&client, &token, &meta.update_body(&video_id, &described)).await {
            Ok(()) => logok("Chapters added to description"),
            Err(err) => logw(format!("Could not add chapters: {:#}", err)),
        }

        match find_thumbnail(output_dir, &data.keyword) {
            Some(thumb) => match self.set_thumbnail(&client, &token, &video_id, &thumb).await {
                Ok(()) => logok("Custom thumbnail set"),
                Err(err) => logw(format!("Could not set thumbnail: {:#}", err)),
            },
            None => logw(format!("No thumbnail found for '{}'", data.keyword)),
        }

        Ok(video_id)
    }

    /// Uploads the keyword's final video from `output_dir`. Any failure up
    /// to and including the video upload is an `UploadFailed` error.
    pub async fn upload(&self, output_dir: &Path, publish_at: Option<String>) -> Result<String> {
        self.upload_inner(output_dir, publish_at)
            .await
            .map_err(|err| PipelineError::UploadFailed(format!("{:#}", err)).into())
    }
}
