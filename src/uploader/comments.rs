//! Affiliate comments for published videos. The uploader leaves commenting
//! for later because comments can only be posted once a video is public.

use crate::config::Config;
use crate::content::fill_template;
use crate::init::Workspace;
use crate::uploader::{UploadCredentials, auth};
use crate::{logi, logok, logw};
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const MAX_PAGE_SIZE: usize = 50;
const TOP_COMMENTS: &str = "10";
const DEFAULT_COMMENT_KEYWORD: &str = "products";

fn affiliate_line_re() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    Ok(RE.get_or_try_init(|| Regex::new(r"(?i)(N°\d+|👉).*amazon\.[a-z]+"))?)
}

fn title_keyword_re() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    Ok(RE.get_or_try_init(|| Regex::new(r"(?i)Best\s+(\w+)\s+(?:in\s+)?202\d"))?)
}

/// Product lines of an upload description that carry a marketplace link.
pub fn affiliate_lines(description: &str) -> Result<Vec<String>> {
    let re = affiliate_line_re()?;
    Ok(description
        .lines()
        .filter(|line| re.is_match(line))
        .map(|line| line.trim().to_string())
        .collect())
}

/// Keyword named in a "Top N Best <keyword> 2025" style title.
pub fn title_keyword(title: &str) -> Result<String> {
    Ok(title_keyword_re()?
        .captures(title)
        .map(|c| c[1].to_lowercase())
        .unwrap_or_else(|| DEFAULT_COMMENT_KEYWORD.to_string()))
}

pub fn comment_text(template: &str, title: &str, links: &[String]) -> Result<String> {
    let keyword = title_keyword(title)?;
    let intro = fill_template(template, &[("keyword", keyword.as_str())]);
    Ok(format!("{}{}", intro, links.join("\n")))
}

fn is_affiliate_comment(text: &str) -> bool {
    text.to_lowercase().contains("amazon.") || text.contains("👉")
}

/// Whether a `commentThreads.list` reply holds an affiliate comment written
/// by `channel_id`.
pub fn has_affiliate_comment(threads: &Value, channel_id: &str) -> bool {
    threads["items"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|item| &item["snippet"]["topLevelComment"]["snippet"])
        .filter(|c| c["authorChannelId"]["value"].as_str() == Some(channel_id))
        .any(|c| c["textOriginal"].as_str().is_some_and(is_affiliate_comment))
}

/// A video of the channel's uploads playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelVideo {
    pub id: String,
    pub title: String,
}

fn playlist_videos(items: &Value) -> Vec<ChannelVideo> {
    items["items"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|item| {
            let snippet = &item["snippet"];
            Some(ChannelVideo {
                id: snippet["resourceId"]["videoId"].as_str()?.to_string(),
                title: snippet["title"].as_str().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// What happened to one video during a comment pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentOutcome {
    Posted,
    Skipped,
}

/// Posts the affiliate comment on the channel's recent public videos that
/// do not have one yet.
pub struct CommentPoster {
    cfg: Config,
    ws: Workspace,
    channel: String,
    credentials: UploadCredentials,
}

impl CommentPoster {
    pub fn new(cfg: Config, ws: Workspace, channel: &str, credentials: UploadCredentials) -> Self {
        Self {
            cfg,
            ws,
            channel: channel.to_string(),
            credentials,
        }
    }

    async fn get(client: &Client, token: &str, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let resp = client
            .get(format!("{}/{}", API_BASE, path))
            .query(query)
            .bearer_auth(token)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .with_context(|| format!("{} request failed", path))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("{} HTTP {}: {}", path, status.as_u16(), text);
        }
        serde_json::from_str(&text).with_context(|| format!("invalid {} response", path))
    }

    /// Channel id and uploads playlist of the authorized account.
    async fn own_channel(client: &Client, token: &str) -> Result<(String, String)> {
        let body = Self::get(client, token, "channels", &[("part", "id,contentDetails"), ("mine", "true")]).await?;
        let channel = &body["items"][0];
        let id = channel["id"].as_str().context("no channel for the authorized account")?;
        let uploads = channel["contentDetails"]["relatedPlaylists"]["uploads"]
            .as_str()
            .context("channel has no uploads playlist")?;
        Ok((id.to_string(), uploads.to_string()))
    }

    async fn recent_videos(client: &Client, token: &str, playlist: &str, max: usize) -> Result<Vec<ChannelVideo>> {
        let max = max.clamp(1, MAX_PAGE_SIZE).to_string();
        let body = Self::get(
            client,
            token,
            "playlistItems",
            &[("part", "snippet"), ("playlistId", playlist), ("maxResults", max.as_str())],
        )
        .await?;
        Ok(playlist_videos(&body))
    }

    async fn post_comment(client: &Client, token: &str, video_id: &str, text: &str) -> Result<String> {
        let body = json!({
            "snippet": {
                "videoId": video_id,
                "topLevelComment": { "snippet": { "textOriginal": text } }
            }
        });
        let resp = client
            .post(format!("{}/commentThreads", API_BASE))
            .query(&[("part", "snippet")])
            .bearer_auth(token)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("commentThreads.insert request failed")?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("commentThreads.insert HTTP {}: {}", status.as_u16(), text);
        }
        let posted: Value = serde_json::from_str(&text).context("invalid commentThreads.insert response")?;
        posted["snippet"]["topLevelComment"]["id"]
            .as_str()
            .map(str::to_string)
            .context("posted comment has no id")
    }

    async fn publish_comment(client: &Client, token: &str, comment_id: &str) -> Result<()> {
        let resp = client
            .post(format!("{}/comments/setModerationStatus", API_BASE))
            .query(&[("id", comment_id), ("moderationStatus", "published"), ("banAuthor", "false")])
            .bearer_auth(token)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("comments.setModerationStatus HTTP {}: {}", status.as_u16(), text);
        }
        Ok(())
    }

    async fn process_video(
        &self,
        client: &Client,
        token: &str,
        channel_id: &str,
        video: &ChannelVideo,
    ) -> Result<CommentOutcome> {
        let details = Self::get(client, token, "videos", &[("part", "snippet,status"), ("id", video.id.as_str())]).await?;
        let item = &details["items"][0];
        if item.is_null() {
            anyhow::bail!("video {} not found", video.id);
        }

        let privacy = item["status"]["privacyStatus"].as_str().unwrap_or("unknown");
        if privacy != "public" {
            logi(format!("  Skip: video is {}", privacy));
            return Ok(CommentOutcome::Skipped);
        }

        let threads = Self::get(
            client,
            token,
            "commentThreads",
            &[
                ("part", "snippet"),
                ("videoId", video.id.as_str()),
                ("order", "relevance"),
                ("maxResults", TOP_COMMENTS),
            ],
        )
        .await;
        match threads {
            Ok(threads) if has_affiliate_comment(&threads, channel_id) => {
                logi("  Skip: affiliate comment already present");
                return Ok(CommentOutcome::Skipped);
            }
            Ok(_) => {}
            Err(err) => {
                // Unknown comment state; posting could duplicate.
                logw(format!("  Could not check comments: {:#}", err));
                return Ok(CommentOutcome::Skipped);
            }
        }

        let description = item["snippet"]["description"].as_str().unwrap_or_default();
        let links = affiliate_lines(description)?;
        if links.is_empty() {
            logi("  Skip: no affiliate links in description");
            return Ok(CommentOutcome::Skipped);
        }

        let text = comment_text(&self.cfg.youtube.pinned_comment, &video.title, &links)?;
        let comment_id = Self::post_comment(client, token, &video.id, &text).await?;
        logok(format!("  Posted affiliate comment {}", comment_id));
        match Self::publish_comment(client, token, &comment_id).await {
            Ok(()) => logok(format!("  Comment {} published", comment_id)),
            Err(err) => logw(format!("  Comment posted but not published: {:#}", err)),
        }
        Ok(CommentOutcome::Posted)
    }

    /// Checks the `max_videos` most recent uploads and returns how many
    /// comments were posted.
    pub async fn run(&self, max_videos: usize) -> Result<usize> {
        let proxy = auth::channel_proxy(&self.ws, &self.cfg, &self.channel).await?;
        let client = auth::build_client(proxy.as_ref())?;
        let token = auth::access_token(&client, &self.credentials.secrets, &self.credentials.token).await?;

        let (channel_id, uploads) = Self::own_channel(&client, &token).await?;
        let videos = Self::recent_videos(&client, &token, &uploads, max_videos).await?;
        logi(format!("Checking {} recent video(s) of '{}'", videos.len(), self.channel));

        let mut posted = 0;
        for (i, video) in videos.iter().enumerate() {
            logi(format!("[{}/{}] {}", i + 1, videos.len(), video.title));
            match self.process_video(&client, &token, &channel_id, video).await {
                Ok(CommentOutcome::Posted) => posted += 1,
                Ok(CommentOutcome::Skipped) => {}
                Err(err) => logw(format!("  {}: {:#}", video.id, err)),
            }
        }

        logok(format!("Posted {} affiliate comment(s)", posted));
        Ok(posted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = "👇 Find the best wireless mouse tested in this video 👇\n\n\
        N°1: (89.99$) 👉 https://www.amazon.com/dp/B07W6JG6Z7/?tag=topnauto-20\n\
        N°2: (49.99$) 👉 https://www.amazon.com/dp/B09C13PZX7/?tag=topnauto-20\n\
        \n\nDisclaimer: affiliate links.\n\n00:00 Intro\n00:05 N°2";

    #[test]
    fn description_links_become_comment_lines() {
        let links = affiliate_lines(DESCRIPTION).unwrap();
        assert_eq!(links.len(), 2);
        assert!(links[0].starts_with("N°1: (89.99$)"));
        assert!(affiliate_lines("00:00 Intro\nN°3 soon").unwrap().is_empty());
    }

    #[test]
    fn comment_names_the_title_keyword() {
        let links = vec!["N°1: 👉 https://www.amazon.com/dp/A".to_string()];
        let text = comment_text("Best {keyword} here:\n", "Top 3 Best Blenders in 2025", &links).unwrap();
        assert_eq!(text, "Best blenders here:\nN°1: 👉 https://www.amazon.com/dp/A");
        assert_eq!(title_keyword("My desk setup").unwrap(), "products");
    }

    #[test]
    fn own_affiliate_comment_is_detected() {
        let threads = json!({ "items": [
            { "snippet": { "topLevelComment": { "snippet": {
                "authorChannelId": { "value": "UCviewer" },
                "textOriginal": "great video, bought it on amazon.com"
            }}}},
            { "snippet": { "topLevelComment": { "snippet": {
                "authorChannelId": { "value": "UCmine" },
                "textOriginal": "thanks for watching"
            }}}}
        ]});
        assert!(!has_affiliate_comment(&threads, "UCmine"));

        let threads = json!({ "items": [
            { "snippet": { "topLevelComment": { "snippet": {
                "authorChannelId": { "value": "UCmine" },
                "textOriginal": "N°1 👉 https://www.Amazon.de/dp/X"
            }}}}
        ]});
        assert!(has_affiliate_comment(&threads, "UCmine"));
        assert!(!has_affiliate_comment(&json!({}), "UCmine"));
    }

    #[test]
    fn playlist_items_become_videos() {
        let body = json!({ "items": [
            { "snippet": { "title": "Top 3 Best Webcams 2025", "resourceId": { "videoId": "abc123" } } },
            { "snippet": { "title": "broken" } }
        ]});
        assert_eq!(
            playlist_videos(&body),
            vec![ChannelVideo { id: "abc123".to_string(), title: "Top 3 Best Webcams 2025".to_string() }]
        );
    }
}
