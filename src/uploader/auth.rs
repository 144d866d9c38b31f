use crate::config::Config;
use crate::init::Workspace;
use crate::{logi, logok};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const EXPIRY_MARGIN_SECS: i64 = 60;

/// OAuth client registration from `credentials/<channel>.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    pub token_uri: String,
}

#[derive(Deserialize)]
struct SecretsBlock {
    client_id: String,
    client_secret: String,
    token_uri: Option<String>,
}

#[derive(Deserialize)]
struct SecretsFile {
    installed: Option<SecretsBlock>,
    web: Option<SecretsBlock>,
}

pub fn parse_client_secrets(text: &str) -> Result<ClientSecrets> {
    let file: SecretsFile = serde_json::from_str(text).context("invalid client secrets JSON")?;
    let Some(block) = file.installed.or(file.web) else {
        anyhow::bail!("client secrets have neither an 'installed' nor a 'web' block");
    };
    Ok(ClientSecrets {
        client_id: block.client_id,
        client_secret: block.client_secret,
        token_uri: block.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
    })
}

/// Stored user token. Accepts both `expires_at` (unix seconds) and the
/// `token`/`expiry` names written by Google's Python tooling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
}

impl StoredToken {
    fn expires_at(&self) -> Option<i64> {
        self.expires_at.or_else(|| {
            let raw = self.expiry.as_deref()?;
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.timestamp())
                .ok()
                .or_else(|| {
                    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|t| t.and_utc().timestamp())
                })
        })
    }

    /// Unknown expiry counts as expired when a refresh token exists.
    pub fn needs_refresh(&self, now: i64) -> bool {
        match self.expires_at() {
            Some(at) => at - EXPIRY_MARGIN_SECS <= now,
            None => self.refresh_token.is_some() || self.access_token.is_empty(),
        }
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
}

async fn refresh(client: &Client, secrets: &ClientSecrets, token: &mut StoredToken) -> Result<()> {
    let Some(refresh_token) = token.refresh_token.clone() else {
        anyhow::bail!("token expired and has no refresh_token; re-authorize the channel");
    };

    logi("Refreshing YouTube access token");
    let resp = client
        .post(&secrets.token_uri)
        .form(&[
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .context("token refresh request failed")?;

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("token refresh HTTP {}: {}", status.as_u16(), text);
    }
    let fresh: RefreshResponse = serde_json::from_str(&text).context("invalid token refresh response")?;

    token.access_token = fresh.access_token;
    token.expires_at = Some(Utc::now().timestamp() + fresh.expires_in.unwrap_or(3600));
    token.expiry = None;
    Ok(())
}

/// A valid access token for the channel, refreshing and saving the stored
/// token when it is about to expire.
pub async fn access_token(client: &Client, secrets_path: &Path, token_path: &Path) -> Result<String> {
    let secrets_text = tokio::fs::read_to_string(secrets_path)
        .await
        .with_context(|| format!("Client secrets not found: {}", secrets_path.display()))?;
    let secrets = parse_client_secrets(&secrets_text)?;

    let token_text = tokio::fs::read_to_string(token_path).await.with_context(|| {
        format!(
            "No stored token at {}; authorize the channel first",
            token_path.display()
        )
    })?;
    let mut token: StoredToken = serde_json::from_str(&token_text)
        .with_context(|| format!("Invalid token file {}", token_path.display()))?;

    if token.needs_refresh(Utc::now().timestamp()) {
        refresh(client, &secrets, &mut token).await?;
        tokio::fs::write(token_path, serde_json::to_string_pretty(&token)?)
            .await
            .with_context(|| format!("Failed to save token {}", token_path.display()))?;
        logok("Access token refreshed");
    }
    Ok(token.access_token)
}

/// HTTP proxy from an anti-detect browser profile.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxySettings {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize)]
struct ProfileFile {
    proxy_config: Option<ProxySettings>,
}

pub fn parse_profile_proxy(text: &str) -> Result<Option<ProxySettings>> {
    let profile: ProfileFile = serde_json::from_str(text).context("invalid browser profile JSON")?;
    Ok(profile.proxy_config.filter(|p| !p.host.trim().is_empty() && p.port != 0))
}

/// Proxy mapped to `channel`, if the channel has a profile with one.
pub async fn channel_proxy(ws: &Workspace, cfg: &Config, channel: &str) -> Result<Option<ProxySettings>> {
    let Some(profile) = cfg.channel_profiles.get(channel) else {
        return Ok(None);
    };
    let path = ws.browser_profile_config(profile);
    if !path.exists() {
        return Ok(None);
    }
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_profile_proxy(&text)
}

pub fn build_client(proxy: Option<&ProxySettings>) -> Result<Client> {
    let mut builder = Client::builder();
    if let Some(p) = proxy {
        logi(format!("Routing YouTube API calls through proxy {}:{}", p.host, p.port));
        let mut proxy = reqwest::Proxy::all(p.url())?;
        if let Some(user) = &p.username {
            proxy = proxy.basic_auth(user, p.password.as_deref().unwrap_or_default());
        }
        builder = builder.proxy(proxy);
    }
    builder.build().context("Failed to build YouTube HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn installed_and_web_secrets() {
        let installed = r#"{"installed": {"client_id": "id1", "client_secret": "s1"}}"#;
        let parsed = parse_client_secrets(installed).unwrap();
        assert_eq!(parsed.client_id, "id1");
        assert_eq!(parsed.token_uri, DEFAULT_TOKEN_URI);

        let web = r#"{"web": {"client_id": "id2", "client_secret": "s2", "token_uri": "https://example.test/token"}}"#;
        assert_eq!(parse_client_secrets(web).unwrap().token_uri, "https://example.test/token");
        assert!(parse_client_secrets("{}").is_err());
    }

    #[test]
    fn token_expiry() {
        let token: StoredToken =
            serde_json::from_str(r#"{"access_token": "a", "refresh_token": "r", "expires_at": 1000}"#).unwrap();
        assert!(!token.needs_refresh(900));
        assert!(token.needs_refresh(950));

        let google: StoredToken =
            serde_json::from_str(r#"{"token": "a", "refresh_token": "r", "expiry": "2025-09-11T12:00:00.123456Z"}"#)
                .unwrap();
        assert_eq!(google.access_token, "a");
        let noon = chrono::NaiveDate::from_ymd_opt(2025, 9, 11)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        assert!(!google.needs_refresh(noon - 3600));
        assert!(google.needs_refresh(noon));

        let unknown: StoredToken = serde_json::from_str(r#"{"access_token": "a", "refresh_token": "r"}"#).unwrap();
        assert!(unknown.needs_refresh(0));
    }

    #[test]
    fn profile_proxy() {
        let text = r#"{"proxy_config": {"host": "10.0.0.2", "port": 5959, "username": "u", "password": "p"}, "target_country": "USA"}"#;
        let proxy = parse_profile_proxy(text).unwrap().unwrap();
        assert_eq!(proxy.url(), "http://10.0.0.2:5959");
        assert_eq!(proxy.username.as_deref(), Some("u"));

        assert!(parse_profile_proxy(r#"{"proxy_config": null}"#).unwrap().is_none());
        assert!(build_client(Some(&proxy)).is_ok());
    }

    #[tokio::test]
    async fn unmapped_channel_has_no_proxy() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let mut cfg = Config::default();
        assert!(channel_proxy(&ws, &cfg, "demo").await.unwrap().is_none());

        cfg.channel_profiles.insert("demo".to_string(), "profile_a".to_string());
        let path = ws.browser_profile_config("profile_a");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"proxy_config": {"host": "h", "port": 8080}}"#).unwrap();
        let proxy = channel_proxy(&ws, &cfg, "demo").await.unwrap().unwrap();
        assert_eq!(proxy.url(), "http://h:8080");
    }

    #[tokio::test]
    async fn missing_token_names_the_path() {
        let dir = TempDir::new().unwrap();
        let secrets = dir.path().join("demo.json");
        std::fs::write(&secrets, r#"{"installed": {"client_id": "i", "client_secret": "s"}}"#).unwrap();
        let token = dir.path().join("token_demo.json");

        let err = access_token(&Client::new(), &secrets, &token).await.unwrap_err();
        assert!(format!("{:#}", err).contains("token_demo.json"));
    }

    #[tokio::test]
    async fn fresh_token_is_used_as_is() {
        let dir = TempDir::new().unwrap();
        let secrets = dir.path().join("demo.json");
        std::fs::write(&secrets, r#"{"installed": {"client_id": "i", "client_secret": "s"}}"#).unwrap();
        let token = dir.path().join("token_demo.json");
        let later = Utc::now().timestamp() + 3600;
        std::fs::write(&token, format!(r#"{{"access_token": "live", "refresh_token": "r", "expires_at": {later}}}"#)).unwrap();

        assert_eq!(access_token(&Client::new(), &secrets, &token).await.unwrap(), "live");
    }
}
