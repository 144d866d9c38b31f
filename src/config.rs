use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Settings for one content language, read from `config/<lang>.json`.
/// Every field has a default so a missing or partial file still works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_tld")]
    pub amazon_tld: String,
    #[serde(default = "default_tag")]
    pub amazon_tag: String,
    #[serde(default = "default_products_per_keyword")]
    pub products_per_keyword: usize,
    #[serde(default)]
    pub scraper: ScraperSettings,
    #[serde(default)]
    pub gemini: GeminiSettings,
    #[serde(default)]
    pub video: VideoSettings,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub youtube: YoutubeTemplates,
    /// Channel name -> anti-detect browser profile holding the proxy settings.
    #[serde(default)]
    pub channel_profiles: HashMap<String, String>,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_tld() -> String {
    "com".to_string()
}

fn default_tag() -> String {
    "topnauto-20".to_string()
}

fn default_products_per_keyword() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperSettings {
    pub max_pages: u32,
    pub min_rating: f32,
    pub min_price: u32,
    pub max_video_seconds: u32,
    pub long_video_seconds: u32,
    pub detail_workers: usize,
    pub download_workers: usize,
    pub request_timeout_secs: u64,
    pub user_agents: Vec<String>,
}

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            max_pages: 5,
            min_rating: 4.0,
            min_price: 50,
            max_video_seconds: 120,
            long_video_seconds: 25,
            detail_workers: 5,
            download_workers: 2,
            request_timeout_secs: 15,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    pub api_keys: Vec<String>,
    pub text_model: String,
    pub outro_model: String,
    pub tts_model: String,
    pub image_model: String,
    pub tts_prompt: String,
    /// Product position ("3", "2", "1") or "default" -> prebuilt voice name.
    pub voices: HashMap<String, String>,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        let voices = [("3", "Sulafat"), ("2", "Alnilam"), ("1", "Sulafat"), ("default", "Sulafat")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            api_keys: Vec::new(),
            text_model: "gemini-2.5-flash".to_string(),
            outro_model: "gemini-2.5-pro".to_string(),
            tts_model: "gemini-2.5-flash-preview-tts".to_string(),
            image_model: "gemini-2.5-flash-image-preview".to_string(),
            tts_prompt: "Say the following text in a natural, clear, and engaging way.".to_string(),
            voices,
        }
    }
}

impl GeminiSettings {
    pub fn voice_for(&self, position: u32) -> &str {
        self.voices
            .get(&position.to_string())
            .or_else(|| self.voices.get("default"))
            .map(String::as_str)
            .unwrap_or("Sulafat")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub background_music: PathBuf,
    pub background_volume: f32,
    pub transition_clip: PathBuf,
    pub encoder: String,
    pub preset: String,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            background_music: PathBuf::from("thumbnail/bgmusic.mp3"),
            background_volume: 0.05,
            transition_clip: PathBuf::from("thumbnail/swoosh_fixed.mp3"),
            encoder: "libx264".to_string(),
            preset: "ultrafast".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Labels {
    pub display_title: String,
    pub spoken_name: String,
    pub about_this_item: String,
    /// Opening banner; `{count}` and `{KEYWORD}` are filled in.
    pub intro_banner: String,
    pub cta_banner: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            display_title: "DISPLAY TITLE:".to_string(),
            spoken_name: "SPOKEN NAME:".to_string(),
            about_this_item: "About this item".to_string(),
            intro_banner: "TOP {count} {KEYWORD}".to_string(),
            cta_banner: "LINK BELOW FOR THE BEST PRICE".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YoutubeTemplates {
    pub title: String,
    pub description_lead_in: String,
    pub product_line: String,
    pub disclaimer: String,
    pub intro_chapter: String,
    pub category_id: String,
    pub privacy_status: String,
    /// Opening of the affiliate comment posted under public videos.
    pub pinned_comment: String,
}

impl Default for YoutubeTemplates {
    fn default() -> Self {
        Self {
            title: "Top {product_count} Best {keyword} in 2025".to_string(),
            description_lead_in: "👇 Find the best {keyword} tested in this video 👇".to_string(),
            product_line: "N°{position}: ({price}) 👉 {link}".to_string(),
            disclaimer: "Disclaimer: This video and description contain affiliate links, which means that if you click on one of the product links, I'll receive a small commission. This helps support the channel and allows us to continue to make videos like this. Thank you for the support!".to_string(),
            intro_chapter: "Intro".to_string(),
            category_id: "22".to_string(),
            privacy_status: "public".to_string(),
            pinned_comment: "👇 Find the best {keyword} tested in this video 👇\n\n".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            language: default_language(),
            amazon_tld: default_tld(),
            amazon_tag: default_tag(),
            products_per_keyword: default_products_per_keyword(),
            scraper: ScraperSettings::default(),
            gemini: GeminiSettings::default(),
            video: VideoSettings::default(),
            labels: Labels::default(),
            youtube: YoutubeTemplates::default(),
            channel_profiles: HashMap::new(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config: {}", path.as_ref().display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `config/<language>.json` under `root`, falling back to built-in
    /// defaults when the file does not exist.
    pub async fn for_language(root: &Path, language: &str) -> Result<Self> {
        let path = root.join("config").join(format!("{}.json", language));
        let mut config = if fs::try_exists(&path).await.unwrap_or(false) {
            Config::load(&path).await?
        } else {
            Config::default()
        };
        config.language = language.to_string();

        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() && !config.gemini.api_keys.contains(&key) {
                config.gemini.api_keys.insert(0, key);
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.amazon_tld.trim().is_empty() {
            anyhow::bail!("config: amazon_tld missing");
        }
        if self.products_per_keyword == 0 {
            anyhow::bail!("config: products_per_keyword must be at least 1");
        }
        if self.scraper.detail_workers == 0 || self.scraper.download_workers == 0 {
            anyhow::bail!("config: scraper worker counts must be at least 1");
        }
        Ok(())
    }

    /// Configured Gemini keys minus empty entries and `YOUR_..._HERE` placeholders.
    pub fn gemini_keys(&self) -> Vec<String> {
        self.gemini
            .api_keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty() && !k.contains("YOUR"))
            .map(str::to_string)
            .collect()
    }

    pub fn marketplace_base(&self) -> String {
        format!("https://www.amazon.{}", self.amazon_tld)
    }
}
