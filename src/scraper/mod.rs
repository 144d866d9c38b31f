pub mod extract;
pub mod selection;
pub mod suggest;

use crate::config::Config;
use crate::error::PipelineError;
use crate::ffmpeg::{ffmpeg_hls_to_mp4, ffprobe_video_dimensions};
use crate::model::{DownloadedFile, MediaKind, PRODUCTS_FILE, Product, VideoDescriptor, parse_price};
use crate::{logi, logok, logw};
use anyhow::{Context, Result};
use backon::{ExponentialBuilder, Retryable};
use extract::SearchHit;
use futures::StreamExt;
use rand::Rng;
use rand::seq::SliceRandom;
use reqwest::{Client, StatusCode, header};
use selection::{SeenVideoIds, classify_aspect, select_videos};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SUGGESTION_TIMEOUT_SECS: u64 = 5;
const SEARCH_RETRIES: usize = 5;
const DETAIL_RETRIES: usize = 3;

/// Marketplace scraper for one keyword run. Requests are paced with random
/// delays and rotate user agents.
pub struct AmazonScraper {
    client: Client,
    cfg: Config,
    base_url: String,
}

/// What the detail stage kept for a product before an index is assigned.
struct ProductDetails {
    hit: SearchHit,
    rating: f32,
    videos: Vec<VideoDescriptor>,
    image_url: String,
    description: Vec<String>,
    brand: Option<String>,
}

impl AmazonScraper {
    pub fn new(cfg: &Config) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            header::HeaderValue::from_str(&accept_language(&cfg.language))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .gzip(true)
            .timeout(Duration::from_secs(cfg.scraper.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: cfg.marketplace_base(),
            cfg: cfg.clone(),
        })
    }

    fn user_agent(&self) -> String {
        self.cfg
            .scraper
            .user_agents
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| "Mozilla/5.0".to_string())
    }

    async fn pause(min_secs: f64, max_secs: f64) {
        let secs = rand::thread_rng().gen_range(min_secs..max_secs);
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    async fn fetch_once(&self, url: &str) -> Result<reqwest::Response> {
        Self::pause(2.0, 4.0).await;
        let resp = self
            .client
            .get(url)
            .header(header::USER_AGENT, self.user_agent())
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;

        if !resp.status().is_success() {
            return Err(PipelineError::Http {
                status: resp.status().as_u16(),
                url: url.to_string(),
            }
            .into());
        }
        Ok(resp)
    }

    /// Fetches a page, backing off on CAPTCHA pages and throttling.
    async fn fetch_page(&self, url: &str, retries: usize) -> Result<String> {
        (|| async {
            let body = self.fetch_once(url).await?.text().await?;
            if extract::is_captcha(&body) {
                return Err(anyhow::Error::from(PipelineError::Captcha(url.to_string())));
            }
            Ok::<_, anyhow::Error>(body)
        })
        .retry(fetch_backoff(retries))
        .when(is_transient)
        .adjust(|err: &anyhow::Error, dur: Option<Duration>| dur.map(|d| d.max(retry_pause(err))))
        .notify(|err: &anyhow::Error, dur: Duration| {
            logw(format!("Request failed, retrying after {:.1}s: {:#}", dur.as_secs_f64(), err));
        })
        .await
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        (|| async { Ok::<_, anyhow::Error>(self.fetch_once(url).await?.bytes().await?.to_vec()) })
            .retry(fetch_backoff(DETAIL_RETRIES))
            .when(is_transient)
            .await
    }

    /// Search-box suggestions for `keyword` on this marketplace.
    pub async fn suggestions(&self, keyword: &str) -> Result<Vec<String>> {
        let Some(mkt) = suggest::marketplace_id(&self.cfg.amazon_tld) else {
            anyhow::bail!("no suggestion marketplace for amazon.{}", self.cfg.amazon_tld);
        };
        let url = format!("{}/s/suggestion", self.base_url);
        let mkt = mkt.to_string();
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("k", keyword),
                ("alias", "aps"),
                ("c", "1"),
                ("mkt", mkt.as_str()),
                ("s", suggest::SUGGESTION_SOURCES),
                ("x", "17"),
            ])
            .header(header::USER_AGENT, self.user_agent())
            .timeout(Duration::from_secs(SUGGESTION_TIMEOUT_SECS))
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;

        if !resp.status().is_success() {
            return Err(PipelineError::Http {
                status: resp.status().as_u16(),
                url,
            }
            .into());
        }
        suggest::parse_suggestions(&resp.text().await?)
    }

    /// Base keywords plus every suggestion found for them, sorted. Keywords
    /// whose lookup fails contribute nothing.
    pub async fn expand_keywords(&self, base: &[String], delay: Duration) -> Vec<String> {
        let mut found = Vec::new();
        for (i, keyword) in base.iter().enumerate() {
            logi(format!("({}/{}) Expanding '{}'", i + 1, base.len(), keyword));
            match self.suggestions(keyword).await {
                Ok(list) => {
                    logi(format!("  {} suggestion(s)", list.len()));
                    found.extend(list);
                }
                Err(err) => logw(format!("No suggestions for '{}': {:#}", keyword, err)),
            }
            let base_secs = delay.as_secs_f64();
            Self::pause(base_secs, base_secs + 0.5).await;
        }
        suggest::merge_keywords(base, found)
    }

    /// Listings on one results page that pass the rating threshold.
    pub async fn search_products(&self, keyword: &str, page: u32) -> Result<Vec<SearchHit>> {
        let url = extract::search_url(&self.base_url, keyword, page, self.cfg.scraper.min_price);
        logi(format!("Searching page {}: {}", page, url));

        let html = self.fetch_page(&url, SEARCH_RETRIES).await?;
        let hits = extract::parse_search_results(&html, &self.base_url)?;
        let total = hits.len();

        let kept: Vec<SearchHit> = hits
            .into_iter()
            .filter(|hit| hit.rating.unwrap_or(0.0) >= self.cfg.scraper.min_rating)
            .collect();
        logi(format!("Page {}: {} listings, {} rated {}+", page, total, kept.len(), self.cfg.scraper.min_rating));
        Ok(kept)
    }

    /// Landscape-screened video candidates. Probe failures keep the video.
    async fn screen_videos(&self, candidates: Vec<VideoDescriptor>) -> Vec<VideoDescriptor> {
        let mut accepted = Vec::new();
        for video in candidates {
            match ffprobe_video_dimensions(&video.url).await {
                Ok((w, h)) => {
                    let verdict = classify_aspect(w, h);
                    if verdict.is_accepted() {
                        accepted.push(video);
                    } else {
                        logi(format!("Skipping video {} ({}x{}, {:?})", video.id, w, h, verdict));
                    }
                }
                Err(err) => {
                    logw(format!("Could not probe video {}: {:#}. Keeping it.", video.id, err));
                    accepted.push(video);
                }
            }
        }
        accepted
    }

    async fn product_details(&self, hit: SearchHit, seen: SeenVideoIds) -> Option<ProductDetails> {
        let page = match self.fetch_page(&hit.url, DETAIL_RETRIES).await {
            Ok(page) => page,
            Err(err) => {
                logw(format!("Skipping {}: {:#}", hit.asin, err));
                return None;
            }
        };

        let candidates = extract::extract_video_candidates(&page, self.cfg.scraper.max_video_seconds)
            .unwrap_or_default();
        if candidates.is_empty() {
            logi(format!("No usable videos for {}", hit.asin));
            return None;
        }

        let screened = self.screen_videos(candidates).await;
        let videos = select_videos(screened, self.cfg.scraper.long_video_seconds);
        if videos.is_empty() {
            logi(format!("Video selection rejected {}", hit.asin));
            return None;
        }

        if let Err(dup) = seen.try_claim(videos.iter().map(|v| v.id.as_str())) {
            logi(format!("Video {} already used, skipping {}", dup, hit.asin));
            return None;
        }

        let image_url = extract::extract_image_url(&page)
            .ok()
            .flatten()
            .unwrap_or_else(|| hit.image_url.clone());

        Some(ProductDetails {
            rating: hit.rating.unwrap_or(0.0),
            videos,
            image_url,
            description: extract::extract_description(&page, &self.cfg.labels.about_this_item),
            brand: extract::extract_brand(&page),
            hit,
        })
    }

    /// Collects up to `target` products for `keyword`, walking results pages
    /// until enough are accepted or the page limit is reached.
    pub async fn collect_products(&self, keyword: &str, target: usize) -> Result<Vec<Product>> {
        let seen = SeenVideoIds::new();
        let mut products: Vec<Product> = Vec::new();
        let mut page = 1;

        while products.len() < target && page <= self.cfg.scraper.max_pages {
            let hits = match self.search_products(keyword, page).await {
                Ok(hits) => hits,
                Err(err) => {
                    logw(format!("Search page {} failed: {:#}", page, err));
                    Vec::new()
                }
            };
            if hits.is_empty() {
                logw(format!("No qualifying listings on page {}", page));
            }

            let mut details = futures::stream::iter(hits)
                .map(|hit| self.product_details(hit, seen.clone()))
                .buffer_unordered(self.cfg.scraper.detail_workers);

            while let Some(found) = details.next().await {
                let Some(d) = found else { continue };
                let index = products.len() + 1;
                logok(format!("Product {}/{} accepted: {}", index, target, d.hit.title));
                products.push(into_product(index, d));
                if products.len() >= target {
                    break;
                }
            }
            page += 1;
        }

        Ok(products)
    }

    async fn download_media(&self, mut product: Product, videos_dir: &Path) -> Product {
        let dir = videos_dir.join(format!(
            "{}_{}",
            product.index,
            extract::safe_dir_name(&product.title)
        ));
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            logw(format!("Cannot create {}: {}", dir.display(), err));
            return product;
        }

        if !product.image_url.is_empty() {
            let out = dir.join(format!("product_image_{}.jpg", product.index));
            match self.fetch_bytes(&product.image_url).await {
                Ok(bytes) => match tokio::fs::write(&out, bytes).await {
                    Ok(()) => product.downloaded_files.push(DownloadedFile {
                        kind: MediaKind::Image,
                        path: out,
                    }),
                    Err(err) => logw(format!("Cannot write {}: {}", out.display(), err)),
                },
                Err(err) => logw(format!("Image download failed for {}: {:#}", product.asin, err)),
            }
        }

        let ua = self.user_agent();
        for (i, video) in product.videos.clone().iter().enumerate() {
            let out = dir.join(format!("video_{}_{}.mp4", i + 1, video.id));
            let saved = if video.url.contains(".m3u8") {
                ffmpeg_hls_to_mp4(&video.url, &ua, &out).await
            } else {
                match self.fetch_bytes(&video.url).await {
                    Ok(bytes) => tokio::fs::write(&out, bytes)
                        .await
                        .map(|_| out.exists())
                        .map_err(Into::into),
                    Err(err) => Err(err),
                }
            };

            match saved {
                Ok(true) => product.downloaded_files.push(DownloadedFile {
                    kind: MediaKind::Video,
                    path: out,
                }),
                Ok(false) => logw(format!("Video {} produced no file", video.id)),
                Err(err) => logw(format!("Video {} download failed: {:#}", video.id, err)),
            }
        }

        logi(format!(
            "Product {}: {} file(s) downloaded",
            product.index,
            product.downloaded_files.len()
        ));
        product
    }

    pub async fn download_all(&self, products: Vec<Product>, videos_dir: &Path) -> Vec<Product> {
        let mut done: Vec<Product> = futures::stream::iter(products)
            .map(|p| self.download_media(p, videos_dir))
            .buffer_unordered(self.cfg.scraper.download_workers)
            .collect()
            .await;
        done.sort_by_key(|p| p.index);
        done
    }

    /// Full scrape stage: collect, download, and write `product.json` into
    /// `output_dir`. Fails with `InsufficientProducts` when fewer than the
    /// configured count qualify.
    pub async fn scrape(&self, keyword: &str, output_dir: &Path, videos_dir: &Path) -> Result<PathBuf> {
        let target = self.cfg.products_per_keyword;
        logi(format!("Scraping '{}' on {} (target {})", keyword, self.base_url, target));

        let products = self.collect_products(keyword, target).await?;
        if products.len() < target {
            return Err(PipelineError::InsufficientProducts {
                found: products.len(),
                target,
            }
            .into());
        }

        let products = self.download_all(products, videos_dir).await;
        let out = output_dir.join(PRODUCTS_FILE);
        crate::model::save_products(&out, &products).await?;
        logok(format!("Saved {} products to {}", products.len(), out.display()));
        Ok(out)
    }
}

fn into_product(index: usize, d: ProductDetails) -> Product {
    let price_value = parse_price(&d.hit.price);
    Product {
        index,
        title: d.hit.title,
        url: d.hit.url,
        asin: d.hit.asin,
        price: d.hit.price,
        rating: d.rating,
        image_url: d.image_url,
        videos: d.videos,
        description: d.description,
        brand: d.brand,
        conversion_signals: extract::conversion_signals(d.rating, price_value),
        downloaded_files: Vec::new(),
    }
}

fn accept_language(language: &str) -> String {
    match language {
        "en" => "en-US,en;q=0.9".to_string(),
        other => format!("{0},{0};q=0.9,en;q=0.7", other),
    }
}

/// Jittered exponential schedule allowing `attempts` requests in total.
fn fetch_backoff(attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(2))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(attempts.saturating_sub(1))
        .with_jitter()
}

/// Missing pages and refused requests will not change on retry.
fn is_transient(err: &anyhow::Error) -> bool {
    !matches!(
        crate::error::pipeline_error(err),
        Some(PipelineError::Http { status, .. })
            if *status == StatusCode::NOT_FOUND.as_u16() || *status == StatusCode::FORBIDDEN.as_u16()
    )
}

/// Minimum wait after `err`: CAPTCHA pages cool down longest, throttling
/// (503) next, anything else briefly.
fn retry_pause(err: &anyhow::Error) -> Duration {
    let (min, max) = match crate::error::pipeline_error(err) {
        Some(PipelineError::Captcha(_)) => (10.0, 15.0),
        Some(PipelineError::Http { status, .. })
            if *status == StatusCode::SERVICE_UNAVAILABLE.as_u16() =>
        {
            (5.0, 10.0)
        }
        _ => (5.0, 8.0),
    };
    Duration::from_secs_f64(rand::thread_rng().gen_range(min..max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    fn http(status: u16) -> anyhow::Error {
        PipelineError::Http { status, url: "https://www.amazon.com/s".to_string() }.into()
    }

    #[test]
    fn pauses_depend_on_the_failure() {
        for _ in 0..20 {
            let captcha = retry_pause(&PipelineError::Captcha("u".to_string()).into());
            assert!(captcha >= Duration::from_secs(10) && captcha < Duration::from_secs(15));

            let throttled = retry_pause(&http(503).context("search page 2"));
            assert!(throttled >= Duration::from_secs(5) && throttled < Duration::from_secs(10));

            let other = retry_pause(&anyhow::anyhow!("connection reset"));
            assert!(other >= Duration::from_secs(5) && other < Duration::from_secs(8));
        }
    }

    #[test]
    fn missing_pages_are_not_retried() {
        assert!(!is_transient(&http(404)));
        assert!(!is_transient(&http(403)));
        assert!(is_transient(&http(503)));
        assert!(is_transient(&PipelineError::Captcha("u".to_string()).into()));
        assert!(is_transient(&anyhow::anyhow!("timed out")));
    }

    #[test]
    fn attempts_bound_the_schedule() {
        assert_eq!(fetch_backoff(SEARCH_RETRIES).build().count(), 4);
        assert_eq!(fetch_backoff(DETAIL_RETRIES).build().count(), 2);
        assert!(fetch_backoff(DETAIL_RETRIES).build().all(|d| d <= Duration::from_secs(60)));
    }

    #[test]
    fn details_become_indexed_products() {
        let d = ProductDetails {
            hit: SearchHit {
                title: "Logitech MX Master 3S Wireless Mouse".to_string(),
                url: "https://www.amazon.com/dp/B07W6JG6Z7".to_string(),
                asin: "B07W6JG6Z7".to_string(),
                price: "$199.99".to_string(),
                rating: Some(4.7),
                image_url: "https://img/thumb.jpg".to_string(),
            },
            rating: 4.7,
            videos: vec![VideoDescriptor {
                id: "a1".to_string(),
                url: "https://x/a1.m3u8".to_string(),
                duration: 40,
                title: "Review".to_string(),
            }],
            image_url: "https://img/hires.jpg".to_string(),
            description: vec!["Quiet clicks".to_string()],
            brand: Some("Logitech".to_string()),
        };

        let product = into_product(2, d);
        assert_eq!(product.index, 2);
        assert_eq!(product.image_url, "https://img/hires.jpg");
        assert_eq!(product.conversion_signals.authority_signals, vec!["⭐ Amazon's Choice"]);
        assert!(product.conversion_signals.urgency_indicators[1].starts_with("🏆"));
        assert!(product.downloaded_files.is_empty());
    }

    #[test]
    fn accept_language_header() {
        assert_eq!(accept_language("en"), "en-US,en;q=0.9");
        assert_eq!(accept_language("fr"), "fr,fr;q=0.9,en;q=0.7");
    }

    #[test]
    fn scraper_builds_from_defaults() {
        let cfg = Config::default();
        let scraper = AmazonScraper::new(&cfg).unwrap();
        assert_eq!(scraper.base_url, cfg.marketplace_base());
        assert!(scraper.user_agent().starts_with("Mozilla/5.0"));
    }
}
