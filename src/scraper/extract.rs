//! Parsing of marketplace pages. Search results are walked as a DOM; product
//! pages are mostly mined with regexes over the embedded JSON blobs.

use crate::model::{ConversionSignals, VideoDescriptor};
use crate::scraper::selection::parse_duration;
use anyhow::Result;
use once_cell::sync::OnceCell;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};

const CAPTCHA_MARKERS: &[&str] = &["validateCaptcha", "Continuer les achats"];
const SPONSORED_MARKERS: &[&str] = &["sponsorisé", "sponsored", "gesponsert"];
const DESCRIPTION_NOISE: &[&str] = &[
    "asin",
    "dimensions",
    "poids",
    "weight",
    "fabricant",
    "manufacturer",
    "numéro du modèle",
    "model number",
];
const MAX_DESCRIPTION_POINTS: usize = 10;
const MIN_TITLE_CHARS: usize = 10;
pub const DEFAULT_VIDEO_TITLE: &str = "Product Video";
pub const PRICE_UNAVAILABLE: &str = "Price not available";

/// A product listing as it appears on a search results page.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub asin: String,
    pub price: String,
    pub rating: Option<f32>,
    pub image_url: String,
}

fn asin_re() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    Ok(RE.get_or_try_init(|| Regex::new(r"/dp/([A-Z0-9]{10})"))?)
}

fn rating_re() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    Ok(RE.get_or_try_init(|| Regex::new(r"(\d+[,.]?\d*)"))?)
}

fn media_id_re() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    Ok(RE.get_or_try_init(|| Regex::new(r#""mediaObjectId":"([a-f0-9]+)""#))?)
}

fn video_array_re() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    Ok(RE.get_or_try_init(|| Regex::new(r#"(?i)"videos":\s*(\[.+?\])"#))?)
}

fn hires_re() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    Ok(RE.get_or_try_init(|| Regex::new(r#""hiRes":"([^"]+)""#))?)
}

fn large_re() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    Ok(RE.get_or_try_init(|| Regex::new(r#""large":"([^"]+)""#))?)
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_ws(&el.text().collect::<String>())
}

fn first_text(el: ElementRef<'_>, css: &str) -> Option<String> {
    let sel = selector(css)?;
    el.select(&sel)
        .map(element_text)
        .find(|text| !text.is_empty())
}

pub fn is_captcha(body: &str) -> bool {
    CAPTCHA_MARKERS.iter().any(|m| body.contains(m))
}

pub fn search_url(base: &str, keyword: &str, page: u32, min_price: u32) -> String {
    format!(
        "{}/s?k={}&page={}&low-price={}&ref=sr_pg_{}",
        base,
        keyword.trim().replace(' ', "+"),
        page,
        min_price,
        page
    )
}

pub fn parse_search_results(html: &str, base_url: &str) -> Result<Vec<SearchHit>> {
    let doc = Html::parse_document(html);

    let mut containers: Vec<ElementRef<'_>> = Vec::new();
    if let Some(sel) = selector(r#"div[data-component-type="s-search-result"]"#) {
        containers.extend(doc.select(&sel));
    }
    if containers.is_empty() {
        if let Some(sel) = selector(r#"div[class*="s-result-item"]"#) {
            containers.extend(doc.select(&sel));
        }
    }

    let mut hits = Vec::new();
    for container in containers {
        if let Some(hit) = parse_search_hit(container, base_url)? {
            hits.push(hit);
        }
    }
    Ok(hits)
}

fn is_sponsored(container: ElementRef<'_>) -> bool {
    let Some(spans) = selector("span") else {
        return false;
    };
    container.select(&spans).any(|span| {
        let text = element_text(span).to_lowercase();
        text.len() < 40 && SPONSORED_MARKERS.iter().any(|m| text.contains(m))
    })
}

fn product_link(container: ElementRef<'_>) -> Option<(String, String)> {
    if let Some(sel) = selector("h2 a[href]") {
        if let Some(link) = container.select(&sel).next() {
            if let Some(href) = link.value().attr("href") {
                return Some((element_text(link), href.to_string()));
            }
        }
    }

    let sel = selector(r#"a[href*="/dp/"]"#)?;
    container.select(&sel).find_map(|link| {
        let text = element_text(link);
        let href = link.value().attr("href")?;
        (!text.is_empty()).then(|| (text, href.to_string()))
    })
}

fn parse_price_text(container: ElementRef<'_>) -> String {
    if let Some(range) = first_text(container, "span.a-price-range") {
        return range;
    }

    if let Some(whole) = first_text(container, "span.a-price-whole") {
        let mut price = whole;
        if let Some(fraction) = first_text(container, "span.a-price-fraction") {
            if !price.ends_with(['.', ',']) {
                price.push('.');
            }
            price.push_str(&fraction);
        }
        if let Some(symbol) = first_text(container, "span.a-price-symbol") {
            price.push_str(&symbol);
        }
        return price;
    }

    first_text(container, "span.a-offscreen").unwrap_or_else(|| PRICE_UNAVAILABLE.to_string())
}

fn parse_search_hit(container: ElementRef<'_>, base_url: &str) -> Result<Option<SearchHit>> {
    if is_sponsored(container) {
        return Ok(None);
    }

    let Some((title, href)) = product_link(container) else {
        return Ok(None);
    };
    if title.chars().count() <= MIN_TITLE_CHARS {
        return Ok(None);
    }

    let url = if href.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), href)
    } else {
        href
    };
    let asin = asin_re()?
        .captures(&url)
        .map(|c| c[1].to_string())
        .unwrap_or_default();

    let rating = match first_text(container, "span.a-icon-alt") {
        Some(text) => rating_re()?
            .captures(&text)
            .and_then(|c| c[1].replace(',', ".").parse::<f32>().ok()),
        None => None,
    };

    let image_url = selector("img.s-image")
        .and_then(|sel| container.select(&sel).next())
        .or_else(|| selector("img").and_then(|sel| container.select(&sel).next()))
        .and_then(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
        .unwrap_or_default()
        .to_string();

    Ok(Some(SearchHit {
        title,
        url,
        asin,
        price: parse_price_text(container),
        rating,
        image_url,
    }))
}

/// Every embedded video with a usable duration, deduplicated by id.
///
/// Two independent sources are mined: flat `mediaObjectId` records and
/// `"videos": [...]` JSON arrays. Aspect ratio is not checked here.
pub fn extract_video_candidates(page: &str, max_seconds: u32) -> Result<Vec<VideoDescriptor>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<VideoDescriptor> = Vec::new();

    let mut ids: Vec<String> = media_id_re()?
        .captures_iter(page)
        .map(|c| c[1].to_string())
        .collect();
    ids.sort();
    ids.dedup();

    for id in ids {
        let field = |name: &str| -> Result<Option<String>> {
            let pattern = format!(
                r#""mediaObjectId":"{}"[^}}]*"{}":"([^"]+)""#,
                regex::escape(&id),
                name
            );
            Ok(Regex::new(&pattern)?.captures(page).map(|c| c[1].to_string()))
        };

        let duration = parse_duration(&field("durationTimestamp")?.unwrap_or_default(), max_seconds);
        if duration == 0 {
            continue;
        }
        let Some(url) = field("url")? else {
            continue;
        };
        let title = field("title")?.unwrap_or_else(|| DEFAULT_VIDEO_TITLE.to_string());

        seen.insert(id.clone());
        out.push(VideoDescriptor {
            id,
            url: url.replace("\\/", "/"),
            duration,
            title,
        });
    }

    for caps in video_array_re()?.captures_iter(page) {
        let Ok(entries) = serde_json::from_str::<Vec<serde_json::Value>>(&caps[1]) else {
            continue;
        };
        for entry in entries {
            let text = |key: &str| entry.get(key).and_then(|v| v.as_str()).map(str::to_string);

            let url = text("url").unwrap_or_default();
            let id = text("mediaObjectId").unwrap_or_else(|| url_video_id(&url));
            if seen.contains(&id) {
                continue;
            }
            let duration = parse_duration(&text("durationTimestamp").unwrap_or_default(), max_seconds);
            if duration == 0 || url.is_empty() {
                continue;
            }

            seen.insert(id.clone());
            out.push(VideoDescriptor {
                id,
                url,
                duration,
                title: text("title").unwrap_or_else(|| DEFAULT_VIDEO_TITLE.to_string()),
            });
        }
    }

    Ok(out)
}

/// Stand-in id for array entries without a `mediaObjectId`. Derived from the
/// stream URL so it stays unique across products.
fn url_video_id(url: &str) -> String {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    format!("url_{:016x}", hasher.finish())
}

pub fn extract_image_url(page: &str) -> Result<Option<String>> {
    let found = hires_re()?
        .captures(page)
        .or(large_re()?.captures(page))
        .map(|c| c[1].replace("\\/", "/"));
    Ok(found)
}

/// Bullet points under the "About this item" heading, noise removed.
pub fn extract_description(html: &str, about_label: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let label = about_label.to_lowercase();

    let mut items: Vec<String> = Vec::new();
    if let Some(headings) = selector("h1, h2, h3") {
        let heading = doc
            .select(&headings)
            .find(|h| element_text(*h).to_lowercase().contains(&label));
        let list = heading.and_then(|h| {
            h.next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "ul")
        });
        if let (Some(list), Some(li)) = (list, selector("li")) {
            items.extend(list.select(&li).map(element_text));
        }
    }

    if items.is_empty() {
        if let Some(sel) = selector("#feature-bullets ul li") {
            items.extend(doc.select(&sel).map(element_text));
        }
    }

    items
        .into_iter()
        .filter(|text| text.chars().count() > 20)
        .filter(|text| {
            let lower = text.to_lowercase();
            !DESCRIPTION_NOISE.iter().any(|noise| lower.contains(noise))
        })
        .take(MAX_DESCRIPTION_POINTS)
        .collect()
}

pub fn extract_brand(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = selector("a#bylineInfo")?;
    doc.select(&sel)
        .map(element_text)
        .find(|text| !text.is_empty())
}

pub fn conversion_signals(rating: f32, price: Option<f64>) -> ConversionSignals {
    let mut signals = ConversionSignals::default();

    if rating >= 4.5 {
        signals.urgency_indicators.push("🔥 Hot seller - order fast!".to_string());
        signals.authority_signals.push("⭐ Amazon's Choice".to_string());
    } else if rating >= 4.0 {
        signals.urgency_indicators.push("📈 Popular choice - selling fast".to_string());
        signals.authority_signals.push("👑 Highly rated by customers".to_string());
    }

    match price {
        Some(p) if p < 50.0 => signals.urgency_indicators.push("💸 Incredible deal under 50".to_string()),
        Some(p) if p > 150.0 => signals.urgency_indicators.push("🏆 Premium quality investment".to_string()),
        _ => {}
    }
    signals
}

/// File-system friendly prefix of a product title.
pub fn safe_dir_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '_')
        .collect();
    collapse_ws(&cleaned)
        .replace(' ', "_")
        .chars()
        .take(30)
        .collect()
}
