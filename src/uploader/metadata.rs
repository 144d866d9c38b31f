//! Title, description, tags and chapter markers for an upload.

use crate::config::Config;
use crate::content::fill_template;
use crate::logw;
use crate::model::{EnhancedProduct, EnhancedProducts};
use serde_json::{Value, json};

/// Length of the intro before the first product chapter.
pub const INTRO_SECONDS: f64 = 5.0;
/// Used for a product whose segment duration was never recorded.
pub const FALLBACK_SEGMENT_SECONDS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub privacy_status: String,
    pub publish_at: Option<String>,
}

impl VideoMetadata {
    pub fn snippet(&self, description: &str) -> Value {
        json!({
            "title": self.title,
            "description": description,
            "tags": self.tags,
            "categoryId": self.category_id,
        })
    }

    /// Body of the `videos.insert` call. A publish time forces the video
    /// private until then.
    pub fn insert_body(&self) -> Value {
        let mut status = json!({
            "privacyStatus": self.privacy_status,
            "selfDeclaredMadeForKids": false,
        });
        if let Some(at) = &self.publish_at {
            status["privacyStatus"] = json!("private");
            status["publishAt"] = json!(at);
        }
        json!({ "snippet": self.snippet(&self.description), "status": status })
    }

    pub fn update_body(&self, video_id: &str, description: &str) -> Value {
        json!({ "id": video_id, "snippet": self.snippet(description) })
    }
}

/// Capitalizes the first letter of every word and lowercases the rest.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut start = true;
    for c in text.chars() {
        if c.is_alphabetic() {
            if start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            start = false;
        } else {
            out.push(c);
            start = true;
        }
    }
    out
}

pub fn affiliate_link(cfg: &Config, product: &EnhancedProduct) -> String {
    let p = &product.product;
    if !p.asin.is_empty() && !cfg.amazon_tag.is_empty() {
        format!("{}/dp/{}/?tag={}", cfg.marketplace_base(), p.asin, cfg.amazon_tag)
    } else {
        p.url.clone()
    }
}

fn ascending(data: &EnhancedProducts) -> Vec<&EnhancedProduct> {
    let mut products: Vec<&EnhancedProduct> = data.products.iter().collect();
    products.sort_by_key(|p| p.position);
    products
}

pub fn build_metadata(cfg: &Config, data: &EnhancedProducts, publish_at: Option<String>) -> VideoMetadata {
    let keyword = data.keyword.as_str();
    let count = data.products.len().to_string();
    let title = fill_template(
        &cfg.youtube.title,
        &[("product_count", count.as_str()), ("keyword", title_case(keyword).as_str())],
    );

    let mut lines = vec![format!("{}\n", fill_template(&cfg.youtube.description_lead_in, &[("keyword", keyword)]))];
    for product in ascending(data) {
        let position = product.position.to_string();
        let link = affiliate_link(cfg, product);
        lines.push(fill_template(
            &cfg.youtube.product_line,
            &[
                ("position", position.as_str()),
                ("price", product.product.price.as_str()),
                ("link", link.as_str()),
            ],
        ));
    }
    lines.push(format!("\n\n{}", cfg.youtube.disclaimer));

    VideoMetadata {
        title,
        description: lines.join("\n"),
        tags: vec![
            keyword.to_string(),
            format!("best {}", keyword),
            format!("top {}", keyword),
            "review".to_string(),
            "test".to_string(),
        ],
        category_id: cfg.youtube.category_id.clone(),
        privacy_status: cfg.youtube.privacy_status.clone(),
        publish_at,
    }
}

/// `MM:SS`, minutes not wrapped at the hour.
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Chapter block appended to the description after upload. Products are
/// listed from #1 upward with cumulative segment durations.
pub fn chapters_block(intro_chapter: &str, data: &EnhancedProducts) -> String {
    let mut lines = vec![
        "\n\nTIMESTAMPS:".to_string(),
        format!("00:00 - {}", intro_chapter),
    ];
    let mut elapsed = INTRO_SECONDS;

    for product in ascending(data) {
        lines.push(format!(
            "{} - N°{}: {}",
            format_timestamp(elapsed),
            product.position,
            product.short_title
        ));
        match product.segment_duration.filter(|d| *d > 0.0) {
            Some(d) => elapsed += d,
            None => {
                logw(format!(
                    "segment_duration missing for product {}, assuming {}s",
                    product.position, FALLBACK_SEGMENT_SECONDS
                ));
                elapsed += FALLBACK_SEGMENT_SECONDS;
            }
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;

    fn data() -> EnhancedProducts {
        EnhancedProducts {
            keyword: "wireless mouse".to_string(),
            products: vec![
                fixtures::enhanced(3, "Alpha", Some(40.2)),
                fixtures::enhanced(2, "Beta", Some(35.9)),
                fixtures::enhanced(1, "Gamma", None),
            ],
        }
    }

    #[test]
    fn title_and_description() {
        let mut cfg = Config::default();
        cfg.amazon_tag = "mytag-20".to_string();
        let meta = build_metadata(&cfg, &data(), None);

        assert_eq!(meta.title, "Top 3 Best Wireless Mouse in 2025");
        let lines: Vec<&str> = meta.description.lines().collect();
        assert_eq!(lines[0], "👇 Find the best wireless mouse tested in this video 👇");
        assert_eq!(lines[2], "N°1: ($59.99) 👉 https://www.amazon.com/dp/B000000001/?tag=mytag-20");
        assert_eq!(lines[4], "N°3: ($59.99) 👉 https://www.amazon.com/dp/B000000003/?tag=mytag-20");
        assert!(meta.description.ends_with("Thank you for the support!"));
        assert_eq!(meta.tags[1], "best wireless mouse");
    }

    #[test]
    fn missing_tag_uses_product_url() {
        let mut cfg = Config::default();
        cfg.amazon_tag.clear();
        let data = data();
        assert_eq!(affiliate_link(&cfg, &data.products[0]), data.products[0].product.url);
    }

    #[test]
    fn scheduled_upload_is_private() {
        let meta = build_metadata(&Config::default(), &data(), Some("2025-09-12T00:00:00Z".to_string()));
        let body = meta.insert_body();
        assert_eq!(body["status"]["privacyStatus"], "private");
        assert_eq!(body["status"]["publishAt"], "2025-09-12T00:00:00Z");
        assert_eq!(body["snippet"]["categoryId"], "22");

        let public = build_metadata(&Config::default(), &data(), None).insert_body();
        assert_eq!(public["status"]["privacyStatus"], "public");
        assert!(public["status"].get("publishAt").is_none());
    }

    #[test]
    fn chapters_accumulate_durations() {
        let block = chapters_block("Intro", &data());
        assert_eq!(
            block,
            "\n\nTIMESTAMPS:\n00:00 - Intro\n00:05 - N°1: Gamma\n00:35 - N°2: Beta\n01:10 - N°3: Alpha"
        );
    }

    #[test]
    fn word_title_case() {
        assert_eq!(title_case("souris SANS fil"), "Souris Sans Fil");
        assert_eq!(title_case("usb-c hub"), "Usb-C Hub");
        assert_eq!(format_timestamp(3725.9), "62:05");
    }
}
