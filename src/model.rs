use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

pub const PRODUCTS_FILE: &str = "product.json";
pub const ENHANCED_PRODUCTS_FILE: &str = "enhanced_product.json";

/// An embedded product video found on a listing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDescriptor {
    pub id: String,
    pub url: String,
    /// Whole seconds; 0 when the page gave nothing usable.
    pub duration: u32,
    pub title: String,
}

/// Marketing hints derived from rating and price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionSignals {
    #[serde(default)]
    pub urgency_indicators: Vec<String>,
    #[serde(default)]
    pub authority_signals: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub kind: MediaKind,
    pub path: PathBuf,
}

/// One accepted listing, as written by the scraper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Order of acceptance during the scrape, starting at 1.
    pub index: usize,
    pub title: String,
    pub url: String,
    pub asin: String,
    pub price: String,
    pub rating: f32,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub videos: Vec<VideoDescriptor>,
    #[serde(default)]
    pub description: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default)]
    pub conversion_signals: ConversionSignals,
    #[serde(default)]
    pub downloaded_files: Vec<DownloadedFile>,
}

impl Product {
    pub fn video_files(&self) -> Vec<&Path> {
        self.files_of(MediaKind::Video)
    }

    pub fn image_file(&self) -> Option<&Path> {
        self.files_of(MediaKind::Image).into_iter().next()
    }

    fn files_of(&self, kind: MediaKind) -> Vec<&Path> {
        self.downloaded_files
            .iter()
            .filter(|f| f.kind == kind)
            .map(|f| f.path.as_path())
            .collect()
    }

    /// Numeric price, tolerant of currency symbols and `1.299,00` style
    /// decimal commas. Ranges use their lower bound.
    pub fn price_value(&self) -> Option<f64> {
        parse_price(&self.price)
    }
}

pub fn parse_price(text: &str) -> Option<f64> {
    let first = text.split(['-', '–']).next()?;
    let digits: String = first
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if digits.is_empty() {
        return None;
    }

    let normalized = match (digits.rfind('.'), digits.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => digits.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => digits.replace(',', ""),
        (None, Some(comma)) if digits.len() - comma - 1 == 2 => digits.replace(',', "."),
        (None, Some(_)) => digits.replace(',', ""),
        _ => digits,
    };
    normalized.parse().ok()
}

/// A product after the content stage, plus the assembler's segment length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedProduct {
    #[serde(flatten)]
    pub product: Product,
    /// Countdown rank; the first product scraped gets the highest number.
    pub position: u32,
    pub short_title: String,
    pub spoken_name: String,
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_audio_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedProducts {
    pub keyword: String,
    pub products: Vec<EnhancedProduct>,
}

impl EnhancedProducts {
    pub async fn load(path: &Path) -> Result<Self> {
        read_json(path).await
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self).await
    }

    /// Products in countdown order (#3, #2, #1).
    pub fn countdown(&self) -> Vec<&EnhancedProduct> {
        let mut products: Vec<&EnhancedProduct> = self.products.iter().collect();
        products.sort_by(|a, b| b.position.cmp(&a.position));
        products
    }

    pub fn by_position(&self, position: u32) -> Option<&EnhancedProduct> {
        self.products.iter().find(|p| p.position == position)
    }
}

pub async fn load_products(path: &Path) -> Result<Vec<Product>> {
    read_json(path).await
}

pub async fn save_products(path: &Path, products: &[Product]) -> Result<()> {
    write_json(path, &products).await
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create dir {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn product(index: usize, title: &str) -> Product {
        Product {
            index,
            title: title.to_string(),
            url: format!("https://www.amazon.com/dp/B00000000{index}"),
            asin: format!("B00000000{index}"),
            price: "$59.99".to_string(),
            rating: 4.6,
            image_url: String::new(),
            videos: Vec::new(),
            description: vec!["Ergonomic shape for all-day comfort".to_string()],
            brand: None,
            conversion_signals: ConversionSignals::default(),
            downloaded_files: Vec::new(),
        }
    }

    pub fn enhanced(position: u32, title: &str, segment: Option<f64>) -> EnhancedProduct {
        EnhancedProduct {
            product: product(position as usize, title),
            position,
            short_title: title.to_string(),
            spoken_name: title.to_string(),
            script: format!("Script for {title}."),
            final_audio_file: None,
            segment_duration: segment,
        }
    }
}
