use crate::api::gemini::Gemini;
use crate::config::Config;
use crate::error::PipelineError;
use crate::ffmpeg::{ffmpeg_fit_image, ffmpeg_headline_thumbnail};
use crate::model::{ENHANCED_PRODUCTS_FILE, EnhancedProducts};
use crate::{logi, logok, logw};
use anyhow::Result;
use std::path::{Path, PathBuf};

pub const THUMBNAIL_WIDTH: u32 = 1280;
pub const THUMBNAIL_HEIGHT: u32 = 720;

/// Overlay copy requested from the image model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailStrings {
    pub top: &'static str,
    pub tested: &'static str,
    pub shocking: &'static str,
}

pub fn localized_strings(language: &str) -> ThumbnailStrings {
    let (top, tested, shocking) = match language {
        "de" => ("TOP", "GETESTET 2025!", "SCHOCKIERENDE ERGEBNISSE!"),
        "fr" => ("TOP", "TESTÉ EN 2025 !", "RÉSULTATS CHOQUANTS !"),
        "es" => ("TOP", "¡PROBADO EN 2025!", "¡RESULTADOS IMPACTANTES!"),
        "nl" => ("TOP", "GETEST IN 2025!", "SCHOKKENDE RESULTATEN!"),
        "sv" => ("TOPP", "TESTAD 2025!", "CHOCKERANDE RESULTAT!"),
        "pl" => ("TOP", "PRZETESTOWANE W 2025 R.!", "SZOKUJĄCE WYNIKI!"),
        _ => ("TOP", "TESTED IN 2025!", "SHOCKING RESULTS!"),
    };
    ThumbnailStrings { top, tested, shocking }
}

/// Scene behind the products, picked from the keyword's product family.
pub fn product_context(keyword: &str) -> &'static str {
    const FAMILIES: &[(&[&str], &str)] = &[
        (
            &["mikrowelle", "microwave", "oven", "toaster", "blender", "mixer", "coffee", "kettle", "fryer"],
            "modern kitchen counter",
        ),
        (
            &["vacuum", "cleaner", "staubsauger", "aspirateur", "mop", "broom"],
            "clean living room",
        ),
        (
            &["laptop", "computer", "phone", "tablet", "headphones", "speaker", "tv", "monitor"],
            "modern desk setup",
        ),
        (
            &["hair", "skin", "makeup", "beauty", "cream", "shampoo"],
            "clean bathroom vanity",
        ),
        (
            &["fitness", "exercise", "gym", "sport", "bike", "treadmill"],
            "home gym",
        ),
        (&["drill", "tool", "hammer", "saw", "screwdriver"], "workshop bench"),
        (&["car", "auto", "tire", "oil", "engine"], "garage"),
    ];

    let lower = keyword.to_lowercase();
    FAMILIES
        .iter()
        .find(|(words, _)| words.iter().any(|w| lower.contains(w)))
        .map(|(_, scene)| *scene)
        .unwrap_or("clean, modern interior")
}

pub fn thumbnail_prompt(keyword: &str, count: usize, language: &str) -> String {
    let kw = keyword.to_lowercase();
    let text = localized_strings(language);
    let scene = product_context(keyword);
    [
        format!("Create a high-impact YouTube thumbnail in 16:9 format for a '{kw}' review video."),
        format!("Background: Show a realistic {scene} environment that naturally relates to {kw} usage. Make it bright, clean, and modern with natural lighting."),
        format!("Layout: {count} distinct, futuristic-looking {kw} products arranged prominently across the RIGHT 70% of the image, each clearly different in design and brand. Make them exceptionally large and detailed with sleek, modern designs."),
        "Human element: On the LEFT side, show a clearly visible, realistic woman (a close-up head and shoulders shot) with an expression of shock and amazement, pointing toward the winning product.".to_string(),
        format!("Visual hierarchy: The other {kw} products must have a strong RED GLOW contained around them."),
        format!("The winning {kw} should have a modern, bright GREEN GLOW with crackling energy sparks and subtle light trails. It should be 200% larger than the others and overlap them slightly."),
        "NO badges, checkmarks, or X's.".to_string(),
        format!("Typography: At the top, display '{} {count} {kw}' and '{}' in a modern, high-impact font with a metallic texture and a modern yellow-to-gold gradient. The text must be bold, 3D, and exceptionally large.", text.top, text.tested),
        format!("Bottom text: '{}' as a solid, single phrase in a clean, bold, white font with a strong, soft black shadow behind it.", text.shocking),
        "Overall Style: Apply a dynamic, high-contrast color grade to the entire image with a subtle lens flare from the winning product.".to_string(),
        "Ensure all text is large, clear, and legible on mobile. Fill the entire 16:9 frame with NO black bars.".to_string(),
    ]
    .join(" ")
}

pub fn thumbnail_file_name(keyword: &str) -> String {
    let safe: String = keyword
        .to_uppercase()
        .replace(' ', "_")
        .chars()
        .map(|c| if "<>:\"/\\|?*'`".contains(c) { '_' } else { c })
        .collect();
    format!("thumbnail_{}.png", safe)
}

/// Finds the thumbnail written for the keyword in `output_dir`, if any.
pub fn find_thumbnail(output_dir: &Path, keyword: &str) -> Option<PathBuf> {
    let path = output_dir.join(thumbnail_file_name(keyword));
    path.exists().then_some(path)
}

pub struct ThumbnailGenerator {
    cfg: Config,
    gemini: Option<Gemini>,
}

impl ThumbnailGenerator {
    pub fn new(cfg: Config, gemini: Option<Gemini>) -> Self {
        Self { cfg, gemini }
    }

    async fn generate_ai(&self, keyword: &str, count: usize, out: &Path) -> Result<bool> {
        let Some(gemini) = &self.gemini else {
            anyhow::bail!("no Gemini key available for thumbnails");
        };

        logi("Generating thumbnail with Gemini");
        let prompt = thumbnail_prompt(keyword, count, &self.cfg.language);
        let bytes = gemini.generate_image(&self.cfg.gemini.image_model, &prompt).await?;

        let raw = out.with_extension("raw.png");
        tokio::fs::write(&raw, bytes).await?;
        let fitted = ffmpeg_fit_image(&raw, THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT, out).await;
        let _ = tokio::fs::remove_file(&raw).await;
        fitted
    }

    /// Writes `thumbnail_<KEYWORD>.png` into `output_dir`. When the image
    /// model fails, a plain headline thumbnail is rendered instead.
    pub async fn generate(&self, output_dir: &Path) -> Result<PathBuf> {
        let data_path = output_dir.join(ENHANCED_PRODUCTS_FILE);
        if !data_path.exists() {
            return Err(PipelineError::MissingInput(data_path).into());
        }
        let data = EnhancedProducts::load(&data_path).await?;
        let out = output_dir.join(thumbnail_file_name(&data.keyword));
        let count = data.products.len();

        match self.generate_ai(&data.keyword, count, &out).await {
            Ok(true) => {
                logok(format!("Thumbnail saved to {}", out.display()));
                return Ok(out);
            }
            Ok(false) => logw("Image model output could not be resized"),
            Err(err) => logw(format!("AI thumbnail failed: {:#}", err)),
        }

        let strings = localized_strings(&self.cfg.language);
        let headline = format!("{} {} {}", strings.top, count, data.keyword.to_uppercase());
        let image = data.by_position(1).and_then(|p| p.product.image_file());
        if ffmpeg_headline_thumbnail(image, &headline, THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT, &out).await? {
            logok(format!("Fallback thumbnail saved to {}", out.display()));
            Ok(out)
        } else {
            anyhow::bail!("thumbnail could not be created")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenes_follow_keyword_family() {
        assert_eq!(product_context("Air Fryer XXL"), "modern kitchen counter");
        assert_eq!(product_context("aspirateur robot"), "clean living room");
        assert_eq!(product_context("noise cancelling headphones"), "modern desk setup");
        assert_eq!(product_context("cordless drill"), "workshop bench");
        assert_eq!(product_context("garden hose"), "clean, modern interior");
    }

    #[test]
    fn file_names_are_upper_and_safe() {
        assert_eq!(thumbnail_file_name("wireless mouse"), "thumbnail_WIRELESS_MOUSE.png");
        assert_eq!(thumbnail_file_name("usb-c hub 4/1"), "thumbnail_USB-C_HUB_4_1.png");
    }

    #[test]
    fn prompt_uses_language_strings() {
        let prompt = thumbnail_prompt("Souris Sans Fil", 3, "fr");
        assert!(prompt.contains("'TOP 3 souris sans fil'"));
        assert!(prompt.contains("TESTÉ EN 2025 !"));
        assert!(prompt.contains("RÉSULTATS CHOQUANTS !"));
        assert_eq!(localized_strings("it"), localized_strings("en"));
        assert_eq!(localized_strings("sv").top, "TOPP");
    }

    #[test]
    fn existing_thumbnail_is_found() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(find_thumbnail(dir.path(), "usb hub").is_none());
        std::fs::write(dir.path().join("thumbnail_USB_HUB.png"), b"png").unwrap();
        assert!(find_thumbnail(dir.path(), "usb hub").is_some());
    }
}
