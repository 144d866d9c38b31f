//! Builds the final countdown video from narrated product segments.

use crate::config::Config;
use crate::error::PipelineError;
use crate::ffmpeg::{
    LONG_TIMEOUT_SECS, ffmpeg_apply_overlays, ffmpeg_concat_copy, ffmpeg_mix_background,
    ffmpeg_render_banner, ffmpeg_render_segment, ffmpeg_transition, ffprobe_duration_seconds,
    write_concat_list,
};
use crate::init::Workspace;
use crate::model::{ENHANCED_PRODUCTS_FILE, EnhancedProduct, EnhancedProducts};
use crate::session::force_delete_directory;
use crate::{loge, logi, logok, logw};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const TITLE_FONT: u32 = 56;
const PRICE_FONT: u32 = 64;
const CTA_FONT: u32 = 48;
const INTRO_FONT: u32 = 96;
const INTRO_SECONDS: f64 = 5.0;

/// One PNG composited over a segment during `enable`.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySpec {
    pub image: PathBuf,
    pub position: &'static str,
    pub enable: String,
}

/// Rendered banners for one product.
#[derive(Debug, Clone)]
pub struct ProductBanners {
    pub title: PathBuf,
    pub price: PathBuf,
    pub cta: PathBuf,
}

fn secs(value: f64) -> String {
    let text = format!("{:.2}", value.max(0.0));
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Timed overlays for a segment of `duration` seconds. The opening segment
/// shows the intro first and delays its title until the intro is gone.
pub fn segment_overlays(
    duration: f64,
    intro: Option<&Path>,
    banners: &ProductBanners,
) -> Vec<OverlaySpec> {
    let tail = secs(duration - 5.0);
    let end = secs(duration);
    let mut overlays = Vec::new();

    let title_enable = match intro {
        Some(intro) => {
            overlays.push(OverlaySpec {
                image: intro.to_path_buf(),
                position: "x=(W-w)/2:y=(H-h)/2",
                enable: format!("between(t,0,{})", secs(INTRO_SECONDS)),
            });
            format!("between(t,5,10)+between(t,{},{})", tail, end)
        }
        None => format!("between(t,0.5,5.5)+between(t,{},{})", tail, end),
    };

    overlays.push(OverlaySpec {
        image: banners.title.clone(),
        position: "x=50:y=50",
        enable: title_enable,
    });
    overlays.push(OverlaySpec {
        image: banners.price.clone(),
        position: "x=W-w-50:y=50",
        enable: format!("between(t,{},{})", secs(duration - 10.0), end),
    });
    overlays.push(OverlaySpec {
        image: banners.cta.clone(),
        position: "x=(W-w)/2:y=H-h-90",
        enable: format!("between(t,{},{})", tail, end),
    });
    overlays
}

/// Chains `overlay` filters; the segment is input 0 and overlay `i` is input
/// `i + 1`. The last link is left unlabeled so ffmpeg maps it.
pub fn build_overlay_filter(overlays: &[OverlaySpec]) -> String {
    let mut parts = Vec::with_capacity(overlays.len());
    let mut last = "[0:v]".to_string();
    for (i, overlay) in overlays.iter().enumerate() {
        let label = if i + 1 == overlays.len() {
            String::new()
        } else {
            format!("[v{}]", i + 1)
        };
        parts.push(format!(
            "{}[{}:v]overlay={}:enable='{}'{}",
            last,
            i + 1,
            overlay.position,
            overlay.enable,
            label
        ));
        last = label;
    }
    parts.join(";")
}

/// ASCII file name for the final video.
pub fn sanitize_filename(text: &str) -> String {
    text.chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                Some(c)
            } else if c.is_ascii() {
                Some('_')
            } else {
                fold_accent(c)
            }
        })
        .collect()
}

fn fold_accent(c: char) -> Option<char> {
    let base = match c {
        'à' | 'á' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'ö' | 'õ' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ÿ' | 'ý' => 'y',
        'À' | 'Á' | 'Â' | 'Ä' | 'Ã' | 'Å' => 'A',
        'Ç' => 'C',
        'È' | 'É' | 'Ê' | 'Ë' => 'E',
        'Ì' | 'Í' | 'Î' | 'Ï' => 'I',
        'Ñ' => 'N',
        'Ò' | 'Ó' | 'Ô' | 'Ö' | 'Õ' => 'O',
        'Ù' | 'Ú' | 'Û' | 'Ü' => 'U',
        _ => return None,
    };
    Some(base)
}

pub fn final_video_path(output_dir: &Path, keyword: &str) -> PathBuf {
    output_dir.join(format!("{}_final_video.mp4", sanitize_filename(keyword)))
}

/// One entry of the concat list, indexing into the produced segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Piece {
    Segment(usize),
    TransitionAfter(usize),
}

/// Segments in order, with a transition between each neighbouring pair.
fn concat_order(produced: usize, with_transitions: bool) -> Vec<Piece> {
    let mut order = Vec::with_capacity(produced * 2);
    for i in 0..produced {
        if i > 0 && with_transitions {
            order.push(Piece::TransitionAfter(i - 1));
        }
        order.push(Piece::Segment(i));
    }
    order
}

pub fn intro_text(template: &str, count: usize, keyword: &str) -> String {
    template
        .replace("{count}", &count.to_string())
        .replace("{KEYWORD}", &keyword.to_uppercase())
        .replace("{keyword}", keyword)
}

pub struct VideoAssembler {
    cfg: Config,
    ws: Workspace,
}

impl VideoAssembler {
    pub fn new(cfg: Config, ws: Workspace) -> Self {
        Self { cfg, ws }
    }

    async fn render_banners(&self, product: &EnhancedProduct, work: &Path) -> Result<ProductBanners> {
        let pos = product.position;
        let banners = ProductBanners {
            title: work.join(format!("title_{}.png", pos)),
            price: work.join(format!("price_{}.png", pos)),
            cta: work.join(format!("cta_{}.png", pos)),
        };
        ffmpeg_render_banner(&product.short_title, TITLE_FONT, "black@0.6", &banners.title).await?;
        ffmpeg_render_banner(&product.product.price, PRICE_FONT, "0xE53935@0.85", &banners.price).await?;
        ffmpeg_render_banner(&self.cfg.labels.cta_banner, CTA_FONT, "0xFFB300@0.9", &banners.cta).await?;
        Ok(banners)
    }

    /// Footage for one product; several clips are joined first.
    async fn product_footage(&self, product: &EnhancedProduct, work: &Path) -> Result<Option<PathBuf>> {
        let clips: Vec<PathBuf> = product
            .product
            .video_files()
            .into_iter()
            .filter(|p| p.exists())
            .map(Path::to_path_buf)
            .collect();

        match clips.len() {
            0 => Ok(None),
            1 => Ok(clips.into_iter().next()),
            n => {
                logi(format!("Joining {} clips for product #{}", n, product.position));
                let list = work.join(format!("clips_{}.txt", product.position));
                let joined = work.join(format!("joined_{}.mp4", product.position));
                write_concat_list(&list, &clips).await?;
                if ffmpeg_concat_copy(&list, &joined, LONG_TIMEOUT_SECS).await? {
                    Ok(Some(joined))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Renders one narrated segment with overlays. Returns the segment, its
    /// duration and the footage used, or `None` when the product is skipped.
    async fn build_segment(
        &self,
        product: &EnhancedProduct,
        intro: Option<&Path>,
        work: &Path,
    ) -> Result<Option<(PathBuf, f64, PathBuf)>> {
        let pos = product.position;
        let Some(audio) = product
            .final_audio_file
            .as_ref()
            .filter(|a| a.exists() && a.extension().is_some_and(|e| e == "wav"))
        else {
            loge(format!("Missing narration for product #{}, skipping segment", pos));
            return Ok(None);
        };

        let Some(footage) = self.product_footage(product, work).await? else {
            loge(format!("No footage for product #{}, skipping segment", pos));
            return Ok(None);
        };

        let duration = ffprobe_duration_seconds(audio)
            .await
            .with_context(|| format!("narration duration for product #{}", pos))?;

        let raw = work.join(format!("raw_segment_{}.mp4", pos));
        ffmpeg_render_segment(&footage, audio, duration, &self.cfg.video.encoder, &self.cfg.video.preset, &raw)
            .await?;

        let banners = self.render_banners(product, work).await?;
        let overlays = segment_overlays(duration, intro, &banners);
        let images: Vec<PathBuf> = overlays.iter().map(|s| s.image.clone()).collect();
        let segment = work.join(format!("final_segment_{}.mp4", pos));
        ffmpeg_apply_overlays(
            &raw,
            &images,
            &build_overlay_filter(&overlays),
            &self.cfg.video.encoder,
            &self.cfg.video.preset,
            &segment,
        )
        .await?;

        logok(format!("Segment #{} ready ({:.2}s)", pos, duration));
        Ok(Some((segment, duration, footage)))
    }

    /// Reads `enhanced_product.json` from `output_dir`, writes the final video
    /// next to it and stores each product's segment duration back.
    pub async fn assemble(&self, output_dir: &Path) -> Result<PathBuf> {
        let data_path = output_dir.join(ENHANCED_PRODUCTS_FILE);
        if !data_path.exists() {
            return Err(PipelineError::MissingInput(data_path).into());
        }
        let mut data = EnhancedProducts::load(&data_path).await?;
        let work = output_dir.join("video_temp");
        tokio::fs::create_dir_all(&work).await?;

        let result = self.assemble_in(&mut data, output_dir, &work).await;
        force_delete_directory(&work).await;
        let out = result?;

        data.save(&data_path).await?;
        Ok(out)
    }

    async fn assemble_in(&self, data: &mut EnhancedProducts, output_dir: &Path, work: &Path) -> Result<PathBuf> {
        let countdown: Vec<EnhancedProduct> = data.countdown().into_iter().cloned().collect();
        logi(format!("Assembling {} segments for '{}'", countdown.len(), data.keyword));

        let intro = work.join("intro.png");
        let intro_label = intro_text(&self.cfg.labels.intro_banner, countdown.len(), &data.keyword);
        let rendered = ffmpeg_render_banner(&intro_label, INTRO_FONT, "black@0.7", &intro).await;
        let intro = match rendered {
            Ok(true) => Some(intro),
            Ok(false) | Err(_) => {
                logw("Intro banner could not be rendered, continuing without it");
                None
            }
        };

        let mut built: Vec<(u32, PathBuf, PathBuf)> = Vec::new();
        let mut durations: HashMap<u32, f64> = HashMap::new();

        for (i, product) in countdown.iter().enumerate() {
            let intro = if i == 0 { intro.as_deref() } else { None };
            let Some((segment, duration, footage)) = self.build_segment(product, intro, work).await? else {
                continue;
            };
            durations.insert(product.position, duration);
            built.push((product.position, segment, footage));
        }

        let transition = self.ws.resolve(&self.cfg.video.transition_clip);
        let with_transitions = transition.exists();
        let mut segments: Vec<PathBuf> = Vec::new();
        for piece in concat_order(built.len(), with_transitions) {
            match piece {
                Piece::Segment(i) => segments.push(built[i].1.clone()),
                Piece::TransitionAfter(i) => {
                    let (position, _, footage) = &built[i];
                    let bridge = work.join(format!("transition_{}.mp4", position));
                    match ffmpeg_transition(footage, &transition, &self.cfg.video.encoder, &self.cfg.video.preset, &bridge).await {
                        Ok(true) => segments.push(bridge),
                        Ok(false) => logw("Transition produced no file"),
                        Err(err) => logw(format!("Transition failed: {:#}", err)),
                    }
                }
            }
        }

        if segments.is_empty() {
            anyhow::bail!("no video segments could be created");
        }

        let list = work.join("segments.txt");
        let combined = work.join("combined.mp4");
        write_concat_list(&list, &segments).await?;
        if !ffmpeg_concat_copy(&list, &combined, LONG_TIMEOUT_SECS).await? {
            anyhow::bail!("concatenation produced no output");
        }

        let out = final_video_path(output_dir, &data.keyword);
        let music = self.ws.resolve(&self.cfg.video.background_music);
        if music.exists() {
            logi(format!("Mixing background music {}", music.display()));
            if !ffmpeg_mix_background(&combined, &music, self.cfg.video.background_volume, &out).await? {
                anyhow::bail!("music mix produced no output");
            }
        } else {
            logw(format!("Background music {} not found, keeping narration only", music.display()));
            tokio::fs::rename(&combined, &out)
                .await
                .with_context(|| format!("Failed to move video to {}", out.display()))?;
        }

        for product in data.products.iter_mut() {
            product.segment_duration = durations.get(&product.position).copied();
        }
        logok(format!("Final video: {}", out.display()));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn banners() -> ProductBanners {
        ProductBanners {
            title: PathBuf::from("t.png"),
            price: PathBuf::from("p.png"),
            cta: PathBuf::from("c.png"),
        }
    }

    #[test]
    fn opening_segment_waits_for_intro() {
        let overlays = segment_overlays(42.5, Some(Path::new("intro.png")), &banners());
        let enables: Vec<&str> = overlays.iter().map(|s| s.enable.as_str()).collect();
        assert_eq!(
            enables,
            vec![
                "between(t,0,5)",
                "between(t,5,10)+between(t,37.5,42.5)",
                "between(t,32.5,42.5)",
                "between(t,37.5,42.5)",
            ]
        );
        assert_eq!(overlays[0].position, "x=(W-w)/2:y=(H-h)/2");
    }

    #[test]
    fn later_segments_show_title_early() {
        let overlays = segment_overlays(30.0, None, &banners());
        assert_eq!(overlays.len(), 3);
        assert_eq!(overlays[0].enable, "between(t,0.5,5.5)+between(t,25,30)");
        assert_eq!(overlays[1].position, "x=W-w-50:y=50");
        assert_eq!(overlays[2].position, "x=(W-w)/2:y=H-h-90");
    }

    #[test]
    fn overlay_chain_labels() {
        let overlays = segment_overlays(30.0, None, &banners());
        assert_eq!(
            build_overlay_filter(&overlays),
            "[0:v][1:v]overlay=x=50:y=50:enable='between(t,0.5,5.5)+between(t,25,30)'[v1];\
             [v1][2:v]overlay=x=W-w-50:y=50:enable='between(t,20,30)'[v2];\
             [v2][3:v]overlay=x=(W-w)/2:y=H-h-90:enable='between(t,25,30)'"
        );
    }

    #[test]
    fn final_video_names() {
        assert_eq!(sanitize_filename("souris sans fil ergonomique"), "souris_sans_fil_ergonomique");
        assert_eq!(sanitize_filename("café/thé"), "cafe_the");
        assert_eq!(
            final_video_path(Path::new("output"), "usb hub"),
            PathBuf::from("output/usb_hub_final_video.mp4")
        );
    }

    #[test]
    fn transitions_only_join_produced_segments() {
        use Piece::*;
        assert_eq!(
            concat_order(3, true),
            vec![Segment(0), TransitionAfter(0), Segment(1), TransitionAfter(1), Segment(2)]
        );
        // a skipped last product must not leave a trailing transition
        assert_eq!(concat_order(1, true), vec![Segment(0)]);
        assert_eq!(concat_order(2, false), vec![Segment(0), Segment(1)]);
        assert!(concat_order(0, true).is_empty());
    }

    #[test]
    fn intro_label() {
        assert_eq!(intro_text("TOP {count} {KEYWORD}", 3, "usb hub"), "TOP 3 USB HUB");
    }
}
