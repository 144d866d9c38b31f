use crate::error::PipelineError;
use crate::logw;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Default limit for a single ffmpeg/ffprobe call.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
/// Limit for long-running calls: HLS downloads, final concat, music mix.
pub const LONG_TIMEOUT_SECS: u64 = 180;

pub const SEGMENT_WIDTH: u32 = 1920;
pub const SEGMENT_HEIGHT: u32 = 1080;

async fn run_cmd(args: &[String], timeout_secs: u64) -> Result<()> {
    if args.is_empty() {
        return Ok(());
    }

    let mut cmd = Command::new(&args[0]);
    if args.len() > 1 {
        cmd.args(&args[1..]);
    }
    cmd.kill_on_drop(true);

    let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await
    {
        Ok(result) => result.with_context(|| format!("Failed to start {}", args[0]))?,
        Err(_) => {
            return Err(PipelineError::CommandTimeout {
                program: args[0].clone(),
                secs: timeout_secs,
            }
            .into());
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .chars()
            .rev()
            .take(600)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if !tail.trim().is_empty() {
            logw(format!("{} stderr: {}", args[0], tail.trim()));
        }
        return Err(PipelineError::CommandFailed {
            program: args[0].clone(),
            status: output.status.to_string(),
        }
        .into());
    }

    Ok(())
}

fn ffmpeg_base() -> Vec<String> {
    vec![
        "ffmpeg".to_string(),
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ]
}

/// Width and height of the first video stream. `input` may be a local path
/// or a remote (HLS) URL.
pub async fn ffprobe_video_dimensions(input: &str) -> Result<(u32, u32)> {
    let probe = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=s=x:p=0",
        ])
        .arg(input)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS), probe)
        .await
        .map_err(|_| PipelineError::CommandTimeout {
            program: "ffprobe".to_string(),
            secs: DEFAULT_TIMEOUT_SECS,
        })?
        .context("ffprobe execution failed")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("ffprobe failed"));
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let mut parts = text.lines().next().unwrap_or_default().split('x');
    let w = parts
        .next()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0);
    let h = parts
        .next()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0);

    if w == 0 || h == 0 {
        return Err(anyhow::anyhow!("Invalid dimensions: {}", text));
    }

    Ok((w, h))
}

pub async fn ffprobe_duration_seconds(path: &Path) -> Result<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .context("ffprobe duration failed")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("ffprobe failed"));
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let duration = text.parse::<f64>().unwrap_or(-1.0);
    if duration <= 0.1 {
        return Err(anyhow::anyhow!("Invalid duration"));
    }
    Ok(duration)
}

/// Copies an HLS stream into an mp4 container without re-encoding.
pub async fn ffmpeg_hls_to_mp4(hls_url: &str, user_agent: &str, out_mp4: &Path) -> Result<bool> {
    if let Some(parent) = out_mp4.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut args = ffmpeg_base();
    args.extend([
        "-user_agent".to_string(),
        user_agent.to_string(),
        "-i".to_string(),
        hls_url.to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-bsf:a".to_string(),
        "aac_adtstoasc".to_string(),
        out_mp4.display().to_string(),
    ]);

    run_cmd(&args, LONG_TIMEOUT_SECS).await?;
    Ok(out_mp4.exists())
}

/// Writes an ffmpeg concat-demuxer list with absolute paths.
pub async fn write_concat_list(list_txt: &Path, files: &[PathBuf]) -> Result<()> {
    let mut body = String::new();
    for file in files {
        let abs = std::path::absolute(file).unwrap_or_else(|_| file.clone());
        let escaped = abs.display().to_string().replace('\'', "'\\''");
        body.push_str(&format!("file '{}'\n", escaped));
    }
    tokio::fs::write(list_txt, body)
        .await
        .with_context(|| format!("Failed to write {}", list_txt.display()))
}

pub async fn ffmpeg_concat_copy(list_txt: &Path, out: &Path, timeout_secs: u64) -> Result<bool> {
    let mut args = ffmpeg_base();
    args.extend([
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list_txt.display().to_string(),
        "-c".to_string(),
        "copy".to_string(),
        out.display().to_string(),
    ]);
    run_cmd(&args, timeout_secs).await?;
    Ok(out.exists())
}

/// Loops `video` under the narration and cuts at exactly `duration` seconds,
/// scaled and cropped to 1920x1080.
pub async fn ffmpeg_render_segment(
    video: &Path,
    narration: &Path,
    duration: f64,
    encoder: &str,
    preset: &str,
    out_mp4: &Path,
) -> Result<bool> {
    let mut args = ffmpeg_base();
    args.extend([
        "-stream_loop".to_string(),
        "-1".to_string(),
        "-i".to_string(),
        video.display().to_string(),
        "-i".to_string(),
        narration.display().to_string(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "1:a:0".to_string(),
        "-vf".to_string(),
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},setsar=1",
            w = SEGMENT_WIDTH,
            h = SEGMENT_HEIGHT
        ),
        "-c:v".to_string(),
        encoder.to_string(),
        "-preset".to_string(),
        preset.to_string(),
        "-crf".to_string(),
        "23".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-r".to_string(),
        "30".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        "-ar".to_string(),
        "44100".to_string(),
        "-t".to_string(),
        format!("{:.3}", duration),
        out_mp4.display().to_string(),
    ]);
    run_cmd(&args, DEFAULT_TIMEOUT_SECS).await?;
    Ok(out_mp4.exists())
}

/// Composites PNG overlays on a segment with a prebuilt `filter_complex`.
/// The segment is input 0, overlays follow in order.
pub async fn ffmpeg_apply_overlays(
    segment: &Path,
    overlays: &[PathBuf],
    filter_complex: &str,
    encoder: &str,
    preset: &str,
    out_mp4: &Path,
) -> Result<bool> {
    let mut args = ffmpeg_base();
    args.extend(["-i".to_string(), segment.display().to_string()]);
    for overlay in overlays {
        args.extend(["-i".to_string(), overlay.display().to_string()]);
    }
    args.extend([
        "-filter_complex".to_string(),
        filter_complex.to_string(),
        "-c:v".to_string(),
        encoder.to_string(),
        "-preset".to_string(),
        preset.to_string(),
        "-crf".to_string(),
        "28".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:a".to_string(),
        "copy".to_string(),
        out_mp4.display().to_string(),
    ]);
    run_cmd(&args, DEFAULT_TIMEOUT_SECS).await?;
    Ok(out_mp4.exists())
}

/// Short bridge clip: the product's own footage under the transition sound.
pub async fn ffmpeg_transition(
    video: &Path,
    sound: &Path,
    encoder: &str,
    preset: &str,
    out_mp4: &Path,
) -> Result<bool> {
    let mut args = ffmpeg_base();
    args.extend([
        "-stream_loop".to_string(),
        "-1".to_string(),
        "-i".to_string(),
        video.display().to_string(),
        "-i".to_string(),
        sound.display().to_string(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "1:a:0".to_string(),
        "-vf".to_string(),
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},setsar=1",
            w = SEGMENT_WIDTH,
            h = SEGMENT_HEIGHT
        ),
        "-c:v".to_string(),
        encoder.to_string(),
        "-preset".to_string(),
        preset.to_string(),
        "-crf".to_string(),
        "23".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-r".to_string(),
        "30".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        "-ar".to_string(),
        "44100".to_string(),
        "-shortest".to_string(),
        out_mp4.display().to_string(),
    ]);
    run_cmd(&args, DEFAULT_TIMEOUT_SECS).await?;
    Ok(out_mp4.exists())
}

pub async fn ffmpeg_mix_background(
    video_in: &Path,
    music: &Path,
    volume: f32,
    video_out: &Path,
) -> Result<bool> {
    let mut args = ffmpeg_base();
    args.extend([
        "-i".to_string(),
        video_in.display().to_string(),
        "-stream_loop".to_string(),
        "-1".to_string(),
        "-i".to_string(),
        music.display().to_string(),
        "-filter_complex".to_string(),
        format!(
            "[1:a]volume={:.3}[bg];[0:a][bg]amix=inputs=2:duration=first[audio]",
            volume
        ),
        "-map".to_string(),
        "0:v".to_string(),
        "-map".to_string(),
        "[audio]".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        video_out.display().to_string(),
    ]);
    run_cmd(&args, LONG_TIMEOUT_SECS).await?;
    Ok(video_out.exists())
}

/// A text banner on a transparent canvas, saved as PNG. The text is read
/// from a side file so it needs no drawtext escaping.
pub async fn ffmpeg_render_banner(
    text: &str,
    font_size: u32,
    box_color: &str,
    out_png: &Path,
) -> Result<bool> {
    let text_file = out_png.with_extension("txt");
    tokio::fs::write(&text_file, text)
        .await
        .with_context(|| format!("Failed to write {}", text_file.display()))?;

    let width = banner_width(text, font_size);
    let height = font_size * 2 + 20;
    let mut args = ffmpeg_base();
    args.extend([
        "-f".to_string(),
        "lavfi".to_string(),
        "-i".to_string(),
        format!("color=c=black@0.0:s={}x{},format=rgba", width, height),
        "-vf".to_string(),
        format!(
            "drawtext=textfile='{}':fontsize={}:fontcolor=white:box=1:boxcolor={}:boxborderw=18:x=(w-text_w)/2:y=(h-text_h)/2",
            drawtext_path(&text_file),
            font_size,
            box_color
        ),
        "-frames:v".to_string(),
        "1".to_string(),
        out_png.display().to_string(),
    ]);
    let result = run_cmd(&args, DEFAULT_TIMEOUT_SECS).await;
    let _ = tokio::fs::remove_file(&text_file).await;
    result?;
    Ok(out_png.exists())
}

/// Scales and crops any image to an exact frame size.
pub async fn ffmpeg_fit_image(input: &Path, width: u32, height: u32, out: &Path) -> Result<bool> {
    let mut args = ffmpeg_base();
    args.extend([
        "-i".to_string(),
        input.display().to_string(),
        "-vf".to_string(),
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}",
            w = width,
            h = height
        ),
        "-frames:v".to_string(),
        "1".to_string(),
        out.display().to_string(),
    ]);
    run_cmd(&args, DEFAULT_TIMEOUT_SECS).await?;
    Ok(out.exists())
}

/// Fallback thumbnail: product image on a dark backdrop with a headline.
pub async fn ffmpeg_headline_thumbnail(
    image: Option<&Path>,
    headline: &str,
    width: u32,
    height: u32,
    out_png: &Path,
) -> Result<bool> {
    let text_file = out_png.with_extension("txt");
    tokio::fs::write(&text_file, headline)
        .await
        .with_context(|| format!("Failed to write {}", text_file.display()))?;

    let draw = format!(
        "drawtext=textfile='{}':fontsize=110:fontcolor=yellow:borderw=6:bordercolor=black:x=(w-text_w)/2:y=40",
        drawtext_path(&text_file)
    );

    let mut args = ffmpeg_base();
    match image {
        Some(image) => args.extend([
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("color=c=0x101820:s={}x{}", width, height),
            "-i".to_string(),
            image.display().to_string(),
            "-filter_complex".to_string(),
            format!(
                "[1:v]scale=-1:{}[p];[0:v][p]overlay=x=W-w-60:y=H-h-40,{}",
                height * 3 / 4,
                draw
            ),
        ]),
        None => args.extend([
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("color=c=0x101820:s={}x{}", width, height),
            "-vf".to_string(),
            draw,
        ]),
    }
    args.extend([
        "-frames:v".to_string(),
        "1".to_string(),
        out_png.display().to_string(),
    ]);

    let result = run_cmd(&args, DEFAULT_TIMEOUT_SECS).await;
    let _ = tokio::fs::remove_file(&text_file).await;
    result?;
    Ok(out_png.exists())
}

/// Canvas width for a banner, estimated from the glyph count so that
/// right- and centre-anchored overlays line up with the visible text.
fn banner_width(text: &str, font_size: u32) -> u32 {
    let glyphs = text.chars().count() as u32;
    let estimate = glyphs * font_size * 3 / 5 + 80;
    estimate.clamp(200, SEGMENT_WIDTH - 100) & !1
}

fn drawtext_path(path: &Path) -> String {
    path.display()
        .to_string()
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_width_tracks_text_length() {
        assert_eq!(banner_width("$59", 48), 200);
        let long = "x".repeat(200);
        assert_eq!(banner_width(&long, 48), SEGMENT_WIDTH - 100);
        assert!(banner_width("LINK BELOW FOR THE BEST PRICE", 48) > banner_width("Top pick", 48));
    }

    #[test]
    fn drawtext_paths_are_escaped() {
        assert_eq!(drawtext_path(Path::new("C:\\tmp\\it's.txt")), "C\\:/tmp/it\\'s.txt");
    }

    #[tokio::test]
    async fn concat_list_quotes_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let list = dir.path().join("list.txt");
        let files = vec![dir.path().join("a.mp4"), dir.path().join("it's.mp4")];
        write_concat_list(&list, &files).await.unwrap();

        let text = std::fs::read_to_string(&list).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("file '") && lines[0].ends_with("a.mp4'"));
        assert!(lines[1].contains("it'\\''s.mp4"));
    }
}
