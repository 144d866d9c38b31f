use crate::api::gemini::{Gemini, extract_inline_data, extract_text};
use crate::{logi, logok};
use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use serde_json::json;
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub const SAMPLE_RATE: u32 = 24_000;

/// Encodes raw little-endian 16-bit mono PCM as a WAV file image.
fn encode_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut buf = Cursor::new(Vec::with_capacity(44 + pcm.len()));
    let mut writer = WavWriter::new(&mut buf, spec).context("Failed to start WAV stream")?;
    for frame in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([frame[0], frame[1]]))?;
    }
    writer.finalize().context("Failed to finalize WAV stream")?;
    Ok(buf.into_inner())
}

/// `rate=` parameter of an `audio/L16` mime type.
fn sample_rate_of(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|p| p.trim().strip_prefix("rate="))
        .find_map(|r| r.parse().ok())
}

/// Renders `text` with a prebuilt Gemini voice and writes it as WAV.
pub async fn synthesize_to_wav(
    gemini: &Gemini,
    model: &str,
    voice: &str,
    style_prompt: &str,
    text: &str,
    out_wav: &Path,
) -> Result<PathBuf> {
    logi(format!("Generating audio {} (voice: {})", out_wav.display(), voice));

    let body = json!({
        "contents": [{ "parts": [{ "text": format!("{}\n\n{}", style_prompt, text) }] }],
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            }
        }
    });

    let resp = gemini.request(model, body).await?;
    let Some((mime, pcm)) = extract_inline_data(&resp)? else {
        let reply = extract_text(&resp).unwrap_or_default();
        anyhow::bail!("TTS returned no audio for {}: {}", out_wav.display(), reply);
    };

    let rate = sample_rate_of(&mime).unwrap_or(SAMPLE_RATE);
    if let Some(parent) = out_wav.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(out_wav, encode_wav(&pcm, rate)?)
        .await
        .with_context(|| format!("Failed to write {}", out_wav.display()))?;

    logok(format!("Audio ready: {}", out_wav.display()));
    Ok(out_wav.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_reads_back_as_mono_16_bit() {
        let pcm: Vec<u8> = [0i16, 1200, -1200, i16::MAX]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let wav = encode_wav(&pcm, SAMPLE_RATE).unwrap();

        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 24_000);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 1200, -1200, i16::MAX]);
    }

    #[test]
    fn trailing_odd_byte_is_dropped() {
        let wav = encode_wav(&[1, 0, 7], 16_000).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), 1);
    }

    #[test]
    fn rate_from_mime() {
        assert_eq!(sample_rate_of("audio/L16;codec=pcm;rate=24000"), Some(24_000));
        assert_eq!(sample_rate_of("audio/wav"), None);
    }
}
