use std::path::Path;
use std::process::Stdio;

use anyhow::Result;
use hound::{SampleFormat, WavReader};
use rayon::prelude::*;
use tokio::process::Command;
use tracing::info;

/// Sample rate expected by the speech recognition models.
pub const ASR_SAMPLE_RATE: u32 = 16000;

/// Decodes any audio/video file into a 16 kHz mono 16-bit WAV with ffmpeg.
///
/// # Arguments
/// * `ffmpeg` - ffmpeg binary
/// * `input` - source media file
/// * `output` - destination `.wav`, overwritten if present
pub async fn decode_to_wav(ffmpeg: &Path, input: &Path, output: &Path) -> Result<()> {
    info!("Decoding {} to WAV", input.display());

    let status = Command::new(ffmpeg)
        .arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-vn", "-acodec", "pcm_s16le", "-ac", "1"])
        .arg("-ar")
        .arg(ASR_SAMPLE_RATE.to_string())
        .args(["-loglevel", "error"])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to execute ffmpeg: {}", e))?;

    if !status.success() {
        return Err(anyhow::anyhow!("FFmpeg decoding failed with status: {}", status));
    }

    Ok(())
}

/// Reads a 16-bit integer WAV file into mono samples normalized to `[-1, 1]`.
///
/// Returns the samples and the file's sample rate.
pub fn read_wav_samples(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to read WAV file: {}", e))?;

    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int {
        return Err(anyhow::anyhow!("Unsupported sample format: expected integer format"));
    }
    if spec.bits_per_sample != 16 {
        return Err(anyhow::anyhow!("Unsupported bits per sample: expected 16 bits"));
    }

    let samples: Vec<f32> = reader
        .samples::<i16>()
        .map(|s| s.map(|val| val as f32))
        .collect::<std::result::Result<Vec<f32>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to read samples: {}", e))?;

    let mono = convert_to_mono(&samples, spec.channels as usize);
    Ok((normalize_audio(&mono), spec.sample_rate))
}

/// Averages interleaved channels into one.
pub fn convert_to_mono(samples: &[f32], num_channels: usize) -> Vec<f32> {
    if num_channels <= 1 {
        return samples.to_vec();
    }
    samples
        .par_chunks(num_channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// Scales samples so the loudest one has magnitude 1. Silence is left as is.
pub fn normalize_audio(samples: &[f32]) -> Vec<f32> {
    let max_abs = samples
        .par_iter()
        .map(|s| s.abs())
        .reduce(|| 0.0f32, f32::max);

    if max_abs == 0.0 {
        return samples.to_vec();
    }
    samples.par_iter().map(|&s| s / max_abs).collect()
}
