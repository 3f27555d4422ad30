//! Sample format conversion between the synthesis source and the avatar sink
//!
//! The synthesis source emits floating-point PCM; the avatar bridge consumes
//! signed 16-bit PCM. Conversions clamp to [-1.0, 1.0] before integer scaling
//! so out-of-range input saturates instead of wrapping.

use std::io::Cursor;

use base64::Engine as _;

use crate::{Error, Result};

/// Convert f32 samples to signed 16-bit PCM, clamping to [-1.0, 1.0]
#[must_use]
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            #[allow(clippy::cast_possible_truncation)]
            let scaled = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
            scaled
        })
        .collect()
}

/// Convert signed 16-bit PCM samples to f32 in [-1.0, 1.0]
#[must_use]
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32767.0).collect()
}

/// Decode raw little-endian f32 PCM bytes into samples
///
/// # Errors
///
/// Returns `Error::Format` if the byte length is not a multiple of four
pub fn decode_f32_le(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Format(format!(
            "f32 PCM payload length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Encode f32 samples as raw little-endian bytes
#[must_use]
pub fn encode_f32_le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Encode signed 16-bit samples as raw little-endian bytes
#[must_use]
pub fn encode_i16_le(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Decode a base64 f32-LE PCM payload (the wire form of `AUDIO` packets)
///
/// # Errors
///
/// Returns `Error::Format` for invalid base64 or a truncated sample buffer
pub fn decode_payload(payload: &str) -> Result<Vec<f32>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| Error::Format(format!("invalid base64 audio payload: {e}")))?;
    decode_f32_le(&bytes)
}

/// Encode f32 samples as a base64 payload for the wire
#[must_use]
pub fn encode_payload(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_f32_le(samples))
}

/// Wrap signed 16-bit PCM in a mono WAV container
///
/// # Errors
///
/// Returns `Error::Format` if WAV encoding fails
pub fn pcm16_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Format(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Format(e.to_string()))?;
        }
        writer.finalize().map_err(|e| Error::Format(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Unwrap a WAV container to raw signed 16-bit PCM samples
///
/// # Errors
///
/// Returns `Error::Format` for an undecodable container or non-16-bit samples
pub fn wav_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Format(e.to_string()))?;
    reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Format(e.to_string()))
}
