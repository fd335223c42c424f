//! Frame encoding: base64 transport text, G.711 mu-law and WAV framing.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Base64 decode error: {0}")]
    Base64(String),
    #[error("Linear PCM must have an even number of bytes, got {0}")]
    OddLength(usize),
    #[error("WAV error: {0}")]
    Wav(String),
    #[error("Resampling error: {0}")]
    Resample(String),
}

/// Standard alphabet, padded on output. Decoding also accepts unpadded text
/// and non-zero trailing bits.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Encode a raw frame as base64 text for a JSON string value.
pub fn encode_frame(raw: &[u8]) -> String {
    BASE64.encode(raw)
}

/// Inverse of [`encode_frame`].
pub fn decode_frame(text: &str) -> Result<Vec<u8>, CodecError> {
    BASE64
        .decode(text.trim())
        .map_err(|e| CodecError::Base64(e.to_string()))
}

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// Expand one G.711 mu-law byte to a 16-bit linear sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Compress one 16-bit linear sample to G.711 mu-law.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80u8
    } else {
        0
    };
    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7u8;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

pub fn decode_mulaw(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| mulaw_to_linear(b)).collect()
}

pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| linear_to_mulaw(s)).collect()
}

/// Convert s16le bytes to samples
pub fn linear16_from_bytes(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Convert samples to s16le bytes
pub fn linear16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Wrap mono 16-bit samples in a complete in-memory WAV file.
pub fn wav_from_samples(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, CodecError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer =
            hound::WavWriter::new(&mut buffer, spec).map_err(|e| CodecError::Wav(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| CodecError::Wav(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| CodecError::Wav(e.to_string()))?;
    }
    Ok(buffer.into_inner())
}

/// Read mono 16-bit samples and the sample rate back out of a WAV file.
pub fn samples_from_wav(bytes: &[u8]) -> Result<(Vec<i16>, u32), CodecError> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| CodecError::Wav(e.to_string()))?;
    let sample_rate = reader.spec().sample_rate;
    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CodecError::Wav(e.to_string()))?;
    Ok((samples, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frames: [&[u8]; 4] = [&[], &[0], &[0xFF, 0x00, 0x7F], &[1, 2, 3, 4, 5, 6, 7, 8, 9]];
        for frame in frames {
            assert_eq!(decode_frame(&encode_frame(frame)).unwrap(), frame);
        }

        let every_byte: Vec<u8> = (0..=255u8).cycle().take(4000).collect();
        assert_eq!(decode_frame(&encode_frame(&every_byte)).unwrap(), every_byte);
    }

    #[test]
    fn test_encoded_frame_is_json_safe() {
        let encoded = encode_frame(&[0x22, 0x5C, 0x0A, 0x00]);
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='));
    }

    #[test]
    fn test_decode_accepts_unpadded_text() {
        assert_eq!(decode_frame("AAA").unwrap(), vec![0, 0]);
        assert_eq!(decode_frame("AQI").unwrap(), vec![1, 2]);
        assert_eq!(decode_frame("AQI=").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        assert!(matches!(decode_frame("not base64!"), Err(CodecError::Base64(_))));
    }

    #[test]
    fn test_mulaw_reference_points() {
        assert_eq!(mulaw_to_linear(0xFF), 0);
        assert_eq!(mulaw_to_linear(0x7F), 0);
        assert_eq!(mulaw_to_linear(0x80), 32124);
        assert_eq!(mulaw_to_linear(0x00), -32124);
        assert_eq!(linear_to_mulaw(0), 0xFF);
    }

    #[test]
    fn test_mulaw_every_code_is_stable() {
        // Decoding and re-encoding any code yields the same level (0x7F and 0xFF
        // are both zero).
        for code in 0..=255u8 {
            let level = mulaw_to_linear(code);
            assert_eq!(mulaw_to_linear(linear_to_mulaw(level)), level, "code {code:#x}");
        }
    }

    #[test]
    fn test_mulaw_quantisation_error_is_bounded() {
        for sample in (-32000i16..32000).step_by(97) {
            let restored = mulaw_to_linear(linear_to_mulaw(sample)) as i32;
            let error = (restored - sample as i32).abs();
            // Step size grows with magnitude; error stays within ~1/16 of it.
            assert!(error <= (sample as i32).abs() / 16 + 8, "{sample} -> {restored}");
        }
    }

    #[test]
    fn test_linear16_bytes() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = linear16_to_bytes(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(linear16_from_bytes(&bytes).unwrap(), samples);
        assert_eq!(linear16_from_bytes(&[1, 2, 3]), Err(CodecError::OddLength(3)));
    }

    #[test]
    fn test_wav_framing() {
        let samples: Vec<i16> = (0..4000).map(|i| (i % 200) as i16 * 100).collect();
        let wav = wav_from_samples(&samples, 8000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), 44 + samples.len() * 2);

        let (restored, rate) = samples_from_wav(&wav).unwrap();
        assert_eq!(rate, 8000);
        assert_eq!(restored, samples);
    }
}
