use dasp_sample::Sample;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::codec::{self, CodecError};
use crate::protocol::{AudioEncoding, AudioFormat};

/// Turns received frames into linear PCM at the playback device rate.
///
/// Kept behind a trait so the playback queue can be exercised with synthetic
/// buffers instead of real decoders.
pub trait PcmTranscoder: Send + Sync {
    fn decode_to_linear_pcm(&self, frame: &[u8], source: AudioFormat)
        -> Result<Vec<i16>, CodecError>;

    fn resample(&self, pcm: &[i16], from_rate: u32, to_rate: u32) -> Result<Vec<i16>, CodecError>;
}

/// Band-limited sinc resampler with cubic interpolation between the sinc tables.
#[derive(Debug)]
pub struct RubatoTranscoder {
    params: SincInterpolationParameters,
}

impl Default for RubatoTranscoder {
    fn default() -> Self {
        Self {
            params: SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Cubic,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            },
        }
    }
}

impl RubatoTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn copy_params(&self) -> SincInterpolationParameters {
        SincInterpolationParameters {
            sinc_len: self.params.sinc_len,
            f_cutoff: self.params.f_cutoff,
            interpolation: match self.params.interpolation {
                SincInterpolationType::Cubic => SincInterpolationType::Cubic,
                SincInterpolationType::Quadratic => SincInterpolationType::Quadratic,
                SincInterpolationType::Linear => SincInterpolationType::Linear,
                SincInterpolationType::Nearest => SincInterpolationType::Nearest,
            },
            oversampling_factor: self.params.oversampling_factor,
            window: self.params.window,
        }
    }
}

impl PcmTranscoder for RubatoTranscoder {
    fn decode_to_linear_pcm(
        &self,
        frame: &[u8],
        source: AudioFormat,
    ) -> Result<Vec<i16>, CodecError> {
        match source.encoding {
            AudioEncoding::Mulaw => Ok(codec::decode_mulaw(frame)),
            AudioEncoding::Linear16 => codec::linear16_from_bytes(frame),
        }
    }

    fn resample(&self, pcm: &[i16], from_rate: u32, to_rate: u32) -> Result<Vec<i16>, CodecError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(CodecError::Resample(format!(
                "invalid sample rates {} -> {}",
                from_rate, to_rate
            )));
        }
        if pcm.is_empty() || from_rate == to_rate {
            return Ok(pcm.to_vec());
        }

        let ratio = to_rate as f64 / from_rate as f64;
        // One zero-padded chunk covering the whole frame; frames are independent.
        let chunk = pcm.len().max(self.params.sinc_len);
        let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, self.copy_params(), chunk, 1)
            .map_err(|e| CodecError::Resample(e.to_string()))?;

        let mut input: Vec<f32> = pcm.iter().map(|s| s.to_sample::<f32>()).collect();
        input.resize(chunk, 0.0);
        let delay = resampler.output_delay();
        let expected = (pcm.len() as f64 * ratio).round() as usize;

        let mut output = resampler
            .process(&[input], None)
            .map_err(|e| CodecError::Resample(e.to_string()))?
            .remove(0);

        // Push silence through until the delayed tail of the frame is out.
        let per_flush = resampler.output_frames_next().max(1);
        let max_flushes = (delay + expected) / per_flush + 2;
        let mut flushes = 0;
        while output.len() < delay + expected {
            if flushes == max_flushes {
                return Err(CodecError::Resample(format!(
                    "resampler did not drain after {} flushes",
                    flushes
                )));
            }
            let tail = resampler
                .process_partial(None::<&[Vec<f32>]>, None)
                .map_err(|e| CodecError::Resample(e.to_string()))?;
            output.extend_from_slice(&tail[0]);
            flushes += 1;
        }

        Ok(output[delay..delay + expected]
            .iter()
            .map(|s| s.to_sample::<i16>())
            .collect())
    }
}
