//! Audio processing: codec conversion, resampling, framing and VAD.

pub mod codec;
pub mod vad;

use serde::{Deserialize, Serialize};

pub use codec::{
    alaw_to_pcm16, chunk_by_ms, convert_pcm16_to, pcm16_to_ulaw, ulaw_to_pcm16, FrameBuffer,
    Resampler,
};
pub use vad::{EnergyVad, Utterance, UtteranceDetector, VadError, VadMode};

/// Wire encodings the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// G.711 µ-law, 1 byte per sample.
    Ulaw,
    /// G.711 A-law, 1 byte per sample. Decoded inbound only.
    Alaw,
    /// Signed 16-bit little-endian PCM, 2 bytes per sample.
    Pcm16,
}

impl AudioEncoding {
    /// Bytes per sample for this encoding.
    pub const fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Ulaw | Self::Alaw => 1,
            Self::Pcm16 => 2,
        }
    }

    /// Short identifier as used in configuration and ARI format strings.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ulaw => "ulaw",
            Self::Alaw => "alaw",
            Self::Pcm16 => "slin16",
        }
    }
}

/// Black-box inbound audio filter seam (noise suppression, echo
/// cancellation). Concrete DSP lives outside this crate; the default
/// passthrough keeps the pump's call shape stable.
pub trait AudioFilter: Send + Sync {
    /// Filters one PCM16 frame in place.
    fn process(&self, frame: &mut [i16]);
}

/// Identity filter used when no DSP chain is configured.
pub struct PassthroughFilter;

impl AudioFilter for PassthroughFilter {
    fn process(&self, _frame: &mut [i16]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_sample_by_encoding() {
        assert_eq!(AudioEncoding::Ulaw.bytes_per_sample(), 1);
        assert_eq!(AudioEncoding::Alaw.bytes_per_sample(), 1);
        assert_eq!(AudioEncoding::Pcm16.bytes_per_sample(), 2);
    }

    #[test]
    fn passthrough_filter_leaves_samples_untouched() {
        let mut frame: Vec<i16> = vec![100, -200, 300, i16::MAX, i16::MIN];
        let original = frame.clone();
        PassthroughFilter.process(&mut frame);
        assert_eq!(frame, original);
    }

    #[test]
    fn custom_filters_mutate_frames_in_place() {
        struct HalfGain;
        impl AudioFilter for HalfGain {
            fn process(&self, frame: &mut [i16]) {
                for sample in frame {
                    *sample /= 2;
                }
            }
        }

        let mut frame: Vec<i16> = vec![1000, -1000, 500];
        HalfGain.process(&mut frame);
        assert_eq!(frame, vec![500, -500, 250]);
    }
}
