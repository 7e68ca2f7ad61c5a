//! Voice activity detection and utterance assembly.
//!
//! The frame-level detector is RMS energy thresholding over PCM16 frames;
//! [`UtteranceDetector`] wraps it with pre-roll buffering and debounced
//! start/end transitions so the coordinator receives whole utterances.

use std::collections::VecDeque;

use thiserror::Error;

use super::codec::pcm16_bytes_to_samples;

/// Frame durations the detector accepts, in milliseconds.
const VALID_FRAME_MS: [u64; 3] = [10, 20, 30];

/// How many frames of audio to keep ahead of a detected speech start.
const PRE_ROLL_FRAMES: usize = 10;

/// Errors from frame-level VAD.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VadError {
    /// Frame length does not correspond to 10, 20 or 30 ms at the given rate.
    #[error("invalid VAD frame: {bytes} bytes at {sample_rate} Hz")]
    InvalidFrame { bytes: usize, sample_rate: u32 },
}

/// Detector operating point, trading missed speech against noise triggers.
///
/// Later modes demand more energy before a frame counts as speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VadMode {
    /// Most sensitive; accepts quiet speech at the cost of noise triggers.
    Quality,
    #[default]
    LowBitrate,
    Aggressive,
    /// Least sensitive; only confident speech passes.
    VeryAggressive,
}

impl VadMode {
    /// RMS energy threshold on the i16 sample scale.
    fn energy_threshold(&self) -> f64 {
        match self {
            Self::Quality => 200.0,
            Self::LowBitrate => 320.0,
            Self::Aggressive => 500.0,
            Self::VeryAggressive => 750.0,
        }
    }
}

/// Frame-level speech/silence decision by RMS energy.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    mode: VadMode,
}

impl EnergyVad {
    pub fn new(mode: VadMode) -> Self {
        Self { mode }
    }

    /// Decides whether one PCM16 frame contains speech.
    ///
    /// The frame must be exactly 10, 20 or 30 ms at `sample_rate`.
    pub fn is_speech(&self, frame: &[u8], sample_rate: u32) -> Result<bool, VadError> {
        if sample_rate == 0 || frame.len() % 2 != 0 {
            return Err(VadError::InvalidFrame {
                bytes: frame.len(),
                sample_rate,
            });
        }
        let samples = frame.len() / 2;
        let valid = VALID_FRAME_MS
            .iter()
            .any(|ms| (sample_rate as u64 * ms / 1000) as usize == samples);
        if !valid {
            return Err(VadError::InvalidFrame {
                bytes: frame.len(),
                sample_rate,
            });
        }

        Ok(rms_energy(&pcm16_bytes_to_samples(frame)) > self.mode.energy_threshold())
    }
}

/// RMS energy of a PCM16 frame on the i16 sample scale.
fn rms_energy(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_squares / samples.len() as f64).sqrt()
}

/// Assembler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorState {
    /// Accumulating pre-roll, waiting for sustained speech.
    Listening,
    /// Appending frames to the current utterance.
    Speaking,
}

/// A complete caller utterance delimited by the VAD.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Monotonic per-call utterance number, starting at 1.
    pub id: u64,
    /// PCM16 audio: pre-roll plus the voiced segment.
    pub audio: Vec<u8>,
    /// Duration of the audio in milliseconds.
    pub duration_ms: u64,
}

/// Turns a stream of PCM16 bytes into discrete utterances.
///
/// Arbitrary byte pushes are reframed internally; a partial frame at the
/// tail is kept for the next push. All buffers and counters reset when TTS
/// gating activates so the agent never hears itself.
#[derive(Debug)]
pub struct UtteranceDetector {
    vad: EnergyVad,
    sample_rate: u32,
    frame_ms: u64,
    frame_bytes: usize,
    /// Consecutive speech frames required to open an utterance.
    start_frames: u32,
    /// Consecutive silence frames required to close it.
    end_frames: u32,

    state: DetectorState,
    speech_count: u32,
    silence_count: u32,
    pre_roll: VecDeque<Vec<u8>>,
    utterance: Vec<u8>,
    tail: Vec<u8>,
    utterance_id: u64,
    /// Millisecond timestamp (monotonic frames processed) of the last
    /// utterance end.
    last_utterance_end_ms: u64,
    frames_processed: u64,
}

impl UtteranceDetector {
    pub fn new(mode: VadMode, sample_rate: u32, frame_ms: u64) -> Self {
        Self::with_debounce(mode, sample_rate, frame_ms, 3, 3)
    }

    pub fn with_debounce(
        mode: VadMode,
        sample_rate: u32,
        frame_ms: u64,
        start_frames: u32,
        end_frames: u32,
    ) -> Self {
        let frame_bytes = (sample_rate as u64 * frame_ms / 1000) as usize * 2;
        Self {
            vad: EnergyVad::new(mode),
            sample_rate,
            frame_ms,
            frame_bytes,
            start_frames: start_frames.max(1),
            end_frames: end_frames.max(1),
            state: DetectorState::Listening,
            speech_count: 0,
            silence_count: 0,
            pre_roll: VecDeque::with_capacity(PRE_ROLL_FRAMES),
            utterance: Vec::new(),
            tail: Vec::new(),
            utterance_id: 0,
            last_utterance_end_ms: 0,
            frames_processed: 0,
        }
    }

    /// Feeds PCM16 bytes in; returns any utterances completed by this push.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Utterance>, VadError> {
        self.tail.extend_from_slice(data);

        let mut emitted = Vec::new();
        while self.tail.len() >= self.frame_bytes {
            let rest = self.tail.split_off(self.frame_bytes);
            let frame = std::mem::replace(&mut self.tail, rest);
            if let Some(utterance) = self.process_frame(frame)? {
                emitted.push(utterance);
            }
        }
        Ok(emitted)
    }

    fn process_frame(&mut self, frame: Vec<u8>) -> Result<Option<Utterance>, VadError> {
        let is_speech = self.vad.is_speech(&frame, self.sample_rate)?;
        self.frames_processed += 1;

        match self.state {
            DetectorState::Listening => {
                if self.pre_roll.len() == PRE_ROLL_FRAMES {
                    self.pre_roll.pop_front();
                }
                self.pre_roll.push_back(frame);

                if is_speech {
                    self.speech_count += 1;
                    if self.speech_count >= self.start_frames {
                        self.state = DetectorState::Speaking;
                        self.silence_count = 0;
                        self.utterance = self
                            .pre_roll
                            .drain(..)
                            .flatten()
                            .collect();
                        log::debug!(
                            "[VAD] Speech started after {} consecutive frames",
                            self.speech_count
                        );
                    }
                } else {
                    self.speech_count = 0;
                }
                Ok(None)
            }
            DetectorState::Speaking => {
                self.utterance.extend_from_slice(&frame);

                if is_speech {
                    self.silence_count = 0;
                    Ok(None)
                } else {
                    self.silence_count += 1;
                    if self.silence_count >= self.end_frames {
                        Ok(Some(self.finish_utterance()))
                    } else {
                        Ok(None)
                    }
                }
            }
        }
    }

    fn finish_utterance(&mut self) -> Utterance {
        self.utterance_id += 1;
        let audio = std::mem::take(&mut self.utterance);
        let duration_ms = (audio.len() / 2) as u64 * 1000 / u64::from(self.sample_rate);

        self.state = DetectorState::Listening;
        self.speech_count = 0;
        self.silence_count = 0;
        self.pre_roll.clear();
        self.last_utterance_end_ms = self.frames_processed * self.frame_ms;

        log::debug!(
            "[VAD] Utterance {} complete: {} ms",
            self.utterance_id,
            duration_ms
        );

        Utterance {
            id: self.utterance_id,
            audio,
            duration_ms,
        }
    }

    /// Clears all counters and buffers, including the partial-frame tail.
    ///
    /// Called when TTS gating activates so buffered agent audio cannot leak
    /// into the next utterance.
    pub fn reset(&mut self) {
        self.state = DetectorState::Listening;
        self.speech_count = 0;
        self.silence_count = 0;
        self.pre_roll.clear();
        self.utterance.clear();
        self.tail.clear();
    }

    /// Whether the detector currently considers the caller to be speaking.
    pub fn is_speaking(&self) -> bool {
        self.state == DetectorState::Speaking
    }

    /// Millisecond offset (in processed audio time) of the last utterance end.
    pub fn last_utterance_end_ms(&self) -> u64 {
        self.last_utterance_end_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::pcm16_samples_to_bytes;

    const RATE: u32 = 16_000;
    const FRAME_MS: u64 = 20;

    fn frame(amplitude: i16) -> Vec<u8> {
        let samples: Vec<i16> = (0..(RATE as u64 * FRAME_MS / 1000))
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        pcm16_samples_to_bytes(&samples)
    }

    fn speech() -> Vec<u8> {
        frame(4000)
    }

    fn silence() -> Vec<u8> {
        frame(0)
    }

    #[test]
    fn frame_level_decisions() {
        let vad = EnergyVad::new(VadMode::LowBitrate);
        assert!(vad.is_speech(&speech(), RATE).unwrap());
        assert!(!vad.is_speech(&silence(), RATE).unwrap());
    }

    #[test]
    fn wrong_frame_size_is_an_error() {
        let vad = EnergyVad::new(VadMode::LowBitrate);
        assert!(matches!(
            vad.is_speech(&[0u8; 100], RATE),
            Err(VadError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn more_aggressive_modes_need_more_energy() {
        let borderline = frame(400);
        assert!(EnergyVad::new(VadMode::Quality)
            .is_speech(&borderline, RATE)
            .unwrap());
        assert!(!EnergyVad::new(VadMode::VeryAggressive)
            .is_speech(&borderline, RATE)
            .unwrap());
    }

    #[test]
    fn exactly_n_speech_frames_open_an_utterance() {
        let mut det = UtteranceDetector::new(VadMode::LowBitrate, RATE, FRAME_MS);

        det.push(&speech()).unwrap();
        det.push(&speech()).unwrap();
        assert!(!det.is_speaking(), "two frames must not transition");

        det.push(&speech()).unwrap();
        assert!(det.is_speaking(), "third consecutive frame must transition");
    }

    #[test]
    fn interrupted_speech_resets_the_start_counter() {
        let mut det = UtteranceDetector::new(VadMode::LowBitrate, RATE, FRAME_MS);

        det.push(&speech()).unwrap();
        det.push(&speech()).unwrap();
        det.push(&silence()).unwrap();
        det.push(&speech()).unwrap();
        det.push(&speech()).unwrap();
        assert!(!det.is_speaking());
    }

    #[test]
    fn exactly_m_silence_frames_close_an_utterance() {
        let mut det = UtteranceDetector::new(VadMode::LowBitrate, RATE, FRAME_MS);

        for _ in 0..5 {
            det.push(&speech()).unwrap();
        }
        assert!(det.push(&silence()).unwrap().is_empty());
        assert!(det.push(&silence()).unwrap().is_empty());

        let emitted = det.push(&silence()).unwrap();
        assert_eq!(emitted.len(), 1);
        assert!(!det.is_speaking());
    }

    #[test]
    fn utterance_contains_pre_roll_and_trailing_silence() {
        let mut det = UtteranceDetector::new(VadMode::LowBitrate, RATE, FRAME_MS);
        let frame_bytes = speech().len();

        // Two silence frames of pre-roll, five speech, three closing silence.
        det.push(&silence()).unwrap();
        det.push(&silence()).unwrap();
        for _ in 0..5 {
            det.push(&speech()).unwrap();
        }
        let mut utterances = Vec::new();
        for _ in 0..3 {
            utterances.extend(det.push(&silence()).unwrap());
        }

        assert_eq!(utterances.len(), 1);
        let utterance = &utterances[0];
        assert_eq!(utterance.id, 1);
        assert_eq!(utterance.audio.len(), 10 * frame_bytes);
        assert_eq!(utterance.duration_ms, 10 * FRAME_MS);
    }

    #[test]
    fn partial_tail_is_kept_for_the_next_push() {
        let mut det = UtteranceDetector::new(VadMode::LowBitrate, RATE, FRAME_MS);
        let frame = speech();
        let (a, b) = frame.split_at(frame.len() / 2);

        det.push(a).unwrap();
        det.push(b).unwrap();
        det.push(&frame).unwrap();
        det.push(&frame).unwrap();
        assert!(det.is_speaking(), "split frames must still count");
    }

    #[test]
    fn reset_clears_progress_and_buffers() {
        let mut det = UtteranceDetector::new(VadMode::LowBitrate, RATE, FRAME_MS);

        for _ in 0..4 {
            det.push(&speech()).unwrap();
        }
        assert!(det.is_speaking());

        det.reset();
        assert!(!det.is_speaking());

        // Needs the full start debounce again after a reset.
        det.push(&speech()).unwrap();
        det.push(&speech()).unwrap();
        assert!(!det.is_speaking());
        det.push(&speech()).unwrap();
        assert!(det.is_speaking());
    }

    #[test]
    fn consecutive_utterances_get_increasing_ids() {
        let mut det = UtteranceDetector::new(VadMode::LowBitrate, RATE, FRAME_MS);

        let mut all = Vec::new();
        for _ in 0..2 {
            for _ in 0..4 {
                all.extend(det.push(&speech()).unwrap());
            }
            for _ in 0..3 {
                all.extend(det.push(&silence()).unwrap());
            }
        }

        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, 1);
        assert_eq!(all[1].id, 2);
    }
}
