//! Barge-in detection over inbound PCM frames.
//!
//! While the assistant is thinking or speaking, inbound audio is watched for
//! sustained voice activity. A single loud frame (cough, door slam) must not
//! cancel an in-flight response, so energy has to persist `sustain_ms` before
//! the detector reports a deliberate barge-in. The sustain window is the
//! tunable; there is no single correct value upstream.

/// Tunables for barge-in detection.
#[derive(Debug, Clone)]
pub struct BargeInConfig {
    /// RMS (normalized to -1.0..1.0) above this counts as voiced.
    pub rms_threshold: f32,
    /// Voiced audio must persist this long to count as deliberate speech.
    pub sustain_ms: u64,
    /// Sample rate of inbound PCM16 frames.
    pub sample_rate: u32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            rms_threshold: 0.015,
            sustain_ms: 300,
            sample_rate: 16_000,
        }
    }
}

/// Accumulates voiced milliseconds across frames; silence resets the run.
#[derive(Debug)]
pub struct BargeInDetector {
    config: BargeInConfig,
    voiced_ms: f32,
}

impl BargeInDetector {
    pub fn new(config: BargeInConfig) -> Self {
        Self {
            config,
            voiced_ms: 0.0,
        }
    }

    /// Feed one PCM16LE frame. Returns true once sustained voice activity
    /// crosses the configured threshold. Callers reset after acting on it.
    pub fn observe(&mut self, frame: &[u8]) -> bool {
        let samples = pcm16_bytes_to_i16(frame);
        if samples.is_empty() {
            return false;
        }
        let frame_ms = (samples.len() as f32 * 1000.0) / self.config.sample_rate as f32;
        if rms(&samples) >= self.config.rms_threshold {
            self.voiced_ms += frame_ms;
        } else {
            self.voiced_ms = 0.0;
        }
        self.voiced_ms >= self.config.sustain_ms as f32
    }

    /// Clear accumulated voice activity (state change or interruption handled).
    pub fn reset(&mut self) {
        self.voiced_ms = 0.0;
    }
}

/// Little-endian PCM16 bytes to samples; a trailing odd byte is dropped.
pub fn pcm16_bytes_to_i16(payload: &[u8]) -> Vec<i16> {
    payload
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Root mean square of PCM16 samples, normalized to -1.0..1.0.
fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let x = s as f64 / i16::MAX as f64;
            x * x
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 30ms frame at 16kHz with every sample at the given amplitude.
    fn frame(amplitude: i16) -> Vec<u8> {
        std::iter::repeat(amplitude.to_le_bytes())
            .take(480)
            .flatten()
            .collect()
    }

    fn detector(sustain_ms: u64) -> BargeInDetector {
        BargeInDetector::new(BargeInConfig {
            sustain_ms,
            ..BargeInConfig::default()
        })
    }

    #[test]
    fn silence_never_triggers() {
        let mut d = detector(90);
        for _ in 0..100 {
            assert!(!d.observe(&frame(0)));
        }
    }

    #[test]
    fn single_loud_frame_is_not_barge_in() {
        let mut d = detector(90);
        assert!(!d.observe(&frame(8000)));
    }

    #[test]
    fn sustained_speech_triggers_after_sustain_window() {
        let mut d = detector(90);
        assert!(!d.observe(&frame(8000))); // 30ms
        assert!(!d.observe(&frame(8000))); // 60ms
        assert!(d.observe(&frame(8000))); // 90ms
    }

    #[test]
    fn silence_resets_the_voiced_run() {
        let mut d = detector(90);
        d.observe(&frame(8000));
        d.observe(&frame(8000));
        d.observe(&frame(0)); // reset
        assert!(!d.observe(&frame(8000)));
        assert!(!d.observe(&frame(8000)));
        assert!(d.observe(&frame(8000)));
    }

    #[test]
    fn pcm_decode_drops_trailing_odd_byte() {
        let samples = pcm16_bytes_to_i16(&[0x00, 0x10, 0xFF]);
        assert_eq!(samples, vec![0x1000]);
    }
}
