//! Loudness metering for capture and playback frames.

/// Computes RMS of 16-bit PCM samples, normalized to 0.0..=1.0.
///
/// - 0.0 represents silence
/// - ~0.707 represents a full-scale sine wave
/// - 1.0 represents maximum amplitude
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    (mean_square.sqrt() as f32).min(1.0)
}

/// Decodes little-endian PCM16 bytes into samples. A trailing odd byte is ignored.
pub fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encodes samples as little-endian PCM16 bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Normalized loudness meter.
///
/// Speech RMS rarely exceeds ~0.3 of full scale, so the raw RMS is scaled by
/// `gain` and clamped to keep meters readable.
#[derive(Debug, Clone, Copy)]
pub struct LevelMeter {
    gain: f32,
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self { gain: 1.0 }
    }
}

impl LevelMeter {
    /// Meter with a custom display gain (values <= 0 fall back to 1.0).
    pub fn with_gain(gain: f32) -> Self {
        let gain = if gain > 0.0 && gain.is_finite() {
            gain
        } else {
            1.0
        };
        Self { gain }
    }

    /// Level of a frame of samples in 0.0..=1.0.
    pub fn measure(&self, samples: &[i16]) -> f32 {
        (calculate_rms(samples) * self.gain).clamp(0.0, 1.0)
    }

    /// Level of a frame of little-endian PCM16 bytes in 0.0..=1.0.
    pub fn measure_bytes(&self, bytes: &[u8]) -> f32 {
        if bytes.len() < 2 {
            return 0.0;
        }
        let mut sum_squares = 0.0f64;
        let mut n = 0usize;
        for pair in bytes.chunks_exact(2) {
            let normalized = i16::from_le_bytes([pair[0], pair[1]]) as f64 / i16::MAX as f64;
            sum_squares += normalized * normalized;
            n += 1;
        }
        let rms = (sum_squares / n as f64).sqrt() as f32;
        (rms * self.gain).clamp(0.0, 1.0)
    }
}
