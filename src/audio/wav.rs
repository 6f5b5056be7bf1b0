//! WAV file capture device: replays a recording as if it were the microphone.

use crate::audio::device::CaptureDevice;
use crate::error::{Result, VoicelinkError};
use std::io::Read;
use std::path::Path;
use std::time::Instant;

/// Capture device that plays back WAV data in real time.
///
/// Samples are mixed to mono and resampled to the session rate up front.
/// Reads release only as many samples as wall-clock time since `start`
/// allows, so the transport sees the same cadence as a live microphone.
pub struct WavFileSource {
    samples: Vec<i16>,
    position: usize,
    sample_rate: u32,
    started_at: Option<Instant>,
}

impl WavFileSource {
    /// Parse WAV data from any reader and convert it to `sample_rate` mono.
    pub fn from_reader(reader: impl Read, sample_rate: u32) -> Result<Self> {
        let mut wav_reader =
            hound::WavReader::new(reader).map_err(|e| VoicelinkError::AudioCapture {
                message: format!("Failed to parse WAV file: {}", e),
            })?;

        let spec = wav_reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(VoicelinkError::AudioCapture {
                message: format!(
                    "Unsupported WAV format: {} bit {:?} (PCM16 required)",
                    spec.bits_per_sample, spec.sample_format
                ),
            });
        }

        let raw_samples: Vec<i16> = wav_reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VoicelinkError::AudioCapture {
                message: format!("Failed to read WAV samples: {}", e),
            })?;

        let channels = spec.channels.max(1) as usize;
        let mono = downmix(&raw_samples, channels);
        let samples = resample(&mono, spec.sample_rate, sample_rate);

        Ok(Self {
            samples,
            position: 0,
            sample_rate,
            started_at: None,
        })
    }

    /// Open a WAV file from disk.
    pub fn open(path: &Path, sample_rate: u32) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| VoicelinkError::AudioDeviceNotFound {
            device: format!("{} ({})", path.display(), e),
        })?;
        Self::from_reader(std::io::BufReader::new(file), sample_rate)
    }

    /// Total samples after conversion.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when the file contained no audio.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl CaptureDevice for WavFileSource {
    fn start(&mut self) -> Result<()> {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started_at = None;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let Some(started_at) = self.started_at else {
            return Ok(Vec::new());
        };
        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        let due = ((elapsed_ms * self.sample_rate as u64) / 1000) as usize;
        let end = due.min(self.samples.len());
        if end <= self.position {
            return Ok(Vec::new());
        }
        let chunk = self.samples[self.position..end].to_vec();
        self.position = end;
        Ok(chunk)
    }
}

/// Average interleaved channels into mono.
fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Simple linear interpolation resampling.
pub(crate) fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn make_wav_data(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn mono_at_session_rate_is_unchanged() {
        let data = make_wav_data(16000, 1, &[100, 200, 300]);
        let source = WavFileSource::from_reader(Cursor::new(data), 16000).unwrap();
        assert_eq!(source.samples, vec![100, 200, 300]);
    }

    #[test]
    fn stereo_is_downmixed() {
        let data = make_wav_data(16000, 2, &[100, 300, -200, -400]);
        let source = WavFileSource::from_reader(Cursor::new(data), 16000).unwrap();
        assert_eq!(source.samples, vec![200, -300]);
    }

    #[test]
    fn resamples_48khz_to_16khz() {
        let data = make_wav_data(48000, 1, &vec![1000i16; 4800]);
        let source = WavFileSource::from_reader(Cursor::new(data), 16000).unwrap();
        assert_eq!(source.len(), 1600);
        assert!(source.samples.iter().all(|&s| s == 1000));
    }

    #[test]
    fn read_before_start_yields_nothing() {
        let data = make_wav_data(16000, 1, &[1; 1000]);
        let mut source = WavFileSource::from_reader(Cursor::new(data), 16000).unwrap();
        assert!(source.read_samples().unwrap().is_empty());
    }

    #[test]
    fn reads_are_paced_by_wall_clock() {
        let data = make_wav_data(16000, 1, &vec![7i16; 16000]);
        let mut source = WavFileSource::from_reader(Cursor::new(data), 16000).unwrap();
        source.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let first = source.read_samples().unwrap();
        // ~800 samples due after 50ms; far less than the whole second of audio
        assert!(!first.is_empty());
        assert!(first.len() < 8000, "released {} samples", first.len());
    }

    #[test]
    fn invalid_wav_data_returns_error() {
        let result = WavFileSource::from_reader(Cursor::new(b"not a wav".to_vec()), 16000);
        assert!(matches!(result, Err(VoicelinkError::AudioCapture { .. })));
    }

    #[test]
    fn missing_file_is_device_not_found() {
        let result = WavFileSource::open(Path::new("/nonexistent/voicelink.wav"), 16000);
        assert!(matches!(
            result,
            Err(VoicelinkError::AudioDeviceNotFound { .. })
        ));
    }

    #[test]
    fn resample_identity_same_rate() {
        assert_eq!(resample(&[1, 2, 3], 16000, 16000), vec![1, 2, 3]);
    }

    #[test]
    fn resample_upsample_doubles_length() {
        assert_eq!(resample(&[0, 100], 8000, 16000).len(), 4);
    }
}
