//! Capture loop: microphone → transport.

use crate::audio::device::CaptureDevice;
use crate::audio::level::{LevelMeter, pcm16_to_bytes};
use crate::audio::realtime::{Ticker, raise_thread_priority};
use crate::defaults;
use crate::error::VoicelinkError;
use crate::session::events::{EventEmitter, SessionEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Destination for captured frames.
///
/// Implementations must return immediately: frames that cannot be sent right
/// now are dropped, never queued without bound.
pub trait FrameSink: Send + Sync {
    /// Forward one frame of little-endian PCM16 mono audio.
    fn send_audio(&self, frame: &[u8]);
}

/// Sink that discards everything (engine started without a transport).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn send_audio(&self, _frame: &[u8]) {}
}

/// Counters shared by both audio loops, read by `AudioEngine::info`.
#[derive(Debug, Default)]
pub struct AudioStats {
    pub frames_captured: AtomicU64,
    pub frames_played: AtomicU64,
    pub underruns: AtomicU64,
}

/// State owned by the capture thread.
pub(crate) struct CaptureLoop {
    pub(crate) frame_samples: usize,
    pub(crate) frame_duration: Duration,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) muted: Arc<AtomicBool>,
    pub(crate) sink: Arc<dyn FrameSink>,
    pub(crate) events: EventEmitter,
    pub(crate) stats: Arc<AudioStats>,
    pub(crate) meter: LevelMeter,
    pending: Vec<i16>,
}

impl CaptureLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        frame_samples: usize,
        frame_duration: Duration,
        running: Arc<AtomicBool>,
        muted: Arc<AtomicBool>,
        sink: Arc<dyn FrameSink>,
        events: EventEmitter,
        stats: Arc<AudioStats>,
    ) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            frame_duration,
            running,
            muted,
            sink,
            events,
            stats,
            meter: LevelMeter::default(),
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Run until `running` is cleared or the device keeps failing.
    ///
    /// Returns the device so the engine can stop it after the join.
    pub(crate) fn run(mut self, mut device: Box<dyn CaptureDevice>) -> Box<dyn CaptureDevice> {
        raise_thread_priority("capture");
        let mut ticker = Ticker::new(self.frame_duration);
        let mut consecutive_errors: u32 = 0;

        while self.running.load(Ordering::Acquire) {
            match device.read_samples() {
                Ok(samples) => {
                    consecutive_errors = 0;
                    self.tick(samples);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= defaults::MAX_CONSECUTIVE_CAPTURE_ERRORS {
                        tracing::error!(
                            error = %e,
                            consecutive_errors,
                            "audio capture keeps failing, stopping capture loop"
                        );
                        self.events.error(
                            &VoicelinkError::AudioCapture {
                                message: format!(
                                    "capture failed {consecutive_errors} times in a row: {e}"
                                ),
                            },
                            true,
                        );
                        break;
                    }
                }
            }
            ticker.wait();
        }

        tracing::debug!(
            frames = self.stats.frames_captured.load(Ordering::Relaxed),
            "capture loop exited"
        );
        device
    }

    /// Process one read from the device.
    ///
    /// While muted the data is discarded so that unmuting never releases
    /// audio recorded during the mute.
    pub(crate) fn tick(&mut self, samples: Vec<i16>) {
        if self.muted.load(Ordering::Acquire) {
            self.pending.clear();
            return;
        }
        if samples.is_empty() {
            return;
        }

        self.pending.extend_from_slice(&samples);
        while self.pending.len() >= self.frame_samples {
            let frame: Vec<i16> = self.pending.drain(..self.frame_samples).collect();
            self.sink.send_audio(&pcm16_to_bytes(&frame));
            self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
            self.events.emit(SessionEvent::AudioLevel {
                level: self.meter.measure(&frame),
                is_input: true,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::MockCaptureDevice;
    use std::sync::Mutex;
    use std::thread;

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl FrameSink for CollectingSink {
        fn send_audio(&self, frame: &[u8]) {
            self.frames.lock().unwrap().push(frame.to_vec());
        }
    }

    fn make_loop(
        frame_samples: usize,
        muted: bool,
    ) -> (
        CaptureLoop,
        Arc<CollectingSink>,
        crossbeam_channel::Receiver<SessionEvent>,
    ) {
        let sink = Arc::new(CollectingSink::default());
        let (events, rx) = EventEmitter::channel(1024);
        let capture = CaptureLoop::new(
            frame_samples,
            Duration::from_millis(2),
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(muted)),
            sink.clone(),
            events,
            Arc::new(AudioStats::default()),
        );
        (capture, sink, rx)
    }

    #[test]
    fn test_slices_reads_into_exact_frames() {
        let (mut capture, sink, rx) = make_loop(4, false);
        capture.tick(vec![1, 2, 3]);
        assert!(sink.frames.lock().unwrap().is_empty());

        capture.tick(vec![4, 5, 6, 7, 8, 9]);
        let frames = sink.frames.lock().unwrap().clone();
        assert_eq!(
            frames,
            vec![
                pcm16_to_bytes(&[1, 2, 3, 4]),
                pcm16_to_bytes(&[5, 6, 7, 8]),
            ]
        );
        assert_eq!(capture.stats.frames_captured.load(Ordering::Relaxed), 2);

        let levels: Vec<_> = rx.try_iter().collect();
        assert_eq!(levels.len(), 2);
        assert!(levels.iter().all(|e| matches!(
            e,
            SessionEvent::AudioLevel { is_input: true, .. }
        )));
    }

    #[test]
    fn test_muted_forwards_nothing_and_discards_pending() {
        let (mut capture, sink, rx) = make_loop(4, false);
        capture.tick(vec![1, 2]);
        capture.muted.store(true, Ordering::Release);
        capture.tick(vec![3, 4, 5, 6]);
        assert!(sink.frames.lock().unwrap().is_empty());
        assert_eq!(rx.try_iter().count(), 0);

        capture.muted.store(false, Ordering::Release);
        capture.tick(vec![10, 11, 12, 13]);
        assert_eq!(
            sink.frames.lock().unwrap().clone(),
            vec![pcm16_to_bytes(&[10, 11, 12, 13])]
        );
    }

    #[test]
    fn test_run_stops_when_flag_cleared() {
        let (capture, sink, _rx) = make_loop(320, false);
        let running = capture.running.clone();
        let device = MockCaptureDevice::new().with_samples(vec![100; 320]);
        let stats = device.stats();

        let handle = thread::spawn(move || capture.run(Box::new(device)));
        thread::sleep(Duration::from_millis(30));
        running.store(false, Ordering::Release);
        handle.join().unwrap();

        assert!(stats.reads.load(Ordering::Relaxed) > 0);
        assert!(!sink.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_run_bails_out_after_repeated_read_errors() {
        let (capture, sink, rx) = make_loop(320, false);
        let device = MockCaptureDevice::new().with_read_failure();

        let handle = thread::spawn(move || capture.run(Box::new(device)));
        handle.join().unwrap();

        assert!(sink.frames.lock().unwrap().is_empty());
        let fatal = rx.try_iter().find(|e| matches!(e, SessionEvent::Error { .. }));
        match fatal {
            Some(SessionEvent::Error { code, is_fatal, .. }) => {
                assert_eq!(code, "audio_capture");
                assert!(is_fatal);
            }
            other => panic!("Expected fatal capture error, got {:?}", other),
        }
    }
}
