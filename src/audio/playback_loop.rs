//! Playback loop: ring buffer → speaker.

use crate::audio::capture_loop::AudioStats;
use crate::audio::device::RenderDevice;
use crate::audio::level::LevelMeter;
use crate::audio::realtime::{Ticker, raise_thread_priority};
use crate::audio::ring_buffer::RingBuffer;
use crate::session::events::{EventEmitter, SessionEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// State owned by the playback thread.
pub(crate) struct PlaybackLoop {
    frame_duration: Duration,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) muted: Arc<AtomicBool>,
    ring: Arc<RingBuffer>,
    events: EventEmitter,
    pub(crate) stats: Arc<AudioStats>,
    meter: LevelMeter,
    bytes: Vec<u8>,
    samples: Vec<i16>,
    render_failing: bool,
}

impl PlaybackLoop {
    pub(crate) fn new(
        frame_samples: usize,
        frame_duration: Duration,
        running: Arc<AtomicBool>,
        muted: Arc<AtomicBool>,
        ring: Arc<RingBuffer>,
        events: EventEmitter,
        stats: Arc<AudioStats>,
    ) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_duration,
            running,
            muted,
            ring,
            events,
            stats,
            meter: LevelMeter::default(),
            bytes: vec![0u8; frame_samples * 2],
            samples: vec![0i16; frame_samples],
            render_failing: false,
        }
    }

    /// Run until `running` is cleared. Returns the device for the engine to stop.
    pub(crate) fn run(mut self, mut device: Box<dyn RenderDevice>) -> Box<dyn RenderDevice> {
        raise_thread_priority("playback");
        let mut ticker = Ticker::new(self.frame_duration);

        while self.running.load(Ordering::Acquire) {
            self.tick(device.as_mut());
            ticker.wait();
        }

        tracing::debug!(
            frames = self.stats.frames_played.load(Ordering::Relaxed),
            underruns = self.stats.underruns.load(Ordering::Relaxed),
            "playback loop exited"
        );
        device
    }

    /// Render exactly one frame. Never blocks beyond one ring-buffer copy.
    ///
    /// Speaker-muted ticks write silence and leave the ring untouched.
    /// An underrun pads the frame with silence.
    pub(crate) fn tick(&mut self, device: &mut dyn RenderDevice) {
        if self.muted.load(Ordering::Acquire) {
            self.samples.fill(0);
            self.write(device);
            return;
        }

        let filled = self.ring.read_into(&mut self.bytes);
        if filled < self.bytes.len() {
            self.stats.underruns.fetch_add(1, Ordering::Relaxed);
        }
        for (sample, pair) in self.samples.iter_mut().zip(self.bytes.chunks_exact(2)) {
            *sample = i16::from_le_bytes([pair[0], pair[1]]);
        }

        self.write(device);
        self.stats.frames_played.fetch_add(1, Ordering::Relaxed);
        self.events.emit(SessionEvent::AudioLevel {
            level: self.meter.measure(&self.samples),
            is_input: false,
        });
    }

    fn write(&mut self, device: &mut dyn RenderDevice) {
        match device.write_samples(&self.samples) {
            Ok(()) => self.render_failing = false,
            Err(e) => {
                if !self.render_failing {
                    tracing::warn!(error = %e, "render device write failed");
                }
                self.render_failing = true;
            }
        }
    }
}
