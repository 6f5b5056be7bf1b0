//! Real-time audio: devices, the playback ring and the two loops bridging
//! them to the transport.

pub mod capture_loop;
#[cfg(feature = "cpal-audio")]
pub mod cpal_backend;
pub mod device;
pub mod engine;
pub mod level;
pub mod playback_loop;
pub(crate) mod realtime;
pub mod ring_buffer;
pub mod wav;
