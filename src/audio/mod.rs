//! Audio capture, format conversion, routing, and local playback

pub mod capture;
pub mod format;
pub mod output;
pub mod playback;

pub use capture::{CaptureUplink, MicrophoneSource};
pub use output::{AudioOutputRouter, Route};
pub use playback::{PlaybackQueue, SpeakerOutput};
