//! Frame ingestion sources.
//!
//! A pipeline owns exactly one `FrameSource`, obtained from a `SourceOpener` when
//! the camera is started and closed exactly once when the pipeline exits.
//!
//! - RTSP streams (IP cameras, feature: rtsp-gstreamer)
//! - Synthetic `stub://` scenes (always available)

pub mod rtsp;

use anyhow::Result;

use crate::frame::Frame;

pub use rtsp::{RtspConfig, RtspOpener, RtspSource};

/// An open stream handle.
pub trait FrameSource: Send {
    /// Locator this source was opened with.
    fn locator(&self) -> &str;

    /// Read the next frame.
    ///
    /// An error means no frame was available this time (stall, decode hiccup,
    /// reconnect in progress). Callers retry after a backoff; it is never fatal.
    /// An empty `Frame` is a valid "nothing decoded" result and is skipped.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Release the stream. Called exactly once when the owning pipeline exits.
    fn close(&mut self) -> Result<()>;
}

/// Opens a `FrameSource` for a stream locator.
///
/// An error here is an acquisition failure: the camera is not started.
pub trait SourceOpener: Send + Sync {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>>;
}
