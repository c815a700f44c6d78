use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// One instance is owned by exactly one pipeline, so `detect` takes `&mut self`
/// and backends may keep per-camera state (previous frame, tracker, ...).
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// An error is a per-frame failure; the caller treats it as zero detections.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once when the backend is opened.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the backend. Called exactly once when the owning pipeline exits.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens a detector for a model reference.
pub trait DetectorOpener: Send + Sync {
    fn open(&self, model_ref: &str) -> Result<Box<dyn DetectorBackend>>;
}
