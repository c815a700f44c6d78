//! Per-camera processing loop.
//!
//! One `CameraPipeline` runs on its own thread per started camera:
//!
//! 1. Check for a stop request (exit and release handles).
//! 2. Read a frame; on a read failure log, back off, retry.
//! 3. Skip empty frames.
//! 4. Count the frame; only every Nth frame goes on to detection.
//! 5. Detect; a detector error counts as zero detections.
//! 6. Annotate, build one alert per region, queue them without waiting.
//! 7. Sleep off whatever is left of the frame interval.
//!
//! The loop is the only writer of `running`. It flips it on at activation and
//! off after both handles have been closed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

use crate::alert::{Alert, AlertQueue};
use crate::camera::Camera;
use crate::detect::DetectorBackend;
use crate::frame::{Frame, SNAPSHOT_JPEG_QUALITY};
use crate::ingest::FrameSource;

pub const DEFAULT_TARGET_FPS: u32 = 30;
pub const DEFAULT_FRAME_SKIP: u32 = 1;
pub const DEFAULT_SNAPSHOT_EVERY: u32 = 30;
pub const DEFAULT_READ_BACKOFF: Duration = Duration::from_secs(1);

/// Tuning shared by every pipeline a supervisor starts.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Target processing cadence. 0 disables pacing.
    pub target_fps: u32,
    /// Run detection on 1 of every N counted frames.
    pub frame_skip: u32,
    /// Attach a snapshot on every Nth frame passed to detection.
    pub snapshot_every: u32,
    /// Pause after a failed read.
    pub read_backoff: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            frame_skip: DEFAULT_FRAME_SKIP,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
            read_backoff: DEFAULT_READ_BACKOFF,
        }
    }
}

impl PipelineSettings {
    pub fn frame_interval(&self) -> Option<Duration> {
        if self.target_fps == 0 {
            None
        } else {
            Some(Duration::from_secs(1) / self.target_fps)
        }
    }
}

/// Runtime state of one pipeline, guarded by its own lock.
#[derive(Clone, Debug, Default)]
pub struct PipelineState {
    /// True while the loop thread is active.
    pub running: bool,
    /// Set by the supervisor; observed by the loop at the top of each iteration.
    pub stop_requested: bool,
    pub target_fps: u32,
    pub frame_skip: u32,
    /// Successfully read, non-empty frames since start.
    pub frame_count: u64,
    /// Frames passed to the detector.
    pub frames_processed: u64,
    pub read_failures: u64,
    pub alerts_queued: u64,
}

pub(crate) type SharedState = Arc<Mutex<PipelineState>>;

pub(crate) fn new_state(settings: &PipelineSettings) -> SharedState {
    Arc::new(Mutex::new(PipelineState {
        target_fps: settings.target_fps,
        frame_skip: settings.frame_skip.max(1),
        ..PipelineState::default()
    }))
}

pub(crate) fn lock_state(state: &SharedState) -> Result<MutexGuard<'_, PipelineState>> {
    state
        .lock()
        .map_err(|_| anyhow!("pipeline state lock poisoned"))
}

pub(crate) struct CameraPipeline {
    camera: Camera,
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    state: SharedState,
    settings: PipelineSettings,
    alerts: AlertQueue,
}

impl CameraPipeline {
    pub(crate) fn new(
        camera: Camera,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        state: SharedState,
        settings: PipelineSettings,
        alerts: AlertQueue,
    ) -> Self {
        Self {
            camera,
            source,
            detector,
            state,
            settings,
            alerts,
        }
    }

    /// Close both handles without running. Used when the loop never started.
    pub(crate) fn discard(mut self) -> Result<()> {
        self.release()
    }

    /// Launch `run` on a thread from `builder`.
    ///
    /// The pipeline is handed to the thread only once it exists, so a failed
    /// spawn still closes both handles.
    pub(crate) fn spawn(self, builder: Builder) -> Result<JoinHandle<Result<()>>> {
        let camera_id = self.camera.id.clone();
        let (tx, rx) = crossbeam_channel::bounded::<CameraPipeline>(1);
        let worker = match builder.spawn(move || match rx.recv() {
            Ok(pipeline) => pipeline.run(),
            Err(_) => Ok(()),
        }) {
            Ok(worker) => worker,
            Err(err) => {
                if let Err(release_err) = self.discard() {
                    log::warn!(
                        "camera {}: releasing unspawned pipeline: {:#}",
                        camera_id,
                        release_err
                    );
                }
                return Err(anyhow::Error::new(err).context("spawn pipeline thread"));
            }
        };

        if let Err(returned) = tx.send(self) {
            let _ = worker.join();
            if let Err(release_err) = returned.into_inner().discard() {
                log::warn!(
                    "camera {}: releasing unspawned pipeline: {:#}",
                    camera_id,
                    release_err
                );
            }
            return Err(anyhow!(
                "pipeline thread exited before taking over camera {}",
                camera_id
            ));
        }
        Ok(worker)
    }

    /// Run until a stop is requested, then release both handles.
    ///
    /// Returns the release outcome. A loop failure or panic is logged, never
    /// propagated: it only ends this camera's processing.
    pub(crate) fn run(mut self) -> Result<()> {
        log::info!(
            "camera {}: pipeline started ({} fps, frame skip {})",
            self.camera.id,
            self.settings.target_fps,
            self.settings.frame_skip
        );

        match panic::catch_unwind(AssertUnwindSafe(|| self.process())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::error!("camera {}: pipeline aborted: {:#}", self.camera.id, err)
            }
            Err(payload) => log::error!(
                "camera {}: pipeline panicked: {}",
                self.camera.id,
                panic_message(payload.as_ref())
            ),
        }

        let released = self.release();
        if let Err(err) = &released {
            log::error!("camera {}: release failed: {:#}", self.camera.id, err);
        }

        // Poisoning must not leave a stale `running = true` behind.
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.running = false;
        log::info!(
            "camera {}: pipeline stopped after {} frames",
            self.camera.id,
            state.frame_count
        );
        drop(state);

        released
    }

    fn process(&mut self) -> Result<()> {
        if !self.activate()? {
            return Ok(());
        }

        let frame_skip = u64::from(self.settings.frame_skip.max(1));
        let interval = self.settings.frame_interval();
        let mut last_tick = Instant::now();

        loop {
            if lock_state(&self.state)?.stop_requested {
                return Ok(());
            }

            let frame = match self.source.read_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    lock_state(&self.state)?.read_failures += 1;
                    log::warn!(
                        "camera {}: failed to read frame: {:#}",
                        self.camera.id,
                        err
                    );
                    std::thread::sleep(self.settings.read_backoff);
                    continue;
                }
            };

            if frame.is_empty() {
                continue;
            }

            let frame_number = {
                let mut state = lock_state(&self.state)?;
                state.frame_count += 1;
                state.frame_count
            };

            if frame_number % frame_skip == 0 {
                self.process_frame(frame)?;
            }

            if let Some(interval) = interval {
                let elapsed = last_tick.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
            last_tick = Instant::now();
        }
    }

    /// Flip `running` on unless a stop arrived before the thread got going.
    fn activate(&self) -> Result<bool> {
        let mut state = lock_state(&self.state)?;
        if state.stop_requested {
            return Ok(false);
        }
        state.running = true;
        Ok(true)
    }

    fn process_frame(&mut self, mut frame: Frame) -> Result<()> {
        let processed = {
            let mut state = lock_state(&self.state)?;
            state.frames_processed += 1;
            state.frames_processed
        };

        let detections = match self.detector.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("camera {}: detection failed: {:#}", self.camera.id, err);
                Vec::new()
            }
        };
        if detections.is_empty() {
            return Ok(());
        }

        for detection in &detections {
            frame.annotate(&detection.region);
        }

        let snapshot_every = u64::from(self.settings.snapshot_every.max(1));
        let snapshot = if processed % snapshot_every == 0 {
            match snapshot_reference(&frame) {
                Ok(reference) => Some(reference),
                Err(err) => {
                    log::warn!("camera {}: snapshot skipped: {:#}", self.camera.id, err);
                    None
                }
            }
        } else {
            None
        };

        for detection in &detections {
            let alert =
                Alert::from_detection(&self.camera.id, detection).with_snapshot(snapshot.clone());
            self.alerts.push(alert);
        }
        lock_state(&self.state)?.alerts_queued += detections.len() as u64;
        Ok(())
    }

    /// Close both handles. Both are attempted even if the first fails.
    fn release(&mut self) -> Result<()> {
        let source = self
            .source
            .close()
            .with_context(|| format!("close frame source {}", self.source.locator()));
        let detector = self
            .detector
            .close()
            .with_context(|| format!("close detector {}", self.detector.name()));

        match (source, detector) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Err(source_err), Err(detector_err)) => {
                Err(anyhow!("{:#}; {:#}", source_err, detector_err))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Encode the frame and derive the reference attached to alerts.
///
/// Format: `snapshot_<unix seconds>_<first 4 bytes of sha256 as hex>.jpg`.
pub fn snapshot_reference(frame: &Frame) -> Result<String> {
    let jpeg = frame.encode_jpeg(SNAPSHOT_JPEG_QUALITY)?;
    let digest = Sha256::digest(&jpeg);
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    Ok(format!("snapshot_{}_{}.jpg", now, hex::encode(&digest[..4])))
}
