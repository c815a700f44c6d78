//! Camera processing supervisor.
//!
//! The supervisor is the only place pipelines are created or torn down. It keeps
//! one registry entry per camera id; an id is present from a successful `start`
//! until the matching `stop` has observed the loop exit and both handles closed.
//!
//! Locking:
//! - the registry map has one lock, held only while inserting, removing, or
//!   cloning entries out; never across opens, closes, or thread joins.
//! - each entry's `PipelineState` has its own lock shared with its loop thread.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use anyhow::Result;
use serde::Serialize;

use crate::alert::{AlertQueue, AlertSink, DispatchConfig, DispatchStatsSnapshot, Dispatcher};
use crate::camera::Camera;
use crate::catalog::CatalogClient;
use crate::detect::DetectorOpener;
use crate::error::SupervisorError;
use crate::ingest::SourceOpener;
use crate::pipeline::{new_state, CameraPipeline, PipelineSettings, SharedState};

const DEFAULT_DETECTOR_MODEL: &str = "cpu";

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Model reference passed to the detector opener for every camera.
    pub detector_model: String,
    pub pipeline: PipelineSettings,
    pub dispatch: DispatchConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            detector_model: DEFAULT_DETECTOR_MODEL.to_string(),
            pipeline: PipelineSettings::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// Point-in-time status of one registered pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub camera_id: String,
    pub name: String,
    #[serde(rename = "isRunning")]
    pub running: bool,
    #[serde(rename = "fps")]
    pub target_fps: u32,
    pub frame_skip: u32,
    pub frame_count: u64,
    pub frames_processed: u64,
    pub read_failures: u64,
    pub alerts_queued: u64,
}

/// Outcome of a `stop_all` sweep.
#[derive(Debug, Default)]
pub struct StopAllReport {
    pub stopped: Vec<String>,
    pub failed: Vec<SupervisorError>,
}

impl StopAllReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct PipelineEntry {
    camera: Camera,
    state: SharedState,
    /// Taken by the first stop; `None` means a stop is already in flight.
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
}

pub struct Supervisor {
    registry: Mutex<HashMap<String, Arc<PipelineEntry>>>,
    sources: Arc<dyn SourceOpener>,
    detectors: Arc<dyn DetectorOpener>,
    detector_model: String,
    settings: PipelineSettings,
    alerts: AlertQueue,
    dispatcher: Option<Dispatcher>,
}

impl Supervisor {
    pub fn new(
        sources: Arc<dyn SourceOpener>,
        detectors: Arc<dyn DetectorOpener>,
        sink: Arc<dyn AlertSink>,
        config: SupervisorConfig,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::spawn(sink, config.dispatch)?;
        Ok(Self {
            registry: Mutex::new(HashMap::new()),
            sources,
            detectors,
            detector_model: config.detector_model,
            settings: config.pipeline,
            alerts: dispatcher.queue(),
            dispatcher: Some(dispatcher),
        })
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<PipelineEntry>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the camera's source and detector and launch its pipeline thread.
    ///
    /// Returns once the entry is registered; the loop activates asynchronously.
    pub fn start(&self, camera: Camera) -> Result<(), SupervisorError> {
        if self.registry().contains_key(&camera.id) {
            return Err(SupervisorError::AlreadyRunning(camera.id));
        }

        let mut source = self.sources.open(&camera.stream_url).map_err(|source| {
            SupervisorError::AcquisitionFailed {
                camera_id: camera.id.clone(),
                source,
            }
        })?;
        let detector = match self.detectors.open(&self.detector_model) {
            Ok(detector) => detector,
            Err(err) => {
                if let Err(close_err) = source.close() {
                    log::warn!(
                        "camera {}: closing source after detector failure: {:#}",
                        camera.id,
                        close_err
                    );
                }
                return Err(SupervisorError::AcquisitionFailed {
                    camera_id: camera.id,
                    source: err,
                });
            }
        };

        let state = new_state(&self.settings);
        let pipeline = CameraPipeline::new(
            camera.clone(),
            source,
            detector,
            state.clone(),
            self.settings.clone(),
            self.alerts.clone(),
        );

        let mut registry = self.registry();
        // Lost a race with a concurrent start for the same camera.
        if registry.contains_key(&camera.id) {
            drop(registry);
            if let Err(err) = pipeline.discard() {
                log::warn!("camera {}: releasing duplicate handles: {:#}", camera.id, err);
            }
            return Err(SupervisorError::AlreadyRunning(camera.id));
        }

        let worker = pipeline
            .spawn(std::thread::Builder::new().name(format!("camera-{}", camera.id)))
            .map_err(|source| SupervisorError::AcquisitionFailed {
                camera_id: camera.id.clone(),
                source,
            })?;

        log::info!("camera {} ({}) registered", camera.id, camera.name);
        registry.insert(
            camera.id.clone(),
            Arc::new(PipelineEntry {
                camera,
                state,
                worker: Mutex::new(Some(worker)),
            }),
        );
        Ok(())
    }

    /// Stop one camera and wait until its handles are released.
    pub fn stop(&self, camera_id: &str) -> Result<(), SupervisorError> {
        let (entry, worker) = self.request_stop(camera_id)?;
        self.finish_stop(camera_id, &entry, worker)
    }

    /// Stop every registered camera. Failures are logged and collected; the
    /// sweep always visits every camera.
    pub fn stop_all(&self) -> StopAllReport {
        let mut ids: Vec<String> = self.registry().keys().cloned().collect();
        ids.sort();

        // Signal every loop first so they wind down concurrently.
        let mut pending = Vec::with_capacity(ids.len());
        for id in ids {
            match self.request_stop(&id) {
                Ok((entry, worker)) => pending.push((id, entry, worker)),
                // Someone else is already stopping it.
                Err(SupervisorError::NotRunning(_)) => {}
                Err(err) => log::error!("failed to stop camera {}: {}", id, err),
            }
        }

        let mut report = StopAllReport::default();
        for (id, entry, worker) in pending {
            match self.finish_stop(&id, &entry, worker) {
                Ok(()) => report.stopped.push(id),
                Err(err) => {
                    log::error!("failed to stop camera {}: {}", id, err);
                    report.failed.push(err);
                }
            }
        }
        report
    }

    /// Status of every registered camera, keyed by id.
    pub fn status_snapshot(&self) -> BTreeMap<String, PipelineStatus> {
        let entries: Vec<Arc<PipelineEntry>> = self.registry().values().cloned().collect();
        entries
            .iter()
            .map(|entry| {
                let state = entry.state.lock().unwrap_or_else(PoisonError::into_inner);
                let status = PipelineStatus {
                    camera_id: entry.camera.id.clone(),
                    name: entry.camera.name.clone(),
                    running: state.running,
                    target_fps: state.target_fps,
                    frame_skip: state.frame_skip,
                    frame_count: state.frame_count,
                    frames_processed: state.frames_processed,
                    read_failures: state.read_failures,
                    alerts_queued: state.alerts_queued,
                };
                (entry.camera.id.clone(), status)
            })
            .collect()
    }

    pub fn is_registered(&self, camera_id: &str) -> bool {
        self.registry().contains_key(camera_id)
    }

    pub fn active_cameras(&self) -> usize {
        self.registry().len()
    }

    pub fn dispatch_stats(&self) -> DispatchStatsSnapshot {
        self.alerts.stats()
    }

    /// Look a camera up in the catalog and start it.
    pub fn start_from_catalog(&self, camera_id: &str, catalog: &CatalogClient) -> Result<()> {
        let camera = catalog.find(camera_id)?;
        self.start(camera)?;
        Ok(())
    }

    /// Start every enabled, not-yet-streaming camera. Returns the ids started.
    pub fn start_enabled(&self, cameras: &[Camera]) -> Vec<String> {
        let mut started = Vec::new();
        for camera in cameras.iter().filter(|camera| camera.wants_processing()) {
            match self.start(camera.clone()) {
                Ok(()) => started.push(camera.id.clone()),
                Err(err) => log::warn!("failed to start camera {}: {}", camera.id, err),
            }
        }
        started
    }

    /// Stop every camera, then drain and stop the alert dispatcher.
    pub fn shutdown(mut self) -> StopAllReport {
        let report = self.stop_all();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
        }
        report
    }

    fn request_stop(
        &self,
        camera_id: &str,
    ) -> Result<(Arc<PipelineEntry>, JoinHandle<Result<()>>), SupervisorError> {
        let entry = self
            .registry()
            .get(camera_id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotRunning(camera_id.to_string()))?;

        let worker = entry
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SupervisorError::NotRunning(camera_id.to_string()))?;

        entry
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop_requested = true;

        Ok((entry, worker))
    }

    fn finish_stop(
        &self,
        camera_id: &str,
        entry: &Arc<PipelineEntry>,
        worker: JoinHandle<Result<()>>,
    ) -> Result<(), SupervisorError> {
        let outcome = worker.join();

        {
            let mut registry = self.registry();
            if registry
                .get(camera_id)
                .is_some_and(|current| Arc::ptr_eq(current, entry))
            {
                registry.remove(camera_id);
            }
        }

        match outcome {
            Ok(Ok(())) => {
                log::info!("camera {} stopped", camera_id);
                Ok(())
            }
            Ok(Err(err)) => Err(SupervisorError::ReleaseFailed {
                camera_id: camera_id.to_string(),
                reason: format!("{:#}", err),
            }),
            Err(_) => Err(SupervisorError::ReleaseFailed {
                camera_id: camera_id.to_string(),
                reason: "pipeline thread panicked".to_string(),
            }),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Without an explicit shutdown, at least tell every loop to wind down.
        for entry in self.registry().values() {
            entry
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .stop_requested = true;
        }
    }
}
