//! Camera Worker
//!
//! Supervises one detection pipeline per camera inside a single process.
//!
//! # Architecture
//!
//! - `Supervisor` owns the registry (camera id → pipeline) and is the only
//!   component that starts or stops pipelines. At most one pipeline per camera.
//! - Each pipeline runs on its own thread: read a frame, apply the frame-skip
//!   stride, detect, queue alerts, pace to the target frame rate.
//! - Alerts go through a bounded queue to a small pool of delivery threads
//!   (`Dispatcher`). Delivery is best-effort and never blocks a pipeline.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (RTSP, synthetic `stub://`)
//! - `detect`: detector backends and the model registry
//! - `alert`: alert wire type, HTTP collector, dispatcher pool
//! - `catalog`: camera catalog client
//! - `pipeline`: the per-camera loop
//! - `supervisor`: lifecycle and status
//! - `config`: file + environment configuration

pub mod alert;
pub mod camera;
pub mod catalog;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod supervisor;

pub use alert::{Alert, AlertSink, BoundingBox, DispatchConfig, Dispatcher, HttpCollector};
pub use camera::Camera;
pub use catalog::CatalogClient;
pub use config::WorkerConfig;
pub use detect::{BackendRegistry, CpuBackend, Detection, DetectorBackend, DetectorOpener, Region};
pub use error::SupervisorError;
pub use frame::Frame;
pub use ingest::{FrameSource, RtspOpener, RtspSource, SourceOpener};
pub use pipeline::{PipelineSettings, PipelineState};
pub use supervisor::{PipelineStatus, StopAllReport, Supervisor, SupervisorConfig};
