use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::alert::DispatchConfig;
use crate::pipeline::PipelineSettings;
use crate::supervisor::SupervisorConfig;

const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DETECTOR_MODEL: &str = "cpu";
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_FRAME_SKIP: u32 = 1;
const DEFAULT_SNAPSHOT_EVERY: u32 = 30;
const DEFAULT_READ_BACKOFF_MS: u64 = 1_000;
const DEFAULT_DISPATCH_WORKERS: usize = 4;
const DEFAULT_DISPATCH_QUEUE_CAPACITY: usize = 256;
const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    backend_url: Option<String>,
    port: Option<u16>,
    detector: Option<DetectorConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    dispatch: Option<DispatchConfigFile>,
    source: Option<SourceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    target_fps: Option<u32>,
    frame_skip: Option<u32>,
    snapshot_every: Option<u32>,
    read_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub backend_url: String,
    /// Port for the control surface in front of this worker. Not bound here.
    pub port: u16,
    pub detector_model: String,
    pub pipeline: PipelineSettings,
    pub dispatch: DispatchSettings,
    pub source: SourceSettings,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub timeout: Duration,
}

/// Frame size for synthetic (`stub://`) sources.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub width: u32,
    pub height: u32,
}

impl WorkerConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WORKER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WorkerConfigFile) -> Self {
        let pipeline = file.pipeline.unwrap_or_default();
        let dispatch = file.dispatch.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        Self {
            backend_url: file
                .backend_url
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            port: file.port.unwrap_or(DEFAULT_PORT),
            detector_model: file
                .detector
                .and_then(|detector| detector.model)
                .unwrap_or_else(|| DEFAULT_DETECTOR_MODEL.to_string()),
            pipeline: PipelineSettings {
                target_fps: pipeline.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                frame_skip: pipeline.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP),
                snapshot_every: pipeline.snapshot_every.unwrap_or(DEFAULT_SNAPSHOT_EVERY),
                read_backoff: Duration::from_millis(
                    pipeline.read_backoff_ms.unwrap_or(DEFAULT_READ_BACKOFF_MS),
                ),
            },
            dispatch: DispatchSettings {
                workers: dispatch.workers.unwrap_or(DEFAULT_DISPATCH_WORKERS),
                queue_capacity: dispatch
                    .queue_capacity
                    .unwrap_or(DEFAULT_DISPATCH_QUEUE_CAPACITY),
                timeout: Duration::from_secs(
                    dispatch.timeout_secs.unwrap_or(DEFAULT_DISPATCH_TIMEOUT_SECS),
                ),
            },
            source: SourceSettings {
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(port) = env_parse("PORT")? {
            self.port = port;
        }
        if let Some(model) = env_string("DETECTOR_MODEL") {
            self.detector_model = model;
        }
        if let Some(fps) = env_parse("TARGET_FPS")? {
            self.pipeline.target_fps = fps;
        }
        if let Some(skip) = env_parse("FRAME_SKIP")? {
            self.pipeline.frame_skip = skip;
        }
        if let Some(every) = env_parse("SNAPSHOT_EVERY")? {
            self.pipeline.snapshot_every = every;
        }
        if let Some(ms) = env_parse::<u64>("READ_BACKOFF_MS")? {
            self.pipeline.read_backoff = Duration::from_millis(ms);
        }
        if let Some(workers) = env_parse("DISPATCH_WORKERS")? {
            self.dispatch.workers = workers;
        }
        if let Some(capacity) = env_parse("DISPATCH_QUEUE_CAPACITY")? {
            self.dispatch.queue_capacity = capacity;
        }
        if let Some(secs) = env_parse::<u64>("DISPATCH_TIMEOUT_SECS")? {
            self.dispatch.timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let parsed = url::Url::parse(&self.backend_url)
            .map_err(|e| anyhow!("invalid backend url '{}': {}", self.backend_url, e))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "backend url must be http(s), got '{}'",
                self.backend_url
            ));
        }
        self.backend_url = self.backend_url.trim_end_matches('/').to_string();

        if self.detector_model.trim().is_empty() {
            return Err(anyhow!("detector model must not be empty"));
        }
        if self.pipeline.target_fps == 0 {
            return Err(anyhow!("target fps must be greater than zero"));
        }
        if self.pipeline.frame_skip == 0 {
            return Err(anyhow!("frame skip must be greater than zero"));
        }
        if self.pipeline.snapshot_every == 0 {
            return Err(anyhow!("snapshot cadence must be greater than zero"));
        }
        if self.dispatch.workers == 0 {
            return Err(anyhow!("dispatch workers must be greater than zero"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(anyhow!("dispatch queue capacity must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source frame size must be non-zero"));
        }
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            detector_model: self.detector_model.clone(),
            pipeline: self.pipeline.clone(),
            dispatch: DispatchConfig {
                workers: self.dispatch.workers,
                queue_capacity: self.dispatch.queue_capacity,
            },
        }
    }
}

fn read_config_file(path: &Path) -> Result<WorkerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer, got '{}'", key, value)),
        None => Ok(None),
    }
}
