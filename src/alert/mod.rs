//! Alert construction and delivery.
//!
//! Pipelines build an `Alert` per detected region and hand it to an `AlertQueue`.
//! The `Dispatcher` drains the queue on its own threads and delivers each alert
//! once through an `AlertSink`. Nothing is retried or persisted.

mod collector;
mod dispatcher;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::detect::{Detection, Region};

pub use collector::HttpCollector;
pub use dispatcher::{AlertQueue, DispatchConfig, DispatchStats, DispatchStatsSnapshot, Dispatcher};

/// Detection event as posted to the collector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub camera_id: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
    /// Snapshot reference, attached on the snapshot cadence only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl From<Region> for BoundingBox {
    fn from(region: Region) -> Self {
        Self {
            x: region.x,
            y: region.y,
            width: region.width,
            height: region.height,
        }
    }
}

impl Alert {
    pub fn from_detection(camera_id: &str, detection: &Detection) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            confidence: detection.confidence as f64,
            bounding_box: detection.region.into(),
            image_url: None,
        }
    }

    pub fn with_snapshot(mut self, reference: Option<String>) -> Self {
        self.image_url = reference;
        self
    }
}

/// Delivery endpoint for alerts.
///
/// `deliver` is called from dispatcher threads, one alert at a time per thread.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &Alert) -> Result<()>;
}
