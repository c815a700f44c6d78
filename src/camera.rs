use serde::{Deserialize, Serialize};

/// Camera record as served by the catalog.
///
/// Immutable once handed to a pipeline. Only `id` and `stream_url` matter to
/// processing; the rest is carried for status and logging.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Camera {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Stream locator (e.g., "rtsp://10.0.0.12:554/live" or "stub://lobby").
    #[serde(rename = "rtspUrl")]
    pub stream_url: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_streaming: bool,
}

impl Camera {
    pub fn new(id: impl Into<String>, stream_url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            stream_url: stream_url.into(),
            location: String::new(),
            is_enabled: true,
            is_streaming: false,
        }
    }

    /// True when a start-enabled sweep should pick this camera up.
    pub fn wants_processing(&self) -> bool {
        self.is_enabled && !self.is_streaming
    }
}
