//! Camera catalog client.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::camera::Camera;

/// Path of the camera listing under the backend base URL.
pub const CAMERAS_PATH: &str = "/api/cameras";

/// Read-only client for the backend's camera catalog.
pub struct CatalogClient {
    agent: ureq::Agent,
    url: String,
}

impl CatalogClient {
    pub fn new(backend_url: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            url: format!("{}{}", backend_url.trim_end_matches('/'), CAMERAS_PATH),
        }
    }

    /// `GET /api/cameras`.
    pub fn list(&self) -> Result<Vec<Camera>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("fetch camera catalog from {}", self.url))?;
        let cameras: Vec<Camera> =
            serde_json::from_reader(response.into_reader()).context("decode camera catalog")?;
        Ok(cameras)
    }

    /// Look one camera up by id.
    pub fn find(&self, camera_id: &str) -> Result<Camera> {
        self.list()?
            .into_iter()
            .find(|camera| camera.id == camera_id)
            .ok_or_else(|| anyhow!("camera {} not found", camera_id))
    }
}
