use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::{Alert, AlertSink};

/// Path of the alert endpoint under the backend base URL.
pub const ALERTS_PATH: &str = "/api/alerts";

/// Posts alerts as JSON to the remote collector.
///
/// Only `201 Created` counts as delivered. Every other status and every
/// transport error is a failure for that alert.
pub struct HttpCollector {
    agent: ureq::Agent,
    url: String,
}

impl HttpCollector {
    pub fn new(backend_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            url: format!("{}{}", backend_url.trim_end_matches('/'), ALERTS_PATH),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AlertSink for HttpCollector {
    fn deliver(&self, alert: &Alert) -> Result<()> {
        let body = serde_json::to_string(alert).context("serialize alert")?;
        match self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&body)
        {
            Ok(response) if response.status() == 201 => Ok(()),
            Ok(response) => Err(anyhow!(
                "collector answered {} {}",
                response.status(),
                response.status_text()
            )),
            Err(ureq::Error::Status(code, _)) => {
                Err(anyhow!("collector rejected alert with status {}", code))
            }
            Err(err) => Err(anyhow!("post alert to {}: {}", self.url, err)),
        }
    }
}
