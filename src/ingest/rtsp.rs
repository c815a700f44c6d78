//! RTSP frame source.
//!
//! This module provides `RtspSource` for ingesting frames from IP cameras via RTSP.
//!
//! The RTSP source is responsible for:
//! - Connecting to camera streams
//! - Decoding video frames to RGB8
//! - Producing `Frame` instances
//!
//! `stub://` locators are served by a synthetic scene so the worker can run
//! without cameras.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, Result};
#[cfg(feature = "rtsp-gstreamer")]
use std::time::Duration;

use super::{FrameSource, SourceOpener};
use crate::detect::Region;
use crate::frame::Frame;

const SYNTHETIC_BACKGROUND: [u8; 3] = [96, 96, 96];
const SYNTHETIC_BLOCK: [u8; 3] = [240, 240, 240];
const SYNTHETIC_BLOCK_SIZE: u32 = 48;
const SYNTHETIC_SCENE_FRAMES: u64 = 50;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Expected stream frame rate. Used to size read timeouts.
    pub target_fps: u32,
    /// Frame width (synthetic sources only).
    pub width: u32,
    /// Frame height (synthetic sources only).
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real RTSP decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    url: String,
    backend: RtspBackend,
    closed: bool,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        let url = config.url.clone();
        if config.url.starts_with("stub://") {
            Ok(Self {
                url,
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
                closed: false,
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    url,
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                    closed: false,
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!("RTSP requires the rtsp-gstreamer feature ({})", url)
            }
        }
    }

    /// Connect to the RTSP stream.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    /// Capture the next frame.
    pub fn next_frame(&mut self) -> Result<Frame> {
        if self.closed {
            return Err(anyhow!("RTSP source {} is closed", self.url));
        }
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }
}

impl FrameSource for RtspSource {
    fn locator(&self) -> &str {
        &self.url
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.next_frame()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &mut self.backend {
            RtspBackend::Synthetic(_) => {
                log::debug!("RtspSource: closed {} (synthetic)", self.url);
                Ok(())
            }
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.close(),
        }
    }
}

/// Opens connected `RtspSource`s.
#[derive(Clone, Debug)]
pub struct RtspOpener {
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for RtspOpener {
    fn default() -> Self {
        let defaults = RtspConfig::default();
        Self {
            target_fps: defaults.target_fps,
            width: defaults.width,
            height: defaults.height,
        }
    }
}

impl SourceOpener for RtspOpener {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>> {
        let mut source = RtspSource::new(RtspConfig {
            url: locator.to_string(),
            target_fps: self.target_fps,
            width: self.width,
            height: self.height,
        })?;
        source.connect()?;
        Ok(Box::new(source))
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and camera-less runs
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    frame_count: u64,
    /// Which spot the bright block currently occupies.
    scene_state: u32,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
        }
    }

    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<()> {
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        if self.frame_count % SYNTHETIC_SCENE_FRAMES == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let (width, height) = (self.config.width, self.config.height);
        let mut frame = Frame::filled(width, height, SYNTHETIC_BACKGROUND);

        let block = SYNTHETIC_BLOCK_SIZE.min(width).min(height);
        let span_x = width.saturating_sub(block).max(1);
        let span_y = height.saturating_sub(block).max(1);
        let x = self.scene_state.wrapping_mul(97) % span_x;
        let y = self.scene_state.wrapping_mul(61) % span_y;
        frame.fill_region(
            &Region::new(x as i32, y as i32, block as i32, block as i32),
            SYNTHETIC_BLOCK,
        );

        Ok(frame)
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Build GStreamer pipeline: rtspsrc ! decodebin ! videoconvert ! appsink (RGB).
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.check_bus()?;

        let timeout = self.frame_timeout();
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| anyhow!("RTSP stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Frame::from_rgb(width, height, pixels)
    }

    fn close(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Null)
            .context("set RTSP pipeline to Null")?;
        log::info!("RtspSource: closed {}", self.config.url);
        Ok(())
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    /// Drain the bus. A pipeline error or end-of-stream fails this read; the
    /// caller backs off and tries again.
    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        let mut failure = None;
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            let detail = match message.view() {
                MessageView::Error(err) => format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ),
                MessageView::Eos(..) => "gstreamer reached EOS".to_string(),
                _ => continue,
            };
            log::warn!("RtspSource {}: {}", self.config.url, detail);
            failure.get_or_insert(detail);
        }
        match failure {
            Some(detail) => Err(anyhow!(detail)),
            None => Ok(()),
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("RTSP buffer is shorter than its caps")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
