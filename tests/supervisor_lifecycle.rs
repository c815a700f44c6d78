use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use camera_worker::{
    Alert, AlertSink, BoundingBox, Camera, Detection, DetectorBackend, DetectorOpener,
    DispatchConfig, Frame, FrameSource, PipelineSettings, Region, SourceOpener, Supervisor,
    SupervisorConfig, SupervisorError,
};

#[derive(Default)]
struct Counters {
    source_opens: AtomicUsize,
    source_closes: AtomicUsize,
    detector_opens: AtomicUsize,
    detector_closes: AtomicUsize,
    detect_calls: AtomicUsize,
}

impl Counters {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug)]
enum Read {
    NoFrame,
    Empty,
    Frame,
}

/// What a source opened for a given locator will return.
#[derive(Clone)]
struct SourcePlan {
    script: Vec<Read>,
    /// Returned forever once the script is exhausted.
    tail: Read,
    fail_close: bool,
}

impl SourcePlan {
    fn endless() -> Self {
        Self {
            script: Vec::new(),
            tail: Read::Frame,
            fail_close: false,
        }
    }

    fn scripted(script: Vec<Read>) -> Self {
        Self {
            script,
            tail: Read::NoFrame,
            fail_close: false,
        }
    }
}

struct ScriptedSource {
    locator: String,
    script: VecDeque<Read>,
    tail: Read,
    fail_close: bool,
    counters: Arc<Counters>,
}

impl FrameSource for ScriptedSource {
    fn locator(&self) -> &str {
        &self.locator
    }

    fn read_frame(&mut self) -> Result<Frame> {
        match self.script.pop_front().unwrap_or(self.tail) {
            Read::NoFrame => Err(anyhow!("no frame available")),
            Read::Empty => Ok(Frame::empty()),
            Read::Frame => Ok(Frame::filled(32, 32, [40, 40, 40])),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.counters.source_closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(anyhow!("stream teardown timed out"));
        }
        Ok(())
    }
}

struct ScriptedSources {
    counters: Arc<Counters>,
    plans: Mutex<HashMap<String, SourcePlan>>,
}

impl ScriptedSources {
    fn new(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            plans: Mutex::new(HashMap::new()),
        }
    }

    fn plan(self, locator: &str, plan: SourcePlan) -> Self {
        self.plans.lock().unwrap().insert(locator.to_string(), plan);
        self
    }
}

impl SourceOpener for ScriptedSources {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>> {
        if locator.starts_with("bad://") {
            return Err(anyhow!("cannot connect to {}", locator));
        }
        let plan = self
            .plans
            .lock()
            .unwrap()
            .get(locator)
            .cloned()
            .unwrap_or_else(SourcePlan::endless);
        self.counters.source_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSource {
            locator: locator.to_string(),
            script: plan.script.into(),
            tail: plan.tail,
            fail_close: plan.fail_close,
            counters: self.counters.clone(),
        }))
    }
}

struct FixedDetector {
    region: Option<Region>,
    failing: bool,
    counters: Arc<Counters>,
}

impl DetectorBackend for FixedDetector {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.counters.detect_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(anyhow!("inference backend returned garbage"));
        }
        Ok(self
            .region
            .map(|region| Detection {
                region,
                confidence: 0.9,
            })
            .into_iter()
            .collect())
    }

    fn close(&mut self) -> Result<()> {
        self.counters.detector_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FixedDetectors {
    region: Option<Region>,
    fail: bool,
    failing_detect: bool,
    counters: Arc<Counters>,
}

impl DetectorOpener for FixedDetectors {
    fn open(&self, model_ref: &str) -> Result<Box<dyn DetectorBackend>> {
        if self.fail {
            return Err(anyhow!("model {} not found", model_ref));
        }
        self.counters.detector_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FixedDetector {
            region: self.region,
            failing: self.failing_detect,
            counters: self.counters.clone(),
        }))
    }
}

#[derive(Default)]
struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingSink {
    fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl AlertSink for RecordingSink {
    fn deliver(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

struct RejectingSink;

impl AlertSink for RejectingSink {
    fn deliver(&self, _alert: &Alert) -> Result<()> {
        Err(anyhow!("collector answered 500"))
    }
}

fn fast_settings(frame_skip: u32) -> PipelineSettings {
    PipelineSettings {
        target_fps: 200,
        frame_skip,
        snapshot_every: 30,
        read_backoff: Duration::from_millis(5),
    }
}

fn supervisor(
    sources: ScriptedSources,
    detectors: FixedDetectors,
    sink: Arc<dyn AlertSink>,
    settings: PipelineSettings,
) -> Supervisor {
    Supervisor::new(
        Arc::new(sources),
        Arc::new(detectors),
        sink,
        SupervisorConfig {
            detector_model: "fixed".to_string(),
            pipeline: settings,
            dispatch: DispatchConfig {
                workers: 2,
                queue_capacity: 64,
            },
        },
    )
    .expect("spawn supervisor")
}

fn detectors(counters: &Arc<Counters>, region: Option<Region>) -> FixedDetectors {
    FixedDetectors {
        region,
        fail: false,
        failing_detect: false,
        counters: counters.clone(),
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

const WAIT: Duration = Duration::from_secs(5);

fn is_running(supervisor: &Supervisor, camera_id: &str) -> bool {
    supervisor
        .status_snapshot()
        .get(camera_id)
        .is_some_and(|status| status.running)
}

#[test]
fn duplicate_start_is_rejected() {
    let counters = Arc::new(Counters::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        detectors(&counters, None),
        Arc::new(RecordingSink::default()),
        fast_settings(1),
    );

    sup.start(Camera::new("B", "stub://b")).expect("first start");
    let err = sup
        .start(Camera::new("B", "stub://b"))
        .expect_err("second start");
    assert!(matches!(err, SupervisorError::AlreadyRunning(ref id) if id == "B"));

    assert_eq!(sup.status_snapshot().len(), 1);
    assert_eq!(Counters::get(&counters.source_opens), 1);
    assert_eq!(Counters::get(&counters.detector_opens), 1);

    sup.stop("B").expect("stop");
}

#[test]
fn stop_releases_handles_and_deregisters() {
    let counters = Arc::new(Counters::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        detectors(&counters, None),
        Arc::new(RecordingSink::default()),
        fast_settings(1),
    );

    sup.start(Camera::new("cam-1", "stub://one")).expect("start");
    assert!(wait_until(WAIT, || is_running(&sup, "cam-1")));

    sup.stop("cam-1").expect("stop");

    assert!(!sup.is_registered("cam-1"));
    assert!(sup.status_snapshot().is_empty());
    assert_eq!(Counters::get(&counters.source_closes), 1);
    assert_eq!(Counters::get(&counters.detector_closes), 1);
}

#[test]
fn stop_of_unknown_camera_is_not_running() {
    let counters = Arc::new(Counters::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        detectors(&counters, None),
        Arc::new(RecordingSink::default()),
        fast_settings(1),
    );

    let err = sup.stop("ghost").expect_err("nothing to stop");
    assert!(matches!(err, SupervisorError::NotRunning(ref id) if id == "ghost"));
}

#[test]
fn transient_read_failures_then_one_detection() {
    let counters = Arc::new(Counters::default());
    let sources = ScriptedSources::new(counters.clone()).plan(
        "stub://a",
        SourcePlan::scripted(vec![Read::NoFrame, Read::NoFrame, Read::NoFrame, Read::Frame]),
    );
    let sink = Arc::new(RecordingSink::default());
    let sup = supervisor(
        sources,
        detectors(&counters, Some(Region::new(5, 6, 7, 8))),
        sink.clone(),
        fast_settings(1),
    );

    sup.start(Camera::new("A", "stub://a")).expect("start");
    assert!(wait_until(WAIT, || sink.alerts().len() == 1));

    let status = sup.status_snapshot()["A"].clone();
    assert_eq!(status.frame_count, 1);
    assert_eq!(status.frames_processed, 1);
    assert!(status.read_failures >= 3);
    assert_eq!(status.alerts_queued, 1);
    assert_eq!(Counters::get(&counters.detect_calls), 1);

    let alert = &sink.alerts()[0];
    assert_eq!(alert.camera_id, "A");
    assert_eq!(
        alert.bounding_box,
        BoundingBox {
            x: 5,
            y: 6,
            width: 7,
            height: 8
        }
    );
    assert!((alert.confidence - 0.9).abs() < 1e-6);
    assert_eq!(alert.image_url, None);

    // The source only ever fails from here on; nothing else is reported.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sink.alerts().len(), 1);

    sup.stop("A").expect("stop");
}

#[test]
fn frame_skip_runs_detection_on_every_nth_frame() {
    let counters = Arc::new(Counters::default());
    let mut script = Vec::new();
    for n in 0..10 {
        script.push(Read::Frame);
        if n % 4 == 1 {
            script.push(Read::Empty);
        }
    }
    let sources =
        ScriptedSources::new(counters.clone()).plan("stub://skip", SourcePlan::scripted(script));
    let sup = supervisor(
        sources,
        detectors(&counters, None),
        Arc::new(RecordingSink::default()),
        fast_settings(3),
    );

    sup.start(Camera::new("skip", "stub://skip")).expect("start");
    assert!(wait_until(WAIT, || {
        sup.status_snapshot()
            .get("skip")
            .is_some_and(|status| status.frame_count == 10 && status.read_failures > 0)
    }));

    let status = sup.status_snapshot()["skip"].clone();
    assert_eq!(status.frame_skip, 3);
    assert_eq!(status.frames_processed, 3);
    assert_eq!(Counters::get(&counters.detect_calls), 3);

    sup.stop("skip").expect("stop");
}

#[test]
fn snapshot_reference_follows_processed_cadence() {
    let counters = Arc::new(Counters::default());
    let sources = ScriptedSources::new(counters.clone())
        .plan("stub://snap", SourcePlan::scripted(vec![Read::Frame; 4]));
    let sink = Arc::new(RecordingSink::default());
    let mut settings = fast_settings(1);
    settings.snapshot_every = 2;
    let sup = supervisor(
        sources,
        detectors(&counters, Some(Region::new(1, 1, 4, 4))),
        sink.clone(),
        settings,
    );

    sup.start(Camera::new("snap", "stub://snap")).expect("start");
    assert!(wait_until(WAIT, || sink.alerts().len() == 4));
    sup.stop("snap").expect("stop");

    let with_snapshot: Vec<bool> = sink
        .alerts()
        .iter()
        .map(|alert| alert.image_url.is_some())
        .collect();
    // Delivery order across workers is not fixed, only the count is.
    assert_eq!(with_snapshot.iter().filter(|attached| **attached).count(), 2);
    for alert in sink.alerts() {
        if let Some(reference) = alert.image_url {
            assert!(reference.starts_with("snapshot_"));
            assert!(reference.ends_with(".jpg"));
        }
    }
}

#[test]
fn delivery_failures_do_not_halt_the_pipeline() {
    let counters = Arc::new(Counters::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        detectors(&counters, Some(Region::new(0, 0, 8, 8))),
        Arc::new(RejectingSink),
        fast_settings(1),
    );

    sup.start(Camera::new("noisy", "stub://noisy")).expect("start");
    assert!(wait_until(WAIT, || sup.dispatch_stats().failed >= 2));

    let seen = sup.status_snapshot()["noisy"].frame_count;
    assert!(wait_until(WAIT, || {
        sup.status_snapshot()["noisy"].frame_count > seen + 5
    }));
    assert!(is_running(&sup, "noisy"));
    assert_eq!(sup.dispatch_stats().delivered, 0);

    sup.stop("noisy").expect("stop");
}

#[test]
fn detection_failures_count_as_no_detections() {
    let counters = Arc::new(Counters::default());
    let sink = Arc::new(RecordingSink::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        FixedDetectors {
            region: Some(Region::new(0, 0, 8, 8)),
            fail: false,
            failing_detect: true,
            counters: counters.clone(),
        },
        sink.clone(),
        fast_settings(1),
    );

    sup.start(Camera::new("blind", "stub://blind")).expect("start");
    assert!(wait_until(WAIT, || Counters::get(&counters.detect_calls) >= 3));

    let first = sup.status_snapshot()["blind"].clone();
    assert!(wait_until(WAIT, || {
        let status = sup.status_snapshot()["blind"].clone();
        status.frame_count > first.frame_count + 5
            && status.frames_processed > first.frames_processed + 5
    }));

    let status = sup.status_snapshot()["blind"].clone();
    assert!(status.running);
    assert_eq!(status.alerts_queued, 0);
    assert_eq!(sup.dispatch_stats().queued, 0);
    assert!(sink.alerts().is_empty());

    sup.stop("blind").expect("stop");
}

fn frames_after(settings: PipelineSettings, window: Duration) -> (u64, u64) {
    let counters = Arc::new(Counters::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        detectors(&counters, None),
        Arc::new(RecordingSink::default()),
        settings,
    );

    sup.start(Camera::new("paced", "stub://paced")).expect("start");
    std::thread::sleep(window);
    let status = sup.status_snapshot()["paced"].clone();
    sup.stop("paced").expect("stop");
    (status.frame_count, status.frames_processed)
}

#[test]
fn loop_is_paced_to_target_fps() {
    let settings = PipelineSettings {
        target_fps: 20,
        ..fast_settings(1)
    };

    // 50ms per frame over 500ms: about 10 frames.
    let (frames, processed) = frames_after(settings, Duration::from_millis(500));

    assert!((5..=12).contains(&frames), "frames={}", frames);
    // The snapshot can land between counting a frame and detecting on it.
    assert!(processed <= frames && processed + 1 >= frames);
}

#[test]
fn skipped_frames_are_paced_too() {
    let settings = PipelineSettings {
        target_fps: 20,
        ..fast_settings(3)
    };

    let (frames, processed) = frames_after(settings, Duration::from_millis(500));

    // Skipped frames still take a full interval, so the count matches the
    // unskipped rate and only a third reach the detector.
    assert!((5..=12).contains(&frames), "frames={}", frames);
    assert!(processed <= frames / 3 && processed + 1 >= frames / 3);
}

#[test]
fn unreachable_source_leaves_registry_unchanged() {
    let counters = Arc::new(Counters::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        detectors(&counters, None),
        Arc::new(RecordingSink::default()),
        fast_settings(1),
    );

    let err = sup
        .start(Camera::new("dead", "bad://dead"))
        .expect_err("unreachable");
    assert!(matches!(err, SupervisorError::AcquisitionFailed { .. }));
    assert_eq!(err.camera_id(), "dead");
    assert!(!sup.is_registered("dead"));
    assert_eq!(Counters::get(&counters.detector_opens), 0);
}

#[test]
fn detector_failure_closes_the_opened_source() {
    let counters = Arc::new(Counters::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        FixedDetectors {
            region: None,
            fail: true,
            failing_detect: false,
            counters: counters.clone(),
        },
        Arc::new(RecordingSink::default()),
        fast_settings(1),
    );

    let err = sup
        .start(Camera::new("no-model", "stub://no-model"))
        .expect_err("detector missing");
    assert!(matches!(err, SupervisorError::AcquisitionFailed { .. }));
    assert!(sup.status_snapshot().is_empty());
    assert_eq!(Counters::get(&counters.source_opens), 1);
    assert_eq!(Counters::get(&counters.source_closes), 1);
}

#[test]
fn stop_all_sweeps_past_release_failure() {
    let counters = Arc::new(Counters::default());
    let sources = ScriptedSources::new(counters.clone()).plan(
        "stub://c2",
        SourcePlan {
            fail_close: true,
            ..SourcePlan::endless()
        },
    );
    let sup = supervisor(
        sources,
        detectors(&counters, None),
        Arc::new(RecordingSink::default()),
        fast_settings(1),
    );

    for id in ["c1", "c2", "c3"] {
        sup.start(Camera::new(id, format!("stub://{}", id)))
            .expect("start");
    }
    assert!(wait_until(WAIT, || ["c1", "c2", "c3"]
        .iter()
        .all(|id| is_running(&sup, id))));

    let report = sup.stop_all();

    assert_eq!(report.stopped, vec!["c1".to_string(), "c3".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert!(!report.is_clean());
    assert!(matches!(
        &report.failed[0],
        SupervisorError::ReleaseFailed { camera_id, .. } if camera_id == "c2"
    ));
    assert_eq!(sup.active_cameras(), 0);
    assert_eq!(Counters::get(&counters.source_closes), 3);
    assert_eq!(Counters::get(&counters.detector_closes), 3);
}

#[test]
fn restart_resets_counters() {
    let counters = Arc::new(Counters::default());
    let sources = ScriptedSources::new(counters.clone())
        .plan("stub://r", SourcePlan::scripted(vec![Read::Frame; 5]));
    let sup = supervisor(
        sources,
        detectors(&counters, None),
        Arc::new(RecordingSink::default()),
        fast_settings(1),
    );

    for _ in 0..2 {
        sup.start(Camera::new("r", "stub://r")).expect("start");
        assert!(wait_until(WAIT, || {
            sup.status_snapshot()
                .get("r")
                .is_some_and(|status| status.frame_count == 5 && status.read_failures > 0)
        }));
        sup.stop("r").expect("stop");
    }

    assert_eq!(Counters::get(&counters.source_opens), 2);
    assert_eq!(Counters::get(&counters.source_closes), 2);
}

#[test]
fn frame_count_never_decreases_while_running() {
    let counters = Arc::new(Counters::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        detectors(&counters, None),
        Arc::new(RecordingSink::default()),
        fast_settings(1),
    );

    sup.start(Camera::new("mono", "stub://mono")).expect("start");
    let mut last = 0;
    for _ in 0..40 {
        let current = sup.status_snapshot()["mono"].frame_count;
        assert!(current >= last);
        last = current;
        std::thread::sleep(Duration::from_millis(2));
    }
    sup.stop("mono").expect("stop");
}

#[test]
fn start_enabled_skips_disabled_and_streaming_cameras() {
    let counters = Arc::new(Counters::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        detectors(&counters, None),
        Arc::new(RecordingSink::default()),
        fast_settings(1),
    );

    let mut disabled = Camera::new("off", "stub://off");
    disabled.is_enabled = false;
    let mut streaming = Camera::new("busy", "stub://busy");
    streaming.is_streaming = true;
    let cameras = vec![
        Camera::new("lobby", "stub://lobby"),
        disabled,
        streaming,
        Camera::new("dock", "bad://dock"),
    ];

    let started = sup.start_enabled(&cameras);

    assert_eq!(started, vec!["lobby".to_string()]);
    assert_eq!(sup.active_cameras(), 1);
    sup.stop_all();
}

#[test]
fn shutdown_stops_every_camera() {
    let counters = Arc::new(Counters::default());
    let sup = supervisor(
        ScriptedSources::new(counters.clone()),
        detectors(&counters, Some(Region::new(0, 0, 2, 2))),
        Arc::new(RecordingSink::default()),
        fast_settings(1),
    );

    sup.start(Camera::new("x", "stub://x")).expect("start");
    sup.start(Camera::new("y", "stub://y")).expect("start");

    let report = sup.shutdown();

    assert!(report.is_clean());
    assert_eq!(report.stopped.len(), 2);
    assert_eq!(Counters::get(&counters.source_closes), 2);
    assert_eq!(Counters::get(&counters.detector_closes), 2);
}
