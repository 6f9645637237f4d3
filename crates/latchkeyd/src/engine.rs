use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use image::RgbImage;
use latchkey_core::detector::{DetectorError, StageThresholds};
use latchkey_core::encoder::EncoderError;
use latchkey_core::{
    geometry, BoundingBox, Detector, Encoder, EuclideanMatcher, FacenetEncoder, Gallery,
    MatchResult, Matcher, MtcnnDetector,
};
use latchkey_hw::{Camera, DryRunServo, FrameSource, ImageDirSource, Servo, SysfsPwmServo};
use thiserror::Error;

use crate::config::{Config, ConfigError, ServoBackend};
use crate::display::{Annotator, DirectorySink, FrameSink, NullSink, SinkControl, SinkError};
use crate::sequencer::{Clock, MonotonicClock, Sequencer, Timing};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("model check failed: {0}")]
    Models(#[from] latchkey_models::ModelIntegrityError),
    #[error("camera error: {0}")]
    Camera(#[from] latchkey_hw::CameraError),
    #[error("servo error: {0}")]
    Servo(#[from] latchkey_hw::ServoError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("enrollment failed: {0}")]
    Gallery(#[from] latchkey_core::GalleryError),
    #[error("display error: {0}")]
    Sink(#[from] SinkError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Why the frame loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The stop flag was raised (signal).
    Stopped,
    /// The display sink asked to stop.
    SinkStopped,
    /// `max_frames` frames were processed.
    FrameLimit,
    /// The source reported end of stream.
    SourceExhausted,
    /// Too many consecutive frame grabs failed.
    SourceFailed,
}

/// One detected face after matching, with the region it was cropped from.
#[derive(Debug, Clone)]
pub struct FaceOutcome {
    pub region: BoundingBox,
    pub result: MatchResult,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopLimits {
    /// 0 means unlimited.
    pub max_frames: u64,
    pub max_grab_failures: u32,
}

/// The recognition-and-actuation loop and everything it owns.
pub struct Engine<D, E, C: Clock = MonotonicClock> {
    pub source: Box<dyn FrameSource + Send>,
    pub detector: D,
    pub encoder: E,
    pub gallery: Gallery,
    pub thresholds: StageThresholds,
    pub tolerance: f32,
    pub sequencer: Sequencer<C>,
    pub sink: Box<dyn FrameSink + Send>,
    pub annotator: Annotator,
    pub limits: LoopLimits,
}

/// Open every resource the daemon needs, failing fast on the first problem.
///
/// Nothing here is retried: a missing model, an unusable gallery or an
/// absent camera is a configuration error.
pub fn build(config: &Config) -> Result<Engine<MtcnnDetector, FacenetEncoder>, EngineError> {
    config.validate()?;
    let thresholds = config.stage_thresholds()?;

    latchkey_models::verify_models_dir(&config.model_dir)?;
    tracing::info!(dir = %config.model_dir.display(), "models verified");

    let mut detector = MtcnnDetector::load(
        &config.pnet_path(),
        &config.rnet_path(),
        &config.onet_path(),
        config.min_face_size,
    )?;
    tracing::info!(min_face_size = config.min_face_size, "MTCNN detector loaded");

    let mut encoder = FacenetEncoder::load(&config.facenet_path(), config.encoder_layout)?;
    tracing::info!(layout = ?config.encoder_layout, "FaceNet encoder loaded");

    let gallery =
        Gallery::enroll_from_dir(&config.gallery_dir, &mut detector, &mut encoder, thresholds)?;

    let source: Box<dyn FrameSource + Send> = match &config.frame_dir {
        Some(dir) => Box::new(ImageDirSource::open(dir)?),
        None => {
            let mut camera = Camera::open(&config.camera_device)?;
            tracing::info!(
                device = %config.camera_device,
                width = camera.width,
                height = camera.height,
                fourcc = %camera.fourcc,
                "camera opened"
            );
            if config.warmup_frames > 0 {
                tracing::info!(count = config.warmup_frames, "discarding warmup frames");
                camera.discard(config.warmup_frames);
            }
            Box::new(camera)
        }
    };

    let servo: Box<dyn Servo> = match config.servo {
        ServoBackend::Pwm => Box::new(SysfsPwmServo::open(config.pwm_chip, config.pwm_channel)?),
        ServoBackend::DryRun => {
            tracing::warn!("dry-run servo: gate commands are logged only");
            Box::new(DryRunServo::new().0)
        }
    };
    let timing = Timing {
        open_angle: config.open_angle,
        rest_angle: config.rest_angle,
        dwell: config.dwell,
        cooldown: config.cooldown,
    };
    let sequencer = Sequencer::new(servo, MonotonicClock, timing);

    let sink: Box<dyn FrameSink + Send> = match &config.display_dir {
        Some(dir) => Box::new(DirectorySink::create(dir)?),
        None => Box::new(NullSink),
    };
    let annotator = match &config.font_path {
        Some(path) => Annotator::with_font_file(path)?,
        None => Annotator::new(),
    };

    Ok(Engine {
        source,
        detector,
        encoder,
        gallery,
        thresholds,
        tolerance: config.tolerance,
        sequencer,
        sink,
        annotator,
        limits: LoopLimits {
            max_frames: config.max_frames,
            max_grab_failures: config.max_grab_failures,
        },
    })
}

impl<D, E, C> Engine<D, E, C>
where
    D: Detector + Send + 'static,
    E: Encoder + Send + 'static,
    C: Clock + 'static,
{
    /// Run the loop on a dedicated OS thread until it exits on its own or
    /// `stop` is raised.
    pub fn spawn(self, stop: Arc<AtomicBool>) -> Result<JoinHandle<ExitReason>, EngineError> {
        std::thread::Builder::new()
            .name("latchkey-engine".into())
            .spawn(move || {
                tracing::info!("engine thread started");
                let reason = self.run(&stop);
                tracing::info!(reason = ?reason, "engine thread exiting");
                reason
            })
            .map_err(EngineError::Spawn)
    }
}

impl<D: Detector, E: Encoder, C: Clock> Engine<D, E, C> {
    /// Frame loop. On exit the actuator is rested and released and the
    /// source is closed.
    pub fn run(mut self, stop: &AtomicBool) -> ExitReason {
        let started = Instant::now();
        let mut frames: u64 = 0;
        let mut failures: u32 = 0;

        let reason = loop {
            if stop.load(Ordering::Relaxed) {
                break ExitReason::Stopped;
            }
            if self.limits.max_frames > 0 && frames >= self.limits.max_frames {
                break ExitReason::FrameLimit;
            }

            let mut frame = match self.source.next_frame() {
                Ok(Some(frame)) => {
                    failures = 0;
                    frame
                }
                Ok(None) => break ExitReason::SourceExhausted,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, consecutive = failures, "frame grab failed");
                    // Keep the gate on schedule even without frames.
                    self.sequencer.poll();
                    if failures > self.limits.max_grab_failures {
                        break ExitReason::SourceFailed;
                    }
                    continue;
                }
            };
            frames += 1;

            let faces = self.identify(&frame);
            let results: Vec<MatchResult> = faces.iter().map(|f| f.result.clone()).collect();
            let opened = self.sequencer.on_frame(&results);

            for face in &faces {
                self.annotator.draw_face(&mut frame, &face.region, &face.result);
            }
            let elapsed = started.elapsed().as_secs_f32().max(f32::EPSILON);
            self.annotator.draw_fps(&mut frame, frames as f32 / elapsed);

            if opened {
                if let Some(granted) = results.iter().find(|r| r.accepted) {
                    if let Err(e) = self.sink.snapshot(&frame, &granted.name) {
                        tracing::warn!(error = %e, "snapshot failed");
                    }
                }
            }

            match self.sink.present(&frame) {
                Ok(SinkControl::Continue) => {}
                Ok(SinkControl::Stop) => break ExitReason::SinkStopped,
                Err(e) => tracing::warn!(error = %e, "display failed"),
            }
        };

        tracing::info!(frames, reason = ?reason, gate = ?self.sequencer.state(), "frame loop finished");
        self.sequencer.shutdown();
        reason
    }

    /// Detect, normalize, encode and match every face in a frame.
    ///
    /// Detector or encoder faults and faces that clip away are logged and
    /// skipped; they cost a match opportunity, never the loop.
    pub fn identify(&mut self, frame: &RgbImage) -> Vec<FaceOutcome> {
        let detections = match self.detector.detect(frame, self.thresholds) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "detection failed, skipping frame");
                return Vec::new();
            }
        };
        tracing::trace!(faces = detections.len(), "detected");

        let matcher = EuclideanMatcher;
        let mut outcomes = Vec::with_capacity(detections.len());
        for face in &detections {
            let bbox = BoundingBox::from(face);
            let Some(region) = geometry::clip(&geometry::square(&bbox), frame.width(), frame.height())
            else {
                tracing::trace!(?bbox, "face outside frame");
                continue;
            };
            let Some(crop) = geometry::normalize(&bbox, frame) else {
                continue;
            };
            let encoding = match self.encoder.encode(&crop) {
                Ok(enc) => enc,
                Err(e) => {
                    tracing::warn!(error = %e, "encoding failed, skipping face");
                    continue;
                }
            };
            let result = matcher.compare(&encoding, &self.gallery, self.tolerance);
            tracing::debug!(
                name = %result.name,
                distance = result.distance,
                accepted = result.accepted,
                "face matched"
            );
            outcomes.push(FaceOutcome { region, result });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::ActuatorState;
    use image::Rgb;
    use latchkey_core::{DetectedFace, Encoding, GalleryEntry, NormalizedCrop, ENCODING_DIM};
    use latchkey_hw::{CameraError, CommandLog, ServoCommand};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    const SLOTS: [[f32; 4]; 2] = [[5.0, 5.0, 45.0, 45.0], [55.0, 5.0, 95.0, 45.0]];

    /// Frames are 100x50 with two 40x40 face slots; a slot's red channel
    /// encodes the face identity and 0 means the slot is empty.
    fn frame(slot_reds: [u8; 2]) -> RgbImage {
        RgbImage::from_fn(100, 50, |x, y| {
            for (slot, red) in SLOTS.iter().zip(slot_reds) {
                let (x, y) = (x as f32, y as f32);
                if x >= slot[0] && x < slot[2] && y >= slot[1] && y < slot[3] {
                    return Rgb([red, 0, 0]);
                }
            }
            Rgb([0, 0, 0])
        })
    }

    struct FakeDetector;

    impl Detector for FakeDetector {
        fn detect(
            &mut self,
            image: &RgbImage,
            _thresholds: StageThresholds,
        ) -> Result<Vec<DetectedFace>, DetectorError> {
            Ok(SLOTS
                .iter()
                .filter(|s| image.get_pixel(s[0] as u32 + 20, s[1] as u32 + 20).0[0] > 0)
                .map(|s| DetectedFace {
                    bbox: *s,
                    landmarks: [
                        (s[0] + 12.0, s[1] + 15.0),
                        (s[0] + 28.0, s[1] + 15.0),
                        (s[0] + 20.0, s[1] + 22.0),
                        (s[0] + 14.0, s[1] + 30.0),
                        (s[0] + 26.0, s[1] + 30.0),
                    ],
                    score: 0.99,
                })
                .collect())
        }
    }

    /// Encoding is `[red / 100, 0, ...]` read from the crop centre.
    struct FakeEncoder;

    impl Encoder for FakeEncoder {
        fn encode(&mut self, crop: &NormalizedCrop) -> Result<Encoding, EncoderError> {
            Ok(enc(crop.image.get_pixel(80, 80).0[0] as f32 / 100.0))
        }
    }

    fn enc(x: f32) -> Encoding {
        let mut v = vec![0.0; ENCODING_DIM];
        v[0] = x;
        Encoding::new(v).unwrap()
    }

    struct ScriptedSource(VecDeque<Result<Option<RgbImage>, CameraError>>);

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    fn grab_error() -> CameraError {
        CameraError::Io(std::io::Error::new(std::io::ErrorKind::Other, "EIO"))
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        presented: Arc<Mutex<usize>>,
        snapshots: Arc<Mutex<Vec<String>>>,
        stop_after: Option<usize>,
    }

    impl FrameSink for RecordingSink {
        fn present(&mut self, _frame: &RgbImage) -> Result<SinkControl, SinkError> {
            let mut n = self.presented.lock().unwrap();
            *n += 1;
            if self.stop_after.is_some_and(|limit| *n >= limit) {
                return Ok(SinkControl::Stop);
            }
            Ok(SinkControl::Continue)
        }

        fn snapshot(&mut self, _frame: &RgbImage, name: &str) -> Result<(), SinkError> {
            self.snapshots.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    #[derive(Clone)]
    struct StepClock {
        base: Instant,
        offset: Arc<Mutex<Duration>>,
    }

    impl Clock for StepClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }

    fn engine(
        frames: Vec<Result<Option<RgbImage>, CameraError>>,
        gallery: &[(&str, f32)],
        sink: RecordingSink,
    ) -> (Engine<FakeDetector, FakeEncoder, StepClock>, CommandLog) {
        let (servo, log) = DryRunServo::new();
        let clock = StepClock {
            base: Instant::now(),
            offset: Arc::default(),
        };
        let sequencer = Sequencer::new(Box::new(servo), clock, Timing::default());
        log.lock().unwrap().clear();
        let entries = gallery
            .iter()
            .map(|(name, x)| GalleryEntry {
                name: name.to_string(),
                encoding: enc(*x),
            })
            .collect();
        let engine = Engine {
            source: Box::new(ScriptedSource(frames.into())),
            detector: FakeDetector,
            encoder: FakeEncoder,
            gallery: Gallery::from_entries(entries).unwrap(),
            thresholds: StageThresholds::default(),
            tolerance: 0.7,
            sequencer,
            sink: Box::new(sink),
            annotator: Annotator::new(),
            limits: LoopLimits {
                max_frames: 0,
                max_grab_failures: 2,
            },
        };
        (engine, log)
    }

    fn commands(log: &CommandLog) -> Vec<ServoCommand> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_known_face_opens_gate() {
        let sink = RecordingSink::default();
        let (mut e, log) = engine(vec![], &[("alice", 0.0)], sink.clone());

        let faces = e.identify(&frame([30, 0]));
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].result.name, "alice");
        assert!((faces[0].result.distance - 0.3).abs() < 1e-6);
        assert!(faces[0].result.accepted);

        e.source = Box::new(ScriptedSource(vec![Ok(Some(frame([30, 0])))].into()));
        assert_eq!(e.run(&AtomicBool::new(false)), ExitReason::SourceExhausted);
        assert_eq!(
            commands(&log),
            vec![
                ServoCommand::Angle(180.0),
                ServoCommand::Angle(0.0),
                ServoCommand::Release
            ]
        );
        assert_eq!(*sink.snapshots.lock().unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_unknown_face_leaves_gate_closed() {
        let sink = RecordingSink::default();
        let (mut e, log) = engine(vec![], &[("alice", 0.0)], sink.clone());

        let faces = e.identify(&frame([120, 0]));
        assert_eq!(faces[0].result.name, "Unknown");
        assert!((faces[0].result.distance - 1.2).abs() < 1e-6);

        e.source = Box::new(ScriptedSource(vec![Ok(Some(frame([120, 0])))].into()));
        e.run(&AtomicBool::new(false));
        assert_eq!(
            commands(&log),
            vec![ServoCommand::Angle(0.0), ServoCommand::Release]
        );
        assert!(sink.snapshots.lock().unwrap().is_empty());
        assert_eq!(*sink.presented.lock().unwrap(), 1);
    }

    #[test]
    fn test_one_trigger_for_mixed_frame() {
        let (mut e, log) = engine(vec![], &[("bob", 0.0)], RecordingSink::default());
        let faces = e.identify(&frame([40, 90]));
        let accepted: Vec<_> = faces.iter().filter(|f| f.result.accepted).collect();
        assert_eq!(faces.len(), 2);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].result.name, "bob");

        let results: Vec<_> = faces.into_iter().map(|f| f.result).collect();
        assert!(e.sequencer.on_frame(&results));
        assert_eq!(e.sequencer.state(), ActuatorState::Open);
        assert_eq!(commands(&log), vec![ServoCommand::Angle(180.0)]);
    }

    #[test]
    fn test_sustained_presence_single_cycle() {
        let frames = (0..5).map(|_| Ok(Some(frame([30, 0])))).collect();
        let (e, log) = engine(frames, &[("alice", 0.0)], RecordingSink::default());
        e.run(&AtomicBool::new(false));
        // Clock never advances: one open, then the shutdown rest.
        assert_eq!(
            commands(&log),
            vec![
                ServoCommand::Angle(180.0),
                ServoCommand::Angle(0.0),
                ServoCommand::Release
            ]
        );
    }

    #[test]
    fn test_empty_frames_are_skipped() {
        let frames = vec![Ok(Some(frame([0, 0]))), Ok(Some(frame([0, 0])))];
        let sink = RecordingSink::default();
        let (e, log) = engine(frames, &[("alice", 0.0)], sink.clone());
        assert_eq!(e.run(&AtomicBool::new(false)), ExitReason::SourceExhausted);
        assert_eq!(*sink.presented.lock().unwrap(), 2);
        assert_eq!(
            commands(&log),
            vec![ServoCommand::Angle(0.0), ServoCommand::Release]
        );
    }

    #[test]
    fn test_transient_grab_failures_tolerated() {
        let frames = vec![
            Err(grab_error()),
            Err(grab_error()),
            Ok(Some(frame([0, 0]))),
            Err(grab_error()),
        ];
        let sink = RecordingSink::default();
        let (e, _log) = engine(frames, &[], sink.clone());
        assert_eq!(e.run(&AtomicBool::new(false)), ExitReason::SourceExhausted);
        assert_eq!(*sink.presented.lock().unwrap(), 1);
    }

    #[test]
    fn test_persistent_grab_failure_ends_loop() {
        let frames = (0..5).map(|_| Err(grab_error())).collect();
        let (e, log) = engine(frames, &[], RecordingSink::default());
        assert_eq!(e.run(&AtomicBool::new(false)), ExitReason::SourceFailed);
        assert_eq!(
            commands(&log),
            vec![ServoCommand::Angle(0.0), ServoCommand::Release]
        );
    }

    #[test]
    fn test_stop_flag_and_limits() {
        let frames = (0..5).map(|_| Ok(Some(frame([0, 0])))).collect();
        let (e, _) = engine(frames, &[], RecordingSink::default());
        assert_eq!(e.run(&AtomicBool::new(true)), ExitReason::Stopped);

        let frames = (0..5).map(|_| Ok(Some(frame([0, 0])))).collect();
        let sink = RecordingSink::default();
        let (mut e, _) = engine(frames, &[], sink.clone());
        e.limits.max_frames = 3;
        assert_eq!(e.run(&AtomicBool::new(false)), ExitReason::FrameLimit);
        assert_eq!(*sink.presented.lock().unwrap(), 3);

        let frames = (0..5).map(|_| Ok(Some(frame([0, 0])))).collect();
        let sink = RecordingSink {
            stop_after: Some(2),
            ..Default::default()
        };
        let (e, _) = engine(frames, &[], sink.clone());
        assert_eq!(e.run(&AtomicBool::new(false)), ExitReason::SinkStopped);
        assert_eq!(*sink.presented.lock().unwrap(), 2);
    }

    #[test]
    fn test_empty_gallery_never_opens() {
        let frames = vec![Ok(Some(frame([30, 30])))];
        let (e, log) = engine(frames, &[], RecordingSink::default());
        e.run(&AtomicBool::new(false));
        assert!(!commands(&log).contains(&ServoCommand::Angle(180.0)));
    }

    #[test]
    fn test_spawned_engine_stops_on_flag() {
        let frames = (0..1000).map(|_| Ok(Some(frame([0, 0])))).collect();
        let (e, log) = engine(frames, &[], RecordingSink::default());
        let stop = Arc::new(AtomicBool::new(true));
        let handle = e.spawn(stop).unwrap();
        assert_eq!(handle.join().unwrap(), ExitReason::Stopped);
        assert_eq!(commands(&log).last(), Some(&ServoCommand::Release));
    }
}
