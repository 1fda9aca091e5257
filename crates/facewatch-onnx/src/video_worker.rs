//! Multi-stream video worker: detection, tracking and matching per stream.
//!
//! Each stream owns a processing thread fed by a bounded queue. When the
//! queue is full the oldest frame is dropped, so a slow detector never
//! back-pressures capture. Tracking, tracking-lost and match-found results are
//! sent to the stream's listeners as [`WorkerEvent`]s. Errors on processing
//! threads are kept and raised by the next `check_exceptions()`.
//!
//! Disabling a stream stops new frames from being queued; frames already
//! queued are still processed. A tracker reset takes effect after every frame
//! queued before it.

use crate::matcher::Matcher;
use crate::tracker::{IouTracker, LostTrack, TrackerParams};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use facewatch_core::gateway::{
    check_stream, EventSender, MatchFoundData, SearchAcceleration, TrackingData,
    TrackingLostData,
};
use facewatch_core::{
    deferred_errors, Capturer, DatabaseElement, ErrorPoll, ErrorReporter, FrameId, GatewayError,
    ListenerId, Recognizer, VideoWorker, VideoWorkerParams, WorkerEvent,
};
use image::RgbImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const ERROR_CAPACITY: usize = 16;

struct QueuedFrame {
    frame_id: FrameId,
    image: RgbImage,
    timestamp_us: u64,
}

/// Per-stream state shared with its processing thread.
struct StreamControl {
    enabled: AtomicBool,
    reset: AtomicBool,
}

struct StreamSlot {
    tx: Sender<QueuedFrame>,
    /// Receiver clone used to evict the oldest frame when the queue is full.
    evict: Receiver<QueuedFrame>,
    control: Arc<StreamControl>,
}

struct Shared {
    listeners: Mutex<HashMap<ListenerId, (usize, EventSender)>>,
    matcher: RwLock<Arc<Matcher>>,
    shutdown: AtomicBool,
    search_k: usize,
    report_not_found: bool,
}

impl Shared {
    fn emit(&self, stream_id: usize, event: WorkerEvent) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, (sid, tx)) in listeners.iter() {
            if *sid == stream_id && tx.send(event.clone()).is_err() {
                tracing::debug!(listener = id.0, stream_id, "listener gone, event dropped");
            }
        }
    }

    fn matcher(&self) -> Arc<Matcher> {
        self.matcher.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Face backend for one stream's processing thread.
pub struct StreamEngine {
    pub capturer: Box<dyn Capturer>,
    pub recognizer: Box<dyn Recognizer>,
}

pub struct TrackingVideoWorker {
    shared: Arc<Shared>,
    streams: Vec<StreamSlot>,
    next_frame_id: AtomicU64,
    next_listener_id: AtomicU64,
    errors: Mutex<ErrorPoll<GatewayError>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TrackingVideoWorker {
    /// Start one processing thread per stream. `engines` must hold one entry per stream.
    pub fn start(
        params: &VideoWorkerParams,
        tracker: TrackerParams,
        engines: Vec<StreamEngine>,
    ) -> Result<Self, GatewayError> {
        if params.streams_count == 0 {
            return Err(GatewayError::Config("streams_count must be at least 1".into()));
        }
        if engines.len() != params.streams_count {
            return Err(GatewayError::Config(format!(
                "{} engines for {} streams",
                engines.len(),
                params.streams_count
            )));
        }
        for (name, n) in [
            ("processing_threads_count", params.processing_threads_count),
            ("matching_threads_count", params.matching_threads_count),
        ] {
            if n != 0 && n != params.streams_count {
                tracing::warn!(
                    parameter = name,
                    requested = n,
                    used = params.streams_count,
                    "one thread per stream is used"
                );
            }
        }

        let shared = Arc::new(Shared {
            listeners: Mutex::new(HashMap::new()),
            matcher: RwLock::new(Arc::new(Matcher::default())),
            shutdown: AtomicBool::new(false),
            search_k: params.search_k,
            report_not_found: params.not_found_match_found_callback,
        });
        let (reporter, poll) = deferred_errors(ERROR_CAPACITY);

        let mut streams = Vec::with_capacity(engines.len());
        let mut threads = Vec::with_capacity(engines.len());
        for (stream_id, engine) in engines.into_iter().enumerate() {
            let (tx, rx) = crossbeam_channel::bounded(tracker.queue_capacity.max(1));
            let control = Arc::new(StreamControl {
                enabled: AtomicBool::new(true),
                reset: AtomicBool::new(false),
            });

            let processor = StreamProcessor {
                stream_id,
                shared: Arc::clone(&shared),
                control: Arc::clone(&control),
                tracker: IouTracker::new(tracker.clone()),
                engine,
                errors: reporter.clone(),
            };
            let rx_thread = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vw-stream-{stream_id}"))
                .spawn(move || processor.run(rx_thread))
                .map_err(|e| GatewayError::Backend(format!("spawn processing thread: {e}")))?;

            streams.push(StreamSlot { tx, evict: rx, control });
            threads.push(handle);
        }

        tracing::info!(streams = streams.len(), search_k = params.search_k, "video worker started");

        Ok(Self {
            shared,
            streams,
            next_frame_id: AtomicU64::new(1),
            next_listener_id: AtomicU64::new(0),
            errors: Mutex::new(poll),
            threads: Mutex::new(threads),
        })
    }

    fn slot(&self, stream_id: usize) -> Result<&StreamSlot, GatewayError> {
        check_stream(stream_id, self.streams.len())?;
        Ok(&self.streams[stream_id])
    }

    fn threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VideoWorker for TrackingVideoWorker {
    fn streams_count(&self) -> usize {
        self.streams.len()
    }

    fn set_database(
        &self,
        elements: Vec<DatabaseElement>,
        acceleration: SearchAcceleration,
    ) -> Result<(), GatewayError> {
        let count = elements.len();
        let matcher = Arc::new(Matcher::new(elements, acceleration));
        *self.shared.matcher.write().unwrap_or_else(PoisonError::into_inner) = matcher;
        tracing::info!(elements = count, ?acceleration, "database set");
        Ok(())
    }

    fn add_video_frame(
        &self,
        image: &RgbImage,
        stream_id: usize,
        timestamp_us: u64,
    ) -> Result<FrameId, GatewayError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(GatewayError::Closed);
        }
        let slot = self.slot(stream_id)?;
        let frame_id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        if !slot.control.enabled.load(Ordering::Acquire) {
            tracing::trace!(stream_id, frame_id, "processing disabled, frame ignored");
            return Ok(frame_id);
        }
        let mut frame = QueuedFrame {
            frame_id,
            image: image.clone(),
            timestamp_us,
        };

        loop {
            match slot.tx.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    if let Ok(old) = slot.evict.try_recv() {
                        tracing::debug!(stream_id, frame_id = old.frame_id, "queue full, oldest frame dropped");
                    }
                    frame = back;
                }
                Err(TrySendError::Disconnected(_)) => return Err(GatewayError::Closed),
            }
        }

        Ok(frame_id)
    }

    fn add_listener(&self, stream_id: usize, sender: EventSender) -> Result<ListenerId, GatewayError> {
        check_stream(stream_id, self.streams.len())?;
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (stream_id, sender));
        Ok(id)
    }

    fn remove_listener(&self, id: ListenerId) -> Result<(), GatewayError> {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .map(|_| ())
            .ok_or(GatewayError::UnknownListener(id))
    }

    fn enable_processing_on_stream(&self, stream_id: usize) -> Result<(), GatewayError> {
        self.slot(stream_id)?.control.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn disable_processing_on_stream(&self, stream_id: usize) -> Result<(), GatewayError> {
        self.slot(stream_id)?.control.enabled.store(false, Ordering::Release);
        Ok(())
    }

    fn reset_tracker_on_stream(&self, stream_id: usize) -> Result<(), GatewayError> {
        self.slot(stream_id)?.control.reset.store(true, Ordering::Release);
        Ok(())
    }

    fn check_exceptions(&self) -> Result<(), GatewayError> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).check()
    }
}

impl Drop for TrackingVideoWorker {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for handle in self.threads().drain(..) {
            if handle.join().is_err() {
                tracing::error!("video worker thread panicked");
            }
        }
        tracing::debug!("video worker stopped");
    }
}

struct StreamProcessor {
    stream_id: usize,
    shared: Arc<Shared>,
    control: Arc<StreamControl>,
    tracker: IouTracker,
    engine: StreamEngine,
    errors: ErrorReporter<GatewayError>,
}

impl StreamProcessor {
    fn run(mut self, rx: Receiver<QueuedFrame>) {
        tracing::debug!(stream_id = self.stream_id, "processing thread started");
        while !self.shared.shutdown.load(Ordering::Acquire) {
            if self.control.reset.swap(false, Ordering::AcqRel) {
                while let Ok(frame) = rx.try_recv() {
                    self.handle(frame);
                }
                let lost = self.tracker.reset();
                tracing::debug!(stream_id = self.stream_id, tracks = lost.len(), "tracker reset");
                self.emit_lost(lost);
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(frame) => self.handle(frame),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!(stream_id = self.stream_id, "processing thread stopped");
    }

    fn handle(&mut self, frame: QueuedFrame) {
        if let Err(e) = self.process(frame) {
            tracing::error!(stream_id = self.stream_id, error = %e, "frame processing failed");
            self.errors.report(e);
        }
    }

    fn process(&mut self, frame: QueuedFrame) -> Result<(), GatewayError> {
        let detections = self.engine.capturer.capture(&frame.image)?;
        let step = self.tracker.update(frame.frame_id, detections);

        tracing::trace!(
            stream_id = self.stream_id,
            frame_id = frame.frame_id,
            timestamp_us = frame.timestamp_us,
            faces = step.tracked.len(),
            "frame processed"
        );

        let due: Vec<_> = step
            .due_for_match
            .iter()
            .map(|&i| step.tracked[i].sample.clone())
            .collect();

        self.shared.emit(
            self.stream_id,
            WorkerEvent::Tracking(TrackingData {
                stream_id: self.stream_id,
                frame_id: frame.frame_id,
                samples: step.tracked,
            }),
        );

        let matcher = self.shared.matcher();
        for sample in due {
            let template = self.engine.recognizer.process(&sample)?;
            let search_results = matcher.search(&template, self.shared.search_k);
            let found = search_results.first().is_some_and(|r| r.element_id.is_some());
            if found || self.shared.report_not_found {
                self.shared.emit(
                    self.stream_id,
                    WorkerEvent::MatchFound(MatchFoundData {
                        stream_id: self.stream_id,
                        sample,
                        template,
                        search_results,
                    }),
                );
            }
        }

        self.emit_lost(step.lost);
        Ok(())
    }

    fn emit_lost(&self, lost: Vec<LostTrack>) {
        for track in lost {
            self.shared.emit(
                self.stream_id,
                WorkerEvent::TrackingLost(TrackingLostData {
                    stream_id: self.stream_id,
                    track_id: track.track_id,
                    first_frame_id: track.first_frame_id,
                    last_frame_id: track.last_frame_id,
                    best_quality_sample: track.best_quality_sample,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::{BoundingBox, Sample, Template};
    use image::Rgb;
    use tokio::sync::mpsc;

    /// One face per non-black frame, confidence from the red channel.
    struct BrightCapturer;

    impl Capturer for BrightCapturer {
        fn capture(&mut self, image: &RgbImage) -> Result<Vec<Sample>, GatewayError> {
            let [r, g, _] = image.get_pixel(0, 0).0;
            if r == 0 && g == 0 {
                return Ok(vec![]);
            }
            if g == 255 {
                return Err(GatewayError::Backend("detector exploded".into()));
            }
            Ok(vec![Sample {
                track_id: 0,
                frame_id: 0,
                face: BoundingBox {
                    x: 10.0, y: 10.0, width: 80.0, height: 80.0,
                    confidence: r as f32 / 255.0, landmarks: None,
                },
                crop: Arc::new(image.clone()),
                crop_origin: (10, 10),
            }])
        }
    }

    struct ConstRecognizer;

    impl Recognizer for ConstRecognizer {
        fn process(&mut self, _sample: &Sample) -> Result<Template, GatewayError> {
            Ok(Template { values: vec![1.0, 0.0], method: Some("const".into()) })
        }

        fn method_name(&self) -> &str {
            "const"
        }
    }

    fn engine() -> StreamEngine {
        StreamEngine { capturer: Box::new(BrightCapturer), recognizer: Box::new(ConstRecognizer) }
    }

    fn worker(streams: usize) -> TrackingVideoWorker {
        let params = VideoWorkerParams { streams_count: streams, ..Default::default() };
        let tracker = TrackerParams { lost_after_frames: 0, queue_capacity: 8, ..Default::default() };
        TrackingVideoWorker::start(&params, tracker, (0..streams).map(|_| engine()).collect()).unwrap()
    }

    fn frame(r: u8, g: u8) -> RgbImage {
        RgbImage::from_pixel(100, 100, Rgb([r, g, 0]))
    }

    fn recv(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        for _ in 0..200 {
            if let Ok(ev) = rx.try_recv() {
                return ev;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("no event within 2s");
    }

    #[test]
    fn test_frame_ids_increase_and_stream_is_checked() {
        let w = worker(2);
        let a = w.add_video_frame(&frame(0, 0), 0, 0).unwrap();
        let b = w.add_video_frame(&frame(0, 0), 1, 0).unwrap();
        let c = w.add_video_frame(&frame(0, 0), 0, 0).unwrap();
        assert!(a < b && b < c);
        assert!(matches!(
            w.add_video_frame(&frame(0, 0), 2, 0),
            Err(GatewayError::StreamOutOfRange { stream_id: 2, streams_count: 2 })
        ));
    }

    #[test]
    fn test_tracking_match_and_lost_events_in_order() {
        let w = worker(1);
        w.set_database(
            vec![DatabaseElement {
                element_id: 0,
                person_id: 0,
                template: Template { values: vec![1.0, 0.0], method: None },
                distance_threshold: 0.3,
            }],
            SearchAcceleration::None,
        )
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        w.add_listener(0, tx).unwrap();

        let id = w.add_video_frame(&frame(250, 0), 0, 0).unwrap();
        match recv(&mut rx) {
            WorkerEvent::Tracking(t) => {
                assert_eq!(t.frame_id, id);
                assert_eq!(t.samples.len(), 1);
                assert!(!t.samples[0].weak);
            }
            other => panic!("expected tracking, got {other:?}"),
        }
        match recv(&mut rx) {
            WorkerEvent::MatchFound(m) => assert_eq!(m.search_results[0].element_id, Some(0)),
            other => panic!("expected match, got {other:?}"),
        }

        w.add_video_frame(&frame(0, 0), 0, 0).unwrap();
        assert!(matches!(recv(&mut rx), WorkerEvent::Tracking(t) if t.samples.is_empty()));
        match recv(&mut rx) {
            WorkerEvent::TrackingLost(l) => assert!(l.best_quality_sample.is_some()),
            other => panic!("expected lost, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_reports_live_tracks_lost() {
        let w = worker(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        w.add_listener(0, tx).unwrap();
        w.add_video_frame(&frame(100, 0), 0, 0).unwrap();
        assert!(matches!(recv(&mut rx), WorkerEvent::Tracking(_)));
        w.reset_tracker_on_stream(0).unwrap();
        assert!(matches!(recv(&mut rx), WorkerEvent::TrackingLost(_)));
    }

    #[test]
    fn test_frames_queued_before_reset_and_disable_are_processed() {
        let w = worker(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        w.add_listener(0, tx).unwrap();

        let ids: Vec<_> = (0..3).map(|_| w.add_video_frame(&frame(100, 0), 0, 0).unwrap()).collect();
        w.reset_tracker_on_stream(0).unwrap();
        w.disable_processing_on_stream(0).unwrap();

        let mut next = || loop {
            match recv(&mut rx) {
                WorkerEvent::MatchFound(_) => continue,
                event => return event,
            }
        };
        for id in ids {
            match next() {
                WorkerEvent::Tracking(t) => assert_eq!(t.frame_id, id),
                other => panic!("expected tracking for frame {id}, got {other:?}"),
            }
        }
        assert!(matches!(next(), WorkerEvent::TrackingLost(_)));

        // Disabled: new frames are not processed.
        w.add_video_frame(&frame(100, 0), 0, 0).unwrap();
        std::thread::sleep(POLL_INTERVAL * 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_backend_error_surfaces_on_check_exceptions() {
        let w = worker(1);
        w.add_video_frame(&frame(10, 255), 0, 0).unwrap();
        let mut err = None;
        for _ in 0..200 {
            if let Err(e) = w.check_exceptions() {
                err = Some(e);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(err, Some(GatewayError::Backend(_))));
    }

    #[test]
    fn test_remove_listener_closes_channel() {
        let w = worker(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = w.add_listener(0, tx).unwrap();
        w.remove_listener(id).unwrap();
        assert!(rx.blocking_recv().is_none());
        assert!(matches!(w.remove_listener(id), Err(GatewayError::UnknownListener(_))));
    }

    #[test]
    fn test_engine_count_must_match_streams() {
        let params = VideoWorkerParams { streams_count: 2, ..Default::default() };
        assert!(TrackingVideoWorker::start(&params, TrackerParams::default(), vec![engine()]).is_err());
    }
}
