//! Per-stream worker threads and the orchestrator that owns them.
//!
//! Each stream runs three threads: capture (pace, read, submit), event
//! consumer (apply gateway events to the track table) and render (redraw on a
//! fixed interval). Errors on any of them go through the deferred-error
//! channel and are raised by [`Orchestrator::tick`].

use crate::display::{DisplayError, DisplaySink};
use facewatch_core::gateway::{MatchFoundData, TrackingData, TrackingLostData};
use facewatch_core::{
    deferred_errors, CorrelatorError, ErrorPoll, ErrorReporter, FrameCorrelator, FramePacer,
    FrameSource, GatewayError, ListenerId, Renderer, SourceError, TrackError, TrackTable,
    VideoWorker, WorkerEvent,
};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

const DEFERRED_ERROR_CAPACITY: usize = 16;
/// Period of the `--show-metrics` log line.
const METRICS_PERIOD: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
    #[error(transparent)]
    Track(#[from] TrackError),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("source {name}: {source}")]
    Source {
        name: String,
        #[source]
        source: SourceError,
    },
    #[error("stream {stream_id}: search result {position} references invalid element {element_id:?}")]
    InvalidMatch {
        stream_id: usize,
        position: usize,
        element_id: Option<u64>,
    },
    #[error("display error: {0}")]
    Display(#[from] DisplayError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Running counters of one stream, fed by its event consumer.
#[derive(Default)]
pub struct StreamMetrics {
    frames: AtomicU64,
    faces_total: AtomicU64,
    faces_last: AtomicU64,
    /// One past the highest track id seen.
    track_watermark: AtomicU64,
    tracks: AtomicU64,
    templates: AtomicU64,
    matches: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Tracking results received.
    pub frames: u64,
    /// Faces summed over every tracking result.
    pub faces_total: u64,
    /// Faces in the latest tracking result.
    pub faces_last: u64,
    /// Distinct tracks started.
    pub tracks: u64,
    /// Templates extracted for a gallery search.
    pub templates: u64,
    /// Searches that found a gallery entry.
    pub matches: u64,
}

impl StreamMetrics {
    fn record_tracking(&self, data: &TrackingData) {
        let faces = data.samples.len() as u64;
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.faces_total.fetch_add(faces, Ordering::Relaxed);
        self.faces_last.store(faces, Ordering::Relaxed);
        for tracked in &data.samples {
            let next = tracked.sample.track_id + 1;
            if self.track_watermark.fetch_max(next, Ordering::Relaxed) < next {
                self.tracks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn record_search(&self, found: bool) {
        self.templates.fetch_add(1, Ordering::Relaxed);
        if found {
            self.matches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            faces_total: self.faces_total.load(Ordering::Relaxed),
            faces_last: self.faces_last.load(Ordering::Relaxed),
            tracks: self.tracks.load(Ordering::Relaxed),
            templates: self.templates.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
        }
    }
}

/// State of one stream shared by its threads.
pub struct StreamState {
    pub stream_id: usize,
    pub name: String,
    pub correlator: FrameCorrelator,
    pub table: TrackTable,
    pub metrics: StreamMetrics,
    gallery_len: usize,
    drawn: Mutex<Option<RgbImage>>,
    exhausted: AtomicBool,
}

impl StreamState {
    pub fn new(stream_id: usize, name: String, renderer: &Renderer, gallery_len: usize) -> Self {
        Self {
            stream_id,
            name,
            correlator: FrameCorrelator::new(stream_id),
            table: TrackTable::new(stream_id, renderer.config().fade_timeout()),
            metrics: StreamMetrics::default(),
            gallery_len,
            drawn: Mutex::new(None),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Apply one gateway event to the track table.
    pub fn apply_event(&self, event: WorkerEvent) -> Result<(), EngineError> {
        match event {
            WorkerEvent::Tracking(data) => self.on_tracking(data),
            WorkerEvent::TrackingLost(data) => self.on_tracking_lost(data),
            WorkerEvent::MatchFound(data) => self.on_match_found(data),
        }
    }

    fn on_tracking(&self, data: TrackingData) -> Result<(), EngineError> {
        let resolved = self.correlator.resolve(data.frame_id)?;
        self.metrics.record_tracking(&data);
        self.table
            .apply_tracking(data.frame_id, resolved.frame, &data.samples);
        Ok(())
    }

    fn on_tracking_lost(&self, data: TrackingLostData) -> Result<(), EngineError> {
        tracing::debug!(
            stream = self.stream_id,
            track_id = data.track_id,
            first_frame = data.first_frame_id,
            last_frame = data.last_frame_id,
            "tracking lost"
        );
        self.table
            .mark_lost(data.track_id, data.best_quality_sample, Instant::now())?;
        Ok(())
    }

    fn on_match_found(&self, data: MatchFoundData) -> Result<(), EngineError> {
        for (position, result) in data.search_results.iter().enumerate() {
            let valid = match result.element_id {
                None => position == 0,
                Some(id) => (id as usize) < self.gallery_len,
            };
            if !valid {
                return Err(EngineError::InvalidMatch {
                    stream_id: self.stream_id,
                    position,
                    element_id: result.element_id,
                });
            }
        }

        let track_id = data.sample.track_id;
        let best = data.search_results.first().and_then(|r| r.element_id.map(|id| (id, r.distance)));
        self.metrics.record_search(best.is_some());
        match best {
            Some((element_id, distance)) => {
                tracing::debug!(stream = self.stream_id, track_id, element_id, distance, "match found");
                self.table.mark_matched(track_id, element_id as usize)?;
            }
            None => {
                tracing::trace!(stream = self.stream_id, track_id, "no match");
            }
        }
        Ok(())
    }

    /// Take the most recently drawn image, if a new one was drawn.
    pub fn take_drawn(&self) -> Option<RgbImage> {
        self.drawn.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn store_drawn(&self, image: RgbImage) {
        *self.drawn.lock().unwrap_or_else(PoisonError::into_inner) = Some(image);
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Exhausted, and every submitted frame has its tracking result.
    pub fn is_finished(&self) -> bool {
        self.is_exhausted() && self.correlator.is_empty()
    }
}

/// Threads and gateway registration of one stream.
pub struct StreamWorker {
    state: Arc<StreamState>,
    worker: Arc<dyn VideoWorker>,
    shutdown: Arc<AtomicBool>,
    listener: Option<ListenerId>,
    capture: Option<JoinHandle<()>>,
    render: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

/// Settings shared by every stream of an orchestrator.
#[derive(Clone)]
pub struct StreamSettings {
    pub renderer: Arc<Renderer>,
    pub gallery_len: usize,
    pub fps_limit: f64,
    /// Log per-stream counters every [`METRICS_PERIOD`].
    pub show_metrics: bool,
}

impl StreamWorker {
    pub fn start(
        stream_id: usize,
        source: Box<dyn FrameSource>,
        worker: Arc<dyn VideoWorker>,
        settings: &StreamSettings,
        shutdown: Arc<AtomicBool>,
        reporter: ErrorReporter<EngineError>,
        clock: Instant,
    ) -> Result<Self, EngineError> {
        let state = Arc::new(StreamState::new(
            stream_id,
            source.name().to_string(),
            &settings.renderer,
            settings.gallery_len,
        ));

        let mut this = Self {
            state: state.clone(),
            worker: worker.clone(),
            shutdown: shutdown.clone(),
            listener: None,
            capture: None,
            render: None,
            consumer: None,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        this.listener = Some(worker.add_listener(stream_id, tx)?);

        let consumer_state = state.clone();
        let consumer_reporter = reporter.clone();
        this.consumer = Some(spawn(format!("consumer-{stream_id}"), move || {
            while let Some(event) = rx.blocking_recv() {
                if let Err(e) = consumer_state.apply_event(event) {
                    consumer_reporter.report(e);
                }
            }
            tracing::debug!(stream = consumer_state.stream_id, "event consumer exiting");
        })?);

        worker.enable_processing_on_stream(stream_id)?;

        let render_state = state.clone();
        let renderer = settings.renderer.clone();
        let render_shutdown = shutdown.clone();
        this.render = Some(spawn(format!("render-{stream_id}"), move || {
            let interval = renderer.config().interval();
            while !render_shutdown.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                if let Some(snapshot) = render_state.table.refresh(Instant::now()) {
                    render_state.store_drawn(renderer.draw(&snapshot));
                }
            }
        })?);

        let capture = CaptureLoop {
            state,
            worker,
            source,
            pacer: FramePacer::new(settings.fps_limit),
            shutdown,
            reporter,
            clock,
        };
        this.capture = Some(spawn(format!("capture-{stream_id}"), move || capture.run())?);

        tracing::info!(stream = stream_id, source = %this.state.name, "stream started");
        Ok(this)
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Stop capture and render, detach from the gateway, then drain the consumer.
    pub fn dispose(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        join(self.capture.take());
        join(self.render.take());
        if let Some(id) = self.listener.take() {
            if let Err(e) = self.worker.remove_listener(id) {
                tracing::warn!(stream = self.state.stream_id, error = %e, "failed to remove listener");
            }
        }
        join(self.consumer.take());
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn spawn<F>(name: String, f: F) -> Result<JoinHandle<()>, EngineError>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| EngineError::Spawn { name, source })
}

fn join(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        let name = handle.thread().name().unwrap_or("stream").to_string();
        if handle.join().is_err() {
            tracing::error!(thread = %name, "thread panicked");
        }
    }
}

struct CaptureLoop {
    state: Arc<StreamState>,
    worker: Arc<dyn VideoWorker>,
    source: Box<dyn FrameSource>,
    pacer: FramePacer,
    shutdown: Arc<AtomicBool>,
    reporter: ErrorReporter<EngineError>,
    clock: Instant,
}

impl CaptureLoop {
    fn run(mut self) {
        let stream_id = self.state.stream_id;
        while !self.shutdown.load(Ordering::Acquire) {
            self.pacer.wait();

            let frame = match self.source.get() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!(stream = stream_id, source = %self.state.name, "source exhausted");
                    self.finish();
                    return;
                }
                Err(e) if e.is_bad_frame() => {
                    tracing::warn!(stream = stream_id, source = %self.state.name, error = %e, "bad frame, skipped");
                    continue;
                }
                Err(source) => {
                    self.reporter.report(EngineError::Source {
                        name: self.state.name.clone(),
                        source,
                    });
                    return;
                }
            };

            if frame.is_empty() {
                tracing::warn!(stream = stream_id, "empty frame, skipped");
                continue;
            }

            let timestamp_us = frame.timestamp.saturating_duration_since(self.clock).as_micros() as u64;
            let worker = &self.worker;
            let submitted = self.state.correlator.submit(frame, |frame| {
                worker
                    .add_video_frame(&frame.color, stream_id, timestamp_us)
                    .map_err(EngineError::from)
            });
            if let Err(e) = submitted {
                self.reporter.report(e);
                return;
            }
        }
    }

    /// Lose every track, then stop feeding the stream. Frames already
    /// submitted still get their tracking results.
    fn finish(&self) {
        let stream_id = self.state.stream_id;
        let result = self
            .worker
            .reset_tracker_on_stream(stream_id)
            .and_then(|()| self.worker.disable_processing_on_stream(stream_id));
        if let Err(e) = result {
            self.reporter.report(e.into());
        }
        self.state.exhausted.store(true, Ordering::Release);
    }
}

/// Last `--show-metrics` report.
struct MetricsReport {
    at: Instant,
    frames: Vec<u64>,
}

/// Owns the stream workers and the video worker they feed.
pub struct Orchestrator {
    streams: Vec<StreamWorker>,
    worker: Arc<dyn VideoWorker>,
    errors: ErrorPoll<EngineError>,
    sink: Box<dyn DisplaySink>,
    metrics: Option<MetricsReport>,
}

impl Orchestrator {
    pub fn start(
        worker: Arc<dyn VideoWorker>,
        sources: Vec<Box<dyn FrameSource>>,
        settings: StreamSettings,
        sink: Box<dyn DisplaySink>,
    ) -> Result<Self, EngineError> {
        let streams_count = worker.streams_count();
        if sources.len() != streams_count {
            return Err(GatewayError::Config(format!(
                "{} sources for a video worker with {streams_count} streams",
                sources.len()
            ))
            .into());
        }

        let (reporter, errors) = deferred_errors(DEFERRED_ERROR_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let clock = Instant::now();

        let mut this = Self {
            streams: Vec::with_capacity(streams_count),
            worker: worker.clone(),
            errors,
            sink,
            metrics: settings.show_metrics.then(|| MetricsReport {
                at: clock,
                frames: vec![0; streams_count],
            }),
        };
        for (stream_id, source) in sources.into_iter().enumerate() {
            let stream = StreamWorker::start(
                stream_id,
                source,
                worker.clone(),
                &settings,
                shutdown.clone(),
                reporter.clone(),
                clock,
            )?;
            this.streams.push(stream);
        }

        Ok(this)
    }

    /// One control-loop step: raise pending errors, then display new images.
    ///
    /// Returns `true` once every source is exhausted and its frames are processed.
    pub fn tick(&mut self) -> Result<bool, EngineError> {
        self.errors.check()?;
        self.worker.check_exceptions()?;

        for stream in &self.streams {
            if let Some(image) = stream.state().take_drawn() {
                self.sink.show(stream.state().stream_id, &image)?;
            }
        }
        self.report_metrics(Instant::now());

        Ok(!self.streams.is_empty() && self.streams.iter().all(|s| s.state().is_finished()))
    }

    fn report_metrics(&mut self, now: Instant) {
        let Some(report) = self.metrics.as_mut() else {
            return;
        };
        let elapsed = now.saturating_duration_since(report.at);
        if elapsed < METRICS_PERIOD {
            return;
        }
        for (stream, last_frames) in self.streams.iter().zip(report.frames.iter_mut()) {
            let m = stream.state().metrics.snapshot();
            let fps = m.frames.saturating_sub(*last_frames) as f64 / elapsed.as_secs_f64();
            *last_frames = m.frames;
            tracing::info!(
                stream = stream.state().stream_id,
                fps = (fps * 10.0).round() / 10.0,
                faces_total = m.faces_total,
                faces = m.faces_last,
                matches = m.matches,
                templates = m.templates,
                tracks = m.tracks,
                "metrics"
            );
        }
        report.at = now;
    }

    pub fn streams(&self) -> &[StreamWorker] {
        &self.streams
    }

    /// Dispose every stream. Idempotent.
    pub fn shutdown(&mut self) {
        for stream in &mut self.streams {
            stream.dispose();
        }
    }

    /// Dispose every stream, then raise what the consumers reported while draining.
    pub fn close(&mut self) -> Result<(), EngineError> {
        self.shutdown();
        self.errors.check()?;
        self.worker.check_exceptions()?;
        Ok(())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
