//! Per-stream track state shared between the event consumer and the renderer.

use crate::types::{Frame, FrameId, Sample, TrackId};
use crate::gateway::TrackedSample;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    #[error("stream {stream_id}: no track {track_id}")]
    UnknownTrack { stream_id: usize, track_id: TrackId },
    #[error("stream {stream_id}: track {track_id} reported lost twice")]
    AlreadyLost { stream_id: usize, track_id: TrackId },
    #[error("stream {stream_id}: match reported for lost track {track_id}")]
    MatchOnLostTrack { stream_id: usize, track_id: TrackId },
}

/// Transient state of one tracked face.
#[derive(Debug, Clone)]
pub struct TrackState {
    pub sample: Sample,
    /// Frame of the latest sample.
    pub frame_id: FrameId,
    pub lost: bool,
    pub weak: bool,
    pub lost_at: Option<Instant>,
    pub matched_gallery_index: Option<usize>,
    /// 1.0 while live, falls towards 0.0 after loss.
    pub fade_ratio: f32,
}

impl TrackState {
    fn new(sample: Sample, weak: bool) -> Self {
        Self {
            frame_id: sample.frame_id,
            sample,
            lost: false,
            weak,
            lost_at: None,
            matched_gallery_index: None,
            fade_ratio: 1.0,
        }
    }
}

/// Copy of the table taken for drawing.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub frame_id: FrameId,
    pub frame: Frame,
    pub tracks: BTreeMap<TrackId, TrackState>,
}

struct TableState {
    frame: Option<(FrameId, Frame)>,
    tracks: BTreeMap<TrackId, TrackState>,
    updated: bool,
}

/// Fade ratio of a track lost `elapsed` ago, or `None` once it should be removed.
pub fn fade_ratio(elapsed: Duration, timeout: Duration) -> Option<f32> {
    if elapsed < timeout {
        Some(1.0 - elapsed.as_secs_f32() / timeout.as_secs_f32())
    } else {
        None
    }
}

pub struct TrackTable {
    stream_id: usize,
    fade_timeout: Duration,
    state: Mutex<TableState>,
}

impl TrackTable {
    pub fn new(stream_id: usize, fade_timeout: Duration) -> Self {
        Self {
            stream_id,
            fade_timeout,
            state: Mutex::new(TableState {
                frame: None,
                tracks: BTreeMap::new(),
                updated: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A sample for a lost track starts a new lifetime: the track is live again
    /// and may be lost once more. Its gallery match is kept.
    fn upsert_locked(state: &mut TableState, track_id: TrackId, sample: Sample, weak: bool) {
        match state.tracks.get_mut(&track_id) {
            Some(track) => {
                track.frame_id = sample.frame_id;
                track.sample = sample;
                track.weak = weak;
                track.lost = false;
                track.lost_at = None;
                track.fade_ratio = 1.0;
            }
            None => {
                state.tracks.insert(track_id, TrackState::new(sample, weak));
            }
        }
        state.updated = true;
    }

    /// Create or refresh a live track.
    pub fn upsert(&self, track_id: TrackId, sample: Sample, weak: bool) {
        let mut state = self.lock();
        Self::upsert_locked(&mut state, track_id, sample, weak);
    }

    /// Record the frame a tracking result refers to and refresh every track in it.
    pub fn apply_tracking(&self, frame_id: FrameId, frame: Frame, samples: &[TrackedSample]) {
        let mut state = self.lock();
        state.frame = Some((frame_id, frame));
        state.updated = true;
        for tracked in samples {
            Self::upsert_locked(
                &mut state,
                tracked.sample.track_id,
                tracked.sample.clone(),
                tracked.weak,
            );
        }
    }

    /// Mark a live track as lost. Replaces its sample with `best_sample` when given.
    pub fn mark_lost(
        &self,
        track_id: TrackId,
        best_sample: Option<Sample>,
        now: Instant,
    ) -> Result<(), TrackError> {
        let mut state = self.lock();
        let track = state.tracks.get_mut(&track_id).ok_or(TrackError::UnknownTrack {
            stream_id: self.stream_id,
            track_id,
        })?;

        if track.lost {
            return Err(TrackError::AlreadyLost {
                stream_id: self.stream_id,
                track_id,
            });
        }

        track.lost = true;
        track.lost_at = Some(now);
        if let Some(sample) = best_sample {
            track.sample = sample;
        }
        state.updated = true;
        Ok(())
    }

    pub fn mark_matched(&self, track_id: TrackId, gallery_index: usize) -> Result<(), TrackError> {
        let mut state = self.lock();
        let track = state.tracks.get_mut(&track_id).ok_or(TrackError::UnknownTrack {
            stream_id: self.stream_id,
            track_id,
        })?;

        if track.lost {
            return Err(TrackError::MatchOnLostTrack {
                stream_id: self.stream_id,
                track_id,
            });
        }

        track.matched_gallery_index = Some(gallery_index);
        state.updated = true;
        Ok(())
    }

    /// Copy the current frame and tracks. `None` until the first tracking result.
    pub fn snapshot(&self) -> Option<Snapshot> {
        let state = self.lock();
        let (frame_id, frame) = state.frame.clone()?;
        Some(Snapshot {
            frame_id,
            frame,
            tracks: state.tracks.clone(),
        })
    }

    /// Fade and remove lost tracks, then snapshot if anything changed since the last call.
    pub fn refresh(&self, now: Instant) -> Option<Snapshot> {
        let mut state = self.lock();
        let timeout = self.fade_timeout;
        let mut any_lost = false;

        state.tracks.retain(|_, track| {
            if !track.lost {
                return true;
            }
            any_lost = true;
            let elapsed = track
                .lost_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            match fade_ratio(elapsed, timeout) {
                Some(ratio) => {
                    track.fade_ratio = ratio;
                    true
                }
                None => false,
            }
        });

        if any_lost {
            state.updated = true;
        }
        if !state.updated {
            return None;
        }
        state.updated = false;

        let (frame_id, frame) = state.frame.clone()?;
        Some(Snapshot {
            frame_id,
            frame,
            tracks: state.tracks.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tracks.is_empty()
    }

    pub fn get(&self, track_id: TrackId) -> Option<TrackState> {
        self.lock().tracks.get(&track_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use image::RgbImage;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_millis(5000);

    fn sample(track_id: TrackId, frame_id: FrameId) -> Sample {
        Sample {
            track_id,
            frame_id,
            face: BoundingBox {
                x: 10.0, y: 10.0, width: 20.0, height: 20.0, confidence: 0.9, landmarks: None,
            },
            crop: Arc::new(RgbImage::new(8, 8)),
            crop_origin: (10, 10),
        }
    }

    fn tracked(track_id: TrackId, frame_id: FrameId) -> TrackedSample {
        TrackedSample { sample: sample(track_id, frame_id), weak: false, quality: 0.9 }
    }

    fn table_with_frame() -> TrackTable {
        let table = TrackTable::new(0, TIMEOUT);
        table.apply_tracking(1, Frame::new(RgbImage::new(4, 4), 1), &[tracked(7, 1)]);
        table
    }

    #[test]
    fn test_upsert_creates_then_updates() {
        let table = TrackTable::new(0, TIMEOUT);
        table.upsert(1, sample(1, 1), true);
        table.upsert(1, sample(1, 2), false);
        assert_eq!(table.len(), 1);
        let t = table.get(1).unwrap();
        assert_eq!(t.frame_id, 2);
        assert!(!t.weak);
        assert!(!t.lost);
    }

    #[test]
    fn test_mark_lost_once() {
        let table = table_with_frame();
        let now = Instant::now();
        table.mark_lost(7, None, now).unwrap();
        assert_eq!(
            table.mark_lost(7, None, now).unwrap_err(),
            TrackError::AlreadyLost { stream_id: 0, track_id: 7 }
        );
    }

    #[test]
    fn test_tracking_revives_lost_track_for_a_new_lifetime() {
        let table = table_with_frame();
        table.mark_matched(7, 2).unwrap();
        let now = Instant::now();
        table.mark_lost(7, None, now).unwrap();

        table.apply_tracking(2, Frame::new(RgbImage::new(4, 4), 2), &[tracked(7, 2)]);
        let t = table.get(7).unwrap();
        assert!(!t.lost);
        assert_eq!(t.lost_at, None);
        assert_eq!(t.fade_ratio, 1.0);
        assert_eq!(t.frame_id, 2);
        assert_eq!(t.matched_gallery_index, Some(2));

        // One loss per lifetime: the revived track may be lost again, once.
        table.mark_lost(7, None, now).unwrap();
        assert_eq!(
            table.mark_lost(7, None, now).unwrap_err(),
            TrackError::AlreadyLost { stream_id: 0, track_id: 7 }
        );
    }

    #[test]
    fn test_mark_lost_replaces_sample_with_best() {
        let table = table_with_frame();
        table.mark_lost(7, Some(sample(7, 99)), Instant::now()).unwrap();
        let t = table.get(7).unwrap();
        assert!(t.lost);
        assert_eq!(t.sample.frame_id, 99);
        // The drawn frame id stays the one of the last live sample.
        assert_eq!(t.frame_id, 1);
    }

    #[test]
    fn test_mark_lost_unknown_track() {
        let table = TrackTable::new(2, TIMEOUT);
        assert_eq!(
            table.mark_lost(5, None, Instant::now()).unwrap_err(),
            TrackError::UnknownTrack { stream_id: 2, track_id: 5 }
        );
    }

    #[test]
    fn test_mark_matched_rejects_lost_track() {
        let table = table_with_frame();
        table.mark_matched(7, 3).unwrap();
        assert_eq!(table.get(7).unwrap().matched_gallery_index, Some(3));
        table.mark_lost(7, None, Instant::now()).unwrap();
        assert_eq!(
            table.mark_matched(7, 4).unwrap_err(),
            TrackError::MatchOnLostTrack { stream_id: 0, track_id: 7 }
        );
    }

    #[test]
    fn test_fade_ratio_monotonic_and_removal_at_timeout() {
        let mut prev = f32::INFINITY;
        for ms in (0..5000).step_by(250) {
            let r = fade_ratio(Duration::from_millis(ms), TIMEOUT).unwrap();
            assert!((0.0..=1.0).contains(&r));
            assert!(r <= prev);
            prev = r;
        }
        assert_eq!(fade_ratio(Duration::ZERO, TIMEOUT), Some(1.0));
        assert_eq!(fade_ratio(TIMEOUT, TIMEOUT), None);
        assert_eq!(fade_ratio(Duration::from_millis(7000), TIMEOUT), None);
    }

    #[test]
    fn test_refresh_fades_then_removes() {
        let table = table_with_frame();
        let lost_at = Instant::now();
        table.mark_lost(7, None, lost_at).unwrap();

        let snap = table.refresh(lost_at + Duration::from_millis(2500)).unwrap();
        let ratio = snap.tracks[&7].fade_ratio;
        assert!((ratio - 0.5).abs() < 1e-3, "ratio {ratio}");

        let snap = table.refresh(lost_at + Duration::from_millis(5000)).unwrap();
        assert!(snap.tracks.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_refresh_skips_when_unchanged() {
        let table = table_with_frame();
        let now = Instant::now();
        assert!(table.refresh(now).is_some());
        assert!(table.refresh(now).is_none());
        table.mark_matched(7, 0).unwrap();
        assert!(table.refresh(now).is_some());
    }

    #[test]
    fn test_refresh_without_frame_yields_nothing() {
        let table = TrackTable::new(0, TIMEOUT);
        table.upsert(1, sample(1, 1), false);
        assert!(table.refresh(Instant::now()).is_none());
        assert!(table.snapshot().is_none());
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let table = table_with_frame();
        let snap = table.snapshot().unwrap();
        table.mark_matched(7, 1).unwrap();
        assert_eq!(snap.tracks[&7].matched_gallery_index, None);
        assert_eq!(snap.frame_id, 1);
    }
}
