//! Greedy IoU association of per-frame detections into tracks.
//!
//! Each frame's detections are matched to live tracks by descending overlap.
//! Unmatched detections open new tracks; tracks unmatched for more than
//! `lost_after_frames` consecutive frames are reported lost together with the
//! best-quality sample seen during their lifetime.

use facewatch_core::gateway::TrackedSample;
use facewatch_core::{FrameId, Sample, TrackId};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    /// Minimum overlap to continue a track.
    pub iou_threshold: f32,
    /// Consecutive missed frames before a track is lost.
    pub lost_after_frames: u32,
    /// Detections below this confidence are weak.
    pub weak_confidence: f32,
    /// Faces smaller than this (pixels, shorter side) are weak.
    pub min_face_size: f32,
    /// Frames between recognition attempts on the same track.
    pub match_interval_frames: u32,
    /// Per-stream frame queue length in the video worker.
    pub queue_capacity: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            lost_after_frames: 10,
            weak_confidence: 0.6,
            min_face_size: 40.0,
            match_interval_frames: 10,
            queue_capacity: 2,
        }
    }
}

/// A track that ended.
#[derive(Debug, Clone)]
pub struct LostTrack {
    pub track_id: TrackId,
    pub first_frame_id: FrameId,
    pub last_frame_id: FrameId,
    pub best_quality_sample: Option<Sample>,
}

/// Result of one tracker step.
#[derive(Debug, Default)]
pub struct TrackerStep {
    pub tracked: Vec<TrackedSample>,
    pub lost: Vec<LostTrack>,
    /// Indices into `tracked` that are due for recognition.
    pub due_for_match: Vec<usize>,
}

struct Track {
    id: TrackId,
    first_frame_id: FrameId,
    last_frame_id: FrameId,
    last: Sample,
    missed: u32,
    best: Option<(f32, Sample)>,
    /// Processed frames since the last recognition attempt, `None` before the first.
    since_match: Option<u32>,
}

impl Track {
    fn into_lost(self) -> LostTrack {
        LostTrack {
            track_id: self.id,
            first_frame_id: self.first_frame_id,
            last_frame_id: self.last_frame_id,
            best_quality_sample: self.best.map(|(_, s)| s),
        }
    }
}

pub struct IouTracker {
    params: TrackerParams,
    tracks: Vec<Track>,
    next_id: TrackId,
}

impl IouTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            params,
            tracks: Vec::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    fn quality(&self, sample: &Sample) -> (f32, bool) {
        let face = &sample.face;
        let size = face.width.min(face.height);
        let size_factor = (size / self.params.min_face_size).clamp(0.0, 1.0);
        let weak = face.confidence < self.params.weak_confidence || size < self.params.min_face_size;
        (face.confidence * size_factor, weak)
    }

    /// Associate `detections` (samples with unset track ids) from `frame_id`.
    pub fn update(&mut self, frame_id: FrameId, detections: Vec<Sample>) -> TrackerStep {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let iou = track.last.face.iou(&det.face);
                if iou >= self.params.iou_threshold {
                    pairs.push((iou, ti, di));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut track_taken = vec![false; self.tracks.len()];
        let mut assignment: Vec<Option<usize>> = vec![None; detections.len()];
        for (_, ti, di) in pairs {
            if !track_taken[ti] && assignment[di].is_none() {
                track_taken[ti] = true;
                assignment[di] = Some(ti);
            }
        }

        let mut step = TrackerStep::default();

        for (di, mut sample) in detections.into_iter().enumerate() {
            sample.frame_id = frame_id;
            let (quality, weak) = self.quality(&sample);

            let ti = match assignment[di] {
                Some(ti) => ti,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    tracing::debug!(track_id = id, frame_id, "new track");
                    self.tracks.push(Track {
                        id,
                        first_frame_id: frame_id,
                        last_frame_id: frame_id,
                        last: sample.clone(),
                        missed: 0,
                        best: None,
                        since_match: None,
                    });
                    track_taken.push(true);
                    self.tracks.len() - 1
                }
            };

            let match_interval = self.params.match_interval_frames;
            let track = &mut self.tracks[ti];
            sample.track_id = track.id;
            track.last = sample.clone();
            track.last_frame_id = frame_id;
            track.missed = 0;
            if track.best.as_ref().map_or(true, |(q, _)| quality > *q) {
                track.best = Some((quality, sample.clone()));
            }

            let due = !weak && track.since_match.map_or(true, |n| n >= match_interval);
            track.since_match = match (due, track.since_match) {
                (true, _) => Some(0),
                (false, Some(n)) => Some(n + 1),
                (false, None) => None,
            };

            if due {
                step.due_for_match.push(step.tracked.len());
            }
            step.tracked.push(TrackedSample { sample, weak, quality });
        }

        let lost_after = self.params.lost_after_frames;
        let mut kept = Vec::with_capacity(self.tracks.len());
        for (mut track, taken) in self.tracks.drain(..).zip(track_taken) {
            if !taken {
                track.missed += 1;
                if let Some(n) = track.since_match.as_mut() {
                    *n += 1;
                }
            }
            if track.missed > lost_after {
                tracing::debug!(track_id = track.id, "track lost");
                step.lost.push(track.into_lost());
            } else {
                kept.push(track);
            }
        }
        self.tracks = kept;

        step
    }

    /// End every track.
    pub fn reset(&mut self) -> Vec<LostTrack> {
        self.tracks.drain(..).map(Track::into_lost).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::BoundingBox;
    use image::RgbImage;
    use std::sync::Arc;

    fn det(x: f32, conf: f32) -> Sample {
        Sample {
            track_id: 0,
            frame_id: 0,
            face: BoundingBox { x, y: 0.0, width: 100.0, height: 100.0, confidence: conf, landmarks: None },
            crop: Arc::new(RgbImage::new(4, 4)),
            crop_origin: (x as u32, 0),
        }
    }

    fn tracker() -> IouTracker {
        IouTracker::new(TrackerParams { lost_after_frames: 2, match_interval_frames: 3, ..Default::default() })
    }

    #[test]
    fn test_overlapping_detection_keeps_track_id() {
        let mut t = tracker();
        let a = t.update(1, vec![det(0.0, 0.9), det(500.0, 0.9)]);
        let b = t.update(2, vec![det(510.0, 0.9), det(10.0, 0.9)]);
        assert_eq!(a.tracked[0].sample.track_id, b.tracked[1].sample.track_id);
        assert_eq!(a.tracked[1].sample.track_id, b.tracked[0].sample.track_id);
        assert_eq!(b.tracked[0].sample.frame_id, 2);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_track_lost_after_missed_frames_with_best_sample() {
        let mut t = tracker();
        t.update(1, vec![det(0.0, 0.7)]);
        t.update(2, vec![det(5.0, 0.95)]);
        t.update(3, vec![det(8.0, 0.8)]);
        assert!(t.update(4, vec![]).lost.is_empty());
        assert!(t.update(5, vec![]).lost.is_empty());
        let step = t.update(6, vec![]);
        assert_eq!(step.lost.len(), 1);
        let lost = &step.lost[0];
        assert_eq!((lost.first_frame_id, lost.last_frame_id), (1, 3));
        assert_eq!(lost.best_quality_sample.as_ref().unwrap().frame_id, 2);
        assert!(t.is_empty());
    }

    #[test]
    fn test_weak_samples_are_flagged_and_not_matched() {
        let mut t = tracker();
        let step = t.update(1, vec![det(0.0, 0.3)]);
        assert!(step.tracked[0].weak);
        assert!(step.due_for_match.is_empty());
    }

    #[test]
    fn test_match_interval() {
        let mut t = tracker();
        let due: Vec<bool> = (1..=8)
            .map(|f| !t.update(f, vec![det(0.0, 0.9)]).due_for_match.is_empty())
            .collect();
        assert_eq!(due, vec![true, false, false, false, true, false, false, false]);
    }

    #[test]
    fn test_reset_loses_everything_and_ids_are_not_reused() {
        let mut t = tracker();
        let first = t.update(1, vec![det(0.0, 0.9)]).tracked[0].sample.track_id;
        let lost = t.reset();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].track_id, first);
        let second = t.update(2, vec![det(0.0, 0.9)]).tracked[0].sample.track_id;
        assert_ne!(first, second);
    }
}
