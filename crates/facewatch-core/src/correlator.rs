//! Pairs asynchronous tracking results with the frames they were computed on.
//!
//! Frames are queued in submission order. A tracking result for frame `N`
//! pops every older frame (the tracker skipped them) and returns frame `N`.
//! A result for a frame that is no longer queued means the ordering contract
//! with the gateway is broken.

use crate::types::{Frame, FrameId};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("stream {stream_id}: result for frame {frame_id} arrived with no frames queued")]
    EmptyQueue { stream_id: usize, frame_id: FrameId },
    #[error("stream {stream_id}: result for frame {frame_id} is older than queued frame {head}")]
    StaleFrame {
        stream_id: usize,
        frame_id: FrameId,
        head: FrameId,
    },
    #[error("stream {stream_id}: frame id {frame_id} does not follow queued frame {last}")]
    NonIncreasing {
        stream_id: usize,
        frame_id: FrameId,
        last: FrameId,
    },
}

/// A frame matched to a tracking result.
#[derive(Debug)]
pub struct Resolved {
    pub frame: Frame,
    /// Frames popped on the way, oldest first.
    pub skipped: Vec<FrameId>,
}

/// FIFO of submitted frames for one stream.
pub struct FrameCorrelator {
    stream_id: usize,
    queue: Mutex<VecDeque<(FrameId, Frame)>>,
}

impl FrameCorrelator {
    pub fn new(stream_id: usize) -> Self {
        Self {
            stream_id,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn stream_id(&self) -> usize {
        self.stream_id
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(FrameId, Frame)>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a frame through `send` and queue it under the returned id.
    ///
    /// `send` runs with the queue locked, so a result for the new frame can
    /// never be resolved before the frame is queued.
    pub fn submit<F, E>(&self, frame: Frame, send: F) -> Result<FrameId, E>
    where
        F: FnOnce(&Frame) -> Result<FrameId, E>,
        E: From<CorrelatorError>,
    {
        let mut queue = self.lock();
        let frame_id = send(&frame)?;
        Self::enqueue(self.stream_id, &mut queue, frame_id, frame)?;
        Ok(frame_id)
    }

    /// Queue a frame that was already submitted.
    pub fn push(&self, frame_id: FrameId, frame: Frame) -> Result<(), CorrelatorError> {
        let mut queue = self.lock();
        Self::enqueue(self.stream_id, &mut queue, frame_id, frame)
    }

    fn enqueue(
        stream_id: usize,
        queue: &mut VecDeque<(FrameId, Frame)>,
        frame_id: FrameId,
        frame: Frame,
    ) -> Result<(), CorrelatorError> {
        if let Some(&(last, _)) = queue.back() {
            if frame_id <= last {
                return Err(CorrelatorError::NonIncreasing {
                    stream_id,
                    frame_id,
                    last,
                });
            }
        }
        queue.push_back((frame_id, frame));
        Ok(())
    }

    /// Pop frames up to and including `frame_id` and return that frame.
    pub fn resolve(&self, frame_id: FrameId) -> Result<Resolved, CorrelatorError> {
        let mut queue = self.lock();
        let mut skipped = Vec::new();

        loop {
            match queue.front() {
                None => {
                    return Err(CorrelatorError::EmptyQueue {
                        stream_id: self.stream_id,
                        frame_id,
                    })
                }
                Some(&(head, _)) if head > frame_id => {
                    return Err(CorrelatorError::StaleFrame {
                        stream_id: self.stream_id,
                        frame_id,
                        head,
                    })
                }
                Some(_) => {}
            }

            if let Some((id, frame)) = queue.pop_front() {
                if id == frame_id {
                    return Ok(Resolved { frame, skipped });
                }
                tracing::info!("skipped {}: {}", self.stream_id, id);
                skipped.push(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ids currently queued, oldest first.
    pub fn queued_ids(&self) -> Vec<FrameId> {
        self.lock().iter().map(|(id, _)| *id).collect()
    }
}
