use std::collections::{vec_deque, VecDeque};

use crate::{
    error::{ConfigError, PipelineError, Result},
    frame::Frame,
};

/// Fixed capacity ring buffer holding the most recent frames of a run.
///
/// Pushing beyond capacity evicts the oldest frame, so at most `capacity`
/// frames are ever resident. Eviction is O(1).
#[derive(Debug)]
pub struct FrameStore {
    capacity: usize,
    frames: VecDeque<Frame>,
}

impl FrameStore {
    /// Matching needs two frames in memory, so `capacity` must be at least 2.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity < 2 {
            return Err(ConfigError::InvalidBufferCapacity(capacity));
        }

        Ok(Self {
            capacity,
            frames: VecDeque::with_capacity(capacity + 1),
        })
    }

    /// Appends `frame` and returns the frame evicted to make room, if any.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        self.frames.push_back(frame);
        if self.frames.len() > self.capacity {
            self.frames.pop_front()
        } else {
            None
        }
    }

    /// The `k` most recently pushed frames, oldest first.
    pub fn latest(&self, k: usize) -> Result<vec_deque::Iter<'_, Frame>> {
        let resident = self.frames.len();
        if k > resident {
            return Err(PipelineError::InsufficientHistory {
                requested: k,
                resident,
            });
        }

        Ok(self.frames.range(resident - k..))
    }

    pub fn newest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn newest_mut(&mut self) -> Option<&mut Frame> {
        self.frames.back_mut()
    }

    /// Resident frames, oldest first
    pub fn iter(&self) -> vec_deque::Iter<'_, Frame> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
