//! Resumable inference state.
//!
//! A [`Checkpoint`] records where the driver stood in the row stream and in
//! its annealing schedule. Resuming seeks the row stream to
//! [`StreamInterval::assigned_pos`] and continues the schedule from
//! [`Schedule`].

use serde::{Deserialize, Serialize};

use crate::config::ScheduleConfig;

/// Byte offsets into the row stream.
///
/// Rows between `assigned_pos` and `unassigned_pos` are currently assigned;
/// the next row to add is read at `unassigned_pos`, the next row to remove at
/// `assigned_pos`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInterval {
    pub unassigned_pos: u64,
    pub assigned_pos: u64,
}

/// Deterministic add/remove interleaving of the annealing pass.
///
/// Each step either adds the next unassigned row or removes the oldest
/// assigned one. With `extra_passes = p`, rows are added `1 + p` times for
/// every `p` removals, so the stream is traversed `1 + p` times in total.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnealingState {
    pub state: f64,
    pub add_rate: f64,
    pub remove_rate: f64,
}

impl AnnealingState {
    pub fn new(extra_passes: f64) -> Self {
        let add_rate = 1.0 + extra_passes;
        Self {
            state: add_rate,
            add_rate,
            remove_rate: extra_passes,
        }
    }

    /// Advance one step; `true` means add a row, `false` remove one.
    pub fn next_action_is_add(&mut self) -> bool {
        if self.state >= 0.0 {
            self.state -= self.remove_rate;
            true
        } else {
            self.state += self.add_rate;
            false
        }
    }
}

/// In-flight schedule state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub annealing_state: AnnealingState,
    /// Rows currently assigned.
    pub row_count: u64,
    /// Consecutive rejected kind proposals.
    pub reject_iters: u64,
}

impl Schedule {
    pub fn new(config: &ScheduleConfig) -> Self {
        Self {
            annealing_state: AnnealingState::new(config.extra_passes),
            row_count: 0,
            reject_iters: 0,
        }
    }
}

/// Everything needed to resume inference besides the model itself.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Steps taken through the row stream so far.
    pub tardis_iter: u64,
    pub seed: u64,
    pub schedule: Schedule,
    pub stream_interval: StreamInterval,
    /// Rows in the full stream.
    pub row_count: u64,
    pub finished: bool,
}

impl Checkpoint {
    /// State before the first step.
    pub fn start(seed: u64, row_count: u64, config: &ScheduleConfig) -> Self {
        Self {
            tardis_iter: 0,
            seed,
            schedule: Schedule::new(config),
            stream_interval: StreamInterval::default(),
            row_count,
            finished: false,
        }
    }
}
