//! Per-issue dispatch state machine.
//!
//! `Queued -> Dispatched -> Running -> {Completed, Failed}`. Terminal states
//! are final. At most `capacity` jobs are in flight (dispatched or running)
//! at once, and `completed + running + queued == total` after every
//! transition. Jobs are identified by their index in the dispatch list.

use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Queued,
    Dispatched,
    Running,
    Completed,
    Failed,
}

impl IssueState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IssueState::Completed | IssueState::Failed)
    }

    fn in_flight(self) -> bool {
        matches!(self, IssueState::Dispatched | IssueState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("unknown job {0}")]
    UnknownJob(usize),
    #[error("job {job}: illegal transition {from:?} -> {to:?}")]
    Illegal {
        job: usize,
        from: IssueState,
        to: IssueState,
    },
}

/// Live counts read by observers while workers mutate the state.
///
/// `completed` counts every terminal job; `failed` is the subset that failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerCounts {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl SchedulerCounts {
    pub fn is_consistent(&self) -> bool {
        self.completed + self.running + self.queued == self.total && self.failed <= self.completed
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerState {
    capacity: usize,
    states: Vec<IssueState>,
    queue: VecDeque<usize>,
    counts: SchedulerCounts,
}

impl SchedulerState {
    /// All `total` jobs start queued, in index order.
    pub fn new(total: usize, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            states: vec![IssueState::Queued; total],
            queue: (0..total).collect(),
            counts: SchedulerCounts {
                total,
                queued: total,
                ..SchedulerCounts::default()
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn counts(&self) -> SchedulerCounts {
        self.counts
    }

    pub fn state(&self, job: usize) -> Option<IssueState> {
        self.states.get(job).copied()
    }

    /// Pull the next queued job if a slot is free.
    pub fn dispatch_next(&mut self) -> Option<usize> {
        if self.counts.running >= self.capacity {
            return None;
        }
        let job = self.queue.pop_front()?;
        self.states[job] = IssueState::Dispatched;
        self.counts.queued -= 1;
        self.counts.running += 1;
        Some(job)
    }

    pub fn mark_running(&mut self, job: usize) -> Result<(), TransitionError> {
        self.transition(job, IssueState::Running)
    }

    /// Move an in-flight job to its terminal state, freeing its slot.
    pub fn finish(&mut self, job: usize, success: bool) -> Result<(), TransitionError> {
        let to = if success {
            IssueState::Completed
        } else {
            IssueState::Failed
        };
        self.transition(job, to)
    }

    /// True once nothing is queued or in flight.
    pub fn is_drained(&self) -> bool {
        self.counts.queued == 0 && self.counts.running == 0
    }

    fn transition(&mut self, job: usize, to: IssueState) -> Result<(), TransitionError> {
        let from = self.state(job).ok_or(TransitionError::UnknownJob(job))?;
        let legal = matches!(
            (from, to),
            (IssueState::Dispatched, IssueState::Running)
                | (IssueState::Dispatched | IssueState::Running, IssueState::Completed)
                | (IssueState::Dispatched | IssueState::Running, IssueState::Failed)
        );
        if !legal {
            return Err(TransitionError::Illegal { job, from, to });
        }
        self.states[job] = to;
        if to.is_terminal() && from.in_flight() {
            self.counts.running -= 1;
            self.counts.completed += 1;
            if to == IssueState::Failed {
                self.counts.failed += 1;
            }
        }
        Ok(())
    }
}
