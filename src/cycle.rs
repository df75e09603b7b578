//! Decision-cycle phases, stop reasons and the cross-thread stop handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// One phase of the decision cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Input,
    Propose,
    Decision,
    Apply,
    Output,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Input,
        Phase::Propose,
        Phase::Decision,
        Phase::Apply,
        Phase::Output,
    ];

    /// The phase that follows this one; OUTPUT wraps around to INPUT.
    pub fn next(self) -> Phase {
        match self {
            Phase::Input => Phase::Propose,
            Phase::Propose => Phase::Decision,
            Phase::Decision => Phase::Apply,
            Phase::Apply => Phase::Output,
            Phase::Output => Phase::Input,
        }
    }

    /// Whether elaboration in this phase may fire o-supported matches.
    pub fn fires_o_support(self) -> bool {
        self == Phase::Apply
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Input => "input",
            Phase::Propose => "propose",
            Phase::Decision => "decision",
            Phase::Apply => "apply",
            Phase::Output => "output",
        };
        f.write_str(s)
    }
}

/// Why a phase or a run ended early, or that it ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The requested number of decision cycles completed.
    Completed,
    /// A rule or the caller halted the reasoner.
    Halted,
    /// The [`StopHandle`] was triggered.
    Stopped,
    /// An elaboration phase hit `max_elaborations` waves.
    MaxElaborations,
    /// A new sub-goal would exceed `max_goal_depth`.
    MaxGoalDepth,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Completed => "completed",
            StopReason::Halted => "halted",
            StopReason::Stopped => "stopped",
            StopReason::MaxElaborations => "max-elaborations",
            StopReason::MaxGoalDepth => "max-goal-depth",
        };
        f.write_str(s)
    }
}

/// Result of running a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    /// Completed cycles after this phase.
    pub cycle: u64,
    pub stop: Option<StopReason>,
}

/// Shared flag asking a running reasoner to stop at the next boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Consume a pending request. Returns whether one was pending.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_cycle_back_to_input() {
        let mut phase = Phase::Input;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(phase);
            phase = phase.next();
        }
        assert_eq!(seen, Phase::ALL.to_vec());
        assert_eq!(phase, Phase::Input);
    }

    #[test]
    fn only_apply_fires_o_support() {
        let firing: Vec<Phase> = Phase::ALL
            .into_iter()
            .filter(|p| p.fires_o_support())
            .collect();
        assert_eq!(firing, vec![Phase::Apply]);
    }

    #[test]
    fn stop_handle_is_shared_and_consumed() {
        let handle = StopHandle::new();
        let remote = handle.clone();
        std::thread::spawn(move || remote.request_stop())
            .join()
            .unwrap();
        assert!(handle.is_requested());
        assert!(handle.take());
        assert!(!handle.take());
    }
}
