use std::fmt;

/// Where the refinement controller stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RefinementState {
    /// No step taken since the session was created or reset.
    #[default]
    Idle,
    /// At least one step taken, not yet converged.
    Stepping,
    Converged,
    /// The last step raised an error.
    Failed,
}

impl RefinementState {
    /// State after a step that returned `converged`.
    pub fn after_step(self, converged: bool) -> Self {
        if converged {
            RefinementState::Converged
        } else {
            RefinementState::Stepping
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RefinementState::Converged | RefinementState::Failed)
    }
}

impl fmt::Display for RefinementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefinementState::Idle => "idle",
            RefinementState::Stepping => "stepping",
            RefinementState::Converged => "converged",
            RefinementState::Failed => "failed",
        })
    }
}

/// Summary of a finished `run_to_convergence`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinementSummary {
    pub steps: usize,
    pub rw: f64,
    pub state: RefinementState,
}
