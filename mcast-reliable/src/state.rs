//! Progress and round-state types.
//!
//! Every entry point of the core is a single non-blocking step.  It reports
//! [`Progress`] and the caller re-invokes it until it sees
//! [`Progress::Complete`].
//!
//! The acknowledgment round moves strictly forward and returns to `Idle` only
//! at its completion boundary:
//!
//! ```text
//!  Idle ──first step──▶ AckExchangeStarted ──predicate holds──▶ RoundComplete
//!   ▲                                                               │
//!   └───────────────────────── counters reset ──────────────────────┘
//! ```

/// Outcome of one non-blocking step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Not finished; call again.
    InProgress,
    /// Terminal success.
    Complete,
}

impl Progress {
    pub fn is_complete(self) -> bool {
        self == Progress::Complete
    }
}

/// Where a communicator stands in its current acknowledgment round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundState {
    /// No round underway.
    #[default]
    Idle,
    /// ACKs sent to parents; waiting on children, parents or NACKs.
    AckExchangeStarted,
    /// Every ACK is in and no NACK is outstanding; the next step resets.
    RoundComplete,
}

impl std::fmt::Display for RoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
