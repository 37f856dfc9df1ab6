use std::fmt;

/// Lifecycle of one controller invocation.
///
/// ```text
/// Uninitialized → Starting → BatchActive ⇄ BatchPaused
///                    ↓            ↓
///              FallbackPending → Finalizing → Completed
/// ```
///
/// `Failed` is reachable from every active phase. `Starting` is re-entered
/// when a paused, completed or failed controller is invoked again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Uninitialized,
    Starting,
    BatchActive,
    BatchPaused,
    FallbackPending,
    Finalizing,
    Completed,
    Failed,
}

impl SessionPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::Starting => "starting",
            SessionPhase::BatchActive => "batch_active",
            SessionPhase::BatchPaused => "batch_paused",
            SessionPhase::FallbackPending => "fallback_pending",
            SessionPhase::Finalizing => "finalizing",
            SessionPhase::Completed => "completed",
            SessionPhase::Failed => "failed",
        }
    }

    /// `true` for phases in which a failure moves the session to `Failed`.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionPhase::Starting
                | SessionPhase::BatchActive
                | SessionPhase::BatchPaused
                | SessionPhase::FallbackPending
                | SessionPhase::Finalizing
        )
    }

    #[must_use]
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::{
            BatchActive, BatchPaused, Completed, Failed, FallbackPending, Finalizing, Starting,
            Uninitialized,
        };

        if next == Failed {
            return self.is_active();
        }
        matches!(
            (self, next),
            (Uninitialized | BatchPaused | Completed | Failed, Starting)
                | (Starting | BatchPaused, BatchActive)
                | (BatchActive, BatchPaused)
                | (Starting | BatchActive, FallbackPending | Finalizing)
                | (FallbackPending, Finalizing)
                | (Finalizing, Completed)
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
