//! Open request state machine
//!
//! - States are explicit and enumerable
//! - Transitions consume the old state and are checked
//! - Succeeded and Failed are terminal
//!
//! ```text
//! Pending ──▶ Succeeded                      (target == current)
//!    │   └──▶ Failed                         (rejected, cancelled while queued)
//!    ▼
//! AwaitingQuiescence ──▶ Blocked ──▶ Upgrading ──▶ Succeeded | Failed
//!    │        │             └──▶ Failed (cancel)
//!    │        └──────────────────▶ Upgrading
//!    └──▶ Failed (cancel, registry fault)
//! ```

use serde::Serialize;

use super::errors::{OpenError, OpenErrorKind, OpenResult};

/// State of one open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    /// Created, waiting for its turn on the store
    Pending,

    /// Notices delivered; waiting for older connections to close
    AwaitingQuiescence {
        old_version: u64,
        new_version: u64,
    },

    /// Older connections stayed open past the first check
    Blocked {
        old_version: u64,
        new_version: u64,
    },

    /// Upgrade transaction is running
    Upgrading {
        old_version: u64,
        new_version: u64,
    },

    /// A connection was produced
    Succeeded { version: u64 },

    /// The request ended with an error
    Failed { kind: OpenErrorKind },
}

impl Default for RequestState {
    fn default() -> Self {
        Self::Pending
    }
}

impl RequestState {
    /// State name for observability.
    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::AwaitingQuiescence { .. } => "AwaitingQuiescence",
            Self::Blocked { .. } => "Blocked",
            Self::Upgrading { .. } => "Upgrading",
            Self::Succeeded { .. } => "Succeeded",
            Self::Failed { .. } => "Failed",
        }
    }

    /// Whether the request has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    /// Whether a cancel is still honored in this state.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::AwaitingQuiescence { .. } | Self::Blocked { .. }
        )
    }

    /// `(old, new)` of the version change in progress, if any.
    pub fn versions(&self) -> Option<(u64, u64)> {
        match self {
            Self::AwaitingQuiescence {
                old_version,
                new_version,
            }
            | Self::Blocked {
                old_version,
                new_version,
            }
            | Self::Upgrading {
                old_version,
                new_version,
            } => Some((*old_version, *new_version)),
            _ => None,
        }
    }

    /// Pending → Succeeded, for opens at the current version.
    pub fn open_directly(self, version: u64) -> OpenResult<Self> {
        match self {
            Self::Pending => Ok(Self::Succeeded { version }),
            _ => Err(OpenError::forbidden_transition(self.state_name(), "Succeeded")),
        }
    }

    /// Pending → AwaitingQuiescence
    pub fn await_quiescence(self, old_version: u64, new_version: u64) -> OpenResult<Self> {
        match self {
            Self::Pending if new_version > old_version => Ok(Self::AwaitingQuiescence {
                old_version,
                new_version,
            }),
            _ => Err(OpenError::forbidden_transition(
                self.state_name(),
                "AwaitingQuiescence",
            )),
        }
    }

    /// AwaitingQuiescence → Blocked
    pub fn block(self) -> OpenResult<Self> {
        match self {
            Self::AwaitingQuiescence {
                old_version,
                new_version,
            } => Ok(Self::Blocked {
                old_version,
                new_version,
            }),
            _ => Err(OpenError::forbidden_transition(self.state_name(), "Blocked")),
        }
    }

    /// AwaitingQuiescence | Blocked → Upgrading
    pub fn begin_upgrade(self) -> OpenResult<Self> {
        match self {
            Self::AwaitingQuiescence {
                old_version,
                new_version,
            }
            | Self::Blocked {
                old_version,
                new_version,
            } => Ok(Self::Upgrading {
                old_version,
                new_version,
            }),
            _ => Err(OpenError::forbidden_transition(self.state_name(), "Upgrading")),
        }
    }

    /// Upgrading → Succeeded
    pub fn complete_upgrade(self) -> OpenResult<Self> {
        match self {
            Self::Upgrading { new_version, .. } => Ok(Self::Succeeded {
                version: new_version,
            }),
            _ => Err(OpenError::forbidden_transition(self.state_name(), "Succeeded")),
        }
    }

    /// Any non-terminal state → Failed
    pub fn fail(self, kind: OpenErrorKind) -> OpenResult<Self> {
        if self.is_terminal() {
            return Err(OpenError::forbidden_transition(self.state_name(), "Failed"));
        }
        Ok(Self::Failed { kind })
    }

    /// Cancellable state → Failed(Abort)
    pub fn cancel(self) -> OpenResult<Self> {
        if !self.is_cancellable() {
            return Err(OpenError::forbidden_transition(self.state_name(), "Failed"));
        }
        Ok(Self::Failed {
            kind: OpenErrorKind::Abort,
        })
    }
}
