//! The service status/intent vocabulary shared by switches and aggregators.
//!
//! Both the switch engine and the aggregator service state machine emit the
//! same nine-value status enum; rather than duplicate it per engine this
//! crate collapses the transition into a single `Status` sum type and one
//! `Listener::on_status` callback, per the design notes.

use std::fmt;

/// The lifecycle status of a service, as observed by its listeners.
///
/// Derives `Serialize`/`Deserialize` (screaming-snake-case: `"ACTIVE"`,
/// `"ESTABLISHING"`, ...) since a status report is the one piece of this
/// crate's state the out-of-scope remote transport is specified to carry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// No segment has been defined yet.
    Dormant,
    /// A segment was just defined; sub-resources are being provisioned.
    Establishing,
    /// Defined, provisioned, not carrying traffic.
    Inactive,
    /// Transitioning from inactive to active.
    Activating,
    /// Defined, provisioned, and carrying traffic.
    Active,
    /// Transitioning from active to inactive.
    Deactivating,
    /// A sub-resource failed; the service is being torn down.
    Failed,
    /// Tearing down on the way to released.
    Releasing,
    /// Terminal: all resources returned, service no longer usable.
    Released,
}

impl Status {
    /// `true` for the five statuses a service can sit in indefinitely
    /// without a pending transition.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            Status::Dormant | Status::Inactive | Status::Active | Status::Failed | Status::Released
        )
    }

    /// `true` once a service has reached its terminal status. No status is
    /// ever emitted after `Released`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Released)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Status::Dormant => "DORMANT",
            Status::Establishing => "ESTABLISHING",
            Status::Inactive => "INACTIVE",
            Status::Activating => "ACTIVATING",
            Status::Active => "ACTIVE",
            Status::Deactivating => "DEACTIVATING",
            Status::Failed => "FAILED",
            Status::Releasing => "RELEASING",
            Status::Released => "RELEASED",
        };
        f.write_str(s)
    }
}

/// A service's user-requested target state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Intent {
    Inactive,
    Active,
    Release,
    Abort,
}

impl Default for Intent {
    fn default() -> Intent {
        Intent::Inactive
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Intent::Inactive => "INACTIVE",
            Intent::Active => "ACTIVE",
            Intent::Release => "RELEASE",
            Intent::Abort => "ABORT",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_statuses() {
        assert!(Status::Dormant.is_stable());
        assert!(Status::Inactive.is_stable());
        assert!(Status::Active.is_stable());
        assert!(Status::Failed.is_stable());
        assert!(Status::Released.is_stable());
        assert!(!Status::Establishing.is_stable());
        assert!(!Status::Activating.is_stable());
        assert!(!Status::Deactivating.is_stable());
        assert!(!Status::Releasing.is_stable());
    }

    #[test]
    fn only_released_is_terminal() {
        assert!(Status::Released.is_terminal());
        assert!(!Status::Failed.is_terminal());
    }
}
