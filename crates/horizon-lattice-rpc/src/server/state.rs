//! Lifecycle state of a service host.

/// Current state of a [`ServiceHost`](super::ServiceHost).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServiceHostState {
    /// Built, accepting service registrations, not yet serving.
    #[default]
    Idle,
    /// Bound and serving calls.
    Serving,
    /// Shut down. Terminal.
    Stopped,
}

impl std::fmt::Display for ServiceHostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Serving => write!(f, "Serving"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}
