//! Cross-instance token refresh coordination.
//!
//! Several dispatchers (one per browser tab, or per worker) may share one set
//! of credentials. With a channel attached, a dispatcher that needs a refresh
//! broadcasts `RefreshRequested`; only the leader performs the network
//! refresh and then broadcasts one `RefreshComplete` per outcome callback.
//! Without a channel every dispatcher refreshes on its own.

/// Outcome callback carried by a completion broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSignal {
    Success,
    Error,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationEvent {
    /// `auth:refresh`: ask the leader to refresh.
    RefreshRequested,
    /// `auth:refresh:complete`.
    RefreshComplete(RefreshSignal),
}

impl CoordinationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinationEvent::RefreshRequested => "auth:refresh",
            CoordinationEvent::RefreshComplete(_) => "auth:refresh:complete",
        }
    }
}

pub trait CoordinationChannel {
    /// False when the underlying transport is unavailable in this
    /// environment; the dispatcher then refreshes on its own.
    fn is_supported(&self) -> bool;

    fn is_leader(&self) -> bool;

    fn broadcast(&mut self, event: CoordinationEvent);
}
