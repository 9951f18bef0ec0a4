//! Optional hook through which the queue reports that the server went away.

/// Collaborator that tracks server reachability.
///
/// The queue never consults it before sending; it only reports failures so a
/// monitor can re-probe right away instead of waiting for its next tick.
pub trait Connectivity: Send + Sync {
    /// Called after a send found no server at all (status 0).
    fn on_server_unreachable(&self);
}

/// Stand-in used when no connection monitor is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unmonitored;

impl Connectivity for Unmonitored {
    fn on_server_unreachable(&self) {}
}
