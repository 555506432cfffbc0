//! Error types surfaced by a session.
//!
//! Only conditions a caller can act on become errors. Protocol-level events - duplicates,
//!  out-of-window arrivals, acks for unsent sequences - are counted and discarded inside the
//!  state machines, and a failed substrate send is logged and covered by retransmission.

use thiserror::Error;

/// Errors returned by the session surface.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// Operation attempted on a stopping session
    #[error("session is shutting down")]
    Shutdown,
}
