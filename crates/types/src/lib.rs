//! Wire types shared by every RockBot crate: the immutable message envelope,
//! agent identity, reserved headers, and the dispatch outcome vocabulary.

mod envelope;
mod headers;
mod identity;

pub use envelope::{Envelope, EnvelopeBuilder};
pub use headers::{ContentTrust, headers as reserved};
pub use identity::AgentIdentity;

use serde::{Deserialize, Serialize};

/// Result of dispatching one envelope through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchOutcome {
    Ack,
    Retry,
    DeadLetter { reason: String },
}
