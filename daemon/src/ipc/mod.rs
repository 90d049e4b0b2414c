//! Inter-application message channel.
//!
//! Other privileged applications talk to the daemon through the
//! platform's application message service: registration messages come
//! in through [`Messaging::receive`], launch notifications go out
//! through [`Messaging::send`]. The transport itself is a platform
//! collaborator; this module defines the contract and the receive loop.

pub mod message;
pub mod receiver;

pub use message::{AppMessage, MAX_PAYLOAD};
pub use receiver::MessageReceiver;

/// Message channel errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcError {
    /// The transport failed.
    Io(String),
    /// The recipient is gone.
    RecipientGone(u32),
}

impl core::fmt::Display for IpcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(what) => write!(f, "message transport failed: {what}"),
            Self::RecipientGone(app) => write!(f, "recipient {app:#x} is gone"),
        }
    }
}

/// Application message transport.
///
/// `send` failures mean the recipient application no longer exists;
/// the registries prune registrations on that signal.
pub trait Messaging: Send + Sync {
    /// Send a message to `recipient`.
    fn send(&self, recipient: u32, msg_type: u32, payload: &[u8]) -> Result<(), IpcError>;

    /// Block until the next message addressed to the daemon arrives.
    fn receive(&self) -> Result<AppMessage, IpcError>;
}
