//! Platform service wiring.
//!
//! The daemon depends on three console-side services: the application
//! message transport, the remote-process controller and the process
//! directory. Their implementations are linked in by console builds;
//! hosted builds have none and the daemon refuses to start.

use std::sync::Arc;

use brewd_loader::target::{ProcessController, ProcessDirectory};

use crate::ipc::Messaging;

/// The bundle of platform services the daemon runs against.
pub struct Platform {
    pub messaging: Arc<dyn Messaging>,
    pub controller: Arc<dyn ProcessController>,
    pub directory: Arc<dyn ProcessDirectory>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// No native service bindings are linked into this build.
    Unavailable,
}

impl core::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "no native platform bindings in this build"),
        }
    }
}

/// The native service bundle of the running console.
pub fn native() -> Result<Platform, PlatformError> {
    Err(PlatformError::Unavailable)
}
