//! Privileged homebrew launch daemon.
//!
//! Intercepts process creation notifications from the launcher, decides
//! per launch whether another registered application owns the binary's
//! signature prefix, and otherwise freezes the fresh process, patches
//! its entry point and loads the homebrew payload into it with
//! [`brewd_loader`].

pub mod config;
pub mod ipc;
pub mod launch;
pub mod logging;
pub mod platform;
pub mod registry;
