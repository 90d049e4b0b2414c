//! Prefix-handler and launch-listener registries.
//!
//! Two mutex-guarded linear-scan sets shared between the message loop
//! (which mutates them on registration messages) and the launch
//! interceptor (which consults them per launch). Each set has its own
//! lock and no operation holds both at once.

use std::sync::Arc;

use log::{debug, info, warn};
use spin::Mutex;

use crate::ipc::message::MSG_TYPE_APP_LAUNCHED;
use crate::ipc::Messaging;

/// One application's claim on a signature prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PrefixHandler {
    prefix: u32,
    app_id: u32,
}

/// Registered subscriber sets, constructed once at daemon start.
pub struct HandlerRegistries {
    messaging: Arc<dyn Messaging>,
    prefix_handlers: Mutex<Vec<PrefixHandler>>,
    launch_listeners: Mutex<Vec<u32>>,
}

impl HandlerRegistries {
    pub fn new(messaging: Arc<dyn Messaging>) -> Self {
        HandlerRegistries {
            messaging,
            prefix_handlers: Mutex::new(Vec::new()),
            launch_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register `app_id` as the handler for `prefix`. The first
    /// registration for a prefix wins; duplicates are dropped with a
    /// warning.
    pub fn add_prefix_handler(&self, prefix: u32, app_id: u32) {
        let mut handlers = self.prefix_handlers.lock();
        if handlers.iter().any(|h| h.prefix == prefix) {
            warn!("prefix {prefix:#x} already has a handler, ignoring app {app_id:#x}");
            return;
        }
        info!("app {app_id:#x} now handles prefix {prefix:#x}");
        handlers.push(PrefixHandler { prefix, app_id });
    }

    /// Subscribe `app_id` to all launch notifications. Idempotent.
    pub fn add_launch_listener(&self, app_id: u32) {
        let mut listeners = self.launch_listeners.lock();
        if listeners.contains(&app_id) {
            return;
        }
        info!("app {app_id:#x} now listens for launches");
        listeners.push(app_id);
    }

    /// Drop `app_id` from the launch listeners.
    pub fn remove_launch_listener(&self, app_id: u32) {
        self.launch_listeners.lock().retain(|&id| id != app_id);
    }

    /// Route one launch through the registries.
    ///
    /// Non-homebrew launches are informational only: every listener is
    /// notified and the call reports "not handled". Homebrew launches
    /// go to the registered prefix handler if one exists; the return
    /// value says whether one did, regardless of delivery outcome.
    pub fn notify_handlers(&self, prefix: u32, pid: i32, is_homebrew: bool) -> bool {
        if !is_homebrew {
            self.notify_listeners(pid);
            return false;
        }
        self.handle_prefix(prefix, pid)
    }

    /// Deliver a launch message to the handler registered for `prefix`.
    /// A failed delivery prunes the registration (the app is presumed
    /// dead). Returns whether a registration existed at all.
    fn handle_prefix(&self, prefix: u32, pid: i32) -> bool {
        let mut handlers = self.prefix_handlers.lock();
        let Some(index) = handlers.iter().position(|h| h.prefix == prefix) else {
            return false;
        };
        let app_id = handlers[index].app_id;
        if let Err(e) = self.messaging.send(app_id, MSG_TYPE_APP_LAUNCHED, &pid.to_le_bytes()) {
            warn!("dropping handler for prefix {prefix:#x}: {e}");
            handlers.remove(index);
        } else {
            debug!("delegated pid {pid} to app {app_id:#x}");
        }
        true
    }

    /// Notify every launch listener of `pid`, pruning listeners whose
    /// delivery fails. No early exit.
    fn notify_listeners(&self, pid: i32) {
        let mut listeners = self.launch_listeners.lock();
        listeners.retain(|&app_id| {
            match self.messaging.send(app_id, MSG_TYPE_APP_LAUNCHED, &pid.to_le_bytes()) {
                Ok(()) => true,
                Err(e) => {
                    warn!("dropping launch listener {app_id:#x}: {e}");
                    false
                }
            }
        });
    }
}
