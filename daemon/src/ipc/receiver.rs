//! Registration message loop.

use std::sync::Arc;

use log::{debug, error, warn};

use crate::ipc::message::{
    AppMessage, MSG_TYPE_REGISTER_LAUNCH_LISTENER, MSG_TYPE_REGISTER_PREFIX_HANDLER,
};
use crate::ipc::Messaging;
use crate::registry::HandlerRegistries;

/// Receives registration messages and applies them to the registries.
///
/// Runs on its own thread; blocks indefinitely on receipt and has no
/// cancellation path besides daemon termination.
pub struct MessageReceiver {
    messaging: Arc<dyn Messaging>,
    registries: Arc<HandlerRegistries>,
}

impl MessageReceiver {
    pub fn new(messaging: Arc<dyn Messaging>, registries: Arc<HandlerRegistries>) -> Self {
        MessageReceiver { messaging, registries }
    }

    /// Receive and apply messages forever. Receive errors are logged
    /// and the loop continues.
    pub fn run(&self) {
        loop {
            match self.messaging.receive() {
                Ok(msg) => {
                    debug!(
                        "message type {:#x} from app {:#x}, {} bytes",
                        msg.msg_type,
                        msg.sender,
                        msg.payload_size
                    );
                    self.process(&msg);
                }
                Err(e) => error!("failed to receive message: {e}"),
            }
        }
    }

    /// Apply one message to the registries.
    pub fn process(&self, msg: &AppMessage) {
        match msg.msg_type {
            MSG_TYPE_REGISTER_PREFIX_HANDLER => {
                let payload = msg.payload();
                let Some(bytes) = payload.get(0..4) else {
                    warn!("short prefix registration from app {:#x}", msg.sender);
                    return;
                };
                let prefix = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                self.registries.add_prefix_handler(prefix, msg.sender);
            }
            MSG_TYPE_REGISTER_LAUNCH_LISTENER => {
                let Some(&flag) = msg.payload().first() else {
                    warn!("empty listener registration from app {:#x}", msg.sender);
                    return;
                };
                if flag != 0 {
                    self.registries.add_launch_listener(msg.sender);
                } else {
                    self.registries.remove_launch_listener(msg.sender);
                }
            }
            other => {
                debug!("ignoring message type {other:#x} from app {:#x}", msg.sender);
            }
        }
    }
}
