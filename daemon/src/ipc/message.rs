//! Application message record and the daemon's message types.

/// Maximum payload carried by one application message.
pub const MAX_PAYLOAD: usize = 8192;

/// Claim ownership of a signature prefix. Payload: first 4 bytes are
/// the prefix, little endian.
pub const MSG_TYPE_REGISTER_PREFIX_HANDLER: u32 = 0x0100_0000;

/// Subscribe to (non-zero first payload byte) or unsubscribe from
/// (zero) launch notifications.
pub const MSG_TYPE_REGISTER_LAUNCH_LISTENER: u32 = 0x0100_0001;

/// Outgoing launch notification. Payload: the launched pid, little
/// endian.
pub const MSG_TYPE_APP_LAUNCHED: u32 = 0x0100_0002;

/// One message on the application channel.
#[derive(Clone)]
pub struct AppMessage {
    /// Application id of the sender.
    pub sender: u32,
    /// Message type discriminator.
    pub msg_type: u32,
    /// Payload buffer; only `payload_size` bytes are meaningful.
    pub payload: [u8; MAX_PAYLOAD],
    /// Number of valid payload bytes.
    pub payload_size: u32,
    /// Platform timestamp of the message.
    pub timestamp: u64,
}

impl AppMessage {
    /// Build a message carrying `data`, which must fit the payload
    /// buffer.
    pub fn new(sender: u32, msg_type: u32, data: &[u8]) -> Self {
        let mut payload = [0u8; MAX_PAYLOAD];
        let len = data.len().min(MAX_PAYLOAD);
        payload[..len].copy_from_slice(&data[..len]);
        AppMessage { sender, msg_type, payload, payload_size: len as u32, timestamp: 0 }
    }

    /// The meaningful part of the payload.
    pub fn payload(&self) -> &[u8] {
        let len = (self.payload_size as usize).min(MAX_PAYLOAD);
        &self.payload[..len]
    }
}

impl core::fmt::Debug for AppMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppMessage")
            .field("sender", &self.sender)
            .field("msg_type", &self.msg_type)
            .field("payload_size", &self.payload_size)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
