//! Launch-notification wire format.
//!
//! The launcher writes fixed 24-byte records: four little-endian
//! fields plus four bytes of trailing padding from the sender's struct
//! layout.

/// Size of one record on the wire.
pub const RECORD_SIZE: usize = 24;

/// Liveness probe; the daemon replies with one i32 `1`.
pub const CMD_PING: i32 = 0;

/// A process was launched and is waiting on the trampoline.
pub const CMD_PROCESS_LAUNCHED: i32 = 1;

/// Reply sent for a ping.
pub const PING_REPLY: i32 = 1;

/// One launch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRecord {
    /// Command discriminator.
    pub command: i32,
    /// Pid of the launched process.
    pub pid: i32,
    /// Address of the trampoline the launcher parked the process on;
    /// zero for non-homebrew launches.
    pub func: u64,
    /// First four bytes of the launched executable's signature.
    pub prefix: u32,
}

impl LaunchRecord {
    /// Decode a record from its wire bytes.
    pub fn parse(bytes: &[u8; RECORD_SIZE]) -> Self {
        LaunchRecord {
            command: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            pid: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            func: u64::from_le_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
            prefix: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
        }
    }

    /// Encode the record as wire bytes.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..4].copy_from_slice(&self.command.to_le_bytes());
        out[4..8].copy_from_slice(&self.pid.to_le_bytes());
        out[8..16].copy_from_slice(&self.func.to_le_bytes());
        out[16..20].copy_from_slice(&self.prefix.to_le_bytes());
        out
    }
}
