//! Launch interception: notification protocol and the freeze/load path.

pub mod interceptor;
pub mod protocol;

pub use interceptor::{LaunchInterceptor, ShutdownHandle};
pub use protocol::{LaunchRecord, CMD_PING, CMD_PROCESS_LAUNCHED, RECORD_SIZE};
