//! Daemon configuration constants.

/// Local endpoint the launcher sends launch notifications to.
pub const SOCKET_PATH: &str = "/system_tmp/IPC";

/// Conventional payload file name, looked up next to the launched
/// executable.
pub const PAYLOAD_FILE_NAME: &str = "homebrew.elf";

/// Signature prefix marking a homebrew executable: "BREW" read as a
/// little-endian u32.
pub const BREW_PREFIX: u32 = 0x5745_5242;

/// Display name given to a process after its payload is loaded.
pub const HOMEBREW_PROCESS_NAME: &str = "HomebrewApp";

/// Environment variable selecting the log level filter.
pub const LOG_ENV_VAR: &str = "BREWD_LOG";
