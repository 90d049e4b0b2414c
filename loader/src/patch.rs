//! Entry-point patch template.
//!
//! Before the loader's debug session detaches, the target's true entry
//! point is overwritten with a small machine-code loop that sleeps
//! forever, so nothing runs until the loaded image takes over.

/// Offset from the target's image base at which the patch is written.
pub const ENTRYPOINT_OFFSET: u64 = 0x70;

/// Size of the patched region in bytes.
pub const SLEEP_LOOP_SIZE: usize = 39;

/// Byte offset inside the template where the resolved sleep-function
/// address is patched in (the imm64 of the first MOV).
pub const SLEEP_ADDR_OFFSET: usize = 2;

/// x86-64 loop calling `nanosleep(1s, 0)` forever:
///
/// ```text
/// loop:
///   mov rax, <sleep fn>      ; patched at SLEEP_ADDR_OFFSET
///   mov rdi, 1000000000      ; 1 second in nanoseconds
///   mov rsi, 0
///   push rdi
///   push rsi
///   call rax
///   jmp loop
/// ```
pub const SLEEP_LOOP_TEMPLATE: [u8; SLEEP_LOOP_SIZE] = [
    // mov rax, imm64
    0x48, 0xB8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    // mov rdi, 1000000000
    0x48, 0xC7, 0xC7, 0x00, 0xCA, 0x9A, 0x3B,
    // mov rsi, 0
    0x48, 0xC7, 0xC6, 0x00, 0x00, 0x00, 0x00,
    // push rdi; push rsi
    0x57, 0x56,
    // call rax
    0xFF, 0xD0,
    // jmp loop
    0xEB, 0xE2,
    // padding to the fixed region size
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// A sleep-loop patch with its target address filled in.
#[derive(Debug, Clone, Copy)]
pub struct EntrypointPatch {
    bytes: [u8; SLEEP_LOOP_SIZE],
}

impl EntrypointPatch {
    /// Build the patch with `sleep_addr` as the resolved address of the
    /// platform sleep primitive.
    pub fn with_sleep_addr(sleep_addr: u64) -> Self {
        let mut bytes = SLEEP_LOOP_TEMPLATE;
        bytes[SLEEP_ADDR_OFFSET..SLEEP_ADDR_OFFSET + 8].copy_from_slice(&sleep_addr.to_le_bytes());
        EntrypointPatch { bytes }
    }

    /// The patched machine code.
    pub fn bytes(&self) -> &[u8; SLEEP_LOOP_SIZE] {
        &self.bytes
    }
}
