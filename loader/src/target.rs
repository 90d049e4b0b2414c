//! Contracts for the external collaborators the loader drives.
//!
//! The loader never talks to the OS directly; everything it needs from
//! the target process goes through [`TargetProcess`], and everything the
//! interception side needs from the platform goes through
//! [`ProcessController`], [`DebugSession`] and [`ProcessDirectory`].
//! How these capabilities are obtained is outside this crate.

use bitflags::bitflags;

bitflags! {
    /// Memory protection flags for target mappings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
        /// Platform GPU read access, granted along with READ.
        const GPU_READ = 0x10;
        /// Platform GPU write access, granted along with WRITE.
        const GPU_WRITE = 0x20;
    }
}

bitflags! {
    /// Mapping flags for target mmap calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 0x1;
        const PRIVATE = 0x2;
        const FIXED = 0x10;
        const ANONYMOUS = 0x1000;
    }
}

/// Saved register file of a stopped target thread.
///
/// Only the registers the loader and the freeze handshake inspect or
/// modify are represented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    /// Thread-local storage base; becomes nonzero once process creation
    /// has completed inside the target.
    pub fs: u64,
    pub gs: u64,
}

/// Base address and dynamic metadata location of a library loaded in
/// the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryInfo {
    /// Image base of the library inside the target.
    pub image_base: u64,
    /// Address of the library's dynamic metadata records.
    pub metadata_addr: u64,
}

/// File descriptors and kernel pipe address of an already-established
/// read/write channel, used for in-process loads.
#[derive(Debug, Clone, Copy)]
pub struct OwnChannel {
    /// Read/write pipe descriptor pair.
    pub rw_pipe: [i32; 2],
    /// Master/victim socket descriptor pair.
    pub rw_pair: [i32; 2],
    /// Kernel-internal address tied to the pipe.
    pub kpipe_addr: u64,
}

/// How a module is identified when asking the target to load it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleRef {
    /// Well-known numeric system module id.
    Id(u32),
    /// Load by name through the by-name entry point.
    Name(String),
}

/// Errors surfaced by collaborator round-trips into the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// A remote operation failed.
    Io(String),
    /// A read or write faulted at the given target address.
    Fault(u64),
    /// The target process no longer exists.
    ProcessDied,
    /// The operation is not available in this mode.
    Unsupported,
}

impl core::fmt::Display for TargetError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(what) => write!(f, "target operation failed: {what}"),
            Self::Fault(addr) => write!(f, "target memory fault at {addr:#x}"),
            Self::ProcessDied => write!(f, "target process died"),
            Self::Unsupported => write!(f, "operation not supported in this mode"),
        }
    }
}

/// Full-control handle over a target process.
///
/// Every method is a synchronous blocking round-trip; none carries an
/// internal timeout. In remote mode the handle owns a debug session
/// that detaches (resuming the target) when the handle is dropped.
pub trait TargetProcess {
    /// Pid of the target process.
    fn pid(&self) -> i32;

    /// Whether the handle refers to the loader's own process.
    fn is_self(&self) -> bool;

    /// Image base of the target's main executable.
    fn image_base(&self) -> Result<u64, TargetError>;

    /// Map memory inside the target.
    fn mmap(
        &self,
        addr: u64,
        len: u64,
        prot: Protection,
        flags: MapFlags,
        fd: i32,
    ) -> Result<u64, TargetError>;

    /// Unmap memory inside the target.
    fn munmap(&self, addr: u64, len: u64) -> Result<(), TargetError>;

    /// Create an executable+writable shared memory object inside the
    /// target and return its descriptor.
    fn jit_create(&self, len: u64, prot: Protection) -> Result<i32, TargetError>;

    /// Read target memory into `buf`.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), TargetError>;

    /// Write `data` into target memory.
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), TargetError>;

    /// Saved registers of the stopped target thread.
    fn registers(&self) -> Result<Registers, TargetError>;

    /// Overwrite the saved registers of the stopped target thread.
    fn set_registers(&self, regs: &Registers) -> Result<(), TargetError>;

    /// Call a function inside the target and return its value.
    fn call(&self, func: u64, args: &[u64; 6]) -> Result<i64, TargetError>;

    /// Create a socket inside the target.
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> Result<i32, TargetError>;

    /// Create a pipe pair inside the target.
    fn pipe(&self) -> Result<(i32, i32), TargetError>;

    /// Set a socket option inside the target.
    fn setsockopt(&self, fd: i32, level: i32, name: i32, value: &[u8]) -> Result<i32, TargetError>;

    /// Close a descriptor owned by the target.
    fn close(&self, fd: i32) -> Result<(), TargetError>;

    /// Allocate scratch data memory inside the target.
    fn alloc_data(&self, len: u64) -> Result<u64, TargetError>;

    /// Loaded-library record by well-known numeric handle.
    fn lib_by_handle(&self, handle: i32) -> Option<LibraryInfo>;

    /// Loaded-library record by name.
    fn lib_by_name(&self, name: &str) -> Option<LibraryInfo>;

    /// Address of an exported function in a loaded library.
    fn function_address(&self, lib: &LibraryInfo, symbol: &str) -> Option<u64>;

    /// Resolve a symbol by name against one library's dynamic metadata.
    fn resolve_symbol(&self, lib: &LibraryInfo, name: &str) -> Option<u64>;

    /// Load a module in the current process (in-process mode only).
    fn load_local_module(&self, module: &ModuleRef) -> Result<i32, TargetError>;

    /// Turn a descriptor quad (master socket, victim socket, pipe pair)
    /// into a privileged read/write capability for the target.
    fn establish_rw_channel(&self, fds: &[i32; 4]) -> Result<(), TargetError>;

    /// Kernel-internal address of the open-file record behind a pipe
    /// descriptor, read through the loader's own privileged channel.
    fn pipe_file_kernel_addr(&self, fd: i32) -> Result<u64, TargetError>;

    /// The already-established channel of the current process
    /// (in-process mode only).
    fn own_channel(&self) -> Result<OwnChannel, TargetError>;

    /// Base address of kernel data, forwarded to the payload.
    fn kernel_data_base(&self) -> u64;

    /// Set the target's display name.
    fn set_name(&self, name: &str) -> Result<(), TargetError>;

    /// Call the loaded entry point synchronously (in-process mode only).
    fn call_entry(&self, entry: u64, args: u64) -> Result<i32, TargetError>;
}

/// A debug session over a freshly launched process, used for the
/// freeze handshake before a full [`TargetProcess`] handle exists.
///
/// Dropping the session detaches and resumes the target.
pub trait DebugSession {
    fn registers(&self) -> Result<Registers, TargetError>;
    fn set_registers(&self, regs: &Registers) -> Result<(), TargetError>;
    /// Resume the target and block until the next stop; returns the
    /// raw stop state.
    fn run_until_stop(&self) -> Result<i32, TargetError>;
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), TargetError>;
}

/// Attaches debug sessions and opens target-process handles.
pub trait ProcessController: Send + Sync {
    /// Attach a debug session to `pid`.
    fn attach(&self, pid: i32) -> Result<Box<dyn DebugSession>, TargetError>;

    /// Open a full handle over `pid`; `None` while the process is not
    /// yet far enough through creation to be controllable.
    fn try_open(&self, pid: i32) -> Option<Box<dyn TargetProcess>>;
}

/// Process-directory service: path lookup, liveness, termination.
pub trait ProcessDirectory: Send + Sync {
    /// Filesystem path of the executable behind `pid`.
    fn path_of(&self, pid: i32) -> Result<String, TargetError>;

    /// Whether `pid` still refers to a live process.
    fn is_alive(&self, pid: i32) -> bool;

    /// Terminate the application behind `pid`.
    fn kill(&self, pid: i32);
}
