//! Launch-notification server and the freeze/patch/load path.
//!
//! One dedicated thread accepts connections on the launch endpoint and
//! processes records strictly sequentially; no two loads ever run
//! concurrently.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use brewd_loader::load::LIBKERNEL_HANDLE;
use brewd_loader::target::{
    DebugSession, ProcessController, ProcessDirectory, TargetError, TargetProcess,
};
use brewd_loader::{ElfLoader, EntrypointPatch, LoadError, ENTRYPOINT_OFFSET};

use crate::config;
use crate::launch::protocol::{
    LaunchRecord, CMD_PING, CMD_PROCESS_LAUNCHED, PING_REPLY, RECORD_SIZE,
};
use crate::registry::HandlerRegistries;

#[derive(Debug)]
enum InterceptError {
    Target(TargetError),
    Load(LoadError),
    Payload(String),
    ProcessDied(i32),
    MissingSleepPrimitive,
}

impl core::fmt::Display for InterceptError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Target(e) => write!(f, "target failure: {e}"),
            Self::Load(e) => write!(f, "load failure: {e}"),
            Self::Payload(what) => write!(f, "payload unavailable: {what}"),
            Self::ProcessDied(pid) => write!(f, "pid {pid} died before it could be opened"),
            Self::MissingSleepPrimitive => write!(f, "sleep primitive not resolvable in target"),
        }
    }
}

impl From<TargetError> for InterceptError {
    fn from(e: TargetError) -> Self {
        InterceptError::Target(e)
    }
}

impl From<LoadError> for InterceptError {
    fn from(e: LoadError) -> Self {
        InterceptError::Load(e)
    }
}

/// What to do with the connection after one record.
enum Disposition {
    KeepReading,
    Drop,
}

/// Stops a running interceptor: raises the flag, severs the connection
/// currently being served, then connects once to unblock a pending
/// accept.
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    active: Arc<spin::Mutex<Option<UnixStream>>>,
    socket_path: PathBuf,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        if let Some(stream) = self.active.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let _ = UnixStream::connect(&self.socket_path);
    }
}

/// Accepts launch notifications and drives per-launch handling.
pub struct LaunchInterceptor {
    registries: Arc<HandlerRegistries>,
    controller: Arc<dyn ProcessController>,
    directory: Arc<dyn ProcessDirectory>,
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    active: Arc<spin::Mutex<Option<UnixStream>>>,
}

impl LaunchInterceptor {
    pub fn new(
        registries: Arc<HandlerRegistries>,
        controller: Arc<dyn ProcessController>,
        directory: Arc<dyn ProcessDirectory>,
        socket_path: impl Into<PathBuf>,
    ) -> Self {
        LaunchInterceptor {
            registries,
            controller,
            directory,
            socket_path: socket_path.into(),
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(spin::Mutex::new(None)),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            active: self.active.clone(),
            socket_path: self.socket_path.clone(),
        }
    }

    /// Bind the launch endpoint and serve connections until shutdown.
    pub fn run(&self) -> std::io::Result<()> {
        // a stale socket file survives an unclean exit
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        info!("listening for launch notifications on {}", self.socket_path.display());

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    self.serve_connection(stream);
                }
                Err(e) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    error!("accept failed: {e}");
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!("launch interception stopped");
        Ok(())
    }

    fn serve_connection(&self, mut stream: UnixStream) {
        // registered so a shutdown can sever a blocked read
        match stream.try_clone() {
            Ok(clone) => *self.active.lock() = Some(clone),
            Err(e) => warn!("failed to register connection for shutdown: {e}"),
        }
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let mut buf = [0u8; RECORD_SIZE];
            if let Err(e) = stream.read_exact(&mut buf) {
                debug!("launch connection closed: {e}");
                break;
            }
            let record = LaunchRecord::parse(&buf);
            match self.handle_record(&record, &mut stream) {
                Disposition::KeepReading => {}
                Disposition::Drop => break,
            }
        }
        *self.active.lock() = None;
    }

    fn handle_record(&self, record: &LaunchRecord, stream: &mut UnixStream) -> Disposition {
        match record.command {
            CMD_PING => {
                debug!("ping");
                if let Err(e) = stream.write_all(&PING_REPLY.to_le_bytes()) {
                    warn!("failed to answer ping: {e}");
                    return Disposition::Drop;
                }
                Disposition::KeepReading
            }
            CMD_PROCESS_LAUNCHED => {
                self.handle_launch(record);
                Disposition::KeepReading
            }
            other => {
                warn!("unrecognized launch command {other}");
                Disposition::Drop
            }
        }
    }

    fn handle_launch(&self, record: &LaunchRecord) {
        // the launcher only parks homebrew processes on a trampoline
        let is_homebrew = record.func != 0;
        debug!(
            "pid {} launched, prefix {:#x}, homebrew: {is_homebrew}",
            record.pid, record.prefix
        );
        if self.registries.notify_handlers(record.prefix, record.pid, is_homebrew) {
            // another registered application owns this signature
            return;
        }
        if !is_homebrew || record.prefix != config::BREW_PREFIX {
            return;
        }
        info!("loading homebrew into pid {}", record.pid);
        match self.load_homebrew(record) {
            Ok(()) => info!("homebrew running in pid {}", record.pid),
            Err(e) => error!("homebrew load for pid {} failed: {e}", record.pid),
        }
    }

    fn load_homebrew(&self, record: &LaunchRecord) -> Result<(), InterceptError> {
        let pid = record.pid;
        let session = self.freeze(pid, record.func)?;
        let target = self.wait_for_handle(pid)?;
        self.patch_entrypoint(target.as_ref())?;
        // detaching resumes the target, which now parks on the sleep loop
        drop(session);

        let payload_path = self.payload_path(pid)?;
        let bytes = match std::fs::read(&payload_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to read {}: {e}", payload_path.display());
                self.directory.kill(pid);
                return Err(InterceptError::Payload(payload_path.display().to_string()));
            }
        };
        debug!("read {} payload bytes from {}", bytes.len(), payload_path.display());

        if let Err(e) = target.set_name(config::HOMEBREW_PROCESS_NAME) {
            warn!("failed to rename pid {pid}: {e}");
        }

        let result = ElfLoader::new(target.as_ref(), bytes).and_then(ElfLoader::launch);
        if let Err(e) = result {
            self.directory.kill(pid);
            return Err(e.into());
        }
        Ok(())
    }

    /// Park the target on the trampoline and resume it until its
    /// thread-local storage base becomes nonzero, meaning process
    /// creation has finished inside the target. The returned session
    /// keeps the target stopped; dropping it detaches and resumes.
    fn freeze(&self, pid: i32, trampoline: u64) -> Result<Box<dyn DebugSession>, InterceptError> {
        let session = self.controller.attach(pid)?;
        let mut regs = session.registers()?;
        regs.rip = trampoline;
        session.set_registers(&regs)?;

        let mut spins = 0u64;
        loop {
            session.run_until_stop()?;
            if session.registers()?.fs != 0 {
                break;
            }
            spins += 1;
            debug!("pid {pid} thread storage still unset at stop {spins}");
        }
        debug!("pid {pid} froze after {spins} extra stops");
        Ok(session)
    }

    /// Poll for a full process handle; the target is only openable once
    /// it is far enough through creation. Aborts if the process dies
    /// while polling.
    fn wait_for_handle(&self, pid: i32) -> Result<Box<dyn TargetProcess>, InterceptError> {
        loop {
            if let Some(target) = self.controller.try_open(pid) {
                return Ok(target);
            }
            if !self.directory.is_alive(pid) {
                return Err(InterceptError::ProcessDied(pid));
            }
        }
    }

    /// Overwrite the target's true entry point with the sleep loop so
    /// nothing runs after detach until the payload takes over.
    fn patch_entrypoint(&self, target: &dyn TargetProcess) -> Result<(), InterceptError> {
        let libkernel = target
            .lib_by_handle(LIBKERNEL_HANDLE)
            .ok_or(InterceptError::MissingSleepPrimitive)?;
        let sleep_addr = target
            .function_address(&libkernel, "nanosleep")
            .ok_or(InterceptError::MissingSleepPrimitive)?;
        let patch = EntrypointPatch::with_sleep_addr(sleep_addr);
        let base = target.image_base()?;
        target.write(base + ENTRYPOINT_OFFSET, patch.bytes())?;
        Ok(())
    }

    fn payload_path(&self, pid: i32) -> Result<PathBuf, InterceptError> {
        let path = self.directory.path_of(pid)?;
        let dir = Path::new(&path).parent().unwrap_or_else(|| Path::new("/"));
        Ok(dir.join(config::PAYLOAD_FILE_NAME))
    }
}
