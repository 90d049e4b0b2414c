//! Seven-phase ELF load and link against a target process.
//!
//! One [`ElfLoader`] exists per load attempt. `launch()` runs the phases
//! in order — segment mapping, dynamic-table parse, library resolution,
//! relocation, privileged-channel setup, content copy, control transfer —
//! and any phase failure aborts the rest.

use core::mem::size_of;

use log::{debug, error, info, warn};

use crate::elf::{
    Elf64Rela, ElfError, ElfImage, SegmentFlags, DT_HASH, DT_JMPREL, DT_NEEDED, DT_NULL,
    DT_PLTRELSZ, DT_RELA, DT_RELASZ, DT_STRSZ, DT_STRTAB, DT_SYMTAB, PT_DYNAMIC, R_X86_64_64,
    R_X86_64_GLOB_DAT, R_X86_64_JMP_SLOT, R_X86_64_RELATIVE, STB_WEAK,
};
use crate::symbols::SymbolResolver;
use crate::sysmodules::{self, INTERNAL_MASK};
use crate::target::{MapFlags, ModuleRef, Protection, TargetError, TargetProcess};

/// Platform page size.
pub const PAGE_SIZE: u64 = 0x4000;

/// Well-known handle of the platform's core kernel library.
pub const LIBKERNEL_HANDLE: i32 = 0x2001;

/// Well-known handle of the C runtime library.
pub const LIBC_HANDLE: i32 = 2;

/// Library exporting the target's own module-loading entry points.
const SYSMODULE_LIBRARY: &str = "libSceSysmodule.sprx";

/// Retry budget for a failed segment content write.
const COPY_RETRY_LIMIT: u32 = 10;

const STACK_ALIGN: u64 = 0x10;

const AF_INET6: i32 = 28;
const SOCK_DGRAM: i32 = 2;
const IPPROTO_UDP: i32 = 17;
const IPPROTO_IPV6: i32 = 41;
const IPV6_TCLASS: i32 = 61;
const IPV6_2292PKTOPTIONS: i32 = 25;
const IPV6_PKTINFO: i32 = 46;

/// Errors aborting a load attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The image failed validation or an access fell out of bounds
    Image(ElfError),
    /// A collaborator round-trip failed
    Target(TargetError),
    /// No loadable segment carries the executable flag
    NoExecutableSegment,
    /// No dynamic segment in the image
    NoDynamicTable,
    /// A string table is present but its size entry is missing
    NoStringTableSize,
    /// A fixed mapping landed at the wrong address
    MappingMisplaced {
        wanted: u64,
        got: u64,
    },
    /// A needed library name does not end in ".so"
    UnexpectedLibrary(String),
    /// A library record could not be found in the target
    LibraryNotFound(String),
    /// The target failed to load a library
    LibraryLoadFailed(String),
    /// A non-weak symbol could not be resolved
    UnresolvedSymbol(String),
    /// A relocation kind outside the supported set
    UnsupportedRelocation {
        kind: u32,
        symbol: String,
    },
    /// Privileged-channel setup failed
    ChannelSetupFailed(&'static str),
    /// Segment content copy failed after all retries
    CopyFailed {
        vaddr: u64,
    },
    /// An in-process payload reported a nonzero exit status
    PayloadFailed(i32),
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Image(e) => write!(f, "bad image: {e}"),
            Self::Target(e) => write!(f, "target failure: {e}"),
            Self::NoExecutableSegment => write!(f, "no executable segment found"),
            Self::NoDynamicTable => write!(f, "dynamic table not found"),
            Self::NoStringTableSize => write!(f, "strtab size not found but strtab exists"),
            Self::MappingMisplaced { wanted, got } => {
                write!(f, "mapping landed at {got:#x}, wanted {wanted:#x}")
            }
            Self::UnexpectedLibrary(name) => write!(f, "unexpected library {name}"),
            Self::LibraryNotFound(name) => write!(f, "library {name} not found"),
            Self::LibraryLoadFailed(name) => write!(f, "failed to load library {name}"),
            Self::UnresolvedSymbol(name) => write!(f, "symbol lookup for {name} failed"),
            Self::UnsupportedRelocation { kind, symbol } => {
                write!(f, "unexpected relocation type {kind} for symbol {symbol}")
            }
            Self::ChannelSetupFailed(what) => write!(f, "rw channel setup failed: {what}"),
            Self::CopyFailed { vaddr } => write!(f, "segment copy to {vaddr:#x} failed"),
            Self::PayloadFailed(status) => write!(f, "payload exited with status {status}"),
        }
    }
}

impl From<ElfError> for LoadError {
    fn from(e: ElfError) -> Self {
        LoadError::Image(e)
    }
}

impl From<TargetError> for LoadError {
    fn from(e: TargetError) -> Self {
        LoadError::Target(e)
    }
}

/// One mapping created during segment mapping.
///
/// Recorded only for in-process loads, where every region must be
/// released exactly once after control transfer returns. Remote loads
/// leave mappings owned by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    pub base: u64,
    pub len: u64,
}

/// Parameter block handed to the loaded payload.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PayloadArgs {
    /// Dynamic-symbol-lookup entry point.
    pub dlsym: u64,
    /// Pointer to the read/write pipe descriptor pair.
    pub rw_pipe: u64,
    /// Pointer to the master/victim socket descriptor pair.
    pub rw_pair: u64,
    /// Kernel-internal address tied to the pipe.
    pub kpipe_addr: u64,
    /// Kernel data base address.
    pub kdata_base_addr: u64,
    /// Output slot the payload writes its status into.
    pub payload_out: u64,
}

impl PayloadArgs {
    /// Serialized size of the block.
    pub const SIZE: usize = 48;

    /// Little-endian serialization for writing into target memory.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (i, field) in [
            self.dlsym,
            self.rw_pipe,
            self.rw_pair,
            self.kpipe_addr,
            self.kdata_base_addr,
            self.payload_out,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 8..i * 8 + 8].copy_from_slice(&field.to_le_bytes());
        }
        out
    }
}

/// Where the image landed and how file offsets translate to target
/// virtual addresses, fixed once segment mapping has chosen a base.
#[derive(Debug, Clone, Copy)]
struct Placement {
    image_base: u64,
    text_vaddr: u64,
    text_offset: u64,
}

impl Placement {
    /// Translate an image virtual address to a file offset.
    fn to_file_offset(&self, addr: u64) -> u64 {
        if addr >= self.text_vaddr {
            addr - self.text_vaddr + self.text_offset
        } else {
            addr
        }
    }

    /// Translate an image virtual address (or image-relative offset)
    /// to a target virtual address.
    fn to_virtual_address(&self, addr: u64) -> u64 {
        if addr >= self.text_vaddr {
            self.image_base + (addr - self.text_vaddr)
        } else {
            self.image_base + addr
        }
    }
}

/// Link tables collected from the dynamic segment. All table locations
/// are file offsets into the image buffer.
#[derive(Debug, Clone, Copy, Default)]
struct DynamicInfo {
    rela: Option<u64>,
    rela_count: u64,
    plt: Option<u64>,
    plt_count: u64,
    symtab: Option<u64>,
    symtab_len: u64,
    strtab: Option<u64>,
    strtab_len: u64,
}

/// Resolved value of a relocation's symbol.
enum SymbolValue {
    Addr(u64),
    /// Weak-bound with value 0: intentionally absent.
    WeakAbsent,
}

/// Kept alive for the duration of an in-process control transfer; the
/// payload reads descriptors and writes its status through these fields.
#[derive(Debug)]
struct InProcessArgs {
    args: PayloadArgs,
    rw_pipe: [i32; 2],
    rw_pair: [i32; 2],
    payload_out: i32,
}

/// Loads one ELF image into a target process.
pub struct ElfLoader<'a> {
    target: &'a dyn TargetProcess,
    image: ElfImage,
    resolver: SymbolResolver,
    mapped: Vec<MappedRegion>,
    jit_fd: Option<i32>,
    in_process_args: Option<Box<InProcessArgs>>,
}

impl<'a> ElfLoader<'a> {
    /// Validate `data` as an ELF64 image destined for `target`.
    pub fn new(target: &'a dyn TargetProcess, data: Vec<u8>) -> Result<Self, LoadError> {
        let image = ElfImage::parse(data)?;
        Ok(ElfLoader {
            target,
            image,
            resolver: SymbolResolver::new(),
            mapped: Vec::new(),
            jit_fd: None,
            in_process_args: None,
        })
    }

    /// Run all load phases and transfer control to the image.
    ///
    /// In remote mode the target starts executing once the debug session
    /// behind the target handle detaches; in in-process mode the entry
    /// point has already returned when this does.
    pub fn launch(mut self) -> Result<(), LoadError> {
        info!("processing program headers");
        let placement = self.map_segments()?;
        info!("processing dynamic table");
        let dynamic = self.parse_dynamic_table(&placement)?;
        info!("processing relocations");
        self.apply_relocations(&placement, &dynamic)?;
        self.apply_plt_relocations(&placement, &dynamic)?;
        info!("setting up rw channel");
        let args = self.setup_rw_channel()?;
        info!("copying segment contents");
        self.copy_segments(&placement)?;
        info!("starting payload");
        self.transfer_control(&placement, args)
    }

    // Phase 1: reserve one contiguous window, re-map the executable
    // segment into a privileged shared memory object, map the rest as
    // private anonymous regions at their fixed offsets.
    fn map_segments(&mut self) -> Result<Placement, LoadError> {
        let mut total = 0u64;
        let mut text = None;
        let mut text_len = 0u64;
        for phdr in self.image.program_headers() {
            if !phdr.is_loadable() {
                continue;
            }
            total += page_align(phdr.p_memsz);
            if phdr.is_executable() {
                text_len = page_align(phdr.p_memsz);
                text = Some(phdr);
            }
        }
        let text = text.ok_or_else(|| {
            error!("no executable segment found");
            LoadError::NoExecutableSegment
        })?;

        // The placeholder reservation only fixes a base address window.
        let window = self.target.mmap(
            0,
            total,
            Protection::READ,
            MapFlags::ANONYMOUS | MapFlags::PRIVATE,
            -1,
        )?;
        debug!("acquired image window at {window:#x}");
        self.target.munmap(window, total)?;

        // Ordinary writable+executable mappings are restricted, so the
        // executable segment lives in a dedicated shared memory object.
        let jit_fd = self.target.jit_create(
            text_len,
            Protection::READ | Protection::WRITE | Protection::EXEC | Protection::GPU_READ,
        )?;
        if self.target.is_self() {
            self.jit_fd = Some(jit_fd);
        }

        let image_base = self.target.mmap(
            window,
            text_len,
            mmap_protection(text.flags()),
            MapFlags::FIXED | MapFlags::SHARED,
            jit_fd,
        )?;
        if image_base != window {
            return Err(LoadError::MappingMisplaced { wanted: window, got: image_base });
        }
        if self.target.is_self() {
            self.mapped.push(MappedRegion { base: image_base, len: text_len });
        }

        let placement = Placement {
            image_base,
            text_vaddr: text.p_vaddr,
            text_offset: text.p_offset,
        };

        for phdr in self.image.program_headers() {
            if !phdr.is_loadable() || phdr.is_executable() {
                continue;
            }
            let addr = placement.to_virtual_address(phdr.p_paddr);
            let len = page_align(phdr.p_memsz);
            let got = self.target.mmap(
                addr,
                len,
                mmap_protection(phdr.flags()),
                MapFlags::FIXED | MapFlags::ANONYMOUS | MapFlags::PRIVATE,
                -1,
            )?;
            if got != addr {
                return Err(LoadError::MappingMisplaced { wanted: addr, got });
            }
            debug!("mapped segment with paddr {:#x} at {addr:#x}", phdr.p_paddr);
            if self.target.is_self() {
                self.mapped.push(MappedRegion { base: addr, len });
            }
        }

        Ok(placement)
    }

    // Phase 2 and 3: collect link tables, then resolve the needed
    // libraries into the aggregating symbol resolver.
    fn parse_dynamic_table(&mut self, placement: &Placement) -> Result<DynamicInfo, LoadError> {
        let dyn_phdr = self
            .image
            .program_headers()
            .find(|p| p.p_type == PT_DYNAMIC)
            .ok_or_else(|| {
                error!("dynamic table not found");
                LoadError::NoDynamicTable
            })?;

        let mut info = DynamicInfo::default();
        let mut needed: Vec<u64> = Vec::new();
        let mut offset = dyn_phdr.p_offset;
        loop {
            let entry = self.image.dyn_at(offset)?;
            if entry.d_tag == DT_NULL {
                break;
            }
            match entry.d_tag {
                // prepend: the final list is the reverse of file order,
                // which library resolution depends on
                DT_NEEDED => needed.insert(0, entry.d_val),
                DT_RELA => info.rela = Some(placement.to_file_offset(entry.d_val)),
                DT_RELASZ => info.rela_count = entry.d_val / size_of::<Elf64Rela>() as u64,
                DT_JMPREL => info.plt = Some(placement.to_file_offset(entry.d_val)),
                DT_PLTRELSZ => info.plt_count = entry.d_val / size_of::<Elf64Rela>() as u64,
                DT_SYMTAB => info.symtab = Some(placement.to_file_offset(entry.d_val)),
                DT_STRTAB => info.strtab = Some(placement.to_file_offset(entry.d_val)),
                DT_STRSZ => info.strtab_len = entry.d_val,
                DT_HASH => {
                    // second word of the hash table is the symbol count
                    let hash = placement.to_file_offset(entry.d_val);
                    info.symtab_len = u64::from(self.image.read_u32(hash + 4)?);
                }
                _ => {}
            }
            offset += size_of::<crate::elf::Elf64Dyn>() as u64;
        }

        if info.strtab.is_none() {
            warn!("strtab not found");
        }
        if info.strtab.is_some() && info.strtab_len == 0 {
            error!("strtab size not found but strtab exists");
            return Err(LoadError::NoStringTableSize);
        }
        if info.symtab.is_none() {
            warn!("symtab not found");
        }
        let (Some(_), Some(strtab)) = (info.symtab, info.strtab) else {
            // nothing external to link against
            return Ok(info);
        };

        self.resolve_libraries(strtab, &needed)?;
        Ok(info)
    }

    fn resolve_libraries(&mut self, strtab: u64, needed: &[u64]) -> Result<(), LoadError> {
        let mut preloaded: Vec<i32> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        for &name_off in needed {
            let name = self.image.cstr_at(strtab + name_off)?;
            let Some(stem) = name.strip_suffix(".so") else {
                error!("unexpected library {name}");
                return Err(LoadError::UnexpectedLibrary(name.to_string()));
            };
            if name.starts_with("libkernel") {
                preloaded.push(LIBKERNEL_HANDLE);
            } else if name == "libSceLibcInternal.so" || name == "libc.so" {
                preloaded.push(LIBC_HANDLE);
            } else {
                names.push(stem.to_string());
            }
        }

        self.resolver.reserve(preloaded.len() + names.len());
        for handle in preloaded {
            let lib = self.target.lib_by_handle(handle).ok_or_else(|| {
                error!("failed to get library for handle {handle:#x}");
                LoadError::LibraryNotFound(format!("handle {handle:#x}"))
            })?;
            self.resolver.add_library(lib);
        }

        if names.is_empty() {
            return Ok(());
        }
        info!("loading {} libraries", names.len());
        if self.target.is_self() {
            self.load_libraries_in_place(&names)
        } else {
            self.load_libraries_remote(&names)
        }
    }

    fn load_libraries_in_place(&mut self, names: &[String]) -> Result<(), LoadError> {
        for name in names {
            let module = match sysmodules::id_for(name) {
                Some(id) => ModuleRef::Id(id),
                None => ModuleRef::Name(name.clone()),
            };
            let handle = self.target.load_local_module(&module)?;
            if handle == -1 {
                error!("failed to get module handle for {name}");
                return Err(LoadError::LibraryLoadFailed(name.clone()));
            }
        }
        for name in names {
            let lib = self
                .target
                .lib_by_name(name)
                .ok_or_else(|| LoadError::LibraryNotFound(name.clone()))?;
            self.resolver.add_library(lib);
        }
        Ok(())
    }

    // Loading inside a separate frozen target: write a packed table of
    // by-name libraries into the target, then invoke the target's own
    // module-loading entry points with either a numeric id or a table
    // offset, one call per library.
    fn load_libraries_remote(&mut self, names: &[String]) -> Result<(), LoadError> {
        let mut packed = String::new();
        let mut positions: Vec<u64> = Vec::with_capacity(names.len());
        for name in names {
            match sysmodules::id_for(name) {
                Some(id) => positions.push(u64::from(id)),
                None => {
                    positions.push(packed.len() as u64);
                    packed.push_str(name);
                    packed.push('\0');
                }
            }
        }

        let table_addr = self.target.alloc_data(packed.len() as u64 + 1)?;
        let mut table_bytes = packed.into_bytes();
        table_bytes.push(0);
        self.target.write(table_addr, &table_bytes)?;

        let sysmodule = self.target.lib_by_name(SYSMODULE_LIBRARY).ok_or_else(|| {
            error!("{SYSMODULE_LIBRARY} not loaded");
            LoadError::LibraryNotFound(SYSMODULE_LIBRARY.to_string())
        })?;
        let load_by_id = self
            .target
            .function_address(&sysmodule, "sceSysmoduleLoadModuleInternal")
            .ok_or_else(|| {
                error!("sceSysmoduleLoadModuleInternal not found");
                LoadError::UnresolvedSymbol("sceSysmoduleLoadModuleInternal".to_string())
            })?;
        let load_by_name = self
            .target
            .function_address(&sysmodule, "sceSysmoduleLoadModuleByNameInternal")
            .ok_or_else(|| {
                error!("sceSysmoduleLoadModuleByNameInternal not found");
                LoadError::UnresolvedSymbol("sceSysmoduleLoadModuleByNameInternal".to_string())
            })?;

        for (name, &pos) in names.iter().zip(&positions) {
            let handle = if pos & u64::from(INTERNAL_MASK) != 0 {
                self.target.call(load_by_id, &[pos, 0, 0, 0, 0, 0])?
            } else {
                self.target.call(load_by_name, &[table_addr + pos, 0, 0, 0, 0, 0])?
            } as i32;
            if handle == -1 {
                error!("failed to get module handle for {name}");
                return Err(LoadError::LibraryLoadFailed(name.clone()));
            }
            let lib = self
                .target
                .lib_by_name(name)
                .ok_or_else(|| LoadError::LibraryNotFound(name.clone()))?;
            self.resolver.add_library(lib);
        }
        info!("finished loading libraries");
        Ok(())
    }

    fn symbol_address(
        &self,
        placement: &Placement,
        dynamic: &DynamicInfo,
        rela: &Elf64Rela,
    ) -> Result<SymbolValue, LoadError> {
        let (Some(symtab), Some(strtab)) = (dynamic.symtab, dynamic.strtab) else {
            return Err(LoadError::UnresolvedSymbol("<no symbol table>".to_string()));
        };
        let sym = self
            .image
            .sym_at(symtab + (rela.symbol_index() * size_of::<crate::elf::Elf64Sym>()) as u64)?;
        if sym.st_value != 0 {
            // already defined inside this image; only happens when
            // loading a library rather than an executable
            return Ok(SymbolValue::Addr(placement.image_base + sym.st_value));
        }
        if sym.binding() == STB_WEAK {
            return Ok(SymbolValue::WeakAbsent);
        }
        let name = self.image.cstr_at(strtab + u64::from(sym.st_name))?;
        match self.resolver.lookup(self.target, name) {
            Some(addr) => Ok(SymbolValue::Addr(addr)),
            None => {
                error!("symbol lookup for {name} failed");
                Err(LoadError::UnresolvedSymbol(name.to_string()))
            }
        }
    }

    fn relocation_symbol_name(&self, dynamic: &DynamicInfo, rela: &Elf64Rela) -> String {
        let (Some(symtab), Some(strtab)) = (dynamic.symtab, dynamic.strtab) else {
            return "<unknown>".to_string();
        };
        self.image
            .sym_at(symtab + (rela.symbol_index() * size_of::<crate::elf::Elf64Sym>()) as u64)
            .ok()
            .and_then(|sym| self.image.cstr_at(strtab + u64::from(sym.st_name)).ok())
            .map(str::to_string)
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    // Phase 4a: the general relocation table.
    fn apply_relocations(
        &mut self,
        placement: &Placement,
        dynamic: &DynamicInfo,
    ) -> Result<(), LoadError> {
        let Some(table) = dynamic.rela else {
            return Ok(());
        };
        for i in 0..dynamic.rela_count {
            let rela = self.image.rela_at(table + i * size_of::<Elf64Rela>() as u64)?;
            let dest = placement.to_file_offset(rela.r_offset);
            match rela.kind() {
                R_X86_64_64 => {
                    let value = match self.symbol_address(placement, dynamic, &rela)? {
                        SymbolValue::Addr(addr) => addr,
                        SymbolValue::WeakAbsent => u64::MAX,
                    };
                    self.image.write_u64(dest, value.wrapping_add(rela.r_addend as u64))?;
                }
                R_X86_64_GLOB_DAT => match self.symbol_address(placement, dynamic, &rela)? {
                    SymbolValue::Addr(addr) => self.image.write_u64(dest, addr)?,
                    // intentionally absent weak symbol: no write
                    SymbolValue::WeakAbsent => {}
                },
                R_X86_64_RELATIVE => {
                    let value = placement.to_virtual_address(rela.r_addend as u64);
                    self.image.write_u64(dest, value)?;
                }
                // merged dynamic relocation sections put jump slots here
                R_X86_64_JMP_SLOT => {
                    let value = match self.symbol_address(placement, dynamic, &rela)? {
                        SymbolValue::Addr(addr) => addr,
                        SymbolValue::WeakAbsent => u64::MAX,
                    };
                    self.image.write_u64(dest, value)?;
                }
                kind => {
                    let symbol = self.relocation_symbol_name(dynamic, &rela);
                    error!("unexpected relocation type {kind} for symbol {symbol}");
                    return Err(LoadError::UnsupportedRelocation { kind, symbol });
                }
            }
        }
        Ok(())
    }

    // Phase 4b: the PLT table, jump slots only.
    fn apply_plt_relocations(
        &mut self,
        placement: &Placement,
        dynamic: &DynamicInfo,
    ) -> Result<(), LoadError> {
        let Some(table) = dynamic.plt else {
            return Ok(());
        };
        for i in 0..dynamic.plt_count {
            let rela = self.image.rela_at(table + i * size_of::<Elf64Rela>() as u64)?;
            if rela.kind() != R_X86_64_JMP_SLOT {
                let symbol = self.relocation_symbol_name(dynamic, &rela);
                error!("unexpected relocation type {} for symbol {symbol}", rela.kind());
                return Err(LoadError::UnsupportedRelocation { kind: rela.kind(), symbol });
            }
            let value = match self.symbol_address(placement, dynamic, &rela)? {
                SymbolValue::Addr(addr) => addr,
                SymbolValue::WeakAbsent => u64::MAX,
            };
            self.image.write_u64(placement.to_file_offset(rela.r_offset), value)?;
        }
        Ok(())
    }

    // Phase 5: give the payload its own privileged read/write channel
    // and assemble the parameter block it starts with.
    fn setup_rw_channel(&mut self) -> Result<u64, LoadError> {
        if self.target.is_self() {
            return self.setup_rw_channel_in_place();
        }

        let master = self.target.socket(AF_INET6, SOCK_DGRAM, IPPROTO_UDP)?;
        let victim = self.target.socket(AF_INET6, SOCK_DGRAM, IPPROTO_UDP)?;
        debug!("master socket {master}, victim socket {victim}");
        if master == -1 || victim == -1 {
            return Err(LoadError::ChannelSetupFailed("socket creation"));
        }
        let (pipe_rd, pipe_wr) = self.target.pipe()?;
        debug!("rw pipes {pipe_rd}, {pipe_wr}");
        let files = [master, victim, pipe_rd, pipe_wr];

        let mut opts = [0u8; 24];
        opts[0..4].copy_from_slice(&20u32.to_le_bytes());
        opts[4..8].copy_from_slice(&(IPPROTO_IPV6 as u32).to_le_bytes());
        opts[8..12].copy_from_slice(&(IPV6_TCLASS as u32).to_le_bytes());
        if let Err(e) = self.target.setsockopt(master, IPPROTO_IPV6, IPV6_2292PKTOPTIONS, &opts) {
            warn!("setsockopt on master socket failed: {e}");
        }
        let pktinfo = [0u8; 20];
        if let Err(e) = self.target.setsockopt(victim, IPPROTO_IPV6, IPV6_PKTINFO, &pktinfo) {
            warn!("setsockopt on victim socket failed: {e}");
        }

        self.target.establish_rw_channel(&files).map_err(|e| {
            error!("failed to create rw channel: {e}");
            LoadError::ChannelSetupFailed("rw channel")
        })?;
        let kpipe_addr = self.target.pipe_file_kernel_addr(pipe_rd)?;

        let libkernel = self
            .target
            .lib_by_handle(LIBKERNEL_HANDLE)
            .ok_or(LoadError::LibraryNotFound("libkernel".to_string()))?;
        let dlsym = self
            .target
            .function_address(&libkernel, "sceKernelDlsym")
            .ok_or(LoadError::UnresolvedSymbol("sceKernelDlsym".to_string()))?;

        // stash the descriptor quad and the parameter block on the
        // target's stack, below its current stack pointer
        let mut regs = self.target.registers()?;
        regs.rsp -= size_of::<[i32; 4]>() as u64;
        let files_addr = regs.rsp;
        let mut file_bytes = [0u8; 16];
        for (i, fd) in files.iter().enumerate() {
            file_bytes[i * 4..i * 4 + 4].copy_from_slice(&fd.to_le_bytes());
        }
        self.target.write(files_addr, &file_bytes)?;
        regs.rsp -= (size_of::<i32>() + PayloadArgs::SIZE) as u64;
        let args_addr = regs.rsp;
        self.target.set_registers(&regs)?;

        let args = PayloadArgs {
            dlsym,
            rw_pipe: files_addr + 8,
            rw_pair: files_addr,
            kpipe_addr,
            kdata_base_addr: self.target.kernel_data_base(),
            payload_out: args_addr + PayloadArgs::SIZE as u64,
        };
        self.target.write(args_addr, &args.to_bytes())?;
        Ok(args_addr)
    }

    fn setup_rw_channel_in_place(&mut self) -> Result<u64, LoadError> {
        let own = self.target.own_channel()?;
        let libkernel = self
            .target
            .lib_by_handle(LIBKERNEL_HANDLE)
            .ok_or(LoadError::LibraryNotFound("libkernel".to_string()))?;
        let dlsym = self
            .target
            .function_address(&libkernel, "sceKernelDlsym")
            .ok_or(LoadError::UnresolvedSymbol("sceKernelDlsym".to_string()))?;

        let mut block = Box::new(InProcessArgs {
            args: PayloadArgs::default(),
            rw_pipe: own.rw_pipe,
            rw_pair: own.rw_pair,
            payload_out: 0,
        });
        block.args = PayloadArgs {
            dlsym,
            rw_pipe: &block.rw_pipe as *const [i32; 2] as u64,
            rw_pair: &block.rw_pair as *const [i32; 2] as u64,
            kpipe_addr: own.kpipe_addr,
            kdata_base_addr: self.target.kernel_data_base(),
            payload_out: &block.payload_out as *const i32 as u64,
        };
        let addr = &block.args as *const PayloadArgs as u64;
        // the block must stay alive until the entry point returns
        self.in_process_args = Some(block);
        Ok(addr)
    }

    // Phase 6: copy file bytes of every mapped segment into the target.
    fn copy_segments(&mut self, placement: &Placement) -> Result<(), LoadError> {
        debug!("homebrew image base {:#x}", placement.image_base);
        for i in 0..self.image.phnum() {
            let phdr = self.image.program_header(i)?;
            if !phdr.is_loadable() {
                continue;
            }
            let vaddr = placement.to_virtual_address(phdr.p_paddr);
            if vaddr == 0 {
                continue;
            }
            let data = self.image.bytes(phdr.p_offset, phdr.p_filesz)?;
            let mut attempts = 0u32;
            while let Err(e) = self.target.write(vaddr, data) {
                warn!("failed to write segment with paddr {:#x} to {vaddr:#x}: {e}", phdr.p_paddr);
                attempts += 1;
                if attempts > COPY_RETRY_LIMIT {
                    return Err(LoadError::CopyFailed { vaddr });
                }
            }
        }
        Ok(())
    }

    // Phase 7: hand control to the loaded image.
    fn transfer_control(mut self, placement: &Placement, args: u64) -> Result<(), LoadError> {
        let entry = placement.to_virtual_address(self.image.entry());
        debug!("image base {:#x}, entry point {entry:#x}", placement.image_base);

        if self.target.is_self() {
            let status = self.target.call_entry(entry, args);
            // release every recorded region exactly once, whatever the
            // payload reported
            for region in self.mapped.drain(..) {
                if let Err(e) = self.target.munmap(region.base, region.len) {
                    warn!("failed to unmap {:#x}: {e}", region.base);
                }
            }
            if let Some(fd) = self.jit_fd.take() {
                if let Err(e) = self.target.close(fd) {
                    warn!("failed to close jit descriptor: {e}");
                }
            }
            let status = status?;
            if status != 0 {
                return Err(LoadError::PayloadFailed(status));
            }
            return Ok(());
        }

        let mut regs = self.target.registers()?;
        regs.rsp = (regs.rsp & !(STACK_ALIGN - 1)) - 8;
        regs.rdi = args;
        regs.rip = entry;
        self.target.set_registers(&regs)?;
        // the target runs once the debug session detaches
        Ok(())
    }
}

fn page_align(len: u64) -> u64 {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn mmap_protection(flags: SegmentFlags) -> Protection {
    let mut prot = Protection::empty();
    if flags.contains(SegmentFlags::EXEC) {
        prot |= Protection::EXEC;
    }
    if flags.contains(SegmentFlags::READ) {
        prot |= Protection::READ | Protection::GPU_READ;
    }
    if flags.contains(SegmentFlags::WRITE) {
        prot |= Protection::WRITE | Protection::GPU_WRITE;
    }
    prot
}
