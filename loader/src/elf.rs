//! ELF64 image parsing.
//!
//! Implements a bounds-checked view over the raw bytes of an ELF64
//! executable. All structure reads go through [`ElfImage`]; out-of-range
//! offsets are rejected instead of trusting the file.

use core::mem::size_of;

use bitflags::bitflags;

/// ELF magic number: 0x7F 'E' 'L' 'F'
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// ELF class: 64-bit
pub const ELFCLASS64: u8 = 2;

/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;

/// Machine type: x86_64
pub const EM_X86_64: u16 = 62;

/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;

/// Program header type: dynamic linking info
pub const PT_DYNAMIC: u32 = 2;

/// Program header type: exception handling frame data
pub const PT_GNU_EH_FRAME: u32 = 0x6474_E550;

/// Dynamic tags consumed by the loader.
pub const DT_NULL: i64 = 0;
pub const DT_NEEDED: i64 = 1;
pub const DT_PLTRELSZ: i64 = 2;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_RELA: i64 = 7;
pub const DT_RELASZ: i64 = 8;
pub const DT_STRSZ: i64 = 10;
pub const DT_JMPREL: i64 = 23;

/// Relocation type: direct 64-bit (symbol + addend)
pub const R_X86_64_64: u32 = 1;

/// Relocation type: GOT entry (symbol)
pub const R_X86_64_GLOB_DAT: u32 = 6;

/// Relocation type: PLT jump slot (symbol)
pub const R_X86_64_JMP_SLOT: u32 = 7;

/// Relocation type: image-base relative (addend)
pub const R_X86_64_RELATIVE: u32 = 8;

/// Symbol binding: weak
pub const STB_WEAK: u8 = 2;

bitflags! {
    /// Program header permission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        /// Segment is executable (PF_X).
        const EXEC = 1;
        /// Segment is writable (PF_W).
        const WRITE = 2;
        /// Segment is readable (PF_R).
        const READ = 4;
    }
}

/// ELF64 file header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf64Header {
    /// Magic number and other info
    pub e_ident: [u8; 16],
    /// Object file type
    pub e_type: u16,
    /// Machine type
    pub e_machine: u16,
    /// Object file version
    pub e_version: u32,
    /// Entry point virtual address
    pub e_entry: u64,
    /// Program header table file offset
    pub e_phoff: u64,
    /// Section header table file offset
    pub e_shoff: u64,
    /// Processor-specific flags
    pub e_flags: u32,
    /// ELF header size
    pub e_ehsize: u16,
    /// Program header table entry size
    pub e_phentsize: u16,
    /// Program header table entry count
    pub e_phnum: u16,
    /// Section header table entry size
    pub e_shentsize: u16,
    /// Section header table entry count
    pub e_shnum: u16,
    /// Section name string table index
    pub e_shstrndx: u16,
}

/// ELF64 program header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf64ProgramHeader {
    /// Segment type
    pub p_type: u32,
    /// Segment flags
    pub p_flags: u32,
    /// Segment file offset
    pub p_offset: u64,
    /// Segment virtual address
    pub p_vaddr: u64,
    /// Segment physical address
    pub p_paddr: u64,
    /// Segment size in file
    pub p_filesz: u64,
    /// Segment size in memory
    pub p_memsz: u64,
    /// Segment alignment
    pub p_align: u64,
}

impl Elf64ProgramHeader {
    /// Permission flags of this segment.
    pub fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits_truncate(self.p_flags)
    }

    /// Whether the loader maps this segment (LOAD or EH-frame data).
    pub fn is_loadable(&self) -> bool {
        self.p_type == PT_LOAD || self.p_type == PT_GNU_EH_FRAME
    }

    /// Whether this segment carries the executable flag.
    pub fn is_executable(&self) -> bool {
        self.flags().contains(SegmentFlags::EXEC)
    }
}

/// ELF64 dynamic-section entry
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf64Dyn {
    /// Entry tag (DT_*)
    pub d_tag: i64,
    /// Tag value or pointer
    pub d_val: u64,
}

/// ELF64 symbol table entry
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf64Sym {
    /// Symbol name (string table offset)
    pub st_name: u32,
    /// Type and binding
    pub st_info: u8,
    /// Visibility
    pub st_other: u8,
    /// Section index
    pub st_shndx: u16,
    /// Symbol value
    pub st_value: u64,
    /// Symbol size
    pub st_size: u64,
}

impl Elf64Sym {
    /// Symbol binding (upper nibble of `st_info`).
    pub fn binding(&self) -> u8 {
        self.st_info >> 4
    }
}

/// ELF64 relocation entry with addend
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf64Rela {
    /// Location to patch (virtual address)
    pub r_offset: u64,
    /// Symbol index and relocation type
    pub r_info: u64,
    /// Constant addend
    pub r_addend: i64,
}

impl Elf64Rela {
    /// Relocation type (low 32 bits of `r_info`).
    pub fn kind(&self) -> u32 {
        (self.r_info & 0xFFFF_FFFF) as u32
    }

    /// Symbol table index (high 32 bits of `r_info`).
    pub fn symbol_index(&self) -> usize {
        (self.r_info >> 32) as usize
    }
}

/// ELF parsing and access errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElfError {
    /// Buffer too small to contain an ELF header
    TooSmall,
    /// Invalid ELF magic number
    InvalidMagic,
    /// Invalid ELF class (not 64-bit)
    InvalidClass,
    /// Invalid data encoding (not little endian)
    InvalidEncoding,
    /// Invalid ELF version
    InvalidVersion,
    /// Invalid machine type (not x86_64)
    InvalidMachine,
    /// Program header table lies outside the buffer
    InvalidProgramHeaders,
    /// An access fell outside the buffer
    OutOfBounds {
        /// Requested file offset
        offset: u64,
        /// Requested length
        len: u64,
    },
    /// A string was not NUL-terminated or not valid UTF-8
    InvalidString(u64),
}

impl core::fmt::Display for ElfError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooSmall => write!(f, "buffer too small for ELF header"),
            Self::InvalidMagic => write!(f, "invalid ELF magic"),
            Self::InvalidClass => write!(f, "not a 64-bit ELF"),
            Self::InvalidEncoding => write!(f, "not little endian"),
            Self::InvalidVersion => write!(f, "invalid ELF version"),
            Self::InvalidMachine => write!(f, "not an x86_64 ELF"),
            Self::InvalidProgramHeaders => write!(f, "program header table out of bounds"),
            Self::OutOfBounds { offset, len } => {
                write!(f, "access out of bounds: offset {offset:#x} len {len:#x}")
            }
            Self::InvalidString(offset) => write!(f, "invalid string at offset {offset:#x}"),
        }
    }
}

/// Raw bytes of an ELF executable plus a validated header.
///
/// Owned by one load attempt. Relocations are applied to this buffer
/// before its contents are copied into the mapped segments.
pub struct ElfImage {
    data: Vec<u8>,
    header: Elf64Header,
}

impl ElfImage {
    /// Parse and validate an ELF64 image from raw bytes.
    pub fn parse(data: Vec<u8>) -> Result<Self, ElfError> {
        if data.len() < size_of::<Elf64Header>() {
            return Err(ElfError::TooSmall);
        }

        // SAFETY: the size was checked above and Elf64Header is a plain
        // repr(C) struct, read unaligned from the buffer.
        let header: Elf64Header =
            unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };

        if header.e_ident[0..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }
        if header.e_ident[4] != ELFCLASS64 {
            return Err(ElfError::InvalidClass);
        }
        if header.e_ident[5] != ELFDATA2LSB {
            return Err(ElfError::InvalidEncoding);
        }
        if header.e_ident[6] != 1 {
            return Err(ElfError::InvalidVersion);
        }
        if header.e_machine != EM_X86_64 {
            return Err(ElfError::InvalidMachine);
        }

        let table_len = (header.e_phnum as u64)
            .checked_mul(size_of::<Elf64ProgramHeader>() as u64)
            .ok_or(ElfError::InvalidProgramHeaders)?;
        let table_end = header
            .e_phoff
            .checked_add(table_len)
            .ok_or(ElfError::InvalidProgramHeaders)?;
        if header.e_phentsize as usize != size_of::<Elf64ProgramHeader>()
            || table_end > data.len() as u64
        {
            return Err(ElfError::InvalidProgramHeaders);
        }

        Ok(ElfImage { data, header })
    }

    /// The validated file header.
    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    /// The entry point virtual address from the file header.
    pub fn entry(&self) -> u64 {
        self.header.e_entry
    }

    /// Number of program headers.
    pub fn phnum(&self) -> usize {
        self.header.e_phnum as usize
    }

    /// Total file size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Program header at `index`.
    pub fn program_header(&self, index: usize) -> Result<Elf64ProgramHeader, ElfError> {
        if index >= self.phnum() {
            return Err(ElfError::InvalidProgramHeaders);
        }
        let offset = self.header.e_phoff + (index * size_of::<Elf64ProgramHeader>()) as u64;
        self.read_struct(offset)
    }

    /// Iterator over all program headers.
    ///
    /// Bounds were validated at parse time, so iteration cannot fail.
    pub fn program_headers(&self) -> impl Iterator<Item = Elf64ProgramHeader> + '_ {
        (0..self.phnum()).map(move |i| {
            self.program_header(i)
                .unwrap_or_else(|_| unreachable!("phdr table validated at parse"))
        })
    }

    /// Borrow `len` bytes at file offset `offset`.
    pub fn bytes(&self, offset: u64, len: u64) -> Result<&[u8], ElfError> {
        let end = offset.checked_add(len).ok_or(ElfError::OutOfBounds { offset, len })?;
        if end > self.data.len() as u64 {
            return Err(ElfError::OutOfBounds { offset, len });
        }
        Ok(&self.data[offset as usize..end as usize])
    }

    /// Read a little-endian u32 at file offset `offset`.
    pub fn read_u32(&self, offset: u64) -> Result<u32, ElfError> {
        let bytes = self.bytes(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a little-endian u64 at file offset `offset`.
    ///
    /// Used to apply relocations to the image before the content copy.
    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<(), ElfError> {
        let end = offset.checked_add(8).ok_or(ElfError::OutOfBounds { offset, len: 8 })?;
        if end > self.data.len() as u64 {
            return Err(ElfError::OutOfBounds { offset, len: 8 });
        }
        self.data[offset as usize..end as usize].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// NUL-terminated string at file offset `offset`.
    pub fn cstr_at(&self, offset: u64) -> Result<&str, ElfError> {
        if offset >= self.data.len() as u64 {
            return Err(ElfError::OutOfBounds { offset, len: 1 });
        }
        let tail = &self.data[offset as usize..];
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(ElfError::InvalidString(offset))?;
        core::str::from_utf8(&tail[..len]).map_err(|_| ElfError::InvalidString(offset))
    }

    /// Dynamic entry at file offset `offset`.
    pub fn dyn_at(&self, offset: u64) -> Result<Elf64Dyn, ElfError> {
        self.read_struct(offset)
    }

    /// Symbol table entry at file offset `offset`.
    pub fn sym_at(&self, offset: u64) -> Result<Elf64Sym, ElfError> {
        self.read_struct(offset)
    }

    /// Relocation entry at file offset `offset`.
    pub fn rela_at(&self, offset: u64) -> Result<Elf64Rela, ElfError> {
        self.read_struct(offset)
    }

    fn read_struct<T: Copy>(&self, offset: u64) -> Result<T, ElfError> {
        let size = size_of::<T>() as u64;
        let bytes = self.bytes(offset, size)?;
        // SAFETY: bounds checked above; T is one of the plain repr(C)
        // ELF structures, read unaligned from the buffer.
        Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }
}
