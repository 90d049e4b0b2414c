//! End-to-end load tests against a scripted fake target.
//!
//! The fixture image has a read+execute text segment, a read+write data
//! segment holding the dynamic tables, two needed libraries and one of
//! every supported relocation kind.

use std::cell::RefCell;
use std::collections::HashMap;

use brewd_loader::elf::{
    DT_HASH, DT_JMPREL, DT_NEEDED, DT_NULL, DT_PLTRELSZ, DT_RELA, DT_RELASZ, DT_STRSZ, DT_STRTAB,
    DT_SYMTAB, PT_DYNAMIC, PT_LOAD, R_X86_64_64, R_X86_64_GLOB_DAT, R_X86_64_JMP_SLOT,
    R_X86_64_RELATIVE,
};
use brewd_loader::load::{ElfLoader, LoadError, PAGE_SIZE};
use brewd_loader::target::{
    LibraryInfo, MapFlags, ModuleRef, OwnChannel, Protection, Registers, TargetError,
    TargetProcess,
};

/// Base address the fake hands out for the placeholder reservation.
const BASE: u64 = 0x8_0000_0000;

const LIBKERNEL_BASE: u64 = 0x7000_0000;
const SYSMODULE_BASE: u64 = 0x7200_0000;
const USER_SERVICE_BASE: u64 = 0x7300_0000;

const DLSYM_ADDR: u64 = 0x7000_0100;
const SOME_FUNC_ADDR: u64 = 0x7000_0500;
const LOAD_BY_ID_ADDR: u64 = 0x7200_0100;
const LOAD_BY_NAME_ADDR: u64 = 0x7200_0200;
const PLT_FUNC_ADDR: u64 = 0x7300_0200;

const USER_SERVICE_ID: u64 = 0x8000_0011;

const INITIAL_RSP: u64 = 0x7FFF_0000;
const JIT_FD: i32 = 77;
const DATA_TABLE_ADDR: u64 = 0x6000_0000;
const KDATA_BASE: u64 = 0xFFFF_8000_0000_0000;
const KPIPE_ADDR: u64 = 0xFFFF_FFFF_AAAA_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MmapCall {
    addr: u64,
    len: u64,
    prot: Protection,
    flags: MapFlags,
    fd: i32,
    returned: u64,
}

#[derive(Default)]
struct State {
    mmaps: Vec<MmapCall>,
    munmaps: Vec<(u64, u64)>,
    writes: Vec<(u64, Vec<u8>)>,
    write_failures: HashMap<u64, u32>,
    regs: Registers,
    calls: Vec<(u64, [u64; 6])>,
    closed: Vec<i32>,
    sockets: Vec<(i32, i32, i32)>,
    setsockopts: Vec<(i32, i32, i32, Vec<u8>)>,
    established: Vec<[i32; 4]>,
    local_modules: Vec<ModuleRef>,
    entry_calls: Vec<(u64, u64)>,
    entry_status: i32,
    allocs: Vec<u64>,
    next_fd: i32,
}

struct FakeTarget {
    in_process: bool,
    libs_by_handle: HashMap<i32, LibraryInfo>,
    libs_by_name: HashMap<String, LibraryInfo>,
    symbols: HashMap<(u64, String), u64>,
    state: RefCell<State>,
}

impl FakeTarget {
    fn remote() -> Self {
        let mut libs_by_handle = HashMap::new();
        libs_by_handle.insert(
            0x2001,
            LibraryInfo { image_base: LIBKERNEL_BASE, metadata_addr: LIBKERNEL_BASE + 0x1000 },
        );

        let mut libs_by_name = HashMap::new();
        libs_by_name.insert(
            "libSceSysmodule.sprx".to_string(),
            LibraryInfo { image_base: SYSMODULE_BASE, metadata_addr: SYSMODULE_BASE + 0x1000 },
        );
        libs_by_name.insert(
            "libSceUserService".to_string(),
            LibraryInfo {
                image_base: USER_SERVICE_BASE,
                metadata_addr: USER_SERVICE_BASE + 0x1000,
            },
        );

        let mut symbols = HashMap::new();
        symbols.insert((LIBKERNEL_BASE, "sceKernelDlsym".to_string()), DLSYM_ADDR);
        symbols.insert((LIBKERNEL_BASE, "some_func".to_string()), SOME_FUNC_ADDR);
        symbols.insert(
            (SYSMODULE_BASE, "sceSysmoduleLoadModuleInternal".to_string()),
            LOAD_BY_ID_ADDR,
        );
        symbols.insert(
            (SYSMODULE_BASE, "sceSysmoduleLoadModuleByNameInternal".to_string()),
            LOAD_BY_NAME_ADDR,
        );
        symbols.insert((USER_SERVICE_BASE, "plt_func".to_string()), PLT_FUNC_ADDR);

        let state = State {
            regs: Registers { rsp: INITIAL_RSP, ..Registers::default() },
            next_fd: 10,
            ..State::default()
        };
        FakeTarget { in_process: false, libs_by_handle, libs_by_name, symbols, state: RefCell::new(state) }
    }

    fn in_process() -> Self {
        FakeTarget { in_process: true, ..Self::remote() }
    }

    fn fail_writes_at(&self, addr: u64, times: u32) {
        self.state.borrow_mut().write_failures.insert(addr, times);
    }

    fn write_at(&self, addr: u64) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .writes
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, data)| data.clone())
    }
}

impl TargetProcess for FakeTarget {
    fn pid(&self) -> i32 {
        1234
    }

    fn is_self(&self) -> bool {
        self.in_process
    }

    fn image_base(&self) -> Result<u64, TargetError> {
        Ok(0x4000_0000)
    }

    fn mmap(
        &self,
        addr: u64,
        len: u64,
        prot: Protection,
        flags: MapFlags,
        fd: i32,
    ) -> Result<u64, TargetError> {
        let returned = if addr == 0 { BASE } else { addr };
        self.state.borrow_mut().mmaps.push(MmapCall { addr, len, prot, flags, fd, returned });
        Ok(returned)
    }

    fn munmap(&self, addr: u64, len: u64) -> Result<(), TargetError> {
        self.state.borrow_mut().munmaps.push((addr, len));
        Ok(())
    }

    fn jit_create(&self, _len: u64, _prot: Protection) -> Result<i32, TargetError> {
        Ok(JIT_FD)
    }

    fn read(&self, _addr: u64, buf: &mut [u8]) -> Result<(), TargetError> {
        buf.fill(0);
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), TargetError> {
        let mut state = self.state.borrow_mut();
        if let Some(remaining) = state.write_failures.get_mut(&addr) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TargetError::Fault(addr));
            }
        }
        state.writes.push((addr, data.to_vec()));
        Ok(())
    }

    fn registers(&self) -> Result<Registers, TargetError> {
        Ok(self.state.borrow().regs)
    }

    fn set_registers(&self, regs: &Registers) -> Result<(), TargetError> {
        self.state.borrow_mut().regs = *regs;
        Ok(())
    }

    fn call(&self, func: u64, args: &[u64; 6]) -> Result<i64, TargetError> {
        self.state.borrow_mut().calls.push((func, *args));
        Ok(7)
    }

    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> Result<i32, TargetError> {
        let mut state = self.state.borrow_mut();
        let fd = state.next_fd;
        state.next_fd += 1;
        state.sockets.push((domain, ty, protocol));
        Ok(fd)
    }

    fn pipe(&self) -> Result<(i32, i32), TargetError> {
        let mut state = self.state.borrow_mut();
        let rd = state.next_fd;
        state.next_fd += 2;
        Ok((rd, rd + 1))
    }

    fn setsockopt(&self, fd: i32, level: i32, name: i32, value: &[u8]) -> Result<i32, TargetError> {
        self.state.borrow_mut().setsockopts.push((fd, level, name, value.to_vec()));
        Ok(0)
    }

    fn close(&self, fd: i32) -> Result<(), TargetError> {
        self.state.borrow_mut().closed.push(fd);
        Ok(())
    }

    fn alloc_data(&self, len: u64) -> Result<u64, TargetError> {
        self.state.borrow_mut().allocs.push(len);
        Ok(DATA_TABLE_ADDR)
    }

    fn lib_by_handle(&self, handle: i32) -> Option<LibraryInfo> {
        self.libs_by_handle.get(&handle).copied()
    }

    fn lib_by_name(&self, name: &str) -> Option<LibraryInfo> {
        self.libs_by_name.get(name).copied()
    }

    fn function_address(&self, lib: &LibraryInfo, symbol: &str) -> Option<u64> {
        self.resolve_symbol(lib, symbol)
    }

    fn resolve_symbol(&self, lib: &LibraryInfo, name: &str) -> Option<u64> {
        self.symbols.get(&(lib.image_base, name.to_string())).copied()
    }

    fn load_local_module(&self, module: &ModuleRef) -> Result<i32, TargetError> {
        self.state.borrow_mut().local_modules.push(module.clone());
        Ok(5)
    }

    fn establish_rw_channel(&self, fds: &[i32; 4]) -> Result<(), TargetError> {
        self.state.borrow_mut().established.push(*fds);
        Ok(())
    }

    fn pipe_file_kernel_addr(&self, _fd: i32) -> Result<u64, TargetError> {
        Ok(KPIPE_ADDR)
    }

    fn own_channel(&self) -> Result<OwnChannel, TargetError> {
        Ok(OwnChannel { rw_pipe: [20, 21], rw_pair: [22, 23], kpipe_addr: KPIPE_ADDR })
    }

    fn kernel_data_base(&self) -> u64 {
        KDATA_BASE
    }

    fn set_name(&self, _name: &str) -> Result<(), TargetError> {
        Ok(())
    }

    fn call_entry(&self, entry: u64, args: u64) -> Result<i32, TargetError> {
        let mut state = self.state.borrow_mut();
        state.entry_calls.push((entry, args));
        Ok(state.entry_status)
    }
}

// Fixture layout: text at vaddr 0x1000 / file 0x100, data at vaddr
// 0x2000 / file 0x1100. The data segment holds the dynamic table,
// relocations, symbol table, string table and hash table.

const TEXT_VADDR: u64 = 0x1000;
const TEXT_OFFSET: u64 = 0x100;
const DATA_VADDR: u64 = 0x2000;

fn v2f(vaddr: u64) -> usize {
    (vaddr - TEXT_VADDR + TEXT_OFFSET) as usize
}

fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_phdr(
    buf: &mut [u8],
    index: usize,
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
) {
    let o = 64 + index * 56;
    put_u32(buf, o, p_type);
    put_u32(buf, o + 4, flags);
    put_u64(buf, o + 8, offset);
    put_u64(buf, o + 16, vaddr);
    put_u64(buf, o + 24, vaddr); // paddr mirrors vaddr
    put_u64(buf, o + 32, filesz);
    put_u64(buf, o + 40, memsz);
}

fn put_dyn(buf: &mut [u8], index: usize, tag: i64, val: u64) {
    let o = v2f(DATA_VADDR) + index * 16;
    put_u64(buf, o, tag as u64);
    put_u64(buf, o + 8, val);
}

fn put_sym(buf: &mut [u8], index: usize, st_name: u32, st_info: u8, st_value: u64) {
    let o = v2f(0x2300) + index * 24;
    put_u32(buf, o, st_name);
    buf[o + 4] = st_info;
    put_u64(buf, o + 8, st_value);
}

fn put_rela(buf: &mut [u8], table: u64, index: usize, r_offset: u64, r_info: u64, r_addend: i64) {
    let o = v2f(table) + index * 24;
    put_u64(buf, o, r_offset);
    put_u64(buf, o + 8, r_info);
    put_u64(buf, o + 16, r_addend as u64);
}

fn build_fixture() -> Vec<u8> {
    let mut elf = vec![0u8; 0x1800];

    elf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    elf[4] = 2; // 64-bit
    elf[5] = 1; // little endian
    elf[6] = 1; // ELF version
    put_u16(&mut elf, 18, 62); // x86_64
    put_u64(&mut elf, 24, TEXT_VADDR); // entry
    put_u64(&mut elf, 32, 64); // phoff
    put_u16(&mut elf, 54, 56); // phentsize
    put_u16(&mut elf, 56, 3); // phnum

    put_phdr(&mut elf, 0, PT_LOAD, 5, TEXT_OFFSET, TEXT_VADDR, 0x100, 0x100);
    put_phdr(&mut elf, 1, PT_LOAD, 6, v2f(DATA_VADDR) as u64, DATA_VADDR, 0x700, 0x700);
    put_phdr(&mut elf, 2, PT_DYNAMIC, 6, v2f(DATA_VADDR) as u64, DATA_VADDR, 0xB0, 0xB0);

    // string table at 0x2400
    let strtab = v2f(0x2400);
    let strings = b"\0libkernel.so\0libSceUserService.so\0some_func\0plt_func\0weak_sym\0";
    elf[strtab..strtab + strings.len()].copy_from_slice(strings);

    // symbol table at 0x2300: null, strong undef, weak undef, plt
    put_sym(&mut elf, 0, 0, 0, 0);
    put_sym(&mut elf, 1, 35, 0x12, 0); // some_func, global
    put_sym(&mut elf, 2, 54, 0x22, 0); // weak_sym, weak
    put_sym(&mut elf, 3, 45, 0x12, 0); // plt_func, global

    // relocation table at 0x2200
    put_rela(&mut elf, 0x2200, 0, 0x20C0, u64::from(R_X86_64_RELATIVE), 0x1234);
    put_rela(&mut elf, 0x2200, 1, 0x20C8, (1 << 32) | u64::from(R_X86_64_64), 0x10);
    put_rela(&mut elf, 0x2200, 2, 0x20D0, (2 << 32) | u64::from(R_X86_64_GLOB_DAT), 0);

    // plt table at 0x2280
    put_rela(&mut elf, 0x2280, 0, 0x20D8, (3 << 32) | u64::from(R_X86_64_JMP_SLOT), 0);

    // hash table at 0x2500: one bucket, four chain entries
    put_u32(&mut elf, v2f(0x2500), 1);
    put_u32(&mut elf, v2f(0x2500) + 4, 4);

    // dynamic table at 0x2000
    put_dyn(&mut elf, 0, DT_NEEDED, 1); // libkernel.so
    put_dyn(&mut elf, 1, DT_NEEDED, 14); // libSceUserService.so
    put_dyn(&mut elf, 2, DT_RELA, 0x2200);
    put_dyn(&mut elf, 3, DT_RELASZ, 72);
    put_dyn(&mut elf, 4, DT_JMPREL, 0x2280);
    put_dyn(&mut elf, 5, DT_PLTRELSZ, 24);
    put_dyn(&mut elf, 6, DT_SYMTAB, 0x2300);
    put_dyn(&mut elf, 7, DT_STRTAB, 0x2400);
    put_dyn(&mut elf, 8, DT_STRSZ, 63);
    put_dyn(&mut elf, 9, DT_HASH, 0x2500);
    put_dyn(&mut elf, 10, DT_NULL, 0);

    elf
}

// Variant with three needed libraries and no plt table; the freed
// dynamic slots hold the extra needed entries.
fn three_library_fixture() -> Vec<u8> {
    let mut elf = build_fixture();

    let extra = b"libAaa.so\0libBbb.so\0";
    let off = v2f(0x2400) + 63;
    elf[off..off + extra.len()].copy_from_slice(extra);

    put_dyn(&mut elf, 0, DT_NEEDED, 1); // libkernel.so
    put_dyn(&mut elf, 1, DT_NEEDED, 63); // libAaa.so
    put_dyn(&mut elf, 2, DT_NEEDED, 73); // libBbb.so
    put_dyn(&mut elf, 3, DT_RELA, 0x2200);
    put_dyn(&mut elf, 4, DT_RELASZ, 72);
    put_dyn(&mut elf, 5, DT_SYMTAB, 0x2300);
    put_dyn(&mut elf, 6, DT_STRTAB, 0x2400);
    put_dyn(&mut elf, 7, DT_STRSZ, 83);
    put_dyn(&mut elf, 8, DT_HASH, 0x2500);
    put_dyn(&mut elf, 9, DT_NULL, 0);
    elf
}

#[test]
fn missing_executable_segment_fails_before_any_mapping() {
    let mut elf = build_fixture();
    put_u32(&mut elf, 64 + 4, 4); // text segment loses the exec flag

    let target = FakeTarget::remote();
    let result = ElfLoader::new(&target, elf).unwrap().launch();

    assert!(matches!(result, Err(LoadError::NoExecutableSegment)));
    assert!(target.state.borrow().mmaps.is_empty());
}

#[test]
fn remote_launch_maps_reservation_then_fixed_segments() {
    let target = FakeTarget::remote();
    ElfLoader::new(&target, build_fixture()).unwrap().launch().unwrap();

    let state = target.state.borrow();
    let mmaps = &state.mmaps;
    assert_eq!(mmaps.len(), 3);

    // 0x100 of text and 0x700 of data both round up to one page
    assert_eq!(mmaps[0].addr, 0);
    assert_eq!(mmaps[0].len, 2 * PAGE_SIZE);
    assert_eq!(mmaps[0].fd, -1);
    assert_eq!(state.munmaps[0], (BASE, 2 * PAGE_SIZE));

    // executable segment re-mapped from the jit descriptor
    assert_eq!(mmaps[1].addr, BASE);
    assert_eq!(mmaps[1].len, PAGE_SIZE);
    assert_eq!(mmaps[1].fd, JIT_FD);
    assert!(mmaps[1].flags.contains(MapFlags::FIXED | MapFlags::SHARED));
    assert!(mmaps[1].prot.contains(Protection::EXEC));

    // data segment: anonymous private fixed, one page beyond text
    assert_eq!(mmaps[2].addr, BASE + (DATA_VADDR - TEXT_VADDR));
    assert_eq!(mmaps[2].len, PAGE_SIZE);
    assert_eq!(mmaps[2].fd, -1);
    assert!(mmaps[2].flags.contains(MapFlags::FIXED | MapFlags::ANONYMOUS | MapFlags::PRIVATE));
    assert!(mmaps[2].prot.contains(Protection::WRITE));
    assert!(!mmaps[2].prot.contains(Protection::EXEC));
}

#[test]
fn remote_launch_loads_named_library_by_internal_id() {
    let target = FakeTarget::remote();
    ElfLoader::new(&target, build_fixture()).unwrap().launch().unwrap();

    let state = target.state.borrow();
    // libSceUserService has a well-known id, so the packed name table
    // holds nothing but its terminator
    assert_eq!(state.allocs, vec![1]);
    let library_calls: Vec<_> =
        state.calls.iter().filter(|(func, _)| *func == LOAD_BY_ID_ADDR).collect();
    assert_eq!(library_calls.len(), 1);
    assert_eq!(library_calls[0].1[0], USER_SERVICE_ID);
    assert!(state.calls.iter().all(|(func, _)| *func != LOAD_BY_NAME_ADDR));
}

#[test]
fn needed_libraries_load_in_reverse_of_file_order() {
    let mut target = FakeTarget::remote();
    for (name, base) in [("libAaa", 0x7400_0000u64), ("libBbb", 0x7500_0000u64)] {
        target.libs_by_name.insert(
            name.to_string(),
            LibraryInfo { image_base: base, metadata_addr: base + 0x1000 },
        );
    }

    ElfLoader::new(&target, three_library_fixture()).unwrap().launch().unwrap();

    // the packed name table begins with the last entry in file order
    let table = target.write_at(DATA_TABLE_ADDR).unwrap();
    assert_eq!(table, b"libBbb\0libAaa\0\0");

    let state = target.state.borrow();
    let by_name: Vec<u64> = state
        .calls
        .iter()
        .filter(|(func, _)| *func == LOAD_BY_NAME_ADDR)
        .map(|(_, args)| args[0])
        .collect();
    assert_eq!(by_name, vec![DATA_TABLE_ADDR, DATA_TABLE_ADDR + 7]);
}

#[test]
fn string_table_without_declared_size_is_rejected() {
    let mut elf = build_fixture();
    // the size entry becomes an ignored relocation-count tag
    put_dyn(&mut elf, 8, 0x6FFF_FFF9, 0);

    let target = FakeTarget::remote();
    let result = ElfLoader::new(&target, elf).unwrap().launch();
    assert_eq!(result, Err(LoadError::NoStringTableSize));
}

#[test]
fn relocations_are_applied_to_the_copied_data_segment() {
    let target = FakeTarget::remote();
    ElfLoader::new(&target, build_fixture()).unwrap().launch().unwrap();

    let data = target.write_at(BASE + (DATA_VADDR - TEXT_VADDR)).unwrap();
    assert_eq!(data.len(), 0x700);
    let slot = |off: usize| u64::from_le_bytes(data[off..off + 8].try_into().unwrap());

    // RELATIVE: image base plus the text-relative addend
    assert_eq!(slot(0xC0), BASE + 0x1234 - TEXT_VADDR);
    // direct 64-bit: resolved symbol plus addend
    assert_eq!(slot(0xC8), SOME_FUNC_ADDR + 0x10);
    // absent weak GLOB_DAT: untouched
    assert_eq!(slot(0xD0), 0);
    // jump slot: resolved symbol
    assert_eq!(slot(0xD8), PLT_FUNC_ADDR);
}

#[test]
fn remote_launch_builds_rw_channel_and_parameter_block() {
    let target = FakeTarget::remote();
    ElfLoader::new(&target, build_fixture()).unwrap().launch().unwrap();

    let state = target.state.borrow();
    assert_eq!(state.sockets, vec![(28, 2, 17), (28, 2, 17)]);
    assert_eq!(state.established, vec![[10, 11, 12, 13]]);

    // master socket options carry the tclass option chain
    let (fd, level, name, value) = &state.setsockopts[0];
    assert_eq!((*fd, *level, *name), (10, 41, 25));
    assert_eq!(value.len(), 24);
    assert_eq!(u32::from_le_bytes(value[0..4].try_into().unwrap()), 20);
    assert_eq!(u32::from_le_bytes(value[8..12].try_into().unwrap()), 61);
    let (fd, level, name, value) = &state.setsockopts[1];
    assert_eq!((*fd, *level, *name), (11, 41, 46));
    assert_eq!(value, &vec![0u8; 20]);

    // descriptor quad and parameter block pushed onto the target stack
    let files_addr = INITIAL_RSP - 16;
    let args_addr = files_addr - 52;
    drop(state);
    let files = target.write_at(files_addr).unwrap();
    assert_eq!(files.len(), 16);
    assert_eq!(i32::from_le_bytes(files[0..4].try_into().unwrap()), 10);
    assert_eq!(i32::from_le_bytes(files[12..16].try_into().unwrap()), 13);

    let args = target.write_at(args_addr).unwrap();
    assert_eq!(args.len(), 48);
    let field = |i: usize| u64::from_le_bytes(args[i * 8..i * 8 + 8].try_into().unwrap());
    assert_eq!(field(0), DLSYM_ADDR);
    assert_eq!(field(1), files_addr + 8); // pipe pair
    assert_eq!(field(2), files_addr); // socket pair
    assert_eq!(field(3), KPIPE_ADDR);
    assert_eq!(field(4), KDATA_BASE);
    assert_eq!(field(5), args_addr + 48); // status slot

    // entry point and argument land in the saved registers
    let state = target.state.borrow();
    assert_eq!(state.regs.rip, BASE);
    assert_eq!(state.regs.rdi, args_addr);
    assert_eq!(state.regs.rsp, (args_addr & !0xF) - 8);
    // no direct entry call in remote mode
    assert!(state.entry_calls.is_empty());
}

#[test]
fn segment_contents_are_copied_into_both_mappings() {
    let target = FakeTarget::remote();
    ElfLoader::new(&target, build_fixture()).unwrap().launch().unwrap();

    let text = target.write_at(BASE).unwrap();
    assert_eq!(text.len(), 0x100);
    let data = target.write_at(BASE + (DATA_VADDR - TEXT_VADDR)).unwrap();
    assert_eq!(data.len(), 0x700);
}

#[test]
fn unresolved_strong_symbol_is_fatal() {
    let mut target = FakeTarget::remote();
    target.symbols.remove(&(LIBKERNEL_BASE, "some_func".to_string()));

    let result = ElfLoader::new(&target, build_fixture()).unwrap().launch();
    assert_eq!(result, Err(LoadError::UnresolvedSymbol("some_func".to_string())));
}

#[test]
fn unknown_relocation_kind_is_fatal() {
    let mut elf = build_fixture();
    // rewrite the RELATIVE entry as an unsupported PC32
    put_rela(&mut elf, 0x2200, 0, 0x2080, (1 << 32) | 2, 0);

    let target = FakeTarget::remote();
    let result = ElfLoader::new(&target, elf).unwrap().launch();
    assert_eq!(
        result,
        Err(LoadError::UnsupportedRelocation { kind: 2, symbol: "some_func".to_string() })
    );
}

#[test]
fn library_without_so_suffix_is_rejected() {
    let mut elf = build_fixture();
    // repoint the first needed entry at the bare "some_func" string
    put_dyn(&mut elf, 0, DT_NEEDED, 35);

    let target = FakeTarget::remote();
    let result = ElfLoader::new(&target, elf).unwrap().launch();
    assert_eq!(result, Err(LoadError::UnexpectedLibrary("some_func".to_string())));
}

#[test]
fn copy_retries_then_succeeds() {
    let target = FakeTarget::remote();
    target.fail_writes_at(BASE, 3);

    ElfLoader::new(&target, build_fixture()).unwrap().launch().unwrap();
    assert_eq!(target.write_at(BASE).unwrap().len(), 0x100);
}

#[test]
fn copy_gives_up_after_retry_budget() {
    let target = FakeTarget::remote();
    target.fail_writes_at(BASE, 100);

    let result = ElfLoader::new(&target, build_fixture()).unwrap().launch();
    assert_eq!(result, Err(LoadError::CopyFailed { vaddr: BASE }));
}

#[test]
fn in_process_launch_calls_entry_and_releases_mappings() {
    let target = FakeTarget::in_process();
    ElfLoader::new(&target, build_fixture()).unwrap().launch().unwrap();

    let state = target.state.borrow();
    // libraries go through the local module loader
    assert_eq!(state.local_modules, vec![ModuleRef::Id(USER_SERVICE_ID as u32)]);
    // no remote channel plumbing
    assert!(state.sockets.is_empty());
    assert!(state.established.is_empty());

    assert_eq!(state.entry_calls.len(), 1);
    let (entry, args) = state.entry_calls[0];
    assert_eq!(entry, BASE);
    assert_ne!(args, 0);

    // reservation release plus one release per recorded region
    assert_eq!(
        state.munmaps,
        vec![
            (BASE, 2 * PAGE_SIZE),
            (BASE, PAGE_SIZE),
            (BASE + (DATA_VADDR - TEXT_VADDR), PAGE_SIZE),
        ]
    );
    assert_eq!(state.closed, vec![JIT_FD]);
}

#[test]
fn in_process_payload_failure_still_releases_mappings() {
    let target = FakeTarget::in_process();
    target.state.borrow_mut().entry_status = 3;

    let result = ElfLoader::new(&target, build_fixture()).unwrap().launch();
    assert_eq!(result, Err(LoadError::PayloadFailed(3)));

    let state = target.state.borrow();
    assert_eq!(state.munmaps.len(), 3);
    assert_eq!(state.closed, vec![JIT_FD]);
}
