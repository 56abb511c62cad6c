//! Minimal ELF64 loader: maps a static or PIE x86-64 binary's `PT_LOAD`
//! segments into a fresh `AddressSpace`, builds the initial guest stack
//! (`argv`/`envp`/a minimal auxiliary vector), and returns the entry point
//! `Machine::new` should start at. Symbol resolution and dynamic linking
//! are out of scope.

use thiserror::Error;

use crate::memory::{AddressSpace, MemoryError, PteFlags, PAGE_MASK, PAGE_SIZE};

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("not a 64-bit little-endian x86-64 ELF")]
    BadMagic,
    #[error("truncated ELF: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("failed to map segment: {0}")]
    Memory(#[from] MemoryError),
}

const EI_CLASS_64: u8 = 2;
const EI_DATA_LSB: u8 = 1;
const EM_X86_64: u16 = 62;
const ET_DYN: u16 = 3;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;

/// Guest address PIE images are biased to. Static `ET_EXEC` images load at
/// their file-specified addresses unbiased, matching how a non-PIE binary
/// actually runs on Linux.
const PIE_BASE: u64 = 0x0000_5555_5555_0000;

const STACK_TOP: u64 = 0x0000_7fff_ffff_f000;
const STACK_SIZE: u64 = 256 * PAGE_SIZE;

struct Segment {
    vaddr: u64,
    offset: u64,
    filesz: u64,
    memsz: u64,
    flags: u32,
}

pub struct LoadedImage {
    data: Vec<u8>,
    entry: u64,
    segments: Vec<Segment>,
    is_pie: bool,
}

impl LoadedImage {
    pub fn entry_hint(&self) -> u64 {
        if self.is_pie {
            self.entry + PIE_BASE
        } else {
            self.entry
        }
    }

    /// Lowest and one-past-highest guest address this image's `PT_LOAD`
    /// segments occupy once biased, used to seed `System`'s reserved
    /// address range and the JIT's bump-allocation cursor so compiled
    /// blocks never land on top of guest code or data.
    pub fn address_range(&self) -> (u64, u64) {
        let bias = if self.is_pie { PIE_BASE } else { 0 };
        let mut lo = u64::MAX;
        let mut hi = 0u64;
        for seg in &self.segments {
            lo = lo.min(seg.vaddr + bias);
            hi = hi.max(seg.vaddr + bias + seg.memsz);
        }
        if self.segments.is_empty() {
            (bias, bias)
        } else {
            (lo, hi)
        }
    }
}

pub struct EntryPoint {
    pub entry: u64,
    pub stack_top: u64,
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(b[off..off + 2].try_into().unwrap())
}
fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}
fn u64_at(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

pub fn load_file(path: &str) -> Result<LoadedImage, ElfError> {
    let data = std::fs::read(path).map_err(|source| ElfError::Read { path: path.to_string(), source })?;
    parse(data)
}

fn parse(data: Vec<u8>) -> Result<LoadedImage, ElfError> {
    if data.len() < 64 {
        return Err(ElfError::Truncated { expected: 64, got: data.len() });
    }
    if &data[0..4] != b"\x7fELF" || data[4] != EI_CLASS_64 || data[5] != EI_DATA_LSB {
        return Err(ElfError::BadMagic);
    }
    let e_type = u16_at(&data, 16);
    let e_machine = u16_at(&data, 18);
    if e_machine != EM_X86_64 {
        return Err(ElfError::BadMagic);
    }
    let e_entry = u64_at(&data, 24);
    let e_phoff = u64_at(&data, 32) as usize;
    let e_phentsize = u16_at(&data, 54) as usize;
    let e_phnum = u16_at(&data, 56) as usize;

    let needed = e_phoff + e_phentsize * e_phnum;
    if data.len() < needed {
        return Err(ElfError::Truncated { expected: needed, got: data.len() });
    }

    let mut segments = Vec::new();
    for i in 0..e_phnum {
        let ph = &data[e_phoff + i * e_phentsize..];
        let p_type = u32_at(ph, 0);
        if p_type != PT_LOAD {
            continue;
        }
        let p_flags = u32_at(ph, 4);
        let p_offset = u64_at(ph, 8);
        let p_vaddr = u64_at(ph, 16);
        let p_filesz = u64_at(ph, 32);
        let p_memsz = u64_at(ph, 40);
        segments.push(Segment { vaddr: p_vaddr, offset: p_offset, filesz: p_filesz, memsz: p_memsz, flags: p_flags });
    }

    Ok(LoadedImage { data, entry: e_entry, segments, is_pie: e_type == ET_DYN })
}

fn segment_pte_flags(p_flags: u32) -> PteFlags {
    let mut f = PteFlags::USER;
    if p_flags & PF_W != 0 {
        f |= PteFlags::WRITABLE;
    }
    if p_flags & PF_X != 0 {
        f |= PteFlags::HOST_EXEC;
    }
    f
}

/// Maps every `PT_LOAD` segment, builds the initial stack, and returns
/// where the just-spawned `Machine` should set `ip` and `rsp`.
pub fn install(mem: &AddressSpace, image: &LoadedImage, argv: &[String], envp: &[String]) -> Result<EntryPoint, ElfError> {
    let bias = if image.is_pie { PIE_BASE } else { 0 };

    for seg in &image.segments {
        let vaddr = seg.vaddr + bias;
        let page_start = vaddr & !PAGE_MASK;
        let page_end = (vaddr + seg.memsz + PAGE_MASK) & !PAGE_MASK;
        let count = (page_end - page_start) / PAGE_SIZE;
        mem.commit(page_start, count, segment_pte_flags(seg.flags))?;
        let file_bytes = &image.data[seg.offset as usize..(seg.offset + seg.filesz) as usize];
        if !file_bytes.is_empty() {
            mem.write_bytes(vaddr, file_bytes)?;
        }
    }

    let stack_pages = STACK_SIZE / PAGE_SIZE;
    mem.commit(STACK_TOP - STACK_SIZE, stack_pages, PteFlags::WRITABLE)?;

    let mut cursor = STACK_TOP;
    let mut write_str = |mem: &AddressSpace, cursor: &mut u64, s: &str| -> Result<u64, ElfError> {
        *cursor -= s.len() as u64 + 1;
        mem.write_bytes(*cursor, s.as_bytes())?;
        mem.write_bytes(*cursor + s.len() as u64, &[0])?;
        Ok(*cursor)
    };

    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for s in argv {
        argv_ptrs.push(write_str(mem, &mut cursor, s)?);
    }
    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for s in envp {
        envp_ptrs.push(write_str(mem, &mut cursor, s)?);
    }

    let mut words: Vec<u64> = Vec::new();
    words.push(argv.len() as u64);
    words.extend(argv_ptrs.iter().copied());
    words.push(0);
    words.extend(envp_ptrs.iter().copied());
    words.push(0);
    // Minimal auxiliary vector: AT_NULL only. A real libc start-up sequence
    // wants AT_PAGESZ / AT_ENTRY / AT_RANDOM too; static-binary guests that
    // only use clib's syscall wrappers (this emulator's primary target,
    // given dynamic linking is out of scope) don't depend on it.
    words.push(0);
    words.push(0);

    cursor -= (words.len() * 8) as u64;
    cursor &= !0xf;
    for (i, w) in words.iter().enumerate() {
        mem.write_bytes(cursor + (i * 8) as u64, &w.to_le_bytes())?;
    }

    Ok(EntryPoint { entry: image.entry_hint(), stack_top: cursor })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_elf(entry: u64, code: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 64 + 56];
        data[0..4].copy_from_slice(b"\x7fELF");
        data[4] = EI_CLASS_64;
        data[5] = EI_DATA_LSB;
        data[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        data[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        data[24..32].copy_from_slice(&entry.to_le_bytes());
        data[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        data[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        data[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        let ph = &mut data[64..64 + 56];
        ph[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        ph[4..8].copy_from_slice(&(PF_X | 4).to_le_bytes());
        ph[8..16].copy_from_slice(&0u64.to_le_bytes()); // p_offset
        ph[16..24].copy_from_slice(&entry.to_le_bytes()); // p_vaddr == entry for this fixture
        ph[32..40].copy_from_slice(&(code.len() as u64).to_le_bytes());
        ph[40..48].copy_from_slice(&(code.len() as u64).to_le_bytes());

        data.extend_from_slice(code);
        data
    }

    #[test]
    fn parses_static_executable_and_locates_entry() {
        let data = minimal_elf(0x40_0000, &[0xc3]);
        let image = parse(data).unwrap();
        assert!(!image.is_pie);
        assert_eq!(image.entry_hint(), 0x40_0000);
        assert_eq!(image.segments.len(), 1);
    }

    #[test]
    fn install_maps_segment_and_builds_argv_on_stack() {
        let data = minimal_elf(0x40_0000, &[0xc3]);
        let image = parse(data).unwrap();
        let mem = AddressSpace::new(0x10_0000);
        let entry = install(&mem, &image, &["prog".to_string()], &[]).unwrap();
        assert_eq!(entry.entry, 0x40_0000);
        let code = mem.read_slice(0x40_0000, 1).unwrap();
        assert_eq!(code, vec![0xc3]);
        let argc_bytes = mem.read_slice(entry.stack_top, 8).unwrap();
        assert_eq!(u64::from_le_bytes(argc_bytes.try_into().unwrap()), 1);
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(parse(vec![0u8; 64]), Err(ElfError::BadMagic)));
    }
}
