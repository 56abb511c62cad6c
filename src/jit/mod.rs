//! In-process JIT code manager (C6).
//!
//! ```text
//!   +-------------------------------------------------------------+
//!   |                      JIT memory region                      |
//!   |  [ block 0 ][ block 1 ][ block 2 ] ... brk --------> (grows) |
//!   +-------------------------------------------------------------+
//!        ^ each block: W^X-flipped in one mprotect, appended to
//!          single-threaded by whichever guest thread is building a
//!          path through it right now
//! ```
//!
//! A `JitBlock` is a span of host memory threaded code is appended to
//! while the block is `Leased` to one thread, then mprotect'd PROT_EXEC and
//! published read-only once `commit()` runs. Blocks recycle through
//! `Free -> Leased -> Finishing -> Committed -> Free` exactly as blink's
//! `g_jit.freeblocks` list does, except ownership is tracked with an enum
//! instead of an intrusive linked list, since Rust doesn't let us get away
//! with the C version's raw pointer games without much more unsafe.
//!
//! Guest-address -> host-code bindings ("hooks") are published either
//! immediately (`CanJitForImmediateEffect`, i.e. the platform allows
//! writable-and-executable pages so a freshly appended jump is live the
//! instant it's written) or staged and flushed at the next `commit()`,
//! matching blink's `SetJitHook`/`FixupJitJumps` split.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use thiserror::Error;

pub mod codegen_x86_64;

/// Proximity budget: a call-site can only be patched to a direct call/jump
/// if the target is within +/-2GiB (x86-64) or +/-128MiB (aarch64) of it.
/// Matches blink's `kJitProximity`.
#[cfg(target_arch = "x86_64")]
pub const JIT_PROXIMITY: i64 = 0x7fff_ffff;
#[cfg(target_arch = "aarch64")]
pub const JIT_PROXIMITY: i64 = 0x7ff_ffff;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const JIT_PROXIMITY: i64 = 0;

/// Slack subtracted from `JIT_PROXIMITY` before disabling the JIT outright,
/// so blocks allocated right at the edge of the addressable window still
/// have room to grow. Matches blink's `kJitLeeway`.
pub const JIT_LEEWAY: u64 = 0x1000_0000;
pub const JIT_MIN_BLOCK_SIZE: usize = 65536;
pub const JIT_ALIGN: usize = 16;
/// Minimum free space an append must fit in before the block is
/// considered full and a new one is acquired; matches blink's `kJitFit`,
/// sized for the longest single threaded call sequence we ever emit.
pub const JIT_FIT: usize = 800;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("decode failed at {rip:#x}: {reason}")]
    Decode { rip: u64, reason: String },
    #[error("unsupported instruction at {rip:#x}")]
    Unsupported { rip: u64 },
    #[error("no host memory within jit proximity of the guest image; jit disabled")]
    OutOfProximity,
    #[error("host mmap/mprotect for jit block failed: {0}")]
    Host(#[from] std::io::Error),
    #[error("jit code cache is full")]
    CacheFull,
}

pub type JitResult<T> = Result<T, JitError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Leased,
    Finishing,
    Committed,
}

/// One contiguous span of JIT memory. `index` is the append cursor;
/// `committed` is the watermark up to which bytes have been flipped to
/// PROT_EXEC and are safe to jump into concurrently from other threads.
pub struct JitBlock {
    pub addr: u64,
    pub size: usize,
    pub index: usize,
    pub committed: usize,
    pub state: BlockState,
    /// Byte offsets of not-yet-published call sites needing a later
    /// `fixup_jumps` pass once their target block commits.
    pub pending_jumps: Vec<PendingJump>,
}

#[derive(Debug, Clone, Copy)]
pub struct PendingJump {
    pub site_offset: usize,
    pub target_guest_pc: u64,
}

impl JitBlock {
    fn new(addr: u64, size: usize) -> Self {
        JitBlock { addr, size, index: 0, committed: 0, state: BlockState::Free, pending_jumps: Vec::new() }
    }

    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.index)
    }

    pub fn host_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Appends `bytes` at the current index, returning the offset they
    /// were written at. The caller is responsible for checking
    /// `remaining() >= bytes.len()` first (mirrors blink's `AppendJit`,
    /// which the stage-building helpers in `path.rs` call many times per
    /// guest instruction without a growth check on each one).
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let off = self.index;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), (self.addr as *mut u8).add(off), bytes.len());
        }
        self.index += bytes.len();
        off
    }
}

unsafe impl Send for JitBlock {}
unsafe impl Sync for JitBlock {}

/// Published guest-PC -> host-code-address bindings. A hook is a single
/// `AtomicU64` per guest page-aligned call site table entry so readers
/// (the dispatch loop) never need to take a lock to look one up.
pub struct HookTable {
    hooks: RwLock<HashMap<u64, AtomicU64>>,
}

impl Default for HookTable {
    fn default() -> Self {
        HookTable { hooks: RwLock::new(HashMap::new()) }
    }
}

impl HookTable {
    pub fn get(&self, guest_pc: u64) -> Option<u64> {
        let map = self.hooks.read().unwrap();
        map.get(&guest_pc).map(|a| a.load(Ordering::Acquire)).filter(|&v| v != 0)
    }

    /// Publishes or overwrites a hook with release ordering so that any
    /// thread observing the new host address also observes every byte the
    /// JIT wrote into the block before this call.
    pub fn set(&self, guest_pc: u64, host_addr: u64) {
        let map = self.hooks.read().unwrap();
        if let Some(a) = map.get(&guest_pc) {
            a.store(host_addr, Ordering::Release);
            return;
        }
        drop(map);
        let mut map = self.hooks.write().unwrap();
        map.entry(guest_pc).or_insert_with(|| AtomicU64::new(0)).store(host_addr, Ordering::Release);
    }

    pub fn invalidate(&self, guest_pc: u64) {
        if let Some(a) = self.hooks.read().unwrap().get(&guest_pc) {
            a.store(0, Ordering::Release);
        }
    }

    pub fn invalidate_range(&self, lo: u64, hi: u64) {
        let map = self.hooks.read().unwrap();
        for (&pc, a) in map.iter() {
            if pc >= lo && pc < hi {
                a.store(0, Ordering::Release);
            }
        }
    }
}

#[derive(Default)]
pub struct JitStats {
    pub blocks_allocated: AtomicUsize,
    pub blocks_recycled: AtomicUsize,
    pub bytes_appended: AtomicUsize,
    pub commits: AtomicUsize,
    pub jumps_recorded: AtomicUsize,
    pub jumps_fixed_up: AtomicUsize,
    pub disabled: std::sync::atomic::AtomicBool,
}

/// Top-level JIT manager, one per `System`, shared by every guest thread.
/// Owns the block free-list and the bump allocation cursor (`brk`) blocks
/// are carved from, and the published hook table paths install into.
pub struct Jit {
    state: Mutex<JitInner>,
    pub hooks: HookTable,
    pub stats: JitStats,
    image_end: u64,
}

struct JitInner {
    blocks: Vec<JitBlock>,
    free_list: Vec<usize>,
    brk: u64,
    /// Size new blocks are mapped at. Starts at `JIT_MIN_BLOCK_SIZE` and
    /// grows (see `note_overflow`) whenever a path abandons mid-build
    /// having already filled more than half the block it was leased, so
    /// later attempts at the same function don't loop forever retrying
    /// the same too-small size.
    block_size: usize,
}

impl Jit {
    pub fn new(image_end: u64) -> Self {
        Jit {
            state: Mutex::new(JitInner {
                blocks: Vec::new(),
                free_list: Vec::new(),
                brk: round_up(image_end, JIT_MIN_BLOCK_SIZE as u64),
                block_size: JIT_MIN_BLOCK_SIZE,
            }),
            hooks: HookTable::default(),
            stats: JitStats::default(),
            image_end,
        }
    }

    pub fn block_size(&self) -> usize {
        self.state.lock().unwrap().block_size
    }

    /// Called when a path abandons because it ran out of room in its
    /// leased block. If the path had already written more than half the
    /// block before overflowing, grows `block_size` by 50% so the next
    /// lease (and every one after, until blocks are big enough) has room
    /// to finish. Matches spec's "increases the block-size attribute so
    /// next attempts do not loop forever".
    pub fn note_overflow(&self, used_bytes: usize) {
        let mut inner = self.state.lock().unwrap();
        if used_bytes * 2 > inner.block_size {
            let grown = inner.block_size + inner.block_size / 2;
            log::debug!("[jit] block overflow after {used_bytes} bytes, growing block_size {} -> {grown}", inner.block_size);
            inner.block_size = grown;
        }
    }

    pub fn image_end(&self) -> u64 {
        self.image_end
    }

    pub fn blocks_allocated(&self) -> u64 {
        self.stats.blocks_allocated.load(Ordering::Relaxed) as u64
    }

    pub fn is_disabled(&self) -> bool {
        self.stats.disabled.load(Ordering::Relaxed)
    }

    fn disable(&self) {
        self.stats.disabled.store(true, Ordering::Relaxed);
        log::warn!("[jit] disabling threader: no host memory left within proximity of guest image");
    }

    /// Acquires a block with at least `JIT_FIT` bytes free, reusing a
    /// freed block if one fits or mapping a fresh one otherwise. Mirrors
    /// blink's `StartJit`.
    pub fn start(&self) -> JitResult<usize> {
        if self.is_disabled() {
            return Err(JitError::OutOfProximity);
        }
        let mut inner = self.state.lock().unwrap();
        if let Some(&idx) = inner.free_list.iter().find(|&&i| inner.blocks[i].remaining() >= JIT_FIT) {
            inner.free_list.retain(|&i| i != idx);
            inner.blocks[idx].state = BlockState::Leased;
            return Ok(idx);
        }

        let size = inner.block_size;
        let addr = inner.brk;
        if (addr as i64 - self.image_end as i64).unsigned_abs() as u64 > (JIT_PROXIMITY as u64).saturating_sub(JIT_LEEWAY) {
            drop(inner);
            self.disable();
            return Err(JitError::OutOfProximity);
        }
        let mapped = map_jit_block(addr, size)?;
        inner.brk = mapped + size as u64;
        let mut block = JitBlock::new(mapped, size);
        block.state = BlockState::Leased;
        inner.blocks.push(block);
        self.stats.blocks_allocated.fetch_add(1, Ordering::Relaxed);
        Ok(inner.blocks.len() - 1)
    }

    pub fn with_block<R>(&self, idx: usize, f: impl FnOnce(&mut JitBlock) -> R) -> R {
        let mut inner = self.state.lock().unwrap();
        f(&mut inner.blocks[idx])
    }

    /// Flips the block's appended-but-uncommitted bytes to PROT_EXEC and
    /// publishes any pending hooks whose host address now sits entirely
    /// inside the newly executable range. Mirrors blink's `CommitJit_`.
    pub fn commit(&self, idx: usize) -> JitResult<()> {
        let mut inner = self.state.lock().unwrap();
        let (addr, to_commit, index, pending) = {
            let b = &inner.blocks[idx];
            (b.addr, b.index.saturating_sub(b.committed), b.index, b.pending_jumps.clone())
        };
        if to_commit > 0 {
            let page_start = inner.blocks[idx].committed & !(memory_page_mask());
            let len = index - page_start;
            protect_exec(addr + page_start as u64, round_up(len as u64, page_size()) as usize)?;
            inner.blocks[idx].committed = index;
        }
        inner.blocks[idx].state = BlockState::Committed;
        inner.free_list.push(idx);
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        drop(inner);

        for pj in pending {
            self.hooks.set(pj.target_guest_pc, addr + pj.site_offset as u64);
            self.stats.jumps_fixed_up.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Returns a block to the free list without committing its pending
    /// bytes as executable; used when path building is abandoned partway
    /// through (e.g. an unsupported opcode was hit). Matches
    /// `AbandonJit`/`RelinquishJitBlock`.
    pub fn abandon(&self, idx: usize) {
        let mut inner = self.state.lock().unwrap();
        inner.blocks[idx].state = BlockState::Free;
        inner.blocks[idx].pending_jumps.clear();
        inner.free_list.insert(0, idx);
    }

    pub fn record_pending_jump(&self, idx: usize, site_offset: usize, target_guest_pc: u64) {
        let mut inner = self.state.lock().unwrap();
        inner.blocks[idx].pending_jumps.push(PendingJump { site_offset, target_guest_pc });
        self.stats.jumps_recorded.fetch_add(1, Ordering::Relaxed);
    }
}

fn round_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

fn page_size() -> u64 {
    4096
}

fn memory_page_mask() -> usize {
    4095
}

fn map_jit_block(hint: u64, size: usize) -> JitResult<u64> {
    unsafe {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let p = libc::mmap(hint as *mut libc::c_void, size, prot, flags, -1, 0);
        if p == libc::MAP_FAILED {
            return Err(JitError::Host(std::io::Error::last_os_error()));
        }
        Ok(p as u64)
    }
}

fn protect_exec(addr: u64, len: usize) -> JitResult<()> {
    unsafe {
        let rc = libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC);
        if rc != 0 {
            return Err(JitError::Host(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}
