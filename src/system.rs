//! File descriptor table and signal disposition table (C9 resource
//! bookkeeping owned by `System`), grounded in `machine.h`'s `System::fds`
//! and `System::hands[32]`.

use std::collections::HashMap;
use std::os::fd::RawFd;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        const CLOEXEC = 1;
    }
}

pub struct FdEntry {
    pub host_fd: RawFd,
    pub flags: FdFlags,
}

/// Guest fd -> host fd mapping. Guest fd numbers are assigned densely
/// starting at 3 (0/1/2 are inherited stdio, wired through 1:1 at
/// process start); this emulator does not renumber host fds, so a guest
/// fd and its host fd coincide unless the guest explicitly `dup2`s onto a
/// number a host fd doesn't already occupy.
pub struct FdTable {
    entries: HashMap<i32, FdEntry>,
    next: i32,
}

impl FdTable {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(0, FdEntry { host_fd: 0, flags: FdFlags::empty() });
        entries.insert(1, FdEntry { host_fd: 1, flags: FdFlags::empty() });
        entries.insert(2, FdEntry { host_fd: 2, flags: FdFlags::empty() });
        FdTable { entries, next: 3 }
    }

    pub fn insert(&mut self, host_fd: RawFd, flags: FdFlags) -> i32 {
        let guest_fd = self.next;
        self.next += 1;
        self.entries.insert(guest_fd, FdEntry { host_fd, flags });
        guest_fd
    }

    pub fn get(&self, guest_fd: i32) -> Option<&FdEntry> {
        self.entries.get(&guest_fd)
    }

    pub fn close(&mut self, guest_fd: i32) -> Option<FdEntry> {
        self.entries.remove(&guest_fd)
    }

    pub fn dup2(&mut self, old: i32, new: i32) -> Option<()> {
        let host_fd = self.entries.get(&old)?.host_fd;
        self.entries.insert(new, FdEntry { host_fd, flags: FdFlags::empty() });
        if new >= self.next {
            self.next = new + 1;
        }
        Some(())
    }

    /// Closes every fd flagged `CLOEXEC`, called by `execve` before handing
    /// control to the new image per the fd-table half of its contract.
    pub fn close_cloexec(&mut self) {
        let doomed: Vec<i32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.flags.contains(FdFlags::CLOEXEC))
            .map(|(&fd, _)| fd)
            .collect();
        for fd in doomed {
            if let Some(entry) = self.entries.remove(&fd) {
                if entry.host_fd > 2 {
                    unsafe { libc::close(entry.host_fd) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_preinstalled_and_new_fds_allocate_upward() {
        let mut t = FdTable::new();
        assert_eq!(t.get(1).unwrap().host_fd, 1);
        let fd = t.insert(99, FdFlags::empty());
        assert_eq!(fd, 3);
        assert_eq!(t.get(3).unwrap().host_fd, 99);
    }

    #[test]
    fn close_removes_entry() {
        let mut t = FdTable::new();
        let fd = t.insert(50, FdFlags::empty());
        assert!(t.close(fd).is_some());
        assert!(t.get(fd).is_none());
    }
}
