//! Sparse paged memory: 4 KiB pages over a 32-bit address space, with
//! per-page READ/WRITE permission bits and a hot-page cache.
//!
//! Grounded on `INT_Memory` (`tsrkit_pvm/interpreter/memory.py`): permission
//! bits live in two fixed-size bitsets sized to the whole address space so a
//! permission check never allocates, while backing bytes are a sparse map
//! populated lazily on first write.

use std::collections::HashMap;

use crate::consts::{ARGS_ZONE_SIZE, PAGE_COUNT, PAGE_SIZE, ZONE_SIZE, zone_round};
use crate::error::TerminationStatus;

/// Access mode requested of a memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Target permission state for `alter_accessibility`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    None,
    Read,
    Write,
}

fn page_of(addr: u32) -> usize {
    (addr / PAGE_SIZE) as usize
}

/// The paged guest memory. Cheap to construct empty; grows its sparse page
/// map only on writes.
pub struct Memory {
    pub(crate) read_allowed: Vec<bool>,
    pub(crate) write_allowed: Vec<bool>,
    pub(crate) pages: HashMap<usize, Box<[u8; PAGE_SIZE as usize]>>,
    /// First free address above the writable data segment; advanced by `sbrk`.
    pub heap_break: u32,
    hot_page: Option<HotPage>,
}

struct HotPage {
    number: usize,
    bytes: [u8; PAGE_SIZE as usize],
    writable: bool,
}

impl Memory {
    /// An empty address space: every page inaccessible, `heap_break = 0`.
    pub fn empty() -> Self {
        Self {
            read_allowed: vec![false; PAGE_COUNT],
            write_allowed: vec![false; PAGE_COUNT],
            pages: HashMap::new(),
            heap_break: 0,
            hot_page: None,
        }
    }

    /// Build the initial memory for a service invocation: read-only and
    /// read-write data segments, an args segment, and a stack, grounded on
    /// `INT_Memory.from_pc`.
    ///
    /// `read` is mapped READ-only at `ZONE_SIZE`; `write` is mapped
    /// READ+WRITE right after the zone-rounded read segment; `args` is
    /// mapped READ-only near the top of the address space; a stack of `s`
    /// bytes of READ+WRITE pages is mapped ending just below the args
    /// region.
    pub fn from_service_invocation(read: &[u8], write: &[u8], args: &[u8], stack_len: u32) -> Self {
        let mut memory = Self::empty();

        let read_start = ZONE_SIZE as u32;
        memory.map_bytes(read_start, read, Permission::Read);

        let write_start = (2 * ZONE_SIZE + zone_round(read.len() as u64)) as u32;
        memory.map_bytes(write_start, write, Permission::Write);

        let heap_start = write_start + zone_round(write.len() as u64) as u32;
        memory.heap_break = heap_start;

        let args_start = ((1u64 << 32) - ZONE_SIZE - ARGS_ZONE_SIZE) as u32;
        memory.map_bytes(args_start, args, Permission::Read);

        let stack_end = ((1u64 << 32) - 2 * ZONE_SIZE - ARGS_ZONE_SIZE) as u32;
        let stack_len_rounded = crate::consts::page_round(stack_len as u64) as u32;
        let stack_start = stack_end - stack_len_rounded;
        memory.alter_accessibility(stack_start, stack_len_rounded, Permission::Write);

        memory
    }

    fn map_bytes(&mut self, start: u32, data: &[u8], perm: Permission) {
        if data.is_empty() {
            return;
        }
        let len_rounded = crate::consts::zone_round(data.len() as u64) as u32;
        self.alter_accessibility(start, len_rounded, perm);
        self.write_raw(start, data);
    }

    /// Write bytes directly, bypassing permission checks — used only to seed
    /// the initial read-only/read-write segments during construction.
    fn write_raw(&mut self, addr: u32, data: &[u8]) {
        let mut offset = 0usize;
        while offset < data.len() {
            let cur = addr.wrapping_add(offset as u32);
            let page_no = page_of(cur);
            let page_off = (cur % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - page_off).min(data.len() - offset);
            let page = self
                .pages
                .entry(page_no)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
            page[page_off..page_off + n].copy_from_slice(&data[offset..offset + n]);
            offset += n;
        }
    }

    fn page_access(&self, page_no: usize, mode: Access) -> bool {
        if page_no >= PAGE_COUNT {
            return false;
        }
        match mode {
            // WRITE implies READ for access checks.
            Access::Read => self.read_allowed[page_no] || self.write_allowed[page_no],
            Access::Write => self.write_allowed[page_no],
        }
    }

    /// Pure query: would `read`/`write` of `len` bytes at `addr` succeed?
    pub fn is_accessible(&self, addr: u32, len: u32, mode: Access) -> bool {
        if len == 0 {
            return true;
        }
        let start_page = page_of(addr);
        let end_page = page_of(addr.wrapping_add(len - 1));
        if end_page < start_page {
            // wrapped past the top of the address space
            return false;
        }
        (start_page..=end_page).all(|p| self.page_access(p, mode))
    }

    /// Read `len` bytes, or fault with the first inaccessible address.
    ///
    /// A request that lands entirely within the cached hot page is served
    /// straight out of it, skipping both the permission scan and the page
    /// map lookup.
    pub fn read(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, TerminationStatus> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let start_page = page_of(addr);
        let end_page = page_of(addr.wrapping_add(len - 1));
        let single_page = start_page == end_page;
        if single_page {
            if let Some(hot) = &self.hot_page {
                if hot.number == start_page {
                    let page_off = (addr % PAGE_SIZE) as usize;
                    return Ok(hot.bytes[page_off..page_off + len as usize].to_vec());
                }
            }
        }
        if !self.is_accessible(addr, len, Access::Read) {
            return Err(TerminationStatus::PageFault(addr));
        }
        if single_page {
            let page_off = (addr % PAGE_SIZE) as usize;
            let bytes = self.pages.get(&start_page).map(|b| **b).unwrap_or([0u8; PAGE_SIZE as usize]);
            let out = bytes[page_off..page_off + len as usize].to_vec();
            self.hot_page = Some(HotPage {
                number: start_page,
                bytes,
                writable: self.write_allowed[start_page],
            });
            return Ok(out);
        }
        let mut out = Vec::with_capacity(len as usize);
        let mut offset = 0u32;
        while offset < len {
            let cur = addr.wrapping_add(offset);
            let page_no = page_of(cur);
            let page_off = (cur % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE - page_off as u32).min(len - offset);
            match self.pages.get(&page_no) {
                Some(page) => out.extend_from_slice(&page[page_off..page_off + n as usize]),
                None => out.extend(std::iter::repeat(0u8).take(n as usize)),
            }
            offset += n;
        }
        Ok(out)
    }

    /// Write `data`; every touched page must have WRITE or the whole access
    /// faults with no partial effect observable.
    ///
    /// A single-page write that hits the cached hot page and was last seen
    /// writable skips the permission scan entirely.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), TerminationStatus> {
        let len = data.len() as u32;
        if len == 0 {
            return Ok(());
        }
        let start_page = page_of(addr);
        let end_page = page_of(addr.wrapping_add(len - 1));
        let single_page = start_page == end_page;
        let hot_hit = single_page && self.hot_page.as_ref().is_some_and(|h| h.number == start_page && h.writable);
        if !hot_hit && !self.is_accessible(addr, len, Access::Write) {
            return Err(TerminationStatus::PageFault(addr));
        }
        self.write_raw(addr, data);
        if single_page {
            let bytes = *self.pages.get(&start_page).expect("just written");
            self.hot_page = Some(HotPage {
                number: start_page,
                bytes: *bytes,
                writable: true,
            });
        } else {
            self.hot_page = None;
        }
        Ok(())
    }

    /// Set both permission bits on every page touched by `[addr, addr+len)`.
    pub fn alter_accessibility(&mut self, addr: u32, len: u32, perm: Permission) {
        if len == 0 {
            return;
        }
        let start_page = page_of(addr);
        let end_page = page_of(addr.wrapping_add(len.saturating_sub(1)));
        for p in start_page..=end_page.min(PAGE_COUNT - 1) {
            let (r, w) = match perm {
                Permission::None => (false, false),
                Permission::Read => (true, false),
                Permission::Write => (true, true),
            };
            self.read_allowed[p] = r;
            self.write_allowed[p] = w;
        }
        self.hot_page = None;
    }

    /// Permission of a single page, for the recompiler's host-page mapping.
    pub(crate) fn page_permission(&self, page_no: usize) -> Permission {
        match (self.read_allowed.get(page_no).copied().unwrap_or(false), self.write_allowed.get(page_no).copied().unwrap_or(false)) {
            (_, true) => Permission::Write,
            (true, false) => Permission::Read,
            (false, false) => Permission::None,
        }
    }

    /// Backing bytes of a single page, if it has ever been written.
    pub(crate) fn page_bytes(&self, page_no: usize) -> Option<&[u8; PAGE_SIZE as usize]> {
        self.pages.get(&page_no).map(|b| b.as_ref())
    }

    /// Overwrite a page's backing bytes wholesale, bypassing permission
    /// checks — used to mirror a writable guest-window page back into the
    /// sparse model after native execution, not a guest-visible write.
    pub(crate) fn write_back_page(&mut self, page_no: usize, bytes: [u8; PAGE_SIZE as usize]) {
        self.pages.insert(page_no, Box::new(bytes));
        self.hot_page = None;
    }

    /// Clear page contents without altering permissions.
    pub fn zero_memory_range(&mut self, addr: u32, len: u32) {
        let start_page = page_of(addr);
        let end_page = page_of(addr.wrapping_add(len.saturating_sub(1)));
        for p in start_page..=end_page.min(PAGE_COUNT - 1) {
            self.pages.remove(&p);
        }
        self.hot_page = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_page_faults_on_read() {
        let mut mem = Memory::empty();
        assert_eq!(mem.read(0, 1), Err(TerminationStatus::PageFault(0)));
    }

    #[test]
    fn write_permission_implies_read() {
        let mut mem = Memory::empty();
        mem.alter_accessibility(0, PAGE_SIZE, Permission::Write);
        assert!(mem.is_accessible(0, 4, Access::Read));
        assert!(mem.is_accessible(0, 4, Access::Write));
    }

    #[test]
    fn read_only_page_faults_on_write() {
        let mut mem = Memory::empty();
        mem.alter_accessibility(0, PAGE_SIZE, Permission::Read);
        assert!(mem.write(0, &[1]).is_err());
    }

    #[test]
    fn unwritten_readable_page_reads_as_zero() {
        let mut mem = Memory::empty();
        mem.alter_accessibility(0, PAGE_SIZE, Permission::Read);
        assert_eq!(mem.read(10, 4).unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn multi_page_access_requires_every_touched_page() {
        let mut mem = Memory::empty();
        mem.alter_accessibility(0, PAGE_SIZE, Permission::Write);
        // second page left inaccessible
        let addr = PAGE_SIZE - 2;
        assert!(mem.write(addr, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut mem = Memory::empty();
        mem.alter_accessibility(0, PAGE_SIZE, Permission::Write);
        mem.write(100, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.read(100, 4).unwrap(), vec![1, 2, 3, 4]);
    }
}
