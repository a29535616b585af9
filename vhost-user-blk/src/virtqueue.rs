//! Split virtqueue engine (virtio 1.0 §2.4): parses the descriptor table,
//! avail ring, and used ring the driver laid out in guest memory, and walks
//! descriptor chains defensively — every field read here is guest-controlled.

use std::fmt;
use std::sync::atomic::{fence, Ordering};

use crate::memory::{self, MemoryMap};

pub const DESC_F_NEXT: u16 = 1;
pub const DESC_F_WRITE: u16 = 2;
pub const DESC_F_INDIRECT: u16 = 4;

const DESC_ENTRY_SIZE: u64 = 16;
const AVAIL_RING_HEADER: u64 = 4;
const AVAIL_RING_ELEM: u64 = 2;
const USED_RING_HEADER: u64 = 4;
const USED_RING_ELEM: u64 = 8;

pub const MAX_QUEUE_SIZE: u16 = 32768;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    BadQueueSize,
    BadAlignment,
    Memory(#[from] memory::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single scatter/gather buffer yielded by chain iteration.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    pub ptr: *mut u8,
    pub len: u32,
    pub ro: bool,
}

unsafe fn read_u16(ptr: *const u8, offset: u64) -> u16 {
    let p = ptr.add(offset as usize) as *const u16;
    u16::from_le(p.read_volatile())
}

unsafe fn read_u32(ptr: *const u8, offset: u64) -> u32 {
    let p = ptr.add(offset as usize) as *const u32;
    u32::from_le(p.read_volatile())
}

unsafe fn read_u64(ptr: *const u8, offset: u64) -> u64 {
    let p = ptr.add(offset as usize) as *const u64;
    u64::from_le(p.read_volatile())
}

unsafe fn write_u16(ptr: *mut u8, offset: u64, v: u16) {
    let p = ptr.add(offset as usize) as *mut u16;
    p.write_volatile(v.to_le());
}

unsafe fn write_u32(ptr: *mut u8, offset: u64, v: u32) {
    let p = ptr.add(offset as usize) as *mut u32;
    p.write_volatile(v.to_le());
}

#[derive(Debug, Clone, Copy)]
struct RawDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

unsafe fn read_desc(tbl: *const u8, idx: u16) -> RawDesc {
    let base = idx as u64 * DESC_ENTRY_SIZE;
    RawDesc {
        addr: read_u64(tbl, base),
        len: read_u32(tbl, base + 8),
        flags: read_u16(tbl, base + 12),
        next: read_u16(tbl, base + 14),
    }
}

fn avail_len(qsize: u16) -> u64 {
    AVAIL_RING_HEADER + qsize as u64 * AVAIL_RING_ELEM + 2
}

fn used_len(qsize: u16) -> u64 {
    USED_RING_HEADER + qsize as u64 * USED_RING_ELEM + 2
}

/// Device-side state of one split virtqueue.
pub struct VirtQueue {
    qsize: u16,
    desc_ptr: *mut u8,
    avail_ptr: *mut u8,
    used_ptr: *mut u8,
    last_seen_avail: u16,
    broken: bool,
}

impl Default for VirtQueue {
    fn default() -> Self {
        VirtQueue {
            qsize: 0,
            desc_ptr: std::ptr::null_mut(),
            avail_ptr: std::ptr::null_mut(),
            used_ptr: std::ptr::null_mut(),
            last_seen_avail: 0,
            broken: false,
        }
    }
}

impl VirtQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the three rings in `mem` and arms the queue. Re-resolves
    /// from scratch every time — nothing from a previous `start` survives.
    pub fn start(
        &mut self,
        qsize: u16,
        desc_gpa: u64,
        avail_gpa: u64,
        used_gpa: u64,
        avail_base: u16,
        mem: &MemoryMap,
    ) -> Result<(), Error> {
        if qsize == 0 || qsize > MAX_QUEUE_SIZE || !qsize.is_power_of_two() {
            return Err(Error::BadQueueSize);
        }
        if desc_gpa % 16 != 0 || avail_gpa % 2 != 0 || used_gpa % 4 != 0 {
            return Err(Error::BadAlignment);
        }

        let desc_ptr = mem.find_range(desc_gpa, qsize as u64 * DESC_ENTRY_SIZE, false)?;
        let avail_ptr = mem.find_range(avail_gpa, avail_len(qsize), false)?;
        let used_ptr = mem.find_range(used_gpa, used_len(qsize), true)?;

        self.qsize = qsize;
        self.desc_ptr = desc_ptr;
        self.avail_ptr = avail_ptr;
        self.used_ptr = used_ptr;
        self.last_seen_avail = avail_base;
        self.broken = false;
        Ok(())
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn qsize(&self) -> u16 {
        self.qsize
    }

    pub fn last_seen_avail(&self) -> u16 {
        self.last_seen_avail
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn avail_idx(&self) -> u16 {
        // SAFETY: avail_ptr was resolved through the memory map at `start`
        // and is valid for avail_len(qsize) bytes until the next `start`.
        let idx = unsafe { read_u16(self.avail_ptr, 2) };
        fence(Ordering::Acquire);
        idx
    }

    fn avail_ring_entry(&self, slot: u16) -> u16 {
        let offset = AVAIL_RING_HEADER + slot as u64 * AVAIL_RING_ELEM;
        unsafe { read_u16(self.avail_ptr, offset) }
    }

    /// Dequeues the next available descriptor chain, if the driver has
    /// published one and the queue is not broken.
    pub fn dequeue_avail(&mut self) -> Option<DescriptorChainIter<'_>> {
        if self.broken {
            return None;
        }
        if self.last_seen_avail == self.avail_idx() {
            return None;
        }
        let slot = self.last_seen_avail & (self.qsize - 1);
        let head = self.avail_ring_entry(slot);
        self.last_seen_avail = self.last_seen_avail.wrapping_add(1);

        Some(DescriptorChainIter {
            vq: self,
            head,
            cur: Some(head),
            tbl: self.desc_ptr,
            tbl_size: self.qsize,
            in_indirect: false,
            nseen: 0,
            broken_here: false,
        })
    }

    /// Publishes a used entry and advances `used.idx`.
    pub fn enqueue_used(&mut self, head_id: u16, nwritten: u32) {
        let slot = (self.used_idx_raw()) & (self.qsize - 1);
        let entry_offset = USED_RING_HEADER + slot as u64 * USED_RING_ELEM;
        unsafe {
            write_u32(self.used_ptr, entry_offset, head_id as u32);
            write_u32(self.used_ptr, entry_offset + 4, nwritten);
        }
        fence(Ordering::Release);
        let next_idx = self.used_idx_raw().wrapping_add(1);
        unsafe { write_u16(self.used_ptr, 2, next_idx) };
    }

    fn used_idx_raw(&self) -> u16 {
        unsafe { read_u16(self.used_ptr, 2) }
    }
}

/// Walking state for one descriptor chain: `Direct` walks `vq.desc`,
/// `Indirect` walks a table a descriptor pointed at.
enum ChainState {
    Direct,
    Indirect,
}

pub struct DescriptorChainIter<'q> {
    vq: &'q mut VirtQueue,
    head: u16,
    cur: Option<u16>,
    tbl: *const u8,
    tbl_size: u16,
    in_indirect: bool,
    nseen: u32,
    broken_here: bool,
}

impl<'q> DescriptorChainIter<'q> {
    pub fn head_id(&self) -> u16 {
        self.head
    }

    pub fn has_next_buffer(&self) -> bool {
        self.cur.is_some() && !self.vq.is_broken()
    }

    pub fn is_broken(&self) -> bool {
        self.vq.is_broken()
    }

    fn break_queue(&mut self) {
        self.vq.mark_broken();
        self.cur = None;
        self.broken_here = true;
    }

    fn state(&self) -> ChainState {
        if self.in_indirect {
            ChainState::Indirect
        } else {
            ChainState::Direct
        }
    }

    /// Advances the chain, yielding the next buffer or `None` once the
    /// chain ends (or breaks — check `is_broken` to distinguish).
    pub fn next_buffer(&mut self, mem: &MemoryMap) -> Option<Buffer> {
        loop {
            let idx = self.cur?;
            if self.vq.is_broken() {
                return None;
            }

            // SAFETY: `self.tbl` is either vq.desc_ptr (resolved at start)
            // or a table resolved via `mem.find_range` below; `idx` is
            // bounds-checked against `self.tbl_size` before every read.
            if idx >= self.tbl_size {
                self.break_queue();
                return None;
            }
            let d = unsafe { read_desc(self.tbl, idx) };

            if d.flags & DESC_F_INDIRECT != 0 {
                if matches!(self.state(), ChainState::Indirect) {
                    // 2.4.5.3.1: no nested indirect tables.
                    self.break_queue();
                    return None;
                }
                if d.flags & DESC_F_NEXT != 0 {
                    // 2.4.5.3.1: INDIRECT+NEXT forbidden on the referrer.
                    self.break_queue();
                    return None;
                }
                let entries = d.len as u64 / DESC_ENTRY_SIZE;
                if entries == 0 {
                    self.break_queue();
                    return None;
                }
                let tbl_ptr = match mem.find_range(d.addr, d.len as u64, false) {
                    Ok(p) => p,
                    Err(_) => {
                        self.break_queue();
                        return None;
                    }
                };
                self.in_indirect = true;
                self.tbl = tbl_ptr;
                self.tbl_size = entries.min(MAX_QUEUE_SIZE as u64) as u16;
                self.cur = Some(0);
                self.nseen += 1;
                continue;
            }

            self.nseen += 1;
            if self.nseen > self.vq.qsize() as u32 {
                // 2.4.5.3.1: loop / over-length detection.
                self.break_queue();
                return None;
            }
            if d.len == 0 {
                self.break_queue();
                return None;
            }

            let want_write = d.flags & DESC_F_WRITE != 0;
            let ptr = match mem.find_range(d.addr, d.len as u64, want_write) {
                Ok(p) => p,
                Err(_) => {
                    self.break_queue();
                    return None;
                }
            };

            if d.flags & DESC_F_NEXT != 0 {
                if d.next >= self.tbl_size {
                    self.break_queue();
                    // the buffer we just validated is still dropped — the
                    // chain as a whole is malformed.
                    return None;
                }
                self.cur = Some(d.next);
            } else {
                self.cur = None;
            }

            return Some(Buffer {
                ptr,
                len: d.len,
                ro: !want_write,
            });
        }
    }

    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMap;

    /// A fake guest address space: one contiguous buffer, identity-mapped
    /// (gpa == offset into the Vec), so tests can write ring structures by
    /// hand the way a driver would.
    struct FakeGuest {
        backing: Vec<u8>,
    }

    impl FakeGuest {
        fn new(len: usize) -> Self {
            FakeGuest {
                backing: vec![0u8; len],
            }
        }

        fn ptr(&mut self) -> *mut u8 {
            self.backing.as_mut_ptr()
        }

        fn memory_map(&mut self) -> MemoryMap {
            let mut m = MemoryMap::new();
            let len = self.backing.len() as u64;
            m.add_region(0, len, self.ptr(), false).unwrap();
            m
        }

        fn write_desc(&mut self, gpa: u64, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
            let base = gpa as usize + idx as usize * 16;
            self.backing[base..base + 8].copy_from_slice(&addr.to_le_bytes());
            self.backing[base + 8..base + 12].copy_from_slice(&len.to_le_bytes());
            self.backing[base + 12..base + 14].copy_from_slice(&flags.to_le_bytes());
            self.backing[base + 14..base + 16].copy_from_slice(&next.to_le_bytes());
        }

        fn write_avail(&mut self, gpa: u64, idx: u16, ring: &[u16]) {
            let base = gpa as usize;
            self.backing[base..base + 2].copy_from_slice(&0u16.to_le_bytes());
            self.backing[base + 2..base + 4].copy_from_slice(&idx.to_le_bytes());
            for (i, v) in ring.iter().enumerate() {
                let off = base + 4 + i * 2;
                self.backing[off..off + 2].copy_from_slice(&v.to_le_bytes());
            }
        }

        fn used_idx(&self, gpa: u64) -> u16 {
            let base = gpa as usize + 2;
            u16::from_le_bytes(self.backing[base..base + 2].try_into().unwrap())
        }

        fn used_entry(&self, gpa: u64, slot: u16) -> (u32, u32) {
            let base = gpa as usize + 4 + slot as usize * 8;
            let id = u32::from_le_bytes(self.backing[base..base + 4].try_into().unwrap());
            let len = u32::from_le_bytes(self.backing[base + 4..base + 8].try_into().unwrap());
            (id, len)
        }
    }

    const DESC_GPA: u64 = 0x1000;
    const AVAIL_GPA: u64 = 0x3000;
    const USED_GPA: u64 = 0x4000;
    const DATA_GPA: u64 = 0x8000;

    fn start_vq(g: &mut FakeGuest, qsize: u16) -> (VirtQueue, MemoryMap) {
        let mem = g.memory_map();
        let mut vq = VirtQueue::new();
        vq.start(qsize, DESC_GPA, AVAIL_GPA, USED_GPA, 0, &mem)
            .unwrap();
        (vq, mem)
    }

    #[test]
    fn multi_desc_read_chain_yields_buffers_in_order() {
        let mut g = FakeGuest::new(0x10000);
        g.write_desc(DESC_GPA, 0, DATA_GPA, 16, DESC_F_NEXT, 1);
        g.write_desc(DESC_GPA, 1, DATA_GPA + 0x1000, 0x1000, DESC_F_WRITE | DESC_F_NEXT, 2);
        g.write_desc(DESC_GPA, 2, DATA_GPA + 0x4000, 0x2000, DESC_F_WRITE | DESC_F_NEXT, 3);
        g.write_desc(DESC_GPA, 3, DATA_GPA + 0x7000, 1, DESC_F_WRITE, 0);
        g.write_avail(AVAIL_GPA, 1, &[0]);

        let (mut vq, mem) = start_vq(&mut g, 1024);
        let mut chain = vq.dequeue_avail().expect("chain available");
        let mut lens = vec![];
        while let Some(b) = chain.next_buffer(&mem) {
            lens.push(b.len);
        }
        assert_eq!(lens, vec![16, 0x1000, 0x2000, 1]);
        assert!(!vq.is_broken());
    }

    #[test]
    fn indirect_chain_of_length_qsize_minus_one() {
        let mut g = FakeGuest::new(0x200000);
        const N: u16 = 1023;
        const IND_GPA: u64 = 0x20000;
        for i in 0..N {
            let next = if i + 1 == N { 0 } else { i + 1 };
            let flags = if i + 1 == N { DESC_F_WRITE } else { DESC_F_WRITE | DESC_F_NEXT };
            g.write_desc(IND_GPA, i, DATA_GPA + i as u64 * 0x10, 16, flags, next);
        }
        g.write_desc(DESC_GPA, 0, IND_GPA, N as u32 * 16, DESC_F_INDIRECT, 0);
        g.write_avail(AVAIL_GPA, 1, &[0]);

        let (mut vq, mem) = start_vq(&mut g, 1024);
        let mut chain = vq.dequeue_avail().unwrap();
        let mut count = 0;
        while chain.next_buffer(&mem).is_some() {
            count += 1;
        }
        assert_eq!(count, N as u32);
        assert!(!vq.is_broken());
    }

    #[test]
    fn descriptor_loop_breaks_the_queue() {
        let mut g = FakeGuest::new(0x10000);
        g.write_desc(DESC_GPA, 0, DATA_GPA, 16, DESC_F_WRITE | DESC_F_NEXT, 1);
        g.write_desc(DESC_GPA, 1, DATA_GPA, 16, DESC_F_WRITE | DESC_F_NEXT, 0);
        g.write_avail(AVAIL_GPA, 1, &[0]);

        let (mut vq, mem) = start_vq(&mut g, 1024);
        let mut chain = vq.dequeue_avail().unwrap();
        let mut calls = 0;
        while chain.next_buffer(&mem).is_some() {
            calls += 1;
            assert!(calls <= 1025, "iteration did not terminate");
        }
        assert!(vq.is_broken());
    }

    #[test]
    fn nested_indirect_with_next_set_breaks_immediately() {
        let mut g = FakeGuest::new(0x40000);
        const IND_GPA: u64 = 0x20000;
        // indirect table whose only entry is itself an indirect pointer.
        g.write_desc(IND_GPA, 0, IND_GPA, 16, DESC_F_INDIRECT, 0);
        g.write_desc(DESC_GPA, 0, IND_GPA, 16, DESC_F_INDIRECT, 0);
        g.write_avail(AVAIL_GPA, 1, &[0]);

        let (mut vq, mem) = start_vq(&mut g, 1024);
        let mut chain = vq.dequeue_avail().unwrap();
        assert!(chain.next_buffer(&mem).is_none());
        assert!(vq.is_broken());
    }

    #[test]
    fn indirect_pointer_descriptor_with_next_breaks_the_queue() {
        let mut g = FakeGuest::new(0x40000);
        const IND_GPA: u64 = 0x20000;
        g.write_desc(IND_GPA, 0, DATA_GPA, 16, DESC_F_WRITE, 0);
        g.write_desc(DESC_GPA, 0, IND_GPA, 16, DESC_F_INDIRECT | DESC_F_NEXT, 1);
        g.write_avail(AVAIL_GPA, 1, &[0]);

        let (mut vq, mem) = start_vq(&mut g, 1024);
        let mut chain = vq.dequeue_avail().unwrap();
        assert!(chain.next_buffer(&mem).is_none());
        assert!(vq.is_broken());
    }

    #[test]
    fn next_pointing_past_table_size_breaks_the_queue() {
        let mut g = FakeGuest::new(0x10000);
        g.write_desc(DESC_GPA, 0, DATA_GPA, 16, DESC_F_WRITE | DESC_F_NEXT, 5);
        g.write_avail(AVAIL_GPA, 1, &[0]);

        let (mut vq, mem) = start_vq(&mut g, 4);
        let mut chain = vq.dequeue_avail().unwrap();
        // the head buffer is yielded once (its own bounds are fine)...
        assert!(chain.next_buffer(&mem).is_some());
        // ...but following `next` past `tbl_size` breaks on the next call.
        assert!(chain.next_buffer(&mem).is_none());
        assert!(vq.is_broken());
    }

    #[test]
    fn enqueue_used_advances_idx_and_records_head() {
        let mut g = FakeGuest::new(0x10000);
        let (mut vq, _mem) = start_vq(&mut g, 1024);
        vq.enqueue_used(7, 42);
        assert_eq!(g.used_idx(USED_GPA), 1);
        assert_eq!(g.used_entry(USED_GPA, 0), (7, 42));
    }

    #[test]
    fn start_rejects_non_power_of_two_qsize() {
        let mut g = FakeGuest::new(0x10000);
        let mem = g.memory_map();
        let mut vq = VirtQueue::new();
        assert!(matches!(
            vq.start(3, DESC_GPA, AVAIL_GPA, USED_GPA, 0, &mem),
            Err(Error::BadQueueSize)
        ));
    }

    #[test]
    fn broken_queue_yields_no_more_chains() {
        let mut g = FakeGuest::new(0x10000);
        g.write_desc(DESC_GPA, 0, DATA_GPA, 0, DESC_F_WRITE, 0);
        g.write_avail(AVAIL_GPA, 1, &[0]);

        let (mut vq, mem) = start_vq(&mut g, 1024);
        let mut chain = vq.dequeue_avail().unwrap();
        assert!(chain.next_buffer(&mem).is_none());
        assert!(vq.is_broken());
        assert!(vq.dequeue_avail().is_none());
    }
}
