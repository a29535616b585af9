//! Virtio device abstraction: wires vrings to a storage backend through the
//! blk parser, and owns feature negotiation at the virtio (not vhost-user)
//! level.
//!
//! Only `VIRTIO_ID_BLOCK` is implemented — the Non-goals exclude net/console
//! backends, so this is a concrete block device rather than a dispatch trait
//! over device types. A second backend would need its own module in this
//! shape, not a variant bolted onto this one.

use std::io;

use crate::blk::{self, BlkConfig, FeaturePolicy, ParseOutcome, ParsedRequest, RequestKind};
use crate::memory::MemoryMap;
use crate::virtqueue::Buffer;
use crate::vring::Vring;

pub const VIRTIO_F_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

pub const VIRTIO_ID_BLOCK: u32 = 2;

/// Storage operations a block device needs from whatever is backing it.
/// Implementations see already-translated host pointers; they never touch
/// guest addresses.
pub trait BlockBackend {
    fn capacity_sectors(&self) -> u64;
    fn block_size(&self) -> u32;
    fn readonly(&self) -> bool;
    /// Whether the backend can usefully act on `VIRTIO_BLK_T_FLUSH` — gates
    /// whether `BLK_F_FLUSH` is advertised at all.
    fn writeback(&self) -> bool;
    fn serial(&self) -> &[u8];

    /// Reads `sector` onwards into `buffers` in order, returning bytes
    /// written.
    fn read(&mut self, sector: u64, buffers: &[Buffer]) -> io::Result<u32>;
    /// Writes `buffers` in order starting at `sector`.
    fn write(&mut self, sector: u64, buffers: &[Buffer]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// A block device: negotiated feature state, the backend doing the actual
/// I/O, and the vrings driving it.
pub struct BlockDevice<B> {
    backend: B,
    device_features: u64,
    acked_features: u64,
    policy: FeaturePolicy,
}

impl<B: BlockBackend> BlockDevice<B> {
    pub fn new(backend: B) -> Self {
        let mut device_features = VIRTIO_F_INDIRECT_DESC | VIRTIO_F_VERSION_1 | blk::VIRTIO_BLK_F_BLK_SIZE;
        if backend.readonly() {
            device_features |= blk::VIRTIO_BLK_F_RO;
        }
        if backend.writeback() {
            device_features |= blk::VIRTIO_BLK_F_FLUSH;
        }
        let total_sectors = backend.capacity_sectors();
        BlockDevice {
            backend,
            device_features,
            acked_features: 0,
            policy: FeaturePolicy {
                total_sectors,
                ..FeaturePolicy::default()
            },
        }
    }

    pub fn device_features(&self) -> u64 {
        self.device_features
    }

    /// Records the driver's chosen feature subset and derives the request
    /// policy from it. Bits the driver asked for that we never offered are
    /// the protocol layer's problem to reject before this is called.
    pub fn ack_features(&mut self, bits: u64) {
        self.acked_features = bits & self.device_features;
        self.policy = FeaturePolicy {
            readonly: self.acked_features & blk::VIRTIO_BLK_F_RO != 0,
            flush: self.acked_features & blk::VIRTIO_BLK_F_FLUSH != 0,
            total_sectors: self.backend.capacity_sectors(),
        };
    }

    pub fn acked_features(&self) -> u64 {
        self.acked_features
    }

    pub fn config(&self) -> BlkConfig {
        BlkConfig {
            capacity_sectors: self.backend.capacity_sectors(),
            blk_size: self.backend.block_size(),
        }
    }

    /// Drains every available chain on `vring`, dispatching each to the
    /// backend and posting a used entry, then signals `callfd` once if
    /// anything was completed. Runs until the ring is empty or breaks.
    pub fn process_vring(&mut self, vring: &mut Vring, mem: &MemoryMap) -> io::Result<bool> {
        let mut completed_any = false;
        loop {
            let Some(mut chain) = vring.engine.dequeue_avail() else {
                break;
            };
            match blk::parse(&mut chain, mem, &self.policy) {
                ParseOutcome::Request(parsed) => {
                    drop(chain);
                    self.dispatch(parsed, &mut vring.engine)?;
                    completed_any = true;
                }
                ParseOutcome::Dropped { head_id } => {
                    drop(chain);
                    vring.engine.enqueue_used(head_id, 0);
                    completed_any = true;
                }
                ParseOutcome::Broken => {
                    // the virtqueue engine already marked the ring broken;
                    // no used entry to publish for this chain.
                }
            }
        }
        Ok(completed_any)
    }

    fn dispatch(&mut self, req: ParsedRequest, vq: &mut crate::virtqueue::VirtQueue) -> io::Result<()> {
        match req.kind.clone() {
            RequestKind::Read { sector, buffers } => match self.backend.read(sector, &buffers) {
                Ok(_n) => req.complete(vq, blk::VIRTIO_BLK_S_OK),
                Err(e) => {
                    log::warn!("blk: read at sector {sector} failed: {e}");
                    req.complete(vq, blk::VIRTIO_BLK_S_IOERR);
                }
            },
            RequestKind::Write { sector, buffers } => match self.backend.write(sector, &buffers) {
                Ok(()) => req.complete(vq, blk::VIRTIO_BLK_S_OK),
                Err(e) => {
                    log::warn!("blk: write at sector {sector} failed: {e}");
                    req.complete(vq, blk::VIRTIO_BLK_S_IOERR);
                }
            },
            RequestKind::Flush => match self.backend.flush() {
                Ok(()) => req.complete(vq, blk::VIRTIO_BLK_S_OK),
                Err(e) => {
                    log::warn!("blk: flush failed: {e}");
                    req.complete(vq, blk::VIRTIO_BLK_S_IOERR);
                }
            },
            RequestKind::GetId { buffer } => {
                let serial = self.backend.serial();
                let n = serial.len().min(buffer.len as usize);
                unsafe { std::ptr::copy_nonoverlapping(serial.as_ptr(), buffer.ptr, n) };
                if n < buffer.len as usize {
                    unsafe { std::ptr::write_bytes(buffer.ptr.add(n), 0, buffer.len as usize - n) };
                }
                req.complete(vq, blk::VIRTIO_BLK_S_OK);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMap;
    use crate::virtqueue::{DESC_F_NEXT, DESC_F_WRITE};

    struct RamDisk {
        data: Vec<u8>,
        serial: Vec<u8>,
    }

    impl RamDisk {
        fn new(sectors: u64) -> Self {
            RamDisk {
                data: vec![0u8; (sectors * blk::SECTOR_SIZE) as usize],
                serial: b"test-disk-0".to_vec(),
            }
        }
    }

    impl BlockBackend for RamDisk {
        fn capacity_sectors(&self) -> u64 {
            self.data.len() as u64 / blk::SECTOR_SIZE
        }
        fn block_size(&self) -> u32 {
            512
        }
        fn readonly(&self) -> bool {
            false
        }
        fn writeback(&self) -> bool {
            true
        }
        fn serial(&self) -> &[u8] {
            &self.serial
        }
        fn read(&mut self, sector: u64, buffers: &[Buffer]) -> io::Result<u32> {
            let mut off = (sector * blk::SECTOR_SIZE) as usize;
            let mut total = 0u32;
            for b in buffers {
                let len = b.len as usize;
                unsafe { std::ptr::copy_nonoverlapping(self.data[off..off + len].as_ptr(), b.ptr, len) };
                off += len;
                total += b.len;
            }
            Ok(total)
        }
        fn write(&mut self, sector: u64, buffers: &[Buffer]) -> io::Result<()> {
            let mut off = (sector * blk::SECTOR_SIZE) as usize;
            for b in buffers {
                let len = b.len as usize;
                unsafe { std::ptr::copy_nonoverlapping(b.ptr, self.data[off..off + len].as_mut_ptr(), len) };
                off += len;
            }
            Ok(())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FakeGuest {
        backing: Vec<u8>,
    }

    const DESC_GPA: u64 = 0x1000;
    const AVAIL_GPA: u64 = 0x3000;
    const USED_GPA: u64 = 0x4000;
    const HDR_GPA: u64 = 0x8000;
    const DATA_GPA: u64 = 0x9000;
    const STATUS_GPA: u64 = 0xa000;

    impl FakeGuest {
        fn new() -> Self {
            FakeGuest {
                backing: vec![0u8; 0x20000],
            }
        }
        fn memory_map(&mut self) -> MemoryMap {
            let mut m = MemoryMap::new();
            let len = self.backing.len() as u64;
            m.add_region(0, len, self.backing.as_mut_ptr(), false).unwrap();
            m
        }
        fn write_desc(&mut self, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
            let base = DESC_GPA as usize + idx as usize * 16;
            self.backing[base..base + 8].copy_from_slice(&addr.to_le_bytes());
            self.backing[base + 8..base + 12].copy_from_slice(&len.to_le_bytes());
            self.backing[base + 12..base + 14].copy_from_slice(&flags.to_le_bytes());
            self.backing[base + 14..base + 16].copy_from_slice(&next.to_le_bytes());
        }
        fn write_avail(&mut self, idx: u16, ring: &[u16]) {
            let base = AVAIL_GPA as usize;
            self.backing[base + 2..base + 4].copy_from_slice(&idx.to_le_bytes());
            for (i, v) in ring.iter().enumerate() {
                let off = base + 4 + i * 2;
                self.backing[off..off + 2].copy_from_slice(&v.to_le_bytes());
            }
        }
        fn write_header(&mut self, gpa: u64, req_type: u32, sector: u64) {
            let base = gpa as usize;
            self.backing[base..base + 4].copy_from_slice(&req_type.to_le_bytes());
            self.backing[base + 8..base + 16].copy_from_slice(&sector.to_le_bytes());
        }
    }

    #[test]
    fn device_features_reflect_backend_and_ack_narrows_to_offered() {
        let dev = BlockDevice::new(RamDisk::new(1024));
        assert_ne!(dev.device_features() & blk::VIRTIO_BLK_F_FLUSH, 0);
        assert_eq!(dev.device_features() & blk::VIRTIO_BLK_F_RO, 0);

        let mut dev = dev;
        dev.ack_features(u64::MAX);
        assert_eq!(dev.acked_features(), dev.device_features());
    }

    #[test]
    fn processes_one_read_request_end_to_end() {
        let mut g = FakeGuest::new();
        g.write_header(HDR_GPA, blk::VIRTIO_BLK_T_IN, 0);
        g.write_desc(0, HDR_GPA, 16, DESC_F_NEXT, 1);
        g.write_desc(1, DATA_GPA, 512, DESC_F_WRITE | DESC_F_NEXT, 2);
        g.write_desc(2, STATUS_GPA, 1, DESC_F_WRITE, 0);
        g.write_avail(1, &[0]);
        let mem = g.memory_map();

        let mut vring = Vring::new();
        vring.set_size(256);
        vring.set_addr(crate::vring::VringAddr {
            desc: DESC_GPA,
            avail: AVAIL_GPA,
            used: USED_GPA,
        });
        vring.set_kickfd(-1);
        vring.start(&mem, |a| Some(a)).unwrap();

        let mut dev = BlockDevice::new(RamDisk::new(1024));
        dev.ack_features(dev.device_features());
        let completed = dev.process_vring(&mut vring, &mem).unwrap();
        assert!(completed);
        assert!(!vring.engine.is_broken());
    }

    #[test]
    fn out_of_range_sector_is_dropped_with_a_bare_used_entry() {
        let mut g = FakeGuest::new();
        // RamDisk has 4 sectors; request one past the end.
        g.write_header(HDR_GPA, blk::VIRTIO_BLK_T_IN, 4);
        g.write_desc(0, HDR_GPA, 16, DESC_F_NEXT, 1);
        g.write_desc(1, DATA_GPA, 512, DESC_F_WRITE | DESC_F_NEXT, 2);
        g.write_desc(2, STATUS_GPA, 1, DESC_F_WRITE, 0);
        g.write_avail(1, &[0]);
        let mem = g.memory_map();

        let mut vring = Vring::new();
        vring.set_size(256);
        vring.set_addr(crate::vring::VringAddr {
            desc: DESC_GPA,
            avail: AVAIL_GPA,
            used: USED_GPA,
        });
        vring.set_kickfd(-1);
        vring.start(&mem, |a| Some(a)).unwrap();

        let mut dev = BlockDevice::new(RamDisk::new(4));
        dev.ack_features(dev.device_features());
        let completed = dev.process_vring(&mut vring, &mem).unwrap();
        assert!(completed);
        assert!(!vring.engine.is_broken());
        assert_eq!(vring.engine.last_seen_avail(), 1);
    }
}
