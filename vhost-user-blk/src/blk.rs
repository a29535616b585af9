//! virtio-blk request parsing: turns a descriptor chain into a typed
//! request (or a silent drop, or nothing at all if the virtqueue engine
//! itself already broke the ring mid-chain).

use smallvec::SmallVec;

use crate::memory::MemoryMap;
use crate::virtqueue::{Buffer, DescriptorChainIter, VirtQueue};

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

pub const SECTOR_SIZE: u64 = 512;
pub const VIRTIO_BLK_ID_BYTES: u32 = 20;

pub const VIRTIO_BLK_F_RO: u64 = 1 << 5;
pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

const HEADER_LEN: u32 = 16;
const STATUS_LEN: u32 = 1;

/// Negotiated feature/config gates the parser enforces on incoming
/// requests. Rebuilt from the backend whenever features are (re)negotiated.
#[derive(Debug, Clone, Copy)]
pub struct FeaturePolicy {
    pub readonly: bool,
    pub flush: bool,
    pub total_sectors: u64,
}

impl Default for FeaturePolicy {
    fn default() -> Self {
        FeaturePolicy {
            readonly: false,
            flush: false,
            total_sectors: u64::MAX,
        }
    }
}

/// Device config space (a prefix of `struct virtio_blk_config`); fields
/// past `blk_size` (topology, discard, etc.) are Non-goals.
#[derive(Debug, Clone, Copy)]
pub struct BlkConfig {
    pub capacity_sectors: u64,
    pub blk_size: u32,
}

impl BlkConfig {
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..8].copy_from_slice(&self.capacity_sectors.to_le_bytes());
        // size_max, seg_max: unsupported, left zero.
        buf[20..24].copy_from_slice(&self.blk_size.to_le_bytes());
        buf
    }
}

#[derive(Debug, Clone)]
pub enum RequestKind {
    Read { sector: u64, buffers: SmallVec<[Buffer; 4]> },
    Write { sector: u64, buffers: SmallVec<[Buffer; 4]> },
    Flush,
    GetId { buffer: Buffer },
}

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub head_id: u16,
    pub kind: RequestKind,
    status_ptr: *mut u8,
}

impl ParsedRequest {
    /// Writes `status` to the request's status byte and publishes the used
    /// entry. Per spec, `nwritten` is always 0: virtio-blk guests don't
    /// infer data length from the used entry, and any data buffers were
    /// already written directly into the guest's writable buffers by the
    /// backend.
    pub fn complete(self, vq: &mut VirtQueue, status: u8) {
        // SAFETY: status_ptr was resolved via MemoryMap::find_range with
        // want_write=true when the chain was parsed.
        unsafe { self.status_ptr.write_volatile(status) };
        vq.enqueue_used(self.head_id, 0);
    }
}

/// Outcome of parsing one dequeued chain as a virtio-blk request.
pub enum ParseOutcome {
    /// A well-formed request ready to dispatch to the storage backend.
    Request(ParsedRequest),
    /// The chain obeyed the virtqueue-level rules but fails the blk
    /// envelope (bad header/status size, wrong direction, unaligned or
    /// zero data, out-of-range sector, unknown type, or a write against a
    /// read-only-negotiated device). Per spec: commit a used entry with
    /// zero bytes written, write no status byte.
    Dropped { head_id: u16 },
    /// The virtqueue engine already broke the ring while walking this
    /// chain (cycle, bad indirect table, out-of-range `next`, ...). No
    /// used entry is published; the ring stays broken until reinitialized.
    Broken,
}

fn read_u32_le(ptr: *const u8, offset: usize) -> u32 {
    let mut b = [0u8; 4];
    unsafe { std::ptr::copy_nonoverlapping(ptr.add(offset), b.as_mut_ptr(), 4) };
    u32::from_le_bytes(b)
}

fn read_u64_le(ptr: *const u8, offset: usize) -> u64 {
    let mut b = [0u8; 8];
    unsafe { std::ptr::copy_nonoverlapping(ptr.add(offset), b.as_mut_ptr(), 8) };
    u64::from_le_bytes(b)
}

fn drop_or_broken(chain: &DescriptorChainIter<'_>, head_id: u16) -> ParseOutcome {
    if chain.is_broken() {
        ParseOutcome::Broken
    } else {
        ParseOutcome::Dropped { head_id }
    }
}

/// Parses the next available chain on `chain` into a request. Stops
/// reading as soon as the chain is known not to describe a dispatchable
/// request — the remaining, unread descriptors are simply abandoned, which
/// is harmless since nothing has been published to the used ring yet.
pub fn parse(
    chain: &mut DescriptorChainIter<'_>,
    mem: &MemoryMap,
    policy: &FeaturePolicy,
) -> ParseOutcome {
    let head_id = chain.head_id();

    let Some(hdr) = chain.next_buffer(mem) else {
        return drop_or_broken(chain, head_id);
    };
    if hdr.len != HEADER_LEN || !hdr.ro {
        log::warn!("blk: dropping chain {head_id}: bad header descriptor");
        return ParseOutcome::Dropped { head_id };
    }
    // Copy out of shared memory immediately: the guest could mutate this
    // buffer concurrently, so every field we act on must come from this
    // local copy, not a re-read of `hdr.ptr`.
    let req_type = read_u32_le(hdr.ptr, 0);
    let sector = read_u64_le(hdr.ptr, 8);

    let mut rest: SmallVec<[Buffer; 4]> = SmallVec::new();
    while let Some(b) = chain.next_buffer(mem) {
        rest.push(b);
    }
    if chain.is_broken() {
        log::warn!("blk: dropping chain {head_id}: broken mid-chain");
        return ParseOutcome::Broken;
    }

    let Some(status) = rest.pop() else {
        log::warn!("blk: dropping chain {head_id}: no status descriptor");
        return ParseOutcome::Dropped { head_id };
    };
    if status.len != STATUS_LEN || status.ro {
        log::warn!("blk: dropping chain {head_id}: bad status descriptor");
        return ParseOutcome::Dropped { head_id };
    }
    let status_ptr = status.ptr;

    let kind = match req_type {
        VIRTIO_BLK_T_IN | VIRTIO_BLK_T_OUT => {
            let want_write = req_type == VIRTIO_BLK_T_IN;
            if rest.is_empty() || rest.iter().any(|b| b.ro == want_write) {
                log::warn!("blk: dropping chain {head_id}: bad data descriptor direction");
                return ParseOutcome::Dropped { head_id };
            }
            if rest.iter().any(|b| b.len == 0 || b.len as u64 % SECTOR_SIZE != 0) {
                log::warn!("blk: dropping chain {head_id}: data descriptor not sector-aligned");
                return ParseOutcome::Dropped { head_id };
            }
            let total_bytes: u64 = rest.iter().map(|b| b.len as u64).sum();
            let nsectors = total_bytes / SECTOR_SIZE;
            let Some(end_sector) = sector.checked_add(nsectors) else {
                log::warn!("blk: dropping chain {head_id}: sector range overflows");
                return ParseOutcome::Dropped { head_id };
            };
            if end_sector > policy.total_sectors {
                log::warn!(
                    "blk: dropping chain {head_id}: sector range [{sector}, {end_sector}) out of bounds"
                );
                return ParseOutcome::Dropped { head_id };
            }
            if req_type == VIRTIO_BLK_T_OUT && policy.readonly {
                log::warn!("blk: dropping chain {head_id}: write against read-only device");
                return ParseOutcome::Dropped { head_id };
            }
            if req_type == VIRTIO_BLK_T_IN {
                RequestKind::Read { sector, buffers: rest }
            } else {
                RequestKind::Write { sector, buffers: rest }
            }
        }
        VIRTIO_BLK_T_FLUSH => {
            if !rest.is_empty() {
                log::warn!("blk: dropping chain {head_id}: flush carries data");
                return ParseOutcome::Dropped { head_id };
            }
            if !policy.flush {
                log::warn!("blk: dropping chain {head_id}: flush not negotiated");
                return ParseOutcome::Dropped { head_id };
            }
            RequestKind::Flush
        }
        VIRTIO_BLK_T_GET_ID => {
            if rest.len() != 1 || rest[0].ro || rest[0].len != VIRTIO_BLK_ID_BYTES {
                log::warn!("blk: dropping chain {head_id}: bad get_id data descriptor");
                return ParseOutcome::Dropped { head_id };
            }
            RequestKind::GetId { buffer: rest[0] }
        }
        other => {
            log::debug!("blk: dropping chain {head_id}: unsupported request type {other}");
            return ParseOutcome::Dropped { head_id };
        }
    };

    ParseOutcome::Request(ParsedRequest {
        head_id,
        kind,
        status_ptr,
    })
}
