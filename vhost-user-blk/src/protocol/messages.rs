//! Vhost-user wire payloads: plain byte-layout structs with hand-rolled
//! LE encode/decode, no `repr(C)` assumptions about the wire.

pub const HEADER_LEN: usize = 12;

pub const FLAG_VERSION: u32 = 0x1;
pub const FLAG_REPLY: u32 = 0x4;
pub const FLAG_NEED_REPLY: u32 = 0x8;

/// The 12-byte frame header common to every request and reply.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub request: u32,
    pub flags: u32,
    pub size: u32,
}

impl Header {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Header {
        Header {
            request: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    pub fn needs_reply_ack(&self) -> bool {
        self.flags & FLAG_NEED_REPLY != 0
    }
}

/// Builds a full reply frame (header + payload) ready to write to the socket.
pub fn encode_reply(request: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_LEN + payload.len()];
    out[0..4].copy_from_slice(&request.to_le_bytes());
    out[4..8].copy_from_slice(&(FLAG_VERSION | FLAG_REPLY).to_le_bytes());
    out[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    out[12..].copy_from_slice(payload);
    out
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRegionDesc {
    pub guest_addr: u64,
    pub size: u64,
    pub user_addr: u64,
    pub mmap_offset: u64,
}

const MEM_REGION_ENTRY_LEN: usize = 32;

/// `VHOST_USER_SET_MEM_TABLE` payload: a u32 region count (+4 bytes
/// padding), followed by that many 32-byte region descriptions.
pub fn parse_memory_regions(payload: &[u8]) -> Option<Vec<MemoryRegionDesc>> {
    if payload.len() < 8 {
        return None;
    }
    let count = u32::from_le_bytes(payload[0..4].try_into().ok()?) as usize;
    let mut out = Vec::with_capacity(count);
    let mut off = 8;
    for _ in 0..count {
        let entry = payload.get(off..off + MEM_REGION_ENTRY_LEN)?;
        out.push(MemoryRegionDesc {
            guest_addr: u64::from_le_bytes(entry[0..8].try_into().ok()?),
            size: u64::from_le_bytes(entry[8..16].try_into().ok()?),
            user_addr: u64::from_le_bytes(entry[16..24].try_into().ok()?),
            mmap_offset: u64::from_le_bytes(entry[24..32].try_into().ok()?),
        });
        off += MEM_REGION_ENTRY_LEN;
    }
    Some(out)
}

#[derive(Debug, Clone, Copy)]
pub struct VringState {
    pub index: u32,
    pub num: u32,
}

pub fn parse_vring_state(payload: &[u8]) -> Option<VringState> {
    let b = payload.get(0..8)?;
    Some(VringState {
        index: u32::from_le_bytes(b[0..4].try_into().ok()?),
        num: u32::from_le_bytes(b[4..8].try_into().ok()?),
    })
}

pub fn encode_vring_state(state: VringState) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&state.index.to_le_bytes());
    out[4..8].copy_from_slice(&state.num.to_le_bytes());
    out
}

#[derive(Debug, Clone, Copy)]
pub struct VringAddr {
    pub index: u32,
    pub flags: u32,
    pub desc: u64,
    pub used: u64,
    pub avail: u64,
    pub log: u64,
}

pub fn parse_vring_addr(payload: &[u8]) -> Option<VringAddr> {
    let b = payload.get(0..40)?;
    Some(VringAddr {
        index: u32::from_le_bytes(b[0..4].try_into().ok()?),
        flags: u32::from_le_bytes(b[4..8].try_into().ok()?),
        desc: u64::from_le_bytes(b[8..16].try_into().ok()?),
        used: u64::from_le_bytes(b[16..24].try_into().ok()?),
        avail: u64::from_le_bytes(b[24..32].try_into().ok()?),
        log: u64::from_le_bytes(b[32..40].try_into().ok()?),
    })
}

/// Bit 8 of the payload in `SET_VRING_{KICK,CALL,ERR}` marks "no fd in
/// ancillary data, use polling" — this backend doesn't support polling
/// mode, so a set `invalid_fd` just means the vring stays unconfigured.
#[derive(Debug, Clone, Copy)]
pub struct VringFdIndex {
    pub index: u8,
    pub invalid_fd: bool,
}

pub fn parse_vring_fd_index(payload: &[u8]) -> Option<VringFdIndex> {
    let b = payload.get(0..8)?;
    let raw = u64::from_le_bytes(b.try_into().ok()?);
    Some(VringFdIndex {
        index: (raw & 0xff) as u8,
        invalid_fd: raw & 0x100 != 0,
    })
}

pub fn parse_u64(payload: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(payload.get(0..8)?.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_through_encode_reply() {
        let frame = encode_reply(7, &42u64.to_le_bytes());
        let hdr = Header::parse(frame[0..12].try_into().unwrap());
        assert_eq!(hdr.request, 7);
        assert_eq!(hdr.flags, FLAG_VERSION | FLAG_REPLY);
        assert_eq!(hdr.size, 8);
        assert_eq!(&frame[12..], &42u64.to_le_bytes());
    }

    #[test]
    fn parses_two_memory_regions() {
        let mut payload = vec![0u8; 8 + 64];
        payload[0..4].copy_from_slice(&2u32.to_le_bytes());
        payload[8..16].copy_from_slice(&0x1000u64.to_le_bytes());
        payload[16..24].copy_from_slice(&0x4000u64.to_le_bytes());
        payload[24..32].copy_from_slice(&0x7f0000000000u64.to_le_bytes());
        payload[32..40].copy_from_slice(&0u64.to_le_bytes());
        payload[40..48].copy_from_slice(&0x5000u64.to_le_bytes());
        payload[48..56].copy_from_slice(&0x1000u64.to_le_bytes());
        payload[56..64].copy_from_slice(&0x7f0000004000u64.to_le_bytes());
        payload[64..72].copy_from_slice(&0u64.to_le_bytes());

        let regions = parse_memory_regions(&payload).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].guest_addr, 0x1000);
        assert_eq!(regions[0].size, 0x4000);
        assert_eq!(regions[1].guest_addr, 0x5000);
    }

    #[test]
    fn truncated_region_table_is_rejected() {
        let payload = vec![0u8; 8 + 10];
        let mut payload = payload;
        payload[0..4].copy_from_slice(&1u32.to_le_bytes());
        assert!(parse_memory_regions(&payload).is_none());
    }

    #[test]
    fn vring_fd_index_extracts_invalid_bit() {
        let raw = (0x100u64 | 3).to_le_bytes();
        let parsed = parse_vring_fd_index(&raw).unwrap();
        assert_eq!(parsed.index, 3);
        assert!(parsed.invalid_fd);
    }
}
