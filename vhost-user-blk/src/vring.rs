//! Per-vring control-plane state: the fds, addresses, and lifecycle flags
//! the vhost-user protocol manipulates, wrapping the data-plane `VirtQueue`.

use std::os::unix::io::RawFd;

use crate::memory::{self, MemoryMap};
use crate::virtqueue::{self, VirtQueue};

/// Addresses the driver handed over via `SET_VRING_ADDR`. These are given
/// in the vhost-user master's own address space (the `userspace_addr` of
/// whichever `SET_MEM_TABLE` region covers them), not guest-physical
/// addresses — `start` must translate them through the master's
/// user-address-to-gpa table before resolving them against `MemoryMap`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VringAddr {
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

/// One vhost-user vring slot. A device exposes a fixed number of these
/// (spec: up to the backend's advertised maximum queue count); each is
/// configured independently and can be started/stopped any number of times
/// over the life of a connection.
pub struct Vring {
    pub engine: VirtQueue,
    size: u16,
    addr: Option<VringAddr>,
    avail_base: u16,
    enabled: bool,
    started: bool,
    kickfd: Option<RawFd>,
    callfd: Option<RawFd>,
    errfd: Option<RawFd>,
}

impl Default for Vring {
    fn default() -> Self {
        Vring {
            engine: VirtQueue::new(),
            size: 0,
            addr: None,
            avail_base: 0,
            enabled: false,
            started: false,
            kickfd: None,
            callfd: None,
            errfd: None,
        }
    }
}

impl Vring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_size(&mut self, size: u16) {
        self.size = size;
    }

    pub fn set_addr(&mut self, addr: VringAddr) {
        self.addr = Some(addr);
    }

    pub fn set_avail_base(&mut self, base: u16) {
        self.avail_base = base;
    }

    /// `GET_VRING_BASE` both reads back the driver-visible consumed index
    /// and, per spec, implicitly stops the ring.
    pub fn get_vring_base_and_stop(&mut self) -> u16 {
        let base = if self.started {
            self.engine.last_seen_avail()
        } else {
            self.avail_base
        };
        self.stop();
        base
    }

    pub fn set_kickfd(&mut self, fd: RawFd) {
        self.kickfd = Some(fd);
    }

    pub fn set_callfd(&mut self, fd: RawFd) {
        self.callfd = Some(fd);
    }

    pub fn set_errfd(&mut self, fd: RawFd) {
        self.errfd = Some(fd);
    }

    pub fn kickfd(&self) -> Option<RawFd> {
        self.kickfd
    }

    /// Takes and clears the kick fd, e.g. before closing it on
    /// `GET_VRING_BASE` or a connection teardown.
    pub fn take_kickfd(&mut self) -> Option<RawFd> {
        self.kickfd.take()
    }

    pub fn take_callfd(&mut self) -> Option<RawFd> {
        self.callfd.take()
    }

    pub fn take_errfd(&mut self) -> Option<RawFd> {
        self.errfd.take()
    }

    pub fn callfd(&self) -> Option<RawFd> {
        self.callfd
    }

    pub fn errfd(&self) -> Option<RawFd> {
        self.errfd
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Ready to run the moment it is enabled: sized, addressed, and has a
    /// kick fd to wait on.
    pub fn is_configured(&self) -> bool {
        self.size != 0 && self.addr.is_some() && self.kickfd.is_some()
    }

    /// Translates `addr`'s three master-VA fields through `translate_uva`
    /// and arms the underlying engine against `mem`. A no-op (returns
    /// `Ok`) if already started — callers kick this once per enable, not
    /// per kick.
    ///
    /// Resolution is deliberately deferred to here rather than done at
    /// `SET_VRING_ADDR` time: the wire protocol permits `SET_VRING_ADDR`
    /// to arrive before `SET_MEM_TABLE`, so the translation table may not
    /// exist yet when the address is first recorded.
    pub fn start(
        &mut self,
        mem: &MemoryMap,
        translate_uva: impl Fn(u64) -> Option<u64>,
    ) -> Result<(), virtqueue::Error> {
        if self.started {
            return Ok(());
        }
        let addr = self.addr.expect("start requires set_addr first");
        let desc_gpa = translate_uva(addr.desc).ok_or(virtqueue::Error::Memory(memory::Error::Unmapped))?;
        let avail_gpa = translate_uva(addr.avail).ok_or(virtqueue::Error::Memory(memory::Error::Unmapped))?;
        let used_gpa = translate_uva(addr.used).ok_or(virtqueue::Error::Memory(memory::Error::Unmapped))?;
        self.engine
            .start(self.size, desc_gpa, avail_gpa, used_gpa, self.avail_base, mem)?;
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.started = false;
    }

    /// Tears the vring fully back to its unconfigured state — used on
    /// device reset, not on a plain `GET_VRING_BASE`.
    pub fn reset(&mut self) {
        *self = Vring::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_vring_is_not_configured() {
        let v = Vring::new();
        assert!(!v.is_configured());
    }

    #[test]
    fn configured_once_size_addr_and_kickfd_are_set() {
        let mut v = Vring::new();
        v.set_size(256);
        v.set_addr(VringAddr {
            desc: 0x1000,
            avail: 0x2000,
            used: 0x3000,
        });
        assert!(!v.is_configured());
        v.set_kickfd(3);
        assert!(v.is_configured());
    }

    #[test]
    fn get_vring_base_stops_and_reports_avail_base_when_never_started() {
        let mut v = Vring::new();
        v.set_avail_base(7);
        assert_eq!(v.get_vring_base_and_stop(), 7);
        assert!(!v.is_started());
    }

    #[test]
    fn reset_clears_every_field() {
        let mut v = Vring::new();
        v.set_size(128);
        v.set_kickfd(9);
        v.set_enabled(true);
        v.reset();
        assert!(!v.is_configured());
        assert!(!v.enabled());
    }

    #[test]
    fn start_translates_master_va_ring_addresses_to_gpa() {
        // A guest region whose host-visible gpa (0x1000) differs from the
        // master's own userspace_addr (0x7f0000000000) for that region —
        // SET_VRING_ADDR speaks in the latter.
        const UVA_BASE: u64 = 0x7f0000000000;
        const GPA_BASE: u64 = 0x1000;
        let mut backing = vec![0u8; 0x10000];
        let mut mem = MemoryMap::new();
        mem.add_region(GPA_BASE, backing.len() as u64, backing.as_mut_ptr(), false)
            .unwrap();

        let mut v = Vring::new();
        v.set_size(256);
        v.set_addr(VringAddr {
            desc: UVA_BASE,
            avail: UVA_BASE + 0x2000,
            used: UVA_BASE + 0x3000,
        });
        v.set_kickfd(3);

        let translate = |uva: u64| -> Option<u64> {
            if uva >= UVA_BASE && uva < UVA_BASE + backing.len() as u64 {
                Some(GPA_BASE + (uva - UVA_BASE))
            } else {
                None
            }
        };
        v.start(&mem, translate).unwrap();
        assert!(v.is_started());
    }

    #[test]
    fn start_fails_when_master_va_does_not_translate() {
        let mut backing = vec![0u8; 0x10000];
        let mut mem = MemoryMap::new();
        mem.add_region(0x1000, backing.len() as u64, backing.as_mut_ptr(), false)
            .unwrap();

        let mut v = Vring::new();
        v.set_size(256);
        v.set_addr(VringAddr {
            desc: 0x1000,
            avail: 0x2000,
            used: 0x3000,
        });
        v.set_kickfd(3);

        assert!(v.start(&mem, |_uva| None).is_err());
        assert!(!v.is_started());
    }
}
