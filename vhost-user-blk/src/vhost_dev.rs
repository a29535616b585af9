//! Top-level vhost-user block device: owns the listen socket, the single
//! active control connection, the guest memory map, the vrings, and the
//! block device they drive, and wires all of it into the reactor.

use std::cell::RefCell;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::FromRawFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::rc::Rc;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::blk::BlkConfig;
use crate::device::BlockDevice;
use crate::memory::MemoryMap;
use crate::protocol::{self, messages};
use crate::reactor::{Interest, Reactor};
use crate::vring::{Vring, VringAddr as EngineVringAddr};

pub use crate::device::BlockBackend;

struct Mapping {
    hva: *mut u8,
    len: usize,
}

/// One `SET_MEM_TABLE` region's master-userspace-address range, kept
/// alongside `MemoryMap` so `SET_VRING_ADDR`'s master-VA ring addresses can
/// be translated to the GPAs `MemoryMap::find_range` expects.
#[derive(Debug, Clone, Copy)]
struct UvaRegion {
    user_addr: u64,
    len: u64,
    gpa: u64,
}

fn translate_uva(regions: &[UvaRegion], uva: u64) -> Option<u64> {
    regions
        .iter()
        .find(|r| uva >= r.user_addr && uva < r.user_addr + r.len)
        .map(|r| r.gpa + (uva - r.user_addr))
}

struct State<B: BlockBackend> {
    mem: MemoryMap,
    mappings: Vec<Mapping>,
    uva_regions: Vec<UvaRegion>,
    vrings: Vec<Vring>,
    device: BlockDevice<B>,
    owned: bool,
    negotiated_protocol_features: u64,
    conn: Option<UnixStream>,
}

impl<B: BlockBackend> State<B> {
    fn reset_memory(&mut self) {
        self.mem.reset();
        self.uva_regions.clear();
        unmap_all(self.mappings.drain(..));
    }

    fn reset_vrings(&mut self) {
        for v in self.vrings.iter_mut() {
            if let Some(fd) = v.take_kickfd() {
                let _ = nix::unistd::close(fd);
            }
            if let Some(fd) = v.take_callfd() {
                let _ = nix::unistd::close(fd);
            }
            if let Some(fd) = v.take_errfd() {
                let _ = nix::unistd::close(fd);
            }
            v.reset();
        }
    }
}

/// A vhost-user block backend bound to one UNIX control socket.
pub struct VhostDev<B: BlockBackend> {
    listener: Rc<UnixListener>,
    state: Rc<RefCell<State<B>>>,
    num_queues: usize,
}

impl<B: BlockBackend + 'static> VhostDev<B> {
    pub fn bind(socket_path: &std::path::Path, backend: B, num_queues: usize) -> io::Result<Self> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        let vrings = (0..num_queues).map(|_| Vring::new()).collect();
        let state = State {
            mem: MemoryMap::new(),
            mappings: Vec::new(),
            uva_regions: Vec::new(),
            vrings,
            device: BlockDevice::new(backend),
            owned: false,
            negotiated_protocol_features: 0,
            conn: None,
        };
        Ok(VhostDev {
            listener: Rc::new(listener),
            state: Rc::new(RefCell::new(state)),
            num_queues,
        })
    }

    /// Runs the accept-and-serve loop forever (one connection at a time).
    pub fn run(&mut self) -> io::Result<()> {
        let mut reactor = Reactor::new().map_err(io::Error::other)?;

        let listener = self.listener.clone();
        let state = self.state.clone();
        let listener_fd = listener.as_raw_fd();
        reactor
            .register(
                listener_fd,
                Interest::READABLE,
                Box::new(move |r, _fd, _set| {
                    on_listener_readable(&listener, &state, r);
                }),
            )
            .map_err(io::Error::other)?;

        reactor.run().map_err(io::Error::other)
    }
}

fn on_listener_readable<B: BlockBackend + 'static>(
    listener: &Rc<UnixListener>,
    state: &Rc<RefCell<State<B>>>,
    reactor: &mut Reactor<'_>,
) {
    let (stream, _addr) = match listener.accept() {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("vhost-user: accept failed: {e}");
            return;
        }
    };

    // Only one active connection: tear down any previous one first.
    if let Some(old) = state.borrow_mut().conn.take() {
        let _ = reactor.unregister(old.as_raw_fd());
    }
    reset_device(state, reactor);

    let fd = stream.as_raw_fd();
    log::info!("vhost-user: accepted control connection");
    state.borrow_mut().conn = Some(stream);

    let state2 = state.clone();
    let _ = reactor.register(
        fd,
        Interest::READABLE,
        Box::new(move |r, fd, _set| on_control_readable(&state2, r, fd)),
    );
}

fn on_control_readable<B: BlockBackend + 'static>(
    state: &Rc<RefCell<State<B>>>,
    reactor: &mut Reactor<'_>,
    fd: RawFd,
) {
    match protocol::connection::recv_message(fd) {
        Ok(Some(msg)) => {
            if let Err(e) = dispatch(state, reactor, fd, msg) {
                log::error!("vhost-user: request failed: {e}, resetting connection");
                teardown_connection(state, reactor, fd);
            }
        }
        Ok(None) => {
            log::info!("vhost-user: control connection closed by peer");
            teardown_connection(state, reactor, fd);
        }
        Err(e) => {
            log::error!("vhost-user: framing error: {e}, resetting connection");
            teardown_connection(state, reactor, fd);
        }
    }
}

fn teardown_connection<B: BlockBackend + 'static>(
    state: &Rc<RefCell<State<B>>>,
    reactor: &mut Reactor<'_>,
    fd: RawFd,
) {
    let _ = reactor.unregister(fd);
    state.borrow_mut().conn = None;
    reset_device(state, reactor);
}

/// Full teardown used on a fatal error or a dropped connection: also clears
/// ownership, since the next thing to happen is a fresh `SET_OWNER`.
fn reset_device<B: BlockBackend + 'static>(state: &Rc<RefCell<State<B>>>, reactor: &mut Reactor<'_>) {
    reset_device_state(state, reactor, true);
}

fn reset_device_state<B: BlockBackend + 'static>(
    state: &Rc<RefCell<State<B>>>,
    reactor: &mut Reactor<'_>,
    clear_owner: bool,
) {
    let mut s = state.borrow_mut();
    for v in s.vrings.iter() {
        if let Some(fd) = v.kickfd() {
            let _ = reactor.unregister(fd);
        }
        if let Some(fd) = v.errfd() {
            let _ = reactor.unregister(fd);
        }
    }
    s.reset_vrings();
    s.reset_memory();
    if clear_owner {
        s.owned = false;
    }
    s.negotiated_protocol_features = 0;
}

fn dispatch<B: BlockBackend + 'static>(
    state: &Rc<RefCell<State<B>>>,
    reactor: &mut Reactor<'_>,
    fd: RawFd,
    msg: protocol::connection::RecvResult,
) -> Result<(), protocol::Error> {
    let protocol::connection::RecvResult { header, payload, fds } = msg;
    let req = header.request;
    log::debug!("vhost-user: request {req}");

    let mut reply: Option<Vec<u8>> = None;

    match req {
        protocol::GET_FEATURES => {
            let features = state.borrow().device.device_features() | protocol::VHOST_USER_F_PROTOCOL_FEATURES;
            reply = Some(features.to_le_bytes().to_vec());
        }
        protocol::SET_FEATURES => {
            let bits = messages::parse_u64(&payload).ok_or(protocol::Error::BadPayloadSize)?;
            let mut s = state.borrow_mut();
            let offered = s.device.device_features() | protocol::VHOST_USER_F_PROTOCOL_FEATURES;
            let unoffered = bits & !offered;
            if unoffered != 0 {
                return Err(protocol::Error::FeatureNotOffered(unoffered));
            }
            s.device.ack_features(bits);
        }
        protocol::SET_OWNER => {
            let mut s = state.borrow_mut();
            if s.owned {
                return Err(protocol::Error::DuplicateOwner);
            }
            s.owned = true;
        }
        protocol::RESET_OWNER => {
            state.borrow_mut().owned = false;
        }
        protocol::GET_PROTOCOL_FEATURES => {
            let features = protocol::PROTOCOL_F_MQ
                | protocol::PROTOCOL_F_REPLY_ACK
                | protocol::PROTOCOL_F_CONFIG
                | protocol::PROTOCOL_F_RESET_DEVICE;
            reply = Some(features.to_le_bytes().to_vec());
        }
        protocol::SET_PROTOCOL_FEATURES => {
            let bits = messages::parse_u64(&payload).ok_or(protocol::Error::BadPayloadSize)?;
            state.borrow_mut().negotiated_protocol_features = bits;
        }
        protocol::GET_QUEUE_NUM => {
            let n = state.borrow().vrings.len() as u64;
            reply = Some(n.to_le_bytes().to_vec());
        }
        protocol::SET_MEM_TABLE => {
            handle_set_mem_table(state, &payload, fds)?;
        }
        protocol::SET_VRING_NUM => {
            let vs = messages::parse_vring_state(&payload).ok_or(protocol::Error::BadPayloadSize)?;
            let mut s = state.borrow_mut();
            let idx = vring_index(&s, vs.index)?;
            s.vrings[idx].set_size(vs.num as u16);
        }
        protocol::SET_VRING_ADDR => {
            let va = messages::parse_vring_addr(&payload).ok_or(protocol::Error::BadPayloadSize)?;
            let mut s = state.borrow_mut();
            let idx = vring_index(&s, va.index)?;
            s.vrings[idx].set_addr(EngineVringAddr {
                desc: va.desc,
                avail: va.avail,
                used: va.used,
            });
        }
        protocol::SET_VRING_BASE => {
            let vs = messages::parse_vring_state(&payload).ok_or(protocol::Error::BadPayloadSize)?;
            let mut s = state.borrow_mut();
            let idx = vring_index(&s, vs.index)?;
            s.vrings[idx].set_avail_base(vs.num as u16);
        }
        protocol::GET_VRING_BASE => {
            let vs = messages::parse_vring_state(&payload).ok_or(protocol::Error::BadPayloadSize)?;
            let mut s = state.borrow_mut();
            let idx = vring_index(&s, vs.index)?;
            let base = s.vrings[idx].get_vring_base_and_stop();
            if let Some(fd) = s.vrings[idx].take_kickfd() {
                drop(s);
                let _ = reactor.unregister(fd);
                let _ = nix::unistd::close(fd);
                s = state.borrow_mut();
            }
            let _ = s;
            reply = Some(messages::encode_vring_state(messages::VringState {
                index: vs.index,
                num: base as u32,
            }).to_vec());
        }
        protocol::SET_VRING_KICK => {
            let vfi = messages::parse_vring_fd_index(&payload).ok_or(protocol::Error::BadPayloadSize)?;
            let mut s = state.borrow_mut();
            let idx = vring_index(&s, vfi.index as u32)?;
            if let Some(old) = s.vrings[idx].take_kickfd() {
                let _ = reactor.unregister(old);
                let _ = nix::unistd::close(old);
            }
            if vfi.invalid_fd {
                log::warn!("vhost-user: vring {idx} kick fd omitted, polling mode unsupported");
            } else {
                let kickfd = *fds.first().ok_or(protocol::Error::BadPayloadSize)?;
                s.vrings[idx].set_kickfd(kickfd);
                drop(s);
                let state2 = state.clone();
                let _ = reactor.register(
                    kickfd,
                    Interest::READABLE,
                    Box::new(move |r, fd, _set| on_kick(&state2, r, fd, idx)),
                );
            }
        }
        protocol::SET_VRING_CALL => {
            let vfi = messages::parse_vring_fd_index(&payload).ok_or(protocol::Error::BadPayloadSize)?;
            let mut s = state.borrow_mut();
            let idx = vring_index(&s, vfi.index as u32)?;
            if let Some(old) = s.vrings[idx].take_callfd() {
                let _ = nix::unistd::close(old);
            }
            if let Some(callfd) = fds.first() {
                s.vrings[idx].set_callfd(*callfd);
            }
        }
        protocol::SET_VRING_ERR => {
            let vfi = messages::parse_vring_fd_index(&payload).ok_or(protocol::Error::BadPayloadSize)?;
            let mut s = state.borrow_mut();
            let idx = vring_index(&s, vfi.index as u32)?;
            if let Some(old) = s.vrings[idx].take_errfd() {
                let _ = reactor.unregister(old);
                let _ = nix::unistd::close(old);
            }
            if let Some(errfd) = fds.first() {
                s.vrings[idx].set_errfd(*errfd);
                let errfd = *errfd;
                drop(s);
                let _ = reactor.register(
                    errfd,
                    Interest::READABLE,
                    Box::new(move |_r, fd, _set| on_vring_err(fd, idx)),
                );
            }
        }
        protocol::SET_VRING_ENABLE => {
            let vs = messages::parse_vring_state(&payload).ok_or(protocol::Error::BadPayloadSize)?;
            let mut s = state.borrow_mut();
            let idx = vring_index(&s, vs.index)?;
            s.vrings[idx].set_enabled(vs.num != 0);
        }
        protocol::GET_CONFIG => {
            let config = state.borrow().device.config();
            reply = Some(encode_config_reply(&payload, config));
        }
        protocol::RESET_DEVICE => {
            // Graceful reinitialization, not a fatal teardown: the
            // connection and ownership survive, everything else (memory
            // map, vrings, negotiated protocol features) does not.
            reset_device_state(state, reactor, false);
        }
        other => return Err(protocol::Error::UnknownRequest(other)),
    }

    if let Some(payload) = reply {
        protocol::connection::send_reply(fd, req, &payload)?;
    } else if header.needs_reply_ack()
        && state.borrow().negotiated_protocol_features & protocol::PROTOCOL_F_REPLY_ACK != 0
    {
        protocol::connection::send_reply(fd, req, &0u64.to_le_bytes())?;
    }
    Ok(())
}

fn vring_index<B: BlockBackend>(s: &State<B>, index: u32) -> Result<usize, protocol::Error> {
    let idx = index as usize;
    if idx >= s.vrings.len() {
        return Err(protocol::Error::VringIndexOutOfRange(index as u8));
    }
    Ok(idx)
}

fn encode_config_reply(request_payload: &[u8], config: BlkConfig) -> Vec<u8> {
    if request_payload.len() < 12 {
        return Vec::new();
    }
    let offset = u32::from_le_bytes(request_payload[0..4].try_into().unwrap());
    let requested_size = u32::from_le_bytes(request_payload[4..8].try_into().unwrap());
    let flags = u32::from_le_bytes(request_payload[8..12].try_into().unwrap());
    let bytes = config.to_bytes();
    let size = requested_size.min(bytes.len() as u32);

    let mut out = vec![0u8; 12 + size as usize];
    out[0..4].copy_from_slice(&offset.to_le_bytes());
    out[4..8].copy_from_slice(&size.to_le_bytes());
    out[8..12].copy_from_slice(&flags.to_le_bytes());
    out[12..].copy_from_slice(&bytes[..size as usize]);
    out
}

/// Host page size, queried once per call rather than cached: cheap syscall,
/// and avoids a `OnceLock` for something that never changes at runtime.
fn page_size() -> u64 {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Unmaps every `Mapping` in `mappings`. Shared by `State::reset_memory`
/// (unwinding a previously committed table) and `handle_set_mem_table`
/// (unwinding a table that never made it that far).
fn unmap_all(mappings: impl IntoIterator<Item = Mapping>) {
    for m in mappings {
        // SAFETY: every mapping here was produced by `mmap` with this exact
        // length and isn't referenced by anything once this call runs.
        unsafe {
            let _ = munmap(std::ptr::NonNull::new_unchecked(m.hva as *mut _), m.len);
        }
    }
}

fn handle_set_mem_table<B: BlockBackend>(
    state: &Rc<RefCell<State<B>>>,
    payload: &[u8],
    fds: Vec<RawFd>,
) -> Result<(), protocol::Error> {
    let regions = messages::parse_memory_regions(payload).ok_or(protocol::Error::BadPayloadSize)?;
    if regions.len() != fds.len() {
        // Every fd in SCM_RIGHTS is either stored or closed this call, even
        // when the region count itself doesn't match.
        for fd in fds {
            let _ = nix::unistd::close(fd);
        }
        return Err(protocol::Error::BadPayloadSize);
    }

    let page = page_size();
    let mut new_mem = MemoryMap::new();
    let mut new_mappings = Vec::with_capacity(regions.len());
    let mut new_uva_regions = Vec::with_capacity(regions.len());
    let mut pairs = regions.iter().zip(fds);

    let install = (|| -> Result<(), protocol::Error> {
        for (region, fd) in pairs.by_ref() {
            if region.size == 0
                || region.guest_addr % page != 0
                || region.user_addr % page != 0
                || region.mmap_offset % page != 0
                || region.size % page != 0
            {
                // SAFETY: `fd` still needs closing even on a rejected region —
                // every fd in SCM_RIGHTS is either stored or closed this call.
                let _ = nix::unistd::close(fd);
                return Err(protocol::Error::BadPayloadSize);
            }

            // SAFETY: `fd` is a file descriptor to guest memory handed over in
            // this message's ancillary data; closing `file` after `mmap` is
            // fine, the mapping outlives the fd per mmap(2).
            let file = unsafe { File::from_raw_fd(fd) };
            let len = NonZeroUsize::new(region.size as usize).ok_or(protocol::Error::BadPayloadSize)?;
            let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
            let flags = MapFlags::MAP_SHARED | MapFlags::MAP_NORESERVE;
            let ptr = unsafe { mmap(None, len, prot, flags, &file, region.mmap_offset as libc::off_t) }
                .map_err(|_| protocol::Error::BadPayloadSize)?;
            let hva = ptr.as_ptr() as *mut u8;

            // Recorded before `add_region` so a region `add_region` rejects
            // (overlap, table full) still has its mapping torn down by the
            // cleanup below instead of leaking it.
            new_mappings.push(Mapping {
                hva,
                len: region.size as usize,
            });
            new_mem
                .add_region(region.guest_addr, region.size, hva, false)
                .map_err(protocol::Error::Memory)?;
            new_uva_regions.push(UvaRegion {
                user_addr: region.user_addr,
                len: region.size,
                gpa: region.guest_addr,
            });
        }
        Ok(())
    })();

    if let Err(e) = install {
        // Regions after the one that failed never had their fd consumed by
        // the loop above; `RawFd` has no `Drop`, so close them here.
        for (_, fd) in pairs {
            let _ = nix::unistd::close(fd);
        }
        unmap_all(new_mappings);
        return Err(e);
    }

    let mut s = state.borrow_mut();
    s.reset_memory();
    s.mem = new_mem;
    s.mappings = new_mappings;
    s.uva_regions = new_uva_regions;
    for v in s.vrings.iter_mut() {
        v.stop();
    }
    Ok(())
}

fn on_kick<B: BlockBackend + 'static>(
    state: &Rc<RefCell<State<B>>>,
    _reactor: &mut Reactor<'_>,
    fd: RawFd,
    idx: usize,
) {
    let mut buf = [0u8; 8];
    let _ = nix::unistd::read(fd, &mut buf);

    let mut s = state.borrow_mut();
    let State { mem, uva_regions, vrings, device, .. } = &mut *s;
    let vring = &mut vrings[idx];
    if !vring.enabled() {
        return;
    }
    if !vring.is_started() {
        if !vring.is_configured() {
            log::warn!("vring {idx}: kick on a not-yet-configured ring");
            return;
        }
        if let Err(e) = vring.start(mem, |uva| translate_uva(uva_regions, uva)) {
            log::error!("vring {idx}: failed to start: {e}");
            return;
        }
    }

    match device.process_vring(vring, mem) {
        Ok(true) => {
            if let Some(callfd) = vring.callfd() {
                let _ = nix::unistd::write(callfd, &1u64.to_le_bytes());
            }
        }
        Ok(false) => {}
        Err(e) => log::error!("vring {idx}: processing error: {e}"),
    }
}

fn on_vring_err(fd: RawFd, idx: usize) {
    let mut buf = [0u8; 8];
    let _ = nix::unistd::read(fd, &mut buf);
    log::warn!("vring {idx}: driver signalled an error on errfd");
}
