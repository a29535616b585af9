//! Single-threaded, cooperative fd multiplexer.
//!
//! The one property that makes this worth hand-rolling instead of reaching
//! for a generic poller: `unregister` must be safe to call from inside a
//! callback that is itself running as part of the current `wait()` batch,
//! including for a fd whose event is still later in that same batch. The
//! vhost-user control plane relies on this to tear a device down (closing
//! kick/call/err fds and the control socket) from within a kick callback.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Io(#[from] std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Interest a registration wants to be woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub hangup: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        hangup: false,
    };

    fn to_event_set(self) -> EventSet {
        let mut set = EventSet::empty();
        if self.readable {
            set |= EventSet::IN;
        }
        if self.hangup {
            set |= EventSet::HANG_UP;
        }
        set
    }
}

/// Callback invoked when a registered fd becomes ready. Takes `&mut Reactor`
/// so it can register/unregister fds (including itself) while running —
/// callbacks run to completion, there is no preemption, so this reentrance
/// is always single-threaded and well-ordered.
pub type Callback<'a> = Box<dyn FnMut(&mut Reactor<'a>, RawFd, EventSet) + 'a>;

const MAX_BATCH: usize = 64;

pub struct Reactor<'a> {
    epoll: Epoll,
    callbacks: HashMap<RawFd, Callback<'a>>,
    /// The in-flight epoll_wait batch, so `unregister` can null out events
    /// for fds later in the same batch.
    batch: Vec<Option<EpollEvent>>,
    cursor: usize,
    /// fd whose callback is currently executing, if any.
    current: Option<RawFd>,
    /// Set by `unregister(fd)` when `fd == current` — tells the dispatch
    /// loop not to put the callback back once it returns.
    current_removed: bool,
    running: bool,
}

impl<'a> Reactor<'a> {
    pub fn new() -> Result<Self, Error> {
        Ok(Reactor {
            epoll: Epoll::new()?,
            callbacks: HashMap::new(),
            batch: Vec::new(),
            cursor: 0,
            current: None,
            current_removed: false,
            running: false,
        })
    }

    /// Registers `fd` for `interest`, invoking `callback` on every matching
    /// event. Replaces any existing registration for `fd`.
    pub fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: Callback<'a>,
    ) -> Result<(), Error> {
        let op = if self.callbacks.contains_key(&fd) {
            ControlOperation::Modify
        } else {
            ControlOperation::Add
        };
        self.epoll
            .ctl(op, fd, EpollEvent::new(interest.to_event_set(), fd as u64))?;
        self.callbacks.insert(fd, callback);
        Ok(())
    }

    /// Deregisters `fd`. Safe to call from within any callback, including
    /// the callback for `fd` itself, and regardless of whether `fd`'s event
    /// is still pending later in the batch currently being dispatched.
    pub fn unregister(&mut self, fd: RawFd) -> Result<(), Error> {
        // ENOENT/EBADF here just mean the kernel already dropped fd (e.g.
        // it was closed before we got to unregistering it); either way the
        // bookkeeping below still has to run.
        let _ = self.epoll.ctl(
            ControlOperation::Delete,
            fd,
            EpollEvent::new(EventSet::empty(), 0),
        );
        self.callbacks.remove(&fd);
        if self.current == Some(fd) {
            self.current_removed = true;
        }
        for slot in self.batch.iter_mut().skip(self.cursor) {
            if let Some(ev) = slot {
                if ev.data() as RawFd == fd {
                    *slot = None;
                }
            }
        }
        Ok(())
    }

    fn dispatch_batch(&mut self) {
        while self.cursor < self.batch.len() {
            let ev = self.batch[self.cursor].take();
            self.cursor += 1;
            let Some(ev) = ev else { continue };
            let fd = ev.data() as RawFd;

            let Some(mut cb) = self.callbacks.remove(&fd) else {
                continue;
            };
            self.current = Some(fd);
            self.current_removed = false;

            cb(self, fd, ev.event_set());

            let removed = self.current_removed;
            self.current = None;
            if !removed && !self.callbacks.contains_key(&fd) {
                self.callbacks.insert(fd, cb);
            }
        }
        self.batch.clear();
    }

    /// Blocks until at least one registered fd is ready, dispatching every
    /// ready fd's callback once.
    pub fn poll_once(&mut self, timeout_ms: i32) -> Result<(), Error> {
        let mut raw = vec![EpollEvent::new(EventSet::empty(), 0); MAX_BATCH];
        let n = self.epoll.wait(MAX_BATCH, timeout_ms, &mut raw)?;
        self.batch = raw[..n].iter().copied().map(Some).collect();
        self.cursor = 0;
        self.dispatch_batch();
        Ok(())
    }

    /// Runs `poll_once` in a loop until `stop` is called from a callback.
    pub fn run(&mut self) -> Result<(), Error> {
        self.running = true;
        while self.running {
            self.poll_once(-1)?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    #[cfg(test)]
    fn set_batch_for_test(&mut self, batch: Vec<Option<EpollEvent>>) {
        self.batch = batch;
        self.cursor = 0;
    }
}
