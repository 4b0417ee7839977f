//! Socket engine: a readiness multiplexer over pluggable backends
//!
//! The engine owns the descriptor→handler table and drives every
//! registered [`EventHandler`]. Backends translate [`EventMask`]
//! strategies to whatever the native primitive supports: the epoll
//! backend uses edge-triggered mode where the mask permits it, the
//! poll backend is purely level-triggered.

#[cfg(target_os = "linux")]
mod epoll;
mod poll;

#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;
pub use poll::PollBackend;

use crate::error::{Error, Result};
use crate::event::{EventHandler, EventMask};
use crate::server::Core;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, warn};

/// Process exit status used when no backend can be initialized
pub const EXIT_STATUS_SOCKETENGINE: i32 = 10;

/// A handler slot in the descriptor table
pub type HandlerRef = Rc<RefCell<dyn EventHandler>>;

/// One readiness notification out of a backend
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// `Some(code)` for an error condition; hang-up is `Some(0)`
    pub error: Option<i32>,
}

/// Native multiplexer interface implemented per platform
pub trait Backend {
    fn name(&self) -> &'static str;

    /// Start watching `fd` with the translated form of `mask`
    fn add(&self, fd: RawFd, mask: EventMask) -> Result<()>;

    /// Move `fd` from `old` to `new`. Must issue nothing when the
    /// translated native event set is unchanged.
    fn modify(&self, fd: RawFd, old: EventMask, new: EventMask) -> Result<()>;

    /// Stop watching `fd`
    fn remove(&self, fd: RawFd) -> Result<()>;

    /// Block up to `max_wait_ms` and append readiness records to `out`
    fn wait(&self, out: &mut Vec<Readiness>, max_wait_ms: i32) -> Result<()>;
}

/// The descriptor table plus a backend.
///
/// All methods take `&self`; the table lives behind a `RefCell` and no
/// borrow of it is held while a handler callback runs, so callbacks may
/// freely add and remove descriptors.
pub struct SocketEngine {
    backend: Box<dyn Backend>,
    table: RefCell<Vec<Option<HandlerRef>>>,
    current_set_size: Cell<usize>,
    ready: RefCell<Vec<Readiness>>,
}

impl SocketEngine {
    /// Create an engine on the default backend for this platform
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        let backend: Box<dyn Backend> = Box::new(EpollBackend::new()?);
        #[cfg(not(target_os = "linux"))]
        let backend: Box<dyn Backend> = Box::new(PollBackend::new());
        Self::with_backend(backend)
    }

    /// Create an engine on an explicit backend
    pub fn with_backend(backend: Box<dyn Backend>) -> Result<Self> {
        let max = max_descriptors()?;
        debug!(backend = backend.name(), max_fds = max, "socket engine ready");
        let mut table = Vec::new();
        table.resize_with(max, || None);
        Ok(Self {
            backend,
            table: RefCell::new(table),
            current_set_size: Cell::new(0),
            ready: RefCell::new(Vec::with_capacity(1024)),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Number of descriptors currently registered
    pub fn len(&self) -> usize {
        self.current_set_size.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest descriptor the table can hold, exclusive
    pub fn max_fds(&self) -> usize {
        self.table.borrow().len()
    }

    /// Register a handler. Fails if the descriptor is out of range,
    /// already registered, or rejected by the backend.
    pub fn add(&self, handler: HandlerRef, mask: EventMask) -> Result<()> {
        let fd = handler.borrow().fd();
        self.check_range(fd)?;
        if self.table.borrow()[fd as usize].is_some() {
            return Err(Error::SocketEngine(format!(
                "attempt to add duplicate fd {}",
                fd
            )));
        }
        self.backend.add(fd, mask)?;
        handler.borrow_mut().set_event_mask(mask);
        self.table.borrow_mut()[fd as usize] = Some(handler);
        self.current_set_size.set(self.current_set_size.get() + 1);
        debug!(fd, "registered descriptor");
        Ok(())
    }

    /// Deregister a handler. With `force`, backend errors are
    /// suppressed (used while tearing down an already-closed fd).
    pub fn del(&self, handler: &dyn EventHandler, force: bool) -> Result<()> {
        let fd = handler.fd();
        self.check_range(fd)?;
        if let Err(e) = self.backend.remove(fd) {
            if !force {
                return Err(e);
            }
        }
        let occupied = self.table.borrow()[fd as usize].is_some();
        if occupied {
            self.table.borrow_mut()[fd as usize] = None;
            self.current_set_size.set(self.current_set_size.get() - 1);
            debug!(fd, "removed descriptor");
        } else if !force {
            return Err(Error::SocketEngine(format!("fd {} is not registered", fd)));
        }
        Ok(())
    }

    /// Update the desired events for a registered handler.
    ///
    /// Translates old→new into at most one backend call; the handler's
    /// mask field is rewritten either way.
    pub fn set_mask(&self, handler: &mut dyn EventHandler, new_mask: EventMask) {
        let old = handler.event_mask();
        if old == new_mask {
            return;
        }
        if let Err(e) = self.backend.modify(handler.fd(), old, new_mask) {
            warn!(fd = handler.fd(), error = %e, "failed to update event mask");
        }
        handler.set_event_mask(new_mask);
    }

    /// Block up to `max_wait_ms` and deliver callbacks.
    ///
    /// Per descriptor the delivery order is error, then read, then
    /// write; an error event suppresses read/write for that pass. A
    /// handler removed earlier in the pass is skipped. Returns the
    /// number of readiness records processed.
    pub fn dispatch(&self, core: &Core, max_wait_ms: i32) -> usize {
        let mut events = std::mem::take(&mut *self.ready.borrow_mut());
        events.clear();
        if let Err(e) = self.backend.wait(&mut events, max_wait_ms) {
            warn!(error = %e, "backend wait failed");
        }
        let count = events.len();

        for ev in &events {
            let handler = match self.lookup(ev.fd) {
                Some(h) => h,
                None => continue,
            };
            core.stats.total_events.set(core.stats.total_events.get() + 1);

            if let Some(code) = ev.error {
                core.stats.error_events.set(core.stats.error_events.get() + 1);
                handler.borrow_mut().on_error(core, code);
                continue;
            }
            if ev.readable {
                self.clear_bits(
                    &handler,
                    EventMask::READ_WILL_BLOCK | EventMask::FAST_READ,
                );
                core.stats.read_events.set(core.stats.read_events.get() + 1);
                handler.borrow_mut().on_readable(core);
            }
            if ev.writable {
                // The read callback may have torn this handler down.
                if !self.still_registered(ev.fd, &handler) {
                    continue;
                }
                self.clear_bits(
                    &handler,
                    EventMask::WRITE_WILL_BLOCK | EventMask::FAST_WRITE,
                );
                core.stats.write_events.set(core.stats.write_events.get() + 1);
                handler.borrow_mut().on_writable(core);
            }
        }

        events.clear();
        *self.ready.borrow_mut() = events;
        count
    }

    fn lookup(&self, fd: RawFd) -> Option<HandlerRef> {
        let table = self.table.borrow();
        table.get(fd as usize).and_then(|slot| slot.clone())
    }

    fn still_registered(&self, fd: RawFd, handler: &HandlerRef) -> bool {
        let table = self.table.borrow();
        match table.get(fd as usize) {
            Some(Some(current)) => Rc::ptr_eq(current, handler),
            _ => false,
        }
    }

    /// Drop WILL_BLOCK bookkeeping and one-shot bits before delivery
    fn clear_bits(&self, handler: &HandlerRef, bits: EventMask) {
        let mut h = handler.borrow_mut();
        let old = h.event_mask();
        let new = old.without(bits);
        if new != old {
            if let Err(e) = self.backend.modify(h.fd(), old, new) {
                warn!(fd = h.fd(), error = %e, "failed to clear event bits");
            }
            h.set_event_mask(new);
        }
    }

    fn check_range(&self, fd: RawFd) -> Result<()> {
        if fd < 0 || fd as usize >= self.max_fds() {
            return Err(Error::SocketEngine(format!(
                "fd {} out of range (max {})",
                fd,
                self.max_fds()
            )));
        }
        Ok(())
    }
}

/// Size the descriptor table from the process rlimit, clamped so an
/// unbounded or absurd limit cannot balloon the table
fn max_descriptors() -> Result<usize> {
    const TABLE_CAP: usize = 1 << 16;
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return Err(Error::SocketEngine(
            "cannot determine maximum number of open sockets".to_string(),
        ));
    }
    if limit.rlim_cur == libc::RLIM_INFINITY {
        return Ok(TABLE_CAP);
    }
    Ok((limit.rlim_cur as usize).min(TABLE_CAP))
}

/// Fetch and clear the pending error on a socket
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut code: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut code as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        code
    }
}
