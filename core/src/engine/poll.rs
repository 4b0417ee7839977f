//! Portable poll(2) backend
//!
//! Purely level-triggered: edge requests degrade to level delivery and
//! one-shot semantics are enforced by the engine clearing `FAST_*`
//! bits on delivery.

use super::{socket_error, Backend, Readiness};
use crate::error::{Error, Result};
use crate::event::EventMask;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;

#[derive(Default)]
pub struct PollBackend {
    interest: RefCell<HashMap<RawFd, EventMask>>,
}

impl PollBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn mask_to_poll(mask: EventMask) -> libc::c_short {
    let mut events = 0;
    if mask.intersects(EventMask::POLL_READ | EventMask::FAST_READ | EventMask::EDGE_READ) {
        events |= libc::POLLIN;
    }
    if mask.intersects(EventMask::POLL_WRITE | EventMask::FAST_WRITE | EventMask::EDGE_WRITE) {
        events |= libc::POLLOUT;
    }
    events
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn add(&self, fd: RawFd, mask: EventMask) -> Result<()> {
        let mut interest = self.interest.borrow_mut();
        if interest.contains_key(&fd) {
            return Err(Error::SocketEngine(format!(
                "fd {} already watched by poll backend",
                fd
            )));
        }
        interest.insert(fd, mask);
        Ok(())
    }

    fn modify(&self, fd: RawFd, _old: EventMask, new: EventMask) -> Result<()> {
        match self.interest.borrow_mut().get_mut(&fd) {
            Some(mask) => {
                *mask = new;
                Ok(())
            }
            None => Err(Error::SocketEngine(format!(
                "fd {} is not watched by poll backend",
                fd
            ))),
        }
    }

    fn remove(&self, fd: RawFd) -> Result<()> {
        match self.interest.borrow_mut().remove(&fd) {
            Some(_) => Ok(()),
            None => Err(Error::SocketEngine(format!(
                "fd {} is not watched by poll backend",
                fd
            ))),
        }
    }

    fn wait(&self, out: &mut Vec<Readiness>, max_wait_ms: i32) -> Result<()> {
        let mut fds: Vec<libc::pollfd> = self
            .interest
            .borrow()
            .iter()
            .map(|(&fd, &mask)| libc::pollfd {
                fd,
                events: mask_to_poll(mask),
                revents: 0,
            })
            .collect();
        if fds.is_empty() {
            // Nothing to watch; still honour the wait so callers do
            // not spin.
            if max_wait_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(max_wait_ms as u64));
            }
            return Ok(());
        }

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, max_wait_ms) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Error::SocketEngine(format!("poll failed: {}", err)));
        }
        for pfd in fds.iter().filter(|pfd| pfd.revents != 0) {
            let revents = pfd.revents;
            let error = if revents & libc::POLLHUP != 0 || revents & libc::POLLNVAL != 0 {
                Some(0)
            } else if revents & libc::POLLERR != 0 {
                Some(socket_error(pfd.fd))
            } else {
                None
            };
            out.push(Readiness {
                fd: pfd.fd,
                readable: revents & libc::POLLIN != 0,
                writable: revents & libc::POLLOUT != 0,
                error,
            });
        }
        Ok(())
    }
}
