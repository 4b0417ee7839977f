//! Linux epoll backend
//!
//! Edge-triggered mode (EPOLLET) is used only when no `POLL_*` bit is
//! present for the descriptor; a level-polled descriptor stays in level
//! mode for both directions.

use super::{socket_error, Backend, Readiness};
use crate::error::{Error, Result};
use crate::event::EventMask;
use std::cell::RefCell;
use std::os::unix::io::RawFd;

const EVENT_CAPACITY: usize = 1024;

pub struct EpollBackend {
    epfd: RawFd,
    buf: RefCell<Vec<libc::epoll_event>>,
}

impl EpollBackend {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::SocketEngine(format!(
                "could not initialize epoll: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            epfd,
            buf: RefCell::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                EVENT_CAPACITY
            ]),
        })
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

fn mask_to_epoll(mask: EventMask) -> u32 {
    let mut events = 0;
    if mask.intersects(EventMask::POLL_READ | EventMask::POLL_WRITE) {
        // Level-triggered polling was requested for this descriptor.
        if mask.intersects(EventMask::POLL_READ | EventMask::FAST_READ) {
            events |= libc::EPOLLIN as u32;
        }
        if mask.intersects(EventMask::POLL_WRITE | EventMask::FAST_WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
    } else {
        events = libc::EPOLLET as u32;
        if mask.intersects(EventMask::FAST_READ | EventMask::EDGE_READ) {
            events |= libc::EPOLLIN as u32;
        }
        if mask.intersects(EventMask::FAST_WRITE | EventMask::EDGE_WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
    }
    events
}

fn ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
    let mut ev = libc::epoll_event {
        events,
        u64: fd as u64,
    };
    let rc = unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) };
    if rc < 0 {
        return Err(Error::SocketEngine(format!(
            "epoll_ctl on fd {} failed: {}",
            fd,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn add(&self, fd: RawFd, mask: EventMask) -> Result<()> {
        ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, mask_to_epoll(mask))
    }

    fn modify(&self, fd: RawFd, old: EventMask, new: EventMask) -> Result<()> {
        let old_events = mask_to_epoll(old);
        let new_events = mask_to_epoll(new);
        if old_events == new_events {
            return Ok(());
        }
        ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, new_events)
    }

    fn remove(&self, fd: RawFd) -> Result<()> {
        ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn wait(&self, out: &mut Vec<Readiness>, max_wait_ms: i32) -> Result<()> {
        let mut buf = self.buf.borrow_mut();
        let n = unsafe {
            libc::epoll_wait(self.epfd, buf.as_mut_ptr(), buf.len() as libc::c_int, max_wait_ms)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Error::SocketEngine(format!("epoll_wait failed: {}", err)));
        }
        for ev in buf.iter().take(n as usize) {
            let fd = ev.u64 as RawFd;
            let flags = ev.events;
            let error = if flags & libc::EPOLLHUP as u32 != 0 {
                Some(0)
            } else if flags & libc::EPOLLERR as u32 != 0 {
                Some(socket_error(fd))
            } else {
                None
            };
            out.push(Readiness {
                fd,
                readable: flags & libc::EPOLLIN as u32 != 0,
                writable: flags & libc::EPOLLOUT as u32 != 0,
                error,
            });
        }
        Ok(())
    }
}
