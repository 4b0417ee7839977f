//! Per-connection client handler
//!
//! One [`ClientConn`] per accepted socket: it accumulates input into
//! lines for the dispatcher, queues output with backpressure through
//! the engine's write mask, and carries the [`User`] state machine
//! from `Connecting` through `Registered` to `Closed`.

use crate::buffer::{RecvQueue, SendQueue};
use crate::command;
use crate::dns::{QueryType, Resolver, ResolverError};
use crate::event::{EventHandler, EventMask};
use crate::message::Message;
use crate::numeric::Numeric;
use crate::server::Core;
use crate::user::{ClientState, User};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use tracing::{debug, trace};

/// State for one client socket
pub struct ClientConn {
    fd: RawFd,
    stream: TcpStream,
    mask: EventMask,
    recvq: RecvQueue,
    sendq: SendQueue,
    pub user: User,
}

impl ClientConn {
    pub fn new(stream: TcpStream, core: &Core) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        let ip = stream.peer_addr()?.ip();
        let fd = stream.as_raw_fd();
        Ok(Self {
            fd,
            stream,
            mask: EventMask::NONE,
            recvq: RecvQueue::new(core.config.listen.recvq_max),
            sendq: SendQueue::new(core.config.listen.sendq_max),
            user: User::new(ip),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Queue a raw line and try to flush it
    pub fn send_line(&mut self, core: &Core, line: &str) {
        if matches!(self.user.state, ClientState::Closed) {
            return;
        }
        self.sendq.push(line.as_bytes().to_vec());
        self.try_flush(core);
    }

    pub fn send_message(&mut self, core: &Core, msg: &Message) {
        self.send_line(core, &msg.to_line());
    }

    /// Send a numeric with the server prefix, targeted at this user
    pub fn send_numeric(&mut self, core: &Core, numeric: Numeric) {
        let mut msg = numeric.to_message(self.user.display_nick());
        msg.prefix = Some(crate::Prefix::Server(core.config.server.name.clone()));
        self.send_message(core, &msg);
    }

    /// Complete registration if NICK, USER and the hostname challenge
    /// have all landed; emits the welcome burst exactly once.
    pub fn try_complete_registration(&mut self, core: &Core) {
        if !self.user.try_register() {
            return;
        }
        let nick = self.user.display_nick().to_string();
        let username = self.user.username.clone();
        let host = self.user.host.clone();
        let server = &core.config.server;
        debug!(nick = %nick, host = %host, "client registered");
        self.send_numeric(core, Numeric::welcome(&nick, &username, &host));
        self.send_numeric(core, Numeric::your_host(&server.name, env!("CARGO_PKG_VERSION")));
        self.send_numeric(core, Numeric::created(&server.created));
        self.send_numeric(
            core,
            Numeric::my_info(&server.name, env!("CARGO_PKG_VERSION"), "Do", "lnt"),
        );
    }

    /// Flush the send queue; on a short or blocked write, record
    /// WRITE_WILL_BLOCK and ask for a one-shot write notification.
    fn try_flush(&mut self, core: &Core) {
        while let Some(chunk) = self.sendq.pop() {
            match self.stream.write(&chunk) {
                Ok(n) => {
                    core.stats.record_sent(n);
                    if n < chunk.len() {
                        self.sendq.push_front(chunk[n..].to_vec());
                        self.want_write(core);
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.sendq.push_front(chunk);
                    self.want_write(core);
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    self.sendq.push_front(chunk);
                }
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "write failed");
                    self.close(core, "Write error");
                    return;
                }
            }
        }
        if matches!(self.user.state, ClientState::Quitting) {
            self.close(core, "Client quit");
        }
    }

    fn want_write(&mut self, core: &Core) {
        let mask = self.mask | EventMask::WRITE_WILL_BLOCK | EventMask::FAST_WRITE;
        core.engine.set_mask(self, mask);
    }

    /// Begin a graceful shutdown: flush what we can, then close
    pub fn quit(&mut self, core: &Core, reason: &str) {
        if matches!(self.user.state, ClientState::Quitting | ClientState::Closed) {
            return;
        }
        self.user.state = ClientState::Quitting;
        let error = Message::new("ERROR", vec![format!("Closing link: ({})", reason)]);
        self.sendq.push(error.to_line().into_bytes());
        self.broadcast_quit(core, reason);
        self.try_flush(core);
    }

    /// Tear the connection down and unhook it from every table
    pub fn close(&mut self, core: &Core, reason: &str) {
        if matches!(self.user.state, ClientState::Closed) {
            return;
        }
        let was_quitting = matches!(self.user.state, ClientState::Quitting);
        self.user.state = ClientState::Closed;
        debug!(fd = self.fd, nick = self.user.display_nick(), reason, "closing connection");
        if !was_quitting {
            self.broadcast_quit(core, reason);
        }
        let _ = core.engine.del(self, true);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        if let Some(ref nick) = self.user.nick {
            core.nicks.borrow_mut().remove(&nick.to_lowercase());
        }
        core.clients.borrow_mut().remove(&self.fd);
    }

    /// Remove this user from every channel, telling the members
    fn broadcast_quit(&mut self, core: &Core, reason: &str) {
        let nick = self.user.display_nick().to_string();
        let channels: Vec<String> = self.user.channels.drain().collect();
        if channels.is_empty() {
            return;
        }
        let out = Message::with_prefix(
            self.user.prefix(),
            "QUIT",
            vec![reason.to_string()],
        );
        let mut audience = Vec::new();
        {
            let mut map = core.channels.borrow_mut();
            for name in &channels {
                if let Some(chan) = map.get_mut(name) {
                    chan.part(&nick);
                    audience.extend(chan.members.keys().cloned());
                    if chan.is_empty() {
                        map.remove(name);
                    }
                }
            }
        }
        audience.sort();
        audience.dedup();
        for other in audience {
            let fd = match core.nicks.borrow().get(&other).copied() {
                Some(fd) => fd,
                None => continue,
            };
            if fd == self.fd {
                continue;
            }
            let peer = core.clients.borrow().get(&fd).cloned();
            if let Some(peer) = peer {
                peer.borrow_mut().send_message(core, &out);
            }
        }
    }
}

impl EventHandler for ClientConn {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn event_mask(&self) -> EventMask {
        self.mask
    }

    fn set_event_mask(&mut self, mask: EventMask) {
        self.mask = mask;
    }

    fn on_readable(&mut self, core: &Core) {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.close(core, "Connection closed");
                    return;
                }
                Ok(n) => {
                    core.stats.record_recv(n);
                    if !self.recvq.push(&buf[..n]) {
                        self.close(core, "Input buffer exceeded");
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let mask = self.mask | EventMask::READ_WILL_BLOCK;
                    core.engine.set_mask(self, mask);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "read failed");
                    self.close(core, "Read error");
                    return;
                }
            }
        }
        for line in self.recvq.extract_lines() {
            if matches!(self.user.state, ClientState::Quitting | ClientState::Closed) {
                break;
            }
            match Message::parse(&line) {
                Ok(msg) => {
                    command::dispatch(core, self, &msg);
                }
                Err(e) => trace!(fd = self.fd, error = %e, "unparseable line"),
            }
        }
        if !matches!(self.user.state, ClientState::Closed) {
            self.try_flush(core);
        }
    }

    fn on_writable(&mut self, core: &Core) {
        self.try_flush(core);
    }

    fn on_error(&mut self, core: &Core, code: i32) {
        let reason = if code == 0 {
            "Connection closed".to_string()
        } else {
            std::io::Error::from_raw_os_error(code).to_string()
        };
        self.close(core, &reason);
    }
}

/// Consumer for the reverse-DNS challenge issued at accept time.
///
/// Success installs the hostname as the display host; failure keeps
/// the IP. Either way the registration gate is released.
pub struct HostResolver {
    client: Rc<RefCell<ClientConn>>,
}

impl HostResolver {
    pub fn new(client: Rc<RefCell<ClientConn>>) -> Self {
        Self { client }
    }
}

impl Resolver for HostResolver {
    fn on_complete(&mut self, core: &Core, answer: &str, _ttl: u32, cached: bool) {
        let mut client = self.client.borrow_mut();
        trace!(host = answer, cached, "reverse lookup complete");
        client.user.host = answer.to_string();
        client.user.lookup_done = true;
        client.try_complete_registration(core);
    }

    fn on_error(&mut self, core: &Core, kind: ResolverError, message: &str) {
        let mut client = self.client.borrow_mut();
        trace!(kind = %kind, message, "reverse lookup failed");
        client.user.lookup_done = true;
        client.try_complete_registration(core);
    }
}

/// Kick off the reverse lookup for a fresh connection
pub fn start_host_lookup(core: &Core, client: Rc<RefCell<ClientConn>>) {
    let ip = client.borrow().user.ip;
    let enabled = core.config.dns.enabled;
    if !enabled {
        let mut client = client.borrow_mut();
        client.user.lookup_done = true;
        client.try_complete_registration(core);
        return;
    }
    let consumer = Box::new(HostResolver::new(client));
    core.dns
        .borrow_mut()
        .lookup(core, QueryType::Ptr, &ip.to_string(), consumer);
}
