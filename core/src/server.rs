//! Core context and run loop
//!
//! [`Core`] is the explicit context every subsystem receives: the
//! socket engine, timers, resolver, extension registry, command table
//! and live client/channel state. There is no global instance; tests
//! build a fresh one per case.
//!
//! The model is single-threaded cooperative. The only blocking call is
//! `dispatch`; everything else runs as short callbacks between passes.
//! Shared pieces live behind `RefCell` and no borrow is held across a
//! callback.

use crate::channel::Channel;
use crate::client::{self, ClientConn};
use crate::clock::{ClockSource, MonotonicClock};
use crate::command::{CommandEntry, CommandTable};
use crate::config::Config;
use crate::dns::Dns;
use crate::engine::SocketEngine;
use crate::error::Result;
use crate::event::{EventHandler, EventMask};
use crate::extensible::ExtensionRegistry;
use crate::module::{CoreEvent, EventKind, ModuleManager};
use crate::stats::ServerStats;
use crate::timer::{TimerEvent, TimerManager};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Everything the core owns, passed explicitly into every subsystem
pub struct Core {
    pub config: Config,
    pub clock: Box<dyn ClockSource>,
    pub engine: SocketEngine,
    pub timers: RefCell<TimerManager>,
    pub dns: Rc<RefCell<Dns>>,
    pub stats: ServerStats,
    pub registry: RefCell<ExtensionRegistry>,
    pub commands: RefCell<CommandTable>,
    pub clients: RefCell<HashMap<RawFd, Rc<RefCell<ClientConn>>>>,
    pub nicks: RefCell<HashMap<String, RawFd>>,
    pub channels: RefCell<HashMap<String, Channel>>,
    pub modules: RefCell<ModuleManager>,
    running: Cell<bool>,
}

impl Core {
    /// Build a core on the default engine backend and wall clock
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Box::new(MonotonicClock::new()))
    }

    /// Build a core with an explicit clock (tests use [`crate::ManualClock`])
    pub fn with_clock(config: Config, clock: Box<dyn ClockSource>) -> Result<Self> {
        let engine = SocketEngine::new()?;
        Self::with_parts(config, clock, engine)
    }

    /// Build a core from explicit parts
    pub fn with_parts(
        config: Config,
        clock: Box<dyn ClockSource>,
        engine: SocketEngine,
    ) -> Result<Self> {
        let dns = Rc::new(RefCell::new(Dns::new(&config.dns)?));
        let mut commands = CommandTable::new();
        commands.register_builtins();

        let core = Self {
            config,
            clock,
            engine,
            timers: RefCell::new(TimerManager::new()),
            dns,
            stats: ServerStats::new(),
            registry: RefCell::new(ExtensionRegistry::new()),
            commands: RefCell::new(commands),
            clients: RefCell::new(HashMap::new()),
            nicks: RefCell::new(HashMap::new()),
            channels: RefCell::new(HashMap::new()),
            modules: RefCell::new(ModuleManager::new()),
            running: Cell::new(false),
        };

        if core.dns.borrow().is_open() {
            let handler: Rc<RefCell<dyn EventHandler>> = core.dns.clone();
            core.engine.add(handler, EventMask::POLL_READ)?;
        } else if core.config.dns.enabled {
            warn!("starting without a usable resolver socket");
        }

        let now = core.clock.now();
        core.timers
            .borrow_mut()
            .add(now, 3600, true, TimerEvent::DnsCachePrune);
        Ok(core)
    }

    /// Monotonic seconds
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Register a command on behalf of a module or the core
    pub fn register_command(&self, entry: CommandEntry) -> Result<()> {
        self.commands.borrow_mut().register(entry)
    }

    /// Subscribe a module to a core event kind
    pub fn subscribe_event(&self, module: &str, kind: EventKind) {
        self.modules.borrow_mut().subscribe(module, kind);
    }

    /// Load a module: run its `init` (which may register commands,
    /// extensions and resolvers), then record it.
    pub fn load_module(&self, mut module: Box<dyn crate::Module>) -> Result<()> {
        let name = module.name().to_string();
        if self.modules.borrow().is_loaded(&name) {
            return Err(crate::Error::Module(format!(
                "module {} is already loaded",
                name
            )));
        }
        module.init(self)?;
        self.modules.borrow_mut().insert(module)
    }

    /// Unload a module. Teardown order: prevent new operations, fire
    /// FORCEUNLOAD on its resolver consumers, delete its extension
    /// values everywhere, drop its commands, then run its cleanup.
    pub fn unload_module(&self, name: &str) -> Result<()> {
        let mut module = self.modules.borrow_mut().remove(name)?;
        self.dns.borrow_mut().clean_resolvers(self, name);
        self.purge_module_extensions(name);
        self.commands.borrow_mut().remove_owned(name);
        if let Err(e) = module.cleanup(self) {
            warn!(module = name, error = %e, "module cleanup failed");
        }
        debug!(module = name, "module unloaded");
        Ok(())
    }

    /// Deliver an event to subscribed modules
    pub fn fire_event(&self, event: &CoreEvent) {
        self.modules.borrow_mut().fire(self, event);
    }

    /// Drain due timers and route their events
    pub fn run_timers(&self) {
        let now = self.now();
        let due = self.timers.borrow_mut().tick(now);
        for (_, event) in due {
            match event {
                TimerEvent::DnsRequestTimeout(id) => {
                    self.dns.borrow_mut().handle_timeout(self, id);
                }
                TimerEvent::DnsCachePrune => {
                    self.dns.borrow_mut().prune(now);
                }
                TimerEvent::Module(tag) => {
                    self.fire_event(&CoreEvent::Timer { tag });
                }
            }
        }
    }

    /// Unregister every extension owned by `module` and delete its
    /// values across all live users, channels and memberships.
    pub fn purge_module_extensions(&self, module: &str) {
        let keys = self.registry.borrow().keys_owned_by(module);
        for key in keys {
            let removed = self.registry.borrow_mut().unregister(&key);
            let (id, _item) = match removed {
                Some(removed) => removed,
                None => continue,
            };
            for peer in self.clients.borrow().values() {
                peer.borrow_mut().user.extensions.clear(id);
            }
            for chan in self.channels.borrow_mut().values_mut() {
                chan.extensions.clear(id);
                for membership in chan.members.values_mut() {
                    membership.extensions.clear(id);
                }
            }
            debug!(module, key = %key, "extension purged");
        }
    }

    /// Serialization hook for link modules: every syncable-or-not
    /// extension value across all extensibles, in internal form, as
    /// (container, key, value) triples.
    pub fn sync_extensions(&self) -> Vec<(String, String, String)> {
        let registry = self.registry.borrow();
        let mut out = Vec::new();
        for peer in self.clients.borrow().values() {
            let peer = peer.borrow();
            let ident = peer.user.extensions.ident().to_string();
            for (key, value) in registry.serialize(&peer.user.extensions) {
                out.push((ident.clone(), key, value));
            }
        }
        for chan in self.channels.borrow().values() {
            for (key, value) in registry.serialize(&chan.extensions) {
                out.push((chan.name.clone(), key, value));
            }
            for membership in chan.members.values() {
                let ident = membership.extensions.ident().to_string();
                for (key, value) in registry.serialize(&membership.extensions) {
                    out.push((ident.clone(), key, value));
                }
            }
        }
        out
    }

    /// Ask the run loop to stop after the current pass
    pub fn shutdown(&self) {
        self.running.set(false);
    }
}

/// The client listener, itself just another event handler
struct Listener {
    listener: TcpListener,
    mask: EventMask,
}

impl EventHandler for Listener {
    fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn event_mask(&self) -> EventMask {
        self.mask
    }

    fn set_event_mask(&mut self, mask: EventMask) {
        self.mask = mask;
    }

    fn on_readable(&mut self, core: &Core) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, "accepted connection");
                    accept_client(core, stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

fn accept_client(core: &Core, stream: std::net::TcpStream) {
    core.stats.record_accept();
    let conn = match ClientConn::new(stream, core) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "could not set up connection");
            return;
        }
    };
    let fd = conn.fd();
    let rc = Rc::new(RefCell::new(conn));
    let handler: Rc<RefCell<dyn EventHandler>> = rc.clone();
    if let Err(e) = core.engine.add(handler, EventMask::POLL_READ) {
        // Registration failure drops the connection on the floor.
        warn!(fd, error = %e, "could not register connection");
        return;
    }
    core.clients.borrow_mut().insert(fd, rc.clone());
    client::start_host_lookup(core, rc);
}

/// The daemon: a core plus its client listener
pub struct Server {
    core: Core,
    local_addr: SocketAddr,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_core(Core::new(config)?)
    }

    /// Bind the listener configured in the core and register it
    pub fn with_core(core: Core) -> Result<Self> {
        let listener = TcpListener::bind(&core.config.listen.address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let handler: Rc<RefCell<dyn EventHandler>> = Rc::new(RefCell::new(Listener {
            listener,
            mask: EventMask::NONE,
        }));
        core.engine.add(handler, EventMask::POLL_READ)?;
        info!(%local_addr, backend = core.engine.backend_name(), "listening");
        Ok(Self { core, local_addr })
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// One engine pass plus a timer drain; returns delivered events
    pub fn run_once(&self, max_wait_ms: i32) -> usize {
        let count = self.core.engine.dispatch(&self.core, max_wait_ms);
        self.core.run_timers();
        count
    }

    /// Drive the server until [`Core::shutdown`] is called
    pub fn run(&self) {
        self.core.running.set(true);
        info!(server = %self.core.config.server.name, "server running");
        while self.core.running.get() {
            self.run_once(1000);
        }
        info!("server stopped");
    }

    /// Re-read runtime settings: reopen the resolver socket, prune the
    /// cache and tell subscribed modules.
    pub fn rehash(&self) -> Result<()> {
        info!("rehashing");
        let core = &self.core;
        {
            let dns = core.dns.borrow();
            if dns.fd() >= 0 {
                let _ = core.engine.del(&*dns, true);
            }
        }
        let now = core.now();
        core.dns.borrow_mut().rehash(&core.config.dns, now)?;
        if core.dns.borrow().is_open() {
            let handler: Rc<RefCell<dyn EventHandler>> = core.dns.clone();
            core.engine.add(handler, EventMask::POLL_READ)?;
        }
        core.fire_event(&CoreEvent::Rehash);
        Ok(())
    }
}
