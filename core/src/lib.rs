//! ferricd core
//!
//! The readiness-driven heart of the ferricd IRC daemon: a portable
//! socket engine, an asynchronous DNS resolver speaking RFC 1035 over
//! UDP, a typed extension registry for module state, structured
//! numeric replies, and the command dispatcher that ties a client
//! connection to all of them.
//!
//! The core is single-threaded and cooperative. One thread owns every
//! subsystem; the only blocking call is the engine's `dispatch`.

pub mod buffer;
pub mod channel;
pub mod client;
pub mod clock;
pub mod command;
pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod event;
pub mod extensible;
pub mod message;
pub mod module;
pub mod numeric;
pub mod server;
pub mod stats;
pub mod timer;
pub mod user;

pub use buffer::{RecvQueue, SendQueue};
pub use channel::{Channel, Membership};
pub use client::ClientConn;
pub use clock::{ClockSource, ManualClock, MonotonicClock};
pub use command::{CommandEntry, CommandResult, CommandTable};
pub use config::{Config, DnsConfig, ListenConfig, ModuleBlock, OperatorConfig, ServerConfig};
pub use dns::{Dns, DnsCache, QueryType, Resolver, ResolverError};
#[cfg(target_os = "linux")]
pub use engine::EpollBackend;
pub use engine::{Backend, PollBackend, SocketEngine, EXIT_STATUS_SOCKETENGINE};
pub use error::{Error, Result};
pub use event::{EventHandler, EventMask};
pub use extensible::{
    bool_ext_item, int_ext_item, string_ext_item, ExtId, ExtItem, Extensible, ExtensionItem,
    ExtensionRegistry, ExtensionType, SyncSink,
};
pub use message::{Message, Prefix};
pub use module::{CoreEvent, EventKind, Module, ModuleManager};
pub use numeric::Numeric;
pub use server::{Core, Server};
pub use stats::ServerStats;
pub use timer::{TimerEvent, TimerId, TimerManager};
pub use user::{ClientState, User};

/// Re-exports for convenience
pub use tracing::{debug, error, info, warn};
