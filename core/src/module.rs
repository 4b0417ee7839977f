//! Module system
//!
//! Modules register commands, extensions and resolver consumers at
//! load time and are torn down in a fixed order at unload: DNS
//! consumers receive `FORCEUNLOAD`, extension values are deleted
//! across every live object, commands are dropped, and only then does
//! the module's own cleanup run.

use crate::error::{Error, Result};
use crate::server::Core;
use std::collections::HashMap;
use tracing::debug;

/// Events modules can subscribe to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A user has authenticated as an operator
    PostOper { nick: String },
    /// The server is re-reading its configuration
    Rehash,
    /// A module-scheduled timer fired, carrying its tag
    Timer { tag: String },
}

/// Subscription key for [`CoreEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PostOper,
    Rehash,
    Timer,
}

impl CoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CoreEvent::PostOper { .. } => EventKind::PostOper,
            CoreEvent::Rehash => EventKind::Rehash,
            CoreEvent::Timer { .. } => EventKind::Timer,
        }
    }
}

/// Trait implemented by every module
pub trait Module {
    /// Module name; also the owner tag on everything it registers
    fn name(&self) -> &str;

    /// Module version
    fn version(&self) -> &str {
        "0.1.0"
    }

    /// Module description
    fn description(&self) -> &str {
        ""
    }

    /// Called at load; register commands, extensions and resolvers
    /// here, tagging them with [`Module::name`].
    fn init(&mut self, core: &Core) -> Result<()>;

    /// Called after the core has deregistered everything the module
    /// owned
    fn cleanup(&mut self, _core: &Core) -> Result<()> {
        Ok(())
    }

    /// A subscribed event fired
    fn on_event(&mut self, _core: &Core, _event: &CoreEvent) {}
}

struct ModuleSlot {
    name: String,
    module: Box<dyn Module>,
}

/// Loaded-module table and event subscriptions.
///
/// Modules must not load or unload other modules from within their own
/// callbacks; the manager is borrowed for the duration of a callback.
#[derive(Default)]
pub struct ModuleManager {
    modules: Vec<ModuleSlot>,
    subscriptions: HashMap<EventKind, Vec<String>>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.modules.iter().any(|slot| slot.name == name)
    }

    pub fn loaded(&self) -> Vec<String> {
        self.modules.iter().map(|slot| slot.name.clone()).collect()
    }

    /// Record an initialized module. [`Core::load_module`] is the
    /// public entry point; it runs `init` before this is called so the
    /// module may use the registration surface freely.
    pub fn insert(&mut self, module: Box<dyn Module>) -> Result<()> {
        let name = module.name().to_string();
        if self.is_loaded(&name) {
            return Err(Error::Module(format!("module {} is already loaded", name)));
        }
        debug!(module = %name, version = module.version(), "module loaded");
        self.modules.push(ModuleSlot { name, module });
        Ok(())
    }

    /// Detach a module and drop its subscriptions. The caller runs
    /// the rest of the teardown; see [`Core::unload_module`].
    pub fn remove(&mut self, name: &str) -> Result<Box<dyn Module>> {
        let index = self
            .modules
            .iter()
            .position(|slot| slot.name == name)
            .ok_or_else(|| Error::Module(format!("module {} is not loaded", name)))?;
        for subscribers in self.subscriptions.values_mut() {
            subscribers.retain(|subscriber| subscriber != name);
        }
        Ok(self.modules.remove(index).module)
    }

    /// Subscribe a loaded module to an event kind
    pub fn subscribe(&mut self, module: &str, kind: EventKind) {
        let subscribers = self.subscriptions.entry(kind).or_default();
        if !subscribers.iter().any(|name| name == module) {
            subscribers.push(module.to_string());
        }
    }

    /// Deliver an event to every subscribed module.
    ///
    /// The manager stays borrowed while handlers run, so an event
    /// handler must not load, unload or subscribe modules; do that
    /// from `init` instead.
    pub fn fire(&mut self, core: &Core, event: &CoreEvent) {
        let targets = self
            .subscriptions
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for name in targets {
            if let Some(slot) = self.modules.iter_mut().find(|slot| slot.name == name) {
                slot.module.on_event(core, event);
            }
        }
    }
}
