//! Typed module attachments on users, channels and memberships
//!
//! Modules declare an extension once, at load time, and get back a
//! typed handle. Values live inside each [`Extensible`] as type-erased
//! boxes keyed by the extension id; dropping the box is the value's
//! deleter and runs exactly once per stored value.
//!
//! Three serializer axes exist per item: **internal** (lossless, used
//! for burst sync), **network** (push broadcasts; absent on items not
//! declared syncable) and **human** (operator inspection).

use crate::error::{Error, Result};
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

/// Identity of a registered extension within the registry
pub type ExtId = usize;

/// Which kind of object an extension may attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionType {
    User,
    Channel,
    Membership,
}

/// Receiver for extension change broadcasts to peer servers
pub trait SyncSink {
    fn extension_set(&mut self, extype: ExtensionType, container: &str, key: &str, value: &str);
    fn extension_unset(&mut self, extype: ExtensionType, container: &str, key: &str);
}

/// A registered extension definition.
///
/// One concrete record per extension: identity plus serializer
/// closures over the type-erased value. The network axis is derived
/// from the internal one when the item is syncable and absent
/// otherwise.
pub struct ExtensionItem {
    key: String,
    owner: String,
    extype: ExtensionType,
    synced: bool,
    to_internal: Box<dyn Fn(&dyn Any) -> Option<String>>,
    from_internal: Box<dyn Fn(&str) -> Option<Box<dyn Any>>>,
    to_human: Box<dyn Fn(&dyn Any) -> Option<String>>,
}

impl ExtensionItem {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn extype(&self) -> ExtensionType {
        self.extype
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    /// Serialize a raw value to the internal format
    pub fn serialize_internal(&self, value: &dyn Any) -> Option<String> {
        (self.to_internal)(value)
    }

    /// Deserialize a raw value from the internal format
    pub fn deserialize_internal(&self, value: &str) -> Option<Box<dyn Any>> {
        (self.from_internal)(value)
    }

    /// Serialize to the network format; `None` means "do not broadcast"
    pub fn serialize_network(&self, value: &dyn Any) -> Option<String> {
        if self.synced {
            (self.to_internal)(value)
        } else {
            None
        }
    }

    /// Serialize for operator display
    pub fn serialize_human(&self, value: &dyn Any) -> Option<String> {
        (self.to_human)(value)
    }
}

/// An object modules may attach typed state to
pub struct Extensible {
    extype: ExtensionType,
    ident: String,
    values: Vec<(ExtId, Box<dyn Any>)>,
}

impl Extensible {
    /// `ident` names the container in sync broadcasts (a nick, a
    /// channel name, or `nick:#channel` for memberships).
    pub fn new(extype: ExtensionType, ident: impl Into<String>) -> Self {
        Self {
            extype,
            ident: ident.into(),
            values: Vec::new(),
        }
    }

    pub fn extype(&self) -> ExtensionType {
        self.extype
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn rename(&mut self, ident: impl Into<String>) {
        self.ident = ident.into();
    }

    pub fn get_raw(&self, id: ExtId) -> Option<&dyn Any> {
        self.values
            .iter()
            .find(|(stored, _)| *stored == id)
            .map(|(_, value)| value.as_ref())
    }

    /// Store a value, returning the displaced one if any
    pub fn set_raw(&mut self, id: ExtId, value: Box<dyn Any>) -> Option<Box<dyn Any>> {
        for (stored, slot) in self.values.iter_mut() {
            if *stored == id {
                return Some(std::mem::replace(slot, value));
            }
        }
        self.values.push((id, value));
        None
    }

    /// Remove a value, returning it if it was set
    pub fn unset_raw(&mut self, id: ExtId) -> Option<Box<dyn Any>> {
        let pos = self.values.iter().position(|(stored, _)| *stored == id)?;
        Some(self.values.remove(pos).1)
    }

    /// Drop the value for `id` if present
    pub fn clear(&mut self, id: ExtId) {
        self.unset_raw(id);
    }

    /// Ids of every set extension
    pub fn set_ids(&self) -> impl Iterator<Item = ExtId> + '_ {
        self.values.iter().map(|(id, _)| *id)
    }
}

/// Process-wide table of extension definitions
#[derive(Default)]
pub struct ExtensionRegistry {
    items: Vec<Option<Rc<ExtensionItem>>>,
    by_key: HashMap<String, ExtId>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. The key must be globally unique.
    pub fn register(&mut self, item: ExtensionItem) -> Result<ExtId> {
        if self.by_key.contains_key(&item.key) {
            return Err(Error::Extension(format!(
                "extension key {:?} is already registered",
                item.key
            )));
        }
        let id = self.items.len();
        self.by_key.insert(item.key.clone(), id);
        self.items.push(Some(Rc::new(item)));
        Ok(id)
    }

    /// Remove a definition, preventing further operations through it.
    /// The caller is responsible for purging attached values from all
    /// live extensibles (see [`Extensible::clear`]).
    pub fn unregister(&mut self, key: &str) -> Option<(ExtId, Rc<ExtensionItem>)> {
        let id = self.by_key.remove(key)?;
        let item = self.items[id].take()?;
        Some((id, item))
    }

    pub fn get(&self, id: ExtId) -> Option<Rc<ExtensionItem>> {
        self.items.get(id).and_then(|slot| slot.clone())
    }

    pub fn find(&self, key: &str) -> Option<(ExtId, Rc<ExtensionItem>)> {
        let id = *self.by_key.get(key)?;
        Some((id, self.get(id)?))
    }

    /// Ids of every extension registered by `module`
    pub fn ids_owned_by(&self, module: &str) -> Vec<ExtId> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|item| (id, item)))
            .filter(|(_, item)| item.owner == module)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn keys_owned_by(&self, module: &str) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|slot| slot.as_ref())
            .filter(|item| item.owner == module)
            .map(|item| item.key.clone())
            .collect()
    }

    /// Serialize every set extension of `container` to the internal
    /// format, for the sync-on-burst walk.
    pub fn serialize(&self, container: &Extensible) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for id in container.set_ids() {
            if let Some(item) = self.get(id) {
                if let Some(value) = container.get_raw(id) {
                    if let Some(text) = item.serialize_internal(value) {
                        out.push((item.key.clone(), text));
                    }
                }
            }
        }
        out
    }

    /// Apply one internal-format value received in a burst
    pub fn deserialize(&self, container: &mut Extensible, key: &str, value: &str) -> bool {
        let (id, item) = match self.find(key) {
            Some(found) => found,
            None => return false,
        };
        if item.extype != container.extype() {
            return false;
        }
        match item.deserialize_internal(value) {
            Some(parsed) => {
                container.set_raw(id, parsed);
                true
            }
            None => false,
        }
    }
}

/// Typed handle to a registered extension.
///
/// Generated generically over the stored type; the serializer pair is
/// shared with the registry's type-erased closures.
pub struct ExtItem<T: 'static> {
    id: ExtId,
    key: String,
    extype: ExtensionType,
    synced: bool,
    format: fn(&T) -> String,
    parse: fn(&str) -> Option<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> ExtItem<T> {
    /// Register a new extension and return its typed handle.
    pub fn register(
        registry: &mut ExtensionRegistry,
        owner: &str,
        key: &str,
        extype: ExtensionType,
        synced: bool,
        format: fn(&T) -> String,
        parse: fn(&str) -> Option<T>,
    ) -> Result<Self> {
        let item = ExtensionItem {
            key: key.to_string(),
            owner: owner.to_string(),
            extype,
            synced,
            to_internal: Box::new(move |value: &dyn Any| value.downcast_ref::<T>().map(format)),
            from_internal: Box::new(move |text: &str| {
                parse(text).map(|value| Box::new(value) as Box<dyn Any>)
            }),
            to_human: Box::new(move |value: &dyn Any| value.downcast_ref::<T>().map(format)),
        };
        let id = registry.register(item)?;
        Ok(Self {
            id,
            key: key.to_string(),
            extype,
            synced,
            format,
            parse,
            _marker: PhantomData,
        })
    }

    pub fn id(&self) -> ExtId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn extype(&self) -> ExtensionType {
        self.extype
    }

    /// Read the value set on `container`, if any
    pub fn get<'a>(&self, container: &'a Extensible) -> Option<&'a T> {
        container.get_raw(self.id)?.downcast_ref::<T>()
    }

    /// Store a value. Refused (no-op) when the container is of a
    /// different extensible type. The displaced value, if any, is
    /// dropped here.
    pub fn set(&self, container: &mut Extensible, value: T) {
        if container.extype() != self.extype {
            return;
        }
        container.set_raw(self.id, Box::new(value));
    }

    /// Store a value and broadcast it when the item is syncable
    pub fn set_sync(&self, container: &mut Extensible, value: T, sink: &mut dyn SyncSink) {
        if container.extype() != self.extype {
            return;
        }
        if self.synced {
            let text = (self.format)(&value);
            sink.extension_set(self.extype, container.ident(), &self.key, &text);
        }
        container.set_raw(self.id, Box::new(value));
    }

    /// Remove the value, dropping it. Returns whether one was set.
    pub fn unset(&self, container: &mut Extensible) -> bool {
        if container.extype() != self.extype {
            return false;
        }
        container.unset_raw(self.id).is_some()
    }

    /// Remove the value and broadcast the unset when syncable
    pub fn unset_sync(&self, container: &mut Extensible, sink: &mut dyn SyncSink) -> bool {
        let removed = self.unset(container);
        if removed && self.synced {
            sink.extension_unset(self.extype, container.ident(), &self.key);
        }
        removed
    }

    /// Value in network form; `None` when unset or not syncable
    pub fn to_network(&self, container: &Extensible) -> Option<String> {
        if !self.synced {
            return None;
        }
        self.get(container).map(self.format)
    }

    /// Apply a network-form value. Ignored on non-syncable items.
    pub fn from_network(&self, container: &mut Extensible, text: &str) {
        if !self.synced {
            return;
        }
        if let Some(value) = (self.parse)(text) {
            self.set(container, value);
        }
    }

    /// Value in internal form
    pub fn to_internal(&self, container: &Extensible) -> Option<String> {
        self.get(container).map(self.format)
    }

    /// Apply an internal-form value
    pub fn from_internal(&self, container: &mut Extensible, text: &str) {
        if let Some(value) = (self.parse)(text) {
            self.set(container, value);
        }
    }

    /// Value in human-readable form
    pub fn to_human(&self, container: &Extensible) -> Option<String> {
        self.get(container).map(self.format)
    }
}

/// Register a string-valued extension
pub fn string_ext_item(
    registry: &mut ExtensionRegistry,
    owner: &str,
    key: &str,
    extype: ExtensionType,
    synced: bool,
) -> Result<ExtItem<String>> {
    ExtItem::register(registry, owner, key, extype, synced, |v| v.clone(), |s| {
        Some(s.to_string())
    })
}

/// Register an integer-valued extension
pub fn int_ext_item(
    registry: &mut ExtensionRegistry,
    owner: &str,
    key: &str,
    extype: ExtensionType,
    synced: bool,
) -> Result<ExtItem<i64>> {
    ExtItem::register(registry, owner, key, extype, synced, |v| v.to_string(), |s| {
        s.parse().ok()
    })
}

/// Register a boolean extension
pub fn bool_ext_item(
    registry: &mut ExtensionRegistry,
    owner: &str,
    key: &str,
    extype: ExtensionType,
    synced: bool,
) -> Result<ExtItem<bool>> {
    ExtItem::register(
        registry,
        owner,
        key,
        extype,
        synced,
        |v| if *v { "1".to_string() } else { "0".to_string() },
        |s| match s {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Probe(Rc<Cell<u32>>);

    impl Drop for Probe {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn probe_item(registry: &mut ExtensionRegistry) -> ExtItem<Probe> {
        ExtItem::register(
            registry,
            "test",
            "probe",
            ExtensionType::User,
            false,
            |_| String::new(),
            |_| None,
        )
        .unwrap()
    }

    #[test]
    fn get_returns_what_set_stored() {
        let mut registry = ExtensionRegistry::new();
        let away =
            string_ext_item(&mut registry, "test", "away-message", ExtensionType::User, false)
                .unwrap();
        let mut user = Extensible::new(ExtensionType::User, "alice");

        assert!(away.get(&user).is_none());
        away.set(&mut user, "gone fishing".to_string());
        assert_eq!(away.get(&user).unwrap(), "gone fishing");
        away.set(&mut user, "back soon".to_string());
        assert_eq!(away.get(&user).unwrap(), "back soon");
        assert!(away.unset(&mut user));
        assert!(away.get(&user).is_none());
        assert!(!away.unset(&mut user));
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut registry = ExtensionRegistry::new();
        string_ext_item(&mut registry, "a", "away", ExtensionType::User, false).unwrap();
        assert!(string_ext_item(&mut registry, "b", "away", ExtensionType::User, false).is_err());
    }

    #[test]
    fn wrong_extype_is_refused() {
        let mut registry = ExtensionRegistry::new();
        let topic_item =
            string_ext_item(&mut registry, "test", "topic-meta", ExtensionType::Channel, false)
                .unwrap();
        let mut user = Extensible::new(ExtensionType::User, "alice");
        topic_item.set(&mut user, "nope".to_string());
        assert!(topic_item.get(&user).is_none());
    }

    #[test]
    fn deleter_runs_exactly_once_per_value() {
        let mut registry = ExtensionRegistry::new();
        let item = probe_item(&mut registry);
        let drops = Rc::new(Cell::new(0));
        let mut user = Extensible::new(ExtensionType::User, "alice");

        item.set(&mut user, Probe(drops.clone()));
        assert_eq!(drops.get(), 0);
        // Replacing drops the displaced value once.
        item.set(&mut user, Probe(drops.clone()));
        assert_eq!(drops.get(), 1);
        assert!(item.unset(&mut user));
        assert_eq!(drops.get(), 2);
        // Unset of an absent value drops nothing.
        assert!(!item.unset(&mut user));
        assert_eq!(drops.get(), 2);
    }

    #[test]
    fn sync_roundtrip_through_network_form() {
        let mut registry = ExtensionRegistry::new();
        let away = string_ext_item(&mut registry, "test", "away", ExtensionType::User, true).unwrap();
        let mut local = Extensible::new(ExtensionType::User, "alice");
        let mut remote = Extensible::new(ExtensionType::User, "alice");

        away.set(&mut local, "brb".to_string());
        let wire = away.to_network(&local).unwrap();
        assert_eq!(wire, "brb");
        away.from_network(&mut remote, &wire);
        assert_eq!(away.get(&remote).unwrap(), "brb");
    }

    #[test]
    fn non_syncable_has_no_network_form() {
        let mut registry = ExtensionRegistry::new();
        let private =
            string_ext_item(&mut registry, "test", "private", ExtensionType::User, false).unwrap();
        let mut user = Extensible::new(ExtensionType::User, "alice");
        private.set(&mut user, "secret".to_string());
        assert!(private.to_network(&user).is_none());
        // Pushes from the network are ignored too.
        let mut other = Extensible::new(ExtensionType::User, "bob");
        private.from_network(&mut other, "leaked");
        assert!(private.get(&other).is_none());
    }

    #[test]
    fn sink_sees_syncable_changes_only() {
        #[derive(Default)]
        struct Recorder(Vec<String>);
        impl SyncSink for Recorder {
            fn extension_set(
                &mut self,
                _extype: ExtensionType,
                container: &str,
                key: &str,
                value: &str,
            ) {
                self.0.push(format!("set {} {} {}", container, key, value));
            }
            fn extension_unset(&mut self, _extype: ExtensionType, container: &str, key: &str) {
                self.0.push(format!("unset {} {}", container, key));
            }
        }

        let mut registry = ExtensionRegistry::new();
        let synced = string_ext_item(&mut registry, "m", "away", ExtensionType::User, true).unwrap();
        let quiet = string_ext_item(&mut registry, "m", "note", ExtensionType::User, false).unwrap();
        let mut user = Extensible::new(ExtensionType::User, "alice");
        let mut sink = Recorder::default();

        synced.set_sync(&mut user, "brb".to_string(), &mut sink);
        quiet.set_sync(&mut user, "hidden".to_string(), &mut sink);
        synced.unset_sync(&mut user, &mut sink);
        quiet.unset_sync(&mut user, &mut sink);

        assert_eq!(sink.0, vec!["set alice away brb", "unset alice away"]);
    }

    #[test]
    fn unregister_prevents_lookup_and_caller_purges_values() {
        let mut registry = ExtensionRegistry::new();
        let item = probe_item(&mut registry);
        let drops = Rc::new(Cell::new(0));
        let mut alice = Extensible::new(ExtensionType::User, "alice");
        let mut bob = Extensible::new(ExtensionType::User, "bob");
        item.set(&mut alice, Probe(drops.clone()));
        item.set(&mut bob, Probe(drops.clone()));

        let (id, _def) = registry.unregister("probe").unwrap();
        assert!(registry.find("probe").is_none());
        for container in [&mut alice, &mut bob] {
            container.clear(id);
        }
        assert_eq!(drops.get(), 2);
    }

    #[test]
    fn burst_serialization_walks_set_items() {
        let mut registry = ExtensionRegistry::new();
        let away = string_ext_item(&mut registry, "m", "away", ExtensionType::User, true).unwrap();
        let score = int_ext_item(&mut registry, "m", "score", ExtensionType::User, true).unwrap();
        let mut user = Extensible::new(ExtensionType::User, "alice");
        away.set(&mut user, "brb".to_string());
        score.set(&mut user, 42);

        let mut burst = registry.serialize(&user);
        burst.sort();
        assert_eq!(
            burst,
            vec![
                ("away".to_string(), "brb".to_string()),
                ("score".to_string(), "42".to_string())
            ]
        );

        let mut copy = Extensible::new(ExtensionType::User, "alice");
        for (key, value) in &burst {
            assert!(registry.deserialize(&mut copy, key, value));
        }
        assert_eq!(away.get(&copy).unwrap(), "brb");
        assert_eq!(score.get(&copy), Some(&42));
    }

    #[test]
    fn bool_item_parses_strictly() {
        let mut registry = ExtensionRegistry::new();
        let flag = bool_ext_item(&mut registry, "m", "flag", ExtensionType::User, true).unwrap();
        let mut user = Extensible::new(ExtensionType::User, "alice");
        flag.from_network(&mut user, "1");
        assert_eq!(flag.get(&user), Some(&true));
        flag.from_network(&mut user, "bogus");
        // Unparseable input leaves the stored value alone.
        assert_eq!(flag.get(&user), Some(&true));
    }
}
