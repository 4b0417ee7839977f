//! Channel and membership state

use crate::extensible::{Extensible, ExtensionType};
use std::collections::HashMap;

/// One user's presence in one channel
pub struct Membership {
    /// Channel operator status
    pub op: bool,
    /// Module attachments
    pub extensions: Extensible,
}

impl Membership {
    pub fn new(nick: &str, channel: &str, op: bool) -> Self {
        Self {
            op,
            extensions: Extensible::new(
                ExtensionType::Membership,
                format!("{}:{}", nick, channel),
            ),
        }
    }
}

/// Channel state
pub struct Channel {
    /// Channel name, `#`-prefixed
    pub name: String,
    /// Topic, if one has been set
    pub topic: Option<String>,
    /// Flag modes (`n` blocks external messages, `t` restricts TOPIC)
    pub modes: std::collections::HashSet<char>,
    /// Member limit from `+l`, unenforced when absent
    pub limit: Option<u32>,
    /// Members keyed by lower-cased nick
    pub members: HashMap<String, Membership>,
    /// Module attachments
    pub extensions: Extensible,
}

impl Channel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            topic: None,
            modes: std::collections::HashSet::new(),
            limit: None,
            members: HashMap::new(),
            extensions: Extensible::new(ExtensionType::Channel, name.to_string()),
        }
    }

    pub fn has_mode(&self, mode: char) -> bool {
        self.modes.contains(&mode)
    }

    pub fn is_member(&self, nick: &str) -> bool {
        self.members.contains_key(&nick.to_lowercase())
    }

    pub fn member_is_op(&self, nick: &str) -> bool {
        self.members
            .get(&nick.to_lowercase())
            .map(|m| m.op)
            .unwrap_or(false)
    }

    /// Add a member; the first join gets channel operator status
    pub fn join(&mut self, nick: &str) -> &mut Membership {
        let op = self.members.is_empty();
        self.members
            .entry(nick.to_lowercase())
            .or_insert_with(|| Membership::new(nick, &self.name, op))
    }

    /// Remove a member; returns the membership if they were present
    pub fn part(&mut self, nick: &str) -> Option<Membership> {
        self.members.remove(&nick.to_lowercase())
    }

    /// Re-key a membership after a nick change
    pub fn rename_member(&mut self, old_nick: &str, new_nick: &str) {
        if let Some(mut membership) = self.members.remove(&old_nick.to_lowercase()) {
            membership
                .extensions
                .rename(format!("{}:{}", new_nick, self.name));
            self.members.insert(new_nick.to_lowercase(), membership);
        }
    }

    /// Render the current modes as a `+`-prefixed string
    pub fn mode_string(&self) -> String {
        let mut flags: Vec<char> = self.modes.iter().copied().collect();
        flags.sort_unstable();
        let mut out = String::from("+");
        out.extend(flags);
        if let Some(limit) = self.limit {
            out.push('l');
            out.push(' ');
            out.push_str(&limit.to_string());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Channel names are `#`-prefixed, non-empty, and free of separators
pub fn is_valid_channel_name(name: &str) -> bool {
    name.len() > 1
        && name.len() <= 50
        && name.starts_with('#')
        && !name.contains([' ', ',', '\x07'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_join_is_op() {
        let mut chan = Channel::new("#test");
        chan.join("Alice");
        chan.join("bob");
        assert!(chan.member_is_op("alice"));
        assert!(!chan.member_is_op("BOB"));
        assert!(chan.is_member("ALICE"));
        assert!(chan.part("alice").is_some());
        assert!(!chan.is_member("alice"));
    }

    #[test]
    fn channel_name_validation() {
        assert!(is_valid_channel_name("#rust"));
        assert!(!is_valid_channel_name("#"));
        assert!(!is_valid_channel_name("rust"));
        assert!(!is_valid_channel_name("#a b"));
        assert!(!is_valid_channel_name("#a,b"));
    }
}
