//! User management and tracking

use crate::extensible::{Extensible, ExtensionType};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::net::IpAddr;
use uuid::Uuid;

/// Lifecycle of a client connection.
///
/// `NickSet`/`UserSet` record which half of registration arrived
/// first; the transition to `Registered` additionally waits for the
/// hostname challenge to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, nothing received yet
    Connecting,
    /// NICK received, USER outstanding
    NickSet,
    /// USER received, NICK outstanding
    UserSet,
    /// Fully registered
    Registered,
    /// QUIT received, flushing
    Quitting,
    /// Connection torn down
    Closed,
}

/// User information and state
pub struct User {
    /// Unique user ID
    pub id: Uuid,
    /// Nickname, once NICK has been accepted
    pub nick: Option<String>,
    /// Username from USER
    pub username: String,
    /// Real name from USER
    pub realname: String,
    /// Display hostname; the IP until reverse DNS succeeds
    pub host: String,
    /// Peer address
    pub ip: IpAddr,
    /// Connection time
    pub connected_at: DateTime<Utc>,
    /// Last activity time
    pub last_activity: DateTime<Utc>,
    /// User modes
    pub modes: HashSet<char>,
    /// Channels the user is in
    pub channels: HashSet<String>,
    /// Whether the user is an operator
    pub oper: bool,
    /// Lifecycle state
    pub state: ClientState,
    /// Whether the hostname challenge has finished (either way)
    pub lookup_done: bool,
    /// Module attachments
    pub extensions: Extensible,
}

impl User {
    pub fn new(ip: IpAddr) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            nick: None,
            username: String::new(),
            realname: String::new(),
            host: ip.to_string(),
            ip,
            connected_at: now,
            last_activity: now,
            modes: HashSet::new(),
            channels: HashSet::new(),
            oper: false,
            state: ClientState::Connecting,
            lookup_done: false,
            extensions: Extensible::new(ExtensionType::User, id.to_string()),
        }
    }

    /// The nick for display purposes; `*` before one is set
    pub fn display_nick(&self) -> &str {
        self.nick.as_deref().unwrap_or("*")
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.state, ClientState::Registered)
    }

    pub fn is_oper(&self) -> bool {
        self.oper
    }

    /// Record an accepted NICK
    pub fn set_nick(&mut self, nick: String) {
        self.extensions.rename(nick.clone());
        self.nick = Some(nick);
        if self.state == ClientState::Connecting {
            self.state = ClientState::NickSet;
        }
    }

    /// Record an accepted USER
    pub fn set_user(&mut self, username: String, realname: String) {
        self.username = username;
        self.realname = realname;
        if self.state == ClientState::Connecting {
            self.state = ClientState::UserSet;
        }
    }

    /// Whether both halves of registration plus the lookup are done.
    /// Moves to `Registered` and reports true exactly once.
    pub fn try_register(&mut self) -> bool {
        if self.is_registered() || self.state == ClientState::Quitting {
            return false;
        }
        let nick_done = self.nick.is_some();
        let user_done = !self.username.is_empty();
        if nick_done && user_done && self.lookup_done {
            self.state = ClientState::Registered;
            return true;
        }
        false
    }

    /// Source prefix for messages originating from this user
    pub fn prefix(&self) -> crate::Prefix {
        crate::Prefix::User {
            nick: self.display_nick().to_string(),
            user: self.username.clone(),
            host: self.host.clone(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Nicknames start with a letter or special and stay within 30 bytes
pub fn is_valid_nick(nick: &str) -> bool {
    fn special(c: char) -> bool {
        "[]\\`_^{|}".contains(c)
    }
    if nick.len() > 30 {
        return false;
    }
    let first = match nick.chars().next() {
        Some(first) => first,
        None => return false,
    };
    if !first.is_ascii_alphabetic() && !special(first) {
        return false;
    }
    nick.chars()
        .all(|c| c.is_ascii_alphanumeric() || special(c) || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn user() -> User {
        User::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn registration_requires_nick_user_and_lookup() {
        let mut u = user();
        assert_eq!(u.display_nick(), "*");
        u.set_nick("alice".to_string());
        assert_eq!(u.state, ClientState::NickSet);
        assert!(!u.try_register());
        u.set_user("al".to_string(), "Alice".to_string());
        assert!(!u.try_register());
        u.lookup_done = true;
        assert!(u.try_register());
        assert!(u.is_registered());
        // Only reported once.
        assert!(!u.try_register());
    }

    #[test]
    fn user_first_path() {
        let mut u = user();
        u.set_user("al".to_string(), "Alice".to_string());
        assert_eq!(u.state, ClientState::UserSet);
        u.set_nick("alice".to_string());
        assert_eq!(u.state, ClientState::UserSet);
        u.lookup_done = true;
        assert!(u.try_register());
    }

    #[test]
    fn nick_validation() {
        assert!(is_valid_nick("alice"));
        assert!(is_valid_nick("[away]"));
        assert!(is_valid_nick("a-b-c"));
        assert!(!is_valid_nick(""));
        assert!(!is_valid_nick("1abc"));
        assert!(!is_valid_nick("-abc"));
        assert!(!is_valid_nick("has space"));
        assert!(!is_valid_nick(&"x".repeat(31)));
    }

    #[test]
    fn prefix_uses_display_host() {
        let mut u = user();
        u.set_nick("alice".to_string());
        u.set_user("al".to_string(), "Alice".to_string());
        u.host = "host.example.net".to_string();
        assert_eq!(u.prefix().to_string(), "alice!al@host.example.net");
    }
}
