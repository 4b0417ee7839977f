//! IRC message parsing and handling
//!
//! Implements the RFC 1459 message grammar: an optional `:prefix`,
//! a command, up to fourteen middle parameters and an optional
//! `:trailing` parameter, all within 512 bytes including CRLF.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum wire length of one message, terminator included
pub const MAX_LINE_LENGTH: usize = 512;

/// Maximum number of middle parameters before the trailing one
pub const MAX_MIDDLE_PARAMS: usize = 14;

/// IRC message prefix (server or user)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prefix {
    /// Server name
    Server(String),
    /// User prefix (nick!user@host)
    User {
        nick: String,
        user: String,
        host: String,
    },
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Server(name) => write!(f, "{}", name),
            Prefix::User { nick, user, host } => write!(f, "{}!{}@{}", nick, user, host),
        }
    }
}

/// One parsed IRC message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Optional source prefix. Ignored by the dispatcher on client
    /// connections.
    pub prefix: Option<Prefix>,
    /// Upper-cased command verb
    pub command: String,
    /// Positional parameters, trailing last
    pub params: Vec<String>,
}

impl Message {
    /// Create a new message
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into().to_ascii_uppercase(),
            params,
        }
    }

    /// Create a new message with a prefix
    pub fn with_prefix(prefix: Prefix, command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: Some(prefix),
            command: command.into().to_ascii_uppercase(),
            params,
        }
    }

    /// Parse one wire line (without its terminator).
    pub fn parse(input: &str) -> crate::Result<Self> {
        let mut rest = input.trim_end_matches(['\r', '\n']);
        if rest.trim().is_empty() {
            return Err(crate::Error::MessageParse("empty message".to_string()));
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix_str, remainder) = match stripped.split_once(' ') {
                Some(split) => split,
                None => {
                    return Err(crate::Error::MessageParse(
                        "prefix without a command".to_string(),
                    ))
                }
            };
            rest = remainder;
            Some(Self::parse_prefix(prefix_str)?)
        } else {
            None
        };

        let rest = rest.trim_start_matches(' ');
        let (verb, mut rest) = match rest.split_once(' ') {
            Some((verb, remainder)) => (verb, remainder),
            None => (rest, ""),
        };
        if verb.is_empty() {
            return Err(crate::Error::MessageParse("no command found".to_string()));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            if params.len() == MAX_MIDDLE_PARAMS {
                // Everything left collapses into the final parameter.
                params.push(rest.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, remainder)) => {
                    params.push(param.to_string());
                    rest = remainder;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Message {
            prefix,
            command: verb.to_ascii_uppercase(),
            params,
        })
    }

    fn parse_prefix(prefix_str: &str) -> crate::Result<Prefix> {
        if let Some((nick, user_host)) = prefix_str.split_once('!') {
            let (user, host) = user_host.split_once('@').ok_or_else(|| {
                crate::Error::MessageParse("invalid user prefix format".to_string())
            })?;
            Ok(Prefix::User {
                nick: nick.to_string(),
                user: user.to_string(),
                host: host.to_string(),
            })
        } else {
            Ok(Prefix::Server(prefix_str.to_string()))
        }
    }

    /// Serialize to a wire line, CRLF included.
    ///
    /// The final parameter is prefixed with `:` iff it is empty or
    /// contains a space.
    pub fn to_line(&self) -> String {
        let mut result = String::new();
        if let Some(ref prefix) = self.prefix {
            result.push(':');
            result.push_str(&prefix.to_string());
            result.push(' ');
        }
        result.push_str(&self.command);
        for (i, param) in self.params.iter().enumerate() {
            result.push(' ');
            if i == self.params.len() - 1 && (param.is_empty() || param.contains(' ')) {
                result.push(':');
            }
            result.push_str(param);
        }
        result.push_str("\r\n");
        result
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line().trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_message() {
        let msg = Message::parse("NICK alice").unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["alice"]);
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn parse_lowercase_verb_is_uppercased() {
        let msg = Message::parse("privmsg #channel :hi").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn parse_message_with_prefix() {
        let msg = Message::parse(":alice!user@host PRIVMSG #channel :Hello world").unwrap();
        match msg.prefix {
            Some(Prefix::User { nick, user, host }) => {
                assert_eq!(nick, "alice");
                assert_eq!(user, "user");
                assert_eq!(host, "host");
            }
            _ => panic!("expected user prefix"),
        }
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#channel", "Hello world"]);
    }

    #[test]
    fn parse_empty_trailing() {
        let msg = Message::parse("TOPIC #channel :").unwrap();
        assert_eq!(msg.params, vec!["#channel".to_string(), String::new()]);
    }

    #[test]
    fn parse_caps_middle_params_at_fourteen() {
        let line = format!("CMD {}", (1..=16).map(|i| i.to_string()).collect::<Vec<_>>().join(" "));
        let msg = Message::parse(&line).unwrap();
        assert_eq!(msg.params.len(), 15);
        assert_eq!(msg.params[13], "14");
        assert_eq!(msg.params[14], "15 16");
    }

    #[test]
    fn serialize_message() {
        let msg = Message::new("NICK", vec!["alice".to_string()]);
        assert_eq!(msg.to_line(), "NICK alice\r\n");
    }

    #[test]
    fn serialize_quotes_trailing_with_space_or_empty() {
        let msg = Message::new("PRIVMSG", vec!["#x".to_string(), "one two".to_string()]);
        assert_eq!(msg.to_line(), "PRIVMSG #x :one two\r\n");

        let msg = Message::new("TOPIC", vec!["#x".to_string(), String::new()]);
        assert_eq!(msg.to_line(), "TOPIC #x :\r\n");

        let msg = Message::new("PRIVMSG", vec!["#x".to_string(), "word".to_string()]);
        assert_eq!(msg.to_line(), "PRIVMSG #x word\r\n");
    }

    #[test]
    fn roundtrip_with_prefix() {
        let msg = Message::with_prefix(
            Prefix::User {
                nick: "alice".to_string(),
                user: "user".to_string(),
                host: "host".to_string(),
            },
            "PRIVMSG",
            vec!["#channel".to_string(), "Hello world".to_string()],
        );
        assert_eq!(msg.to_line(), ":alice!user@host PRIVMSG #channel :Hello world\r\n");
        let parsed = Message::parse(msg.to_line().trim_end()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn rejects_empty_input() {
        assert!(Message::parse("").is_err());
        assert!(Message::parse("   ").is_err());
    }
}
