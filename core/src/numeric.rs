//! IRC numeric replies
//!
//! A [`Numeric`] is a three-digit reply code plus ordered parameters.
//! The target nickname is not stored here; it is prepended when the
//! reply is rendered for a connection, `*` standing in for a peer that
//! has not completed nick registration.

use crate::Message;

// RFC 1459 replies.
pub const RPL_WELCOME: u16 = 1;
pub const RPL_YOURHOST: u16 = 2;
pub const RPL_CREATED: u16 = 3;
pub const RPL_MYINFO: u16 = 4;
pub const RPL_UMODEIS: u16 = 221;
pub const RPL_CHANNELMODEIS: u16 = 324;
pub const RPL_YOUREOPER: u16 = 381;
pub const ERR_NOSUCHNICK: u16 = 401;
pub const ERR_NOSUCHCHANNEL: u16 = 403;
pub const ERR_CANNOTSENDTOCHAN: u16 = 404;
pub const ERR_UNKNOWNCOMMAND: u16 = 421;
pub const ERR_ERRONEUSNICKNAME: u16 = 432;
pub const ERR_NICKNAMEINUSE: u16 = 433;
pub const ERR_NOTONCHANNEL: u16 = 442;
pub const ERR_NOTREGISTERED: u16 = 451;
pub const ERR_NEEDMOREPARAMS: u16 = 461;
pub const ERR_ALREADYREGISTERED: u16 = 462;
pub const ERR_PASSWDMISMATCH: u16 = 464;
pub const ERR_CHANNELISFULL: u16 = 471;
pub const ERR_UNKNOWNMODE: u16 = 472;
pub const ERR_NOPRIVILEGES: u16 = 481;
pub const ERR_CHANOPRIVSNEEDED: u16 = 482;
pub const ERR_UMODEUNKNOWNFLAG: u16 = 501;
pub const ERR_USERSDONTMATCH: u16 = 502;

// Extensions beyond RFC 1459.
pub const ERR_CANNOTSENDTOUSER: u16 = 531;
pub const ERR_INVALIDMODEPARAM: u16 = 696;

/// A structured server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Numeric {
    code: u16,
    params: Vec<String>,
}

impl Numeric {
    /// Create an empty numeric. `code` must lie in 001..=999.
    pub fn new(code: u16) -> Self {
        debug_assert!((1..=999).contains(&code), "numeric code out of range");
        Self {
            code,
            params: Vec::new(),
        }
    }

    /// Append a parameter
    pub fn push(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// The code as exactly three zero-padded ASCII digits
    pub fn code_str(&self) -> String {
        format!("{:03}", self.code)
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Render for delivery to `target` (the recipient's nick, or `*`)
    pub fn to_message(&self, target: &str) -> Message {
        let mut params = Vec::with_capacity(self.params.len() + 1);
        params.push(target.to_string());
        params.extend(self.params.iter().cloned());
        Message::new(self.code_str(), params)
    }
}

/// Convenience constructors for the numerics the core emits
impl Numeric {
    pub fn welcome(nick: &str, user: &str, host: &str) -> Self {
        Numeric::new(RPL_WELCOME).push(format!(
            "Welcome to the Internet Relay Network {}!{}@{}",
            nick, user, host
        ))
    }

    pub fn your_host(server: &str, version: &str) -> Self {
        Numeric::new(RPL_YOURHOST).push(format!(
            "Your host is {}, running version {}",
            server, version
        ))
    }

    pub fn created(date: &str) -> Self {
        Numeric::new(RPL_CREATED).push(format!("This server was created {}", date))
    }

    pub fn my_info(server: &str, version: &str, user_modes: &str, channel_modes: &str) -> Self {
        Numeric::new(RPL_MYINFO)
            .push(server)
            .push(version)
            .push(user_modes)
            .push(channel_modes)
    }

    pub fn youre_oper() -> Self {
        Numeric::new(RPL_YOUREOPER).push("You are now an IRC operator")
    }

    pub fn no_such_nick(nick: &str) -> Self {
        let nick = if nick.is_empty() { "*" } else { nick };
        Numeric::new(ERR_NOSUCHNICK).push(nick).push("No such nick")
    }

    pub fn no_such_channel(channel: &str) -> Self {
        let channel = if channel.is_empty() { "*" } else { channel };
        Numeric::new(ERR_NOSUCHCHANNEL)
            .push(channel)
            .push("No such channel")
    }

    /// ERR_CANNOTSENDTOCHAN with an explicit reason
    pub fn cannot_send_to_chan(channel: &str, message: impl Into<String>) -> Self {
        Numeric::new(ERR_CANNOTSENDTOCHAN).push(channel).push(message)
    }

    /// ERR_CANNOTSENDTOCHAN blamed on a channel mode
    pub fn cannot_send_to_chan_mode(
        channel: &str,
        what: &str,
        mode_char: char,
        mode_name: &str,
    ) -> Self {
        Numeric::new(ERR_CANNOTSENDTOCHAN).push(channel).push(format!(
            "You cannot send {} to this channel whilst the +{} ({}) mode is set.",
            what, mode_char, mode_name
        ))
    }

    /// ERR_CANNOTSENDTOUSER blamed on a user mode. `on_self` selects
    /// the you/they wording.
    pub fn cannot_send_to_user_mode(
        nick: &str,
        what: &str,
        mode_char: char,
        mode_name: &str,
        on_self: bool,
    ) -> Self {
        let nick = if nick.is_empty() { "*" } else { nick };
        Numeric::new(ERR_CANNOTSENDTOUSER).push(nick).push(format!(
            "You cannot send {} to this user whilst {} have the +{} ({}) mode set.",
            what,
            if on_self { "you" } else { "they" },
            mode_char,
            mode_name
        ))
    }

    pub fn chan_op_privs_needed(channel: &str, action: &str) -> Self {
        Numeric::new(ERR_CHANOPRIVSNEEDED).push(channel).push(format!(
            "You must be a channel operator or higher to {}.",
            action
        ))
    }

    /// ERR_INVALIDMODEPARAM. Without an explicit `message` a default
    /// derived from the mode name is used.
    pub fn invalid_mode_param(
        target: &str,
        mode_char: char,
        mode_name: &str,
        parameter: &str,
        message: Option<&str>,
    ) -> Self {
        let text = match message {
            Some(message) if !message.is_empty() => message.to_string(),
            _ => format!("Invalid {} mode parameter.", mode_name),
        };
        Numeric::new(ERR_INVALIDMODEPARAM)
            .push(target)
            .push(mode_char.to_string())
            .push(parameter)
            .push(text)
    }

    pub fn unknown_command(command: &str) -> Self {
        Numeric::new(ERR_UNKNOWNCOMMAND)
            .push(command)
            .push("Unknown command")
    }

    pub fn need_more_params(command: &str) -> Self {
        Numeric::new(ERR_NEEDMOREPARAMS)
            .push(command)
            .push("Not enough parameters")
    }

    pub fn not_registered() -> Self {
        Numeric::new(ERR_NOTREGISTERED).push("You have not registered")
    }

    pub fn already_registered() -> Self {
        Numeric::new(ERR_ALREADYREGISTERED).push("You may not reregister")
    }

    pub fn passwd_mismatch() -> Self {
        Numeric::new(ERR_PASSWDMISMATCH).push("Password incorrect")
    }

    pub fn no_privileges() -> Self {
        Numeric::new(ERR_NOPRIVILEGES).push("Permission Denied - You do not have the required operator privileges")
    }

    pub fn erroneous_nickname(nick: &str) -> Self {
        Numeric::new(ERR_ERRONEUSNICKNAME)
            .push(nick)
            .push("Erroneous nickname")
    }

    pub fn nickname_in_use(nick: &str) -> Self {
        Numeric::new(ERR_NICKNAMEINUSE)
            .push(nick)
            .push("Nickname is already in use")
    }

    pub fn not_on_channel(channel: &str) -> Self {
        Numeric::new(ERR_NOTONCHANNEL)
            .push(channel)
            .push("You're not on that channel")
    }

    pub fn umode_is(modes: &str) -> Self {
        Numeric::new(RPL_UMODEIS).push(modes)
    }

    pub fn channel_mode_is(channel: &str, modes: &str) -> Self {
        Numeric::new(RPL_CHANNELMODEIS).push(channel).push(modes)
    }

    pub fn channel_is_full(channel: &str) -> Self {
        Numeric::new(ERR_CHANNELISFULL)
            .push(channel)
            .push("Cannot join channel (+l)")
    }

    pub fn unknown_mode(mode_char: char) -> Self {
        Numeric::new(ERR_UNKNOWNMODE)
            .push(mode_char.to_string())
            .push("is unknown mode char to me")
    }

    pub fn umode_unknown_flag() -> Self {
        Numeric::new(ERR_UMODEUNKNOWNFLAG).push("Unknown MODE flag")
    }

    pub fn users_dont_match() -> Self {
        Numeric::new(ERR_USERSDONTMATCH).push("Cannot change mode for other users")
    }
}
