//! Command table and dispatch
//!
//! One wire line becomes a verb plus parameters, is looked up in the
//! table, gated on registration state, arity and privilege, and then
//! handed to its handler. Handlers returning [`CommandResult::Failure`]
//! suppress the echo of the command towards peer servers.

use crate::channel::{is_valid_channel_name, Channel};
use crate::client::ClientConn;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::module::CoreEvent;
use crate::numeric::Numeric;
use crate::server::Core;
use crate::user::is_valid_nick;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, trace};

/// Outcome of a command handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Success,
    /// The command was rejected; do not echo it to the network
    Failure,
}

/// Handler signature shared by built-in and module commands
pub type CommandHandler = Rc<dyn Fn(&Core, &mut ClientConn, &Message) -> CommandResult>;

/// One registered verb
pub struct CommandEntry {
    pub verb: String,
    /// Minimum number of parameters
    pub min_params: usize,
    /// Restricted to operators
    pub oper_only: bool,
    /// Usable before registration completes
    pub pre_reg: bool,
    /// Registering module, if any
    pub owner: Option<String>,
    pub handler: CommandHandler,
}

/// The verb → entry table
#[derive(Default)]
pub struct CommandTable {
    entries: HashMap<String, Rc<CommandEntry>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. The verb must be unused.
    pub fn register(&mut self, entry: CommandEntry) -> Result<()> {
        let verb = entry.verb.to_ascii_uppercase();
        if self.entries.contains_key(&verb) {
            return Err(Error::Module(format!("command {} is already registered", verb)));
        }
        self.entries.insert(verb, Rc::new(entry));
        Ok(())
    }

    pub fn unregister(&mut self, verb: &str) -> bool {
        self.entries.remove(&verb.to_ascii_uppercase()).is_some()
    }

    /// Drop every command registered by `module`
    pub fn remove_owned(&mut self, module: &str) {
        self.entries
            .retain(|_, entry| entry.owner.as_deref() != Some(module));
    }

    pub fn get(&self, verb: &str) -> Option<Rc<CommandEntry>> {
        self.entries.get(verb).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install the built-in command set
    pub fn register_builtins(&mut self) {
        let builtins: [(&str, usize, bool, bool, fn(&Core, &mut ClientConn, &Message) -> CommandResult);
            10] = [
            ("NICK", 1, false, true, handle_nick),
            ("USER", 4, false, true, handle_user),
            ("PING", 1, false, true, handle_ping),
            ("PONG", 0, false, true, handle_pong),
            ("QUIT", 0, false, true, handle_quit),
            ("OPER", 2, false, false, handle_oper),
            ("PRIVMSG", 2, false, false, handle_privmsg),
            ("JOIN", 1, false, false, handle_join),
            ("PART", 1, false, false, handle_part),
            ("MODE", 1, false, false, handle_mode),
        ];
        for (verb, min_params, oper_only, pre_reg, handler) in builtins {
            self.entries.insert(
                verb.to_string(),
                Rc::new(CommandEntry {
                    verb: verb.to_string(),
                    min_params,
                    oper_only,
                    pre_reg,
                    owner: None,
                    handler: Rc::new(handler),
                }),
            );
        }
    }
}

/// Route one parsed line from a client
pub fn dispatch(core: &Core, client: &mut ClientConn, msg: &Message) -> CommandResult {
    // A :source from a client connection is ignored.
    let entry = core.commands.borrow().get(&msg.command);
    let entry = match entry {
        Some(entry) => entry,
        None => {
            // Pre-registration noise is dropped silently.
            if client.user.is_registered() {
                client.send_numeric(core, Numeric::unknown_command(&msg.command));
            }
            return CommandResult::Failure;
        }
    };
    if msg.params.len() < entry.min_params {
        client.send_numeric(core, Numeric::need_more_params(&entry.verb));
        return CommandResult::Failure;
    }
    if entry.oper_only && !client.user.is_oper() {
        client.send_numeric(core, Numeric::no_privileges());
        return CommandResult::Failure;
    }
    if !entry.pre_reg && !client.user.is_registered() {
        client.send_numeric(core, Numeric::not_registered());
        return CommandResult::Failure;
    }
    trace!(verb = %entry.verb, nick = client.user.display_nick(), "dispatching");
    let result = (entry.handler)(core, client, msg);
    if result == CommandResult::Failure {
        trace!(verb = %entry.verb, "handler failed; suppressing network echo");
    }
    result
}

fn handle_nick(core: &Core, client: &mut ClientConn, msg: &Message) -> CommandResult {
    let new_nick = msg.params[0].clone();
    if !is_valid_nick(&new_nick) {
        client.send_numeric(core, Numeric::erroneous_nickname(&new_nick));
        return CommandResult::Failure;
    }
    let lower = new_nick.to_lowercase();
    let taken = core
        .nicks
        .borrow()
        .get(&lower)
        .map(|&fd| fd != client.fd())
        .unwrap_or(false);
    if taken {
        client.send_numeric(core, Numeric::nickname_in_use(&new_nick));
        return CommandResult::Failure;
    }

    let old_nick = client.user.nick.clone();
    {
        let mut nicks = core.nicks.borrow_mut();
        if let Some(ref old) = old_nick {
            nicks.remove(&old.to_lowercase());
        }
        nicks.insert(lower, client.fd());
    }

    if client.user.is_registered() {
        let out = Message::with_prefix(
            client.user.prefix(),
            "NICK",
            vec![new_nick.clone()],
        );
        client.send_message(core, &out);
        let channels: Vec<String> = client.user.channels.iter().cloned().collect();
        let old = old_nick.unwrap_or_default();
        let mut audience = Vec::new();
        {
            let mut map = core.channels.borrow_mut();
            for name in &channels {
                if let Some(chan) = map.get_mut(name) {
                    audience.extend(chan.members.keys().cloned());
                    chan.rename_member(&old, &new_nick);
                }
            }
        }
        audience.sort();
        audience.dedup();
        deliver_to_nicks(core, client, &audience, &out, false);
    }

    client.user.set_nick(new_nick);
    client.try_complete_registration(core);
    CommandResult::Success
}

fn handle_user(core: &Core, client: &mut ClientConn, msg: &Message) -> CommandResult {
    if client.user.is_registered() {
        client.send_numeric(core, Numeric::already_registered());
        return CommandResult::Failure;
    }
    client
        .user
        .set_user(msg.params[0].clone(), msg.params[3].clone());
    client.try_complete_registration(core);
    CommandResult::Success
}

fn handle_ping(core: &Core, client: &mut ClientConn, msg: &Message) -> CommandResult {
    let server = core.config.server.name.clone();
    let pong = Message::with_prefix(
        crate::Prefix::Server(server.clone()),
        "PONG",
        vec![server, msg.params[0].clone()],
    );
    client.send_message(core, &pong);
    CommandResult::Success
}

fn handle_pong(_core: &Core, client: &mut ClientConn, _msg: &Message) -> CommandResult {
    client.user.touch();
    CommandResult::Success
}

fn handle_quit(core: &Core, client: &mut ClientConn, msg: &Message) -> CommandResult {
    let reason = msg
        .params
        .first()
        .cloned()
        .unwrap_or_else(|| "Client quit".to_string());
    client.quit(core, &reason);
    CommandResult::Success
}

fn handle_oper(core: &Core, client: &mut ClientConn, msg: &Message) -> CommandResult {
    let name = &msg.params[0];
    let password = &msg.params[1];
    let matched = core
        .config
        .operators
        .iter()
        .any(|oper| &oper.name == name && &oper.password == password);
    if !matched {
        client.send_numeric(core, Numeric::passwd_mismatch());
        return CommandResult::Failure;
    }
    client.user.oper = true;
    client.user.modes.insert('o');
    client.send_numeric(core, Numeric::youre_oper());
    debug!(nick = client.user.display_nick(), "operator authenticated");
    core.fire_event(&CoreEvent::PostOper {
        nick: client.user.display_nick().to_string(),
    });
    CommandResult::Success
}

fn handle_privmsg(core: &Core, client: &mut ClientConn, msg: &Message) -> CommandResult {
    let target = msg.params[0].clone();
    let text = msg.params[1].clone();
    client.user.touch();
    let out = Message::with_prefix(
        client.user.prefix(),
        "PRIVMSG",
        vec![target.clone(), text],
    );

    if target.starts_with('#') {
        let nick = client.user.display_nick().to_string();
        let verdict = {
            let channels = core.channels.borrow();
            match channels.get(&target.to_lowercase()) {
                None => Err(Numeric::no_such_channel(&target)),
                Some(chan) => {
                    if !chan.is_member(&nick) && chan.has_mode('n') {
                        Err(Numeric::cannot_send_to_chan_mode(
                            &chan.name, "messages", 'n', "noextmsg",
                        ))
                    } else {
                        Ok(chan.members.keys().cloned().collect::<Vec<_>>())
                    }
                }
            }
        };
        return match verdict {
            Err(numeric) => {
                client.send_numeric(core, numeric);
                CommandResult::Failure
            }
            Ok(members) => {
                deliver_to_nicks(core, client, &members, &out, false);
                CommandResult::Success
            }
        };
    }

    let target_fd = core.nicks.borrow().get(&target.to_lowercase()).copied();
    let fd = match target_fd {
        Some(fd) => fd,
        None => {
            client.send_numeric(core, Numeric::no_such_nick(&target));
            return CommandResult::Failure;
        }
    };
    if fd == client.fd() {
        client.send_message(core, &out);
        return CommandResult::Success;
    }
    let peer = core.clients.borrow().get(&fd).cloned();
    match peer {
        Some(peer) => {
            let deaf = peer.borrow().user.modes.contains(&'D');
            if deaf {
                let nick = peer.borrow().user.display_nick().to_string();
                client.send_numeric(
                    core,
                    Numeric::cannot_send_to_user_mode(&nick, "messages", 'D', "deaf", false),
                );
                return CommandResult::Failure;
            }
            peer.borrow_mut().send_message(core, &out);
            CommandResult::Success
        }
        None => {
            client.send_numeric(core, Numeric::no_such_nick(&target));
            CommandResult::Failure
        }
    }
}

fn handle_join(core: &Core, client: &mut ClientConn, msg: &Message) -> CommandResult {
    let name = msg.params[0].clone();
    if !is_valid_channel_name(&name) {
        client.send_numeric(core, Numeric::no_such_channel(&name));
        return CommandResult::Failure;
    }
    let nick = client.user.display_nick().to_string();
    let key = name.to_lowercase();

    enum Verdict {
        AlreadyIn,
        Full,
        Joined(Vec<String>),
    }
    let verdict = {
        let mut channels = core.channels.borrow_mut();
        let chan = channels
            .entry(key.clone())
            .or_insert_with(|| Channel::new(&name));
        if chan.is_member(&nick) {
            Verdict::AlreadyIn
        } else if chan
            .limit
            .map(|limit| chan.members.len() >= limit as usize)
            .unwrap_or(false)
        {
            Verdict::Full
        } else {
            chan.join(&nick);
            Verdict::Joined(chan.members.keys().cloned().collect())
        }
    };

    match verdict {
        Verdict::AlreadyIn => CommandResult::Success,
        Verdict::Full => {
            client.send_numeric(core, Numeric::channel_is_full(&name));
            CommandResult::Failure
        }
        Verdict::Joined(members) => {
            client.user.channels.insert(key);
            let out = Message::with_prefix(client.user.prefix(), "JOIN", vec![name]);
            deliver_to_nicks(core, client, &members, &out, true);
            CommandResult::Success
        }
    }
}

fn handle_part(core: &Core, client: &mut ClientConn, msg: &Message) -> CommandResult {
    let name = msg.params[0].clone();
    let reason = msg.params.get(1).cloned();
    let nick = client.user.display_nick().to_string();
    let key = name.to_lowercase();

    let verdict = {
        let mut channels = core.channels.borrow_mut();
        let verdict = match channels.get_mut(&key) {
            None => Err(Numeric::no_such_channel(&name)),
            Some(chan) => {
                if chan.part(&nick).is_none() {
                    Err(Numeric::not_on_channel(&name))
                } else {
                    Ok((
                        chan.members.keys().cloned().collect::<Vec<_>>(),
                        chan.is_empty(),
                    ))
                }
            }
        };
        if let Ok((_, true)) = verdict {
            channels.remove(&key);
        }
        verdict
    };
    let members = match verdict {
        Err(numeric) => {
            client.send_numeric(core, numeric);
            return CommandResult::Failure;
        }
        Ok((members, _)) => members,
    };

    client.user.channels.remove(&key);
    let mut params = vec![name];
    if let Some(reason) = reason {
        params.push(reason);
    }
    let out = Message::with_prefix(client.user.prefix(), "PART", params);
    client.send_message(core, &out);
    deliver_to_nicks(core, client, &members, &out, false);
    CommandResult::Success
}

fn handle_mode(core: &Core, client: &mut ClientConn, msg: &Message) -> CommandResult {
    let target = msg.params[0].clone();
    if target.starts_with('#') {
        handle_channel_mode(core, client, msg, &target)
    } else {
        handle_user_mode(core, client, msg, &target)
    }
}

fn handle_channel_mode(
    core: &Core,
    client: &mut ClientConn,
    msg: &Message,
    target: &str,
) -> CommandResult {
    let key = target.to_lowercase();
    let nick = client.user.display_nick().to_string();

    if msg.params.len() == 1 {
        let reply = {
            let channels = core.channels.borrow();
            channels
                .get(&key)
                .map(|chan| Numeric::channel_mode_is(&chan.name, &chan.mode_string()))
        };
        return match reply {
            Some(numeric) => {
                client.send_numeric(core, numeric);
                CommandResult::Success
            }
            None => {
                client.send_numeric(core, Numeric::no_such_channel(target));
                CommandResult::Failure
            }
        };
    }

    enum Verdict {
        NoChannel,
        NotOp,
        BadLimit(String),
        MissingArg,
        UnknownMode(char),
        Applied(Vec<String>),
    }
    let modestring = msg.params[1].clone();
    let mut args = msg.params[2..].iter();
    let verdict = {
        let mut channels = core.channels.borrow_mut();
        match channels.get_mut(&key) {
            None => Verdict::NoChannel,
            Some(chan) => {
                if !chan.member_is_op(&nick) {
                    Verdict::NotOp
                } else {
                    let mut adding = true;
                    let mut outcome = None;
                    for mode in modestring.chars() {
                        match mode {
                            '+' => adding = true,
                            '-' => adding = false,
                            'n' | 't' => {
                                if adding {
                                    chan.modes.insert(mode);
                                } else {
                                    chan.modes.remove(&mode);
                                }
                            }
                            'l' => {
                                if adding {
                                    match args.next() {
                                        None => {
                                            outcome = Some(Verdict::MissingArg);
                                            break;
                                        }
                                        Some(arg) => match arg.parse::<u32>() {
                                            Ok(limit) if limit > 0 => chan.limit = Some(limit),
                                            _ => {
                                                outcome = Some(Verdict::BadLimit(arg.clone()));
                                                break;
                                            }
                                        },
                                    }
                                } else {
                                    chan.limit = None;
                                }
                            }
                            other => {
                                outcome = Some(Verdict::UnknownMode(other));
                                break;
                            }
                        }
                    }
                    outcome.unwrap_or_else(|| {
                        Verdict::Applied(chan.members.keys().cloned().collect())
                    })
                }
            }
        }
    };

    match verdict {
        Verdict::NoChannel => {
            client.send_numeric(core, Numeric::no_such_channel(target));
            CommandResult::Failure
        }
        Verdict::NotOp => {
            client.send_numeric(
                core,
                Numeric::chan_op_privs_needed(target, "change channel modes"),
            );
            CommandResult::Failure
        }
        Verdict::MissingArg => {
            client.send_numeric(core, Numeric::need_more_params("MODE"));
            CommandResult::Failure
        }
        Verdict::BadLimit(arg) => {
            client.send_numeric(
                core,
                Numeric::invalid_mode_param(target, 'l', "limit", &arg, None),
            );
            CommandResult::Failure
        }
        Verdict::UnknownMode(mode) => {
            client.send_numeric(core, Numeric::unknown_mode(mode));
            CommandResult::Failure
        }
        Verdict::Applied(members) => {
            let out = Message::with_prefix(
                client.user.prefix(),
                "MODE",
                msg.params.clone(),
            );
            deliver_to_nicks(core, client, &members, &out, true);
            CommandResult::Success
        }
    }
}

fn handle_user_mode(
    core: &Core,
    client: &mut ClientConn,
    msg: &Message,
    target: &str,
) -> CommandResult {
    if target.to_lowercase() != client.user.display_nick().to_lowercase() {
        client.send_numeric(core, Numeric::users_dont_match());
        return CommandResult::Failure;
    }
    if msg.params.len() == 1 {
        let mut modes: Vec<char> = client.user.modes.iter().copied().collect();
        modes.sort_unstable();
        let rendered = format!("+{}", modes.into_iter().collect::<String>());
        client.send_numeric(core, Numeric::umode_is(&rendered));
        return CommandResult::Success;
    }
    let mut adding = true;
    for mode in msg.params[1].chars() {
        match mode {
            '+' => adding = true,
            '-' => adding = false,
            'D' => {
                if adding {
                    client.user.modes.insert('D');
                } else {
                    client.user.modes.remove(&'D');
                }
            }
            // Operator status comes from OPER, never from MODE.
            'o' if !adding => {
                client.user.oper = false;
                client.user.modes.remove(&'o');
            }
            _ => {
                client.send_numeric(core, Numeric::umode_unknown_flag());
                return CommandResult::Failure;
            }
        }
    }
    CommandResult::Success
}

/// Send `msg` to each nick that maps to a live client. The sender is
/// included only when `include_self` is set.
fn deliver_to_nicks(
    core: &Core,
    sender: &mut ClientConn,
    nicks: &[String],
    msg: &Message,
    include_self: bool,
) {
    for nick in nicks {
        let fd = match core.nicks.borrow().get(&nick.to_lowercase()).copied() {
            Some(fd) => fd,
            None => continue,
        };
        if fd == sender.fd() {
            if include_self {
                sender.send_message(core, msg);
            }
            continue;
        }
        let peer = core.clients.borrow().get(&fd).cloned();
        if let Some(peer) = peer {
            peer.borrow_mut().send_message(core, msg);
        }
    }
}
