//! Operator command parsing and execution.
//!
//! Parsing is table driven: [`COMMANDS`] lists every command with its
//! argument shape, and [`parse`] turns a console line into a typed
//! [`Command`]. The executor never prints; it returns a [`CommandOutcome`]
//! that the console renders.
//!
//! Commands that end a session snapshot the target first, do their
//! database work with no registry lock held, announce to everyone else and
//! only then end the session.

use crate::context::ServerContext;
use crate::database::Sanction;
use crate::error::CommandError;
use crate::registry::{ClientSession, SlotId};
use crate::world::WorldCommand;
use log::info;
use shared::{Packet, TransportKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Identity recorded as the issuer of console sanctions.
pub const CONSOLE_ISSUER: &str = "Server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Help,
    Exit,
    Announcement,
    OnlineList,
    Cps,
    Kill,
    Kick,
    Ban,
    Unban,
    Mute,
    Unmute,
    Power,
    PowerAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    /// A single whitespace-delimited token.
    Word(&'static str),
    /// A single token that may be left off.
    Optional(&'static str),
    /// Everything left on the line; at least one token.
    Rest(&'static str),
    /// Everything left on the line, possibly nothing.
    OptionalRest(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDef {
    pub kind: CommandKind,
    pub name: &'static str,
    pub args: &'static [Arg],
}

pub const COMMANDS: &[CommandDef] = &[
    CommandDef {
        kind: CommandKind::Help,
        name: "help",
        args: &[],
    },
    CommandDef {
        kind: CommandKind::Exit,
        name: "exit",
        args: &[],
    },
    CommandDef {
        kind: CommandKind::Announcement,
        name: "announcement",
        args: &[Arg::Rest("message")],
    },
    CommandDef {
        kind: CommandKind::OnlineList,
        name: "onlinelist",
        args: &[],
    },
    CommandDef {
        kind: CommandKind::Cps,
        name: "cps",
        args: &[Arg::Optional("mode")],
    },
    CommandDef {
        kind: CommandKind::Kill,
        name: "kill",
        args: &[Arg::Word("name")],
    },
    CommandDef {
        kind: CommandKind::Kick,
        name: "kick",
        args: &[Arg::Word("name")],
    },
    CommandDef {
        kind: CommandKind::Ban,
        name: "ban",
        args: &[
            Arg::Word("name"),
            Arg::Word("minutes"),
            Arg::Word("ip"),
            Arg::OptionalRest("reason"),
        ],
    },
    CommandDef {
        kind: CommandKind::Unban,
        name: "unban",
        args: &[Arg::Word("account")],
    },
    CommandDef {
        kind: CommandKind::Mute,
        name: "mute",
        args: &[
            Arg::Word("name"),
            Arg::Word("minutes"),
            Arg::Word("ip"),
            Arg::OptionalRest("reason"),
        ],
    },
    CommandDef {
        kind: CommandKind::Unmute,
        name: "unmute",
        args: &[Arg::Word("name")],
    },
    CommandDef {
        kind: CommandKind::Power,
        name: "power",
        args: &[Arg::Word("name"), Arg::Word("level")],
    },
    CommandDef {
        kind: CommandKind::PowerAccount,
        name: "poweracc",
        args: &[Arg::Word("account"), Arg::Word("level")],
    },
];

/// Token that turns any command into a usage request.
pub const USAGE_FLAG: &str = "/?";

pub fn definition(kind: CommandKind) -> &'static CommandDef {
    // Every kind has exactly one table row.
    COMMANDS
        .iter()
        .find(|def| def.kind == kind)
        .unwrap_or(&COMMANDS[0])
}

pub fn lookup(name: &str) -> Option<&'static CommandDef> {
    COMMANDS
        .iter()
        .find(|def| def.name.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Usage(CommandKind),
    Exit,
    Announcement {
        message: String,
    },
    OnlineList,
    Cps,
    CpsStatus,
    Kill {
        name: String,
    },
    Kick {
        name: String,
    },
    Ban {
        name: String,
        minutes: u32,
        ip: bool,
        reason: String,
    },
    Unban {
        account: String,
    },
    Mute {
        name: String,
        minutes: u32,
        ip: bool,
        reason: String,
    },
    /// Matches an online character first, then an account.
    Unmute {
        name: String,
    },
    Power {
        name: String,
        level: i32,
    },
    PowerAccount {
        account: String,
        level: i32,
    },
}

/// Parses one console line.
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next().unwrap_or_default();
    let def = lookup(name).ok_or_else(|| CommandError::NotFound(name.to_string()))?;

    let tokens: Vec<&str> = tokens.collect();
    if tokens.first() == Some(&USAGE_FLAG) {
        return Ok(Command::Usage(def.kind));
    }
    let values = bind_args(def, &tokens)?;
    build(def, values)
}

fn bind_args(def: &CommandDef, tokens: &[&str]) -> Result<Vec<String>, CommandError> {
    let mut values = Vec::with_capacity(def.args.len());
    let mut rest = tokens.iter();

    for arg in def.args {
        match arg {
            Arg::Word(label) => {
                let token = rest.next().ok_or_else(|| missing(def, label))?;
                values.push(token.to_string());
            }
            Arg::Optional(_) => {
                values.push(rest.next().map(|token| token.to_string()).unwrap_or_default());
            }
            Arg::Rest(label) => {
                let remaining: Vec<&str> = rest.by_ref().copied().collect();
                if remaining.is_empty() {
                    return Err(missing(def, label));
                }
                values.push(remaining.join(" "));
            }
            Arg::OptionalRest(_) => {
                let remaining: Vec<&str> = rest.by_ref().copied().collect();
                values.push(remaining.join(" "));
            }
        }
    }

    if rest.next().is_some() {
        return Err(CommandError::Arguments {
            command: def.name,
            reason: format!("expected {} arguments", def.args.len()),
        });
    }
    Ok(values)
}

fn missing(def: &CommandDef, label: &str) -> CommandError {
    CommandError::Arguments {
        command: def.name,
        reason: format!("missing <{}>", label),
    }
}

fn build(def: &CommandDef, values: Vec<String>) -> Result<Command, CommandError> {
    // bind_args produced exactly one value per argument.
    let mut values = values.into_iter();
    let mut next = || values.next().unwrap_or_default();
    let command = match def.kind {
        CommandKind::Help => Command::Help,
        CommandKind::Exit => Command::Exit,
        CommandKind::Announcement => Command::Announcement { message: next() },
        CommandKind::OnlineList => Command::OnlineList,
        CommandKind::Cps => parse_cps_mode(def, &next())?,
        CommandKind::Kill => Command::Kill { name: next() },
        CommandKind::Kick => Command::Kick { name: next() },
        CommandKind::Ban | CommandKind::Mute => {
            let name = next();
            let minutes = parse_number(def, "minutes", &next())?;
            let ip = parse_flag(def, &next())?;
            let reason = next();
            if def.kind == CommandKind::Ban {
                Command::Ban {
                    name,
                    minutes,
                    ip,
                    reason,
                }
            } else {
                Command::Mute {
                    name,
                    minutes,
                    ip,
                    reason,
                }
            }
        }
        CommandKind::Unban => Command::Unban { account: next() },
        CommandKind::Unmute => Command::Unmute { name: next() },
        CommandKind::Power => Command::Power {
            name: next(),
            level: parse_number(def, "level", &next())?,
        },
        CommandKind::PowerAccount => Command::PowerAccount {
            account: next(),
            level: parse_number(def, "level", &next())?,
        },
    };
    Ok(command)
}

fn parse_number<T: std::str::FromStr>(
    def: &CommandDef,
    label: &str,
    value: &str,
) -> Result<T, CommandError> {
    value.parse().map_err(|_| CommandError::Arguments {
        command: def.name,
        reason: format!("<{}> must be a number, got {:?}", label, value),
    })
}

fn parse_cps_mode(def: &CommandDef, mode: &str) -> Result<Command, CommandError> {
    match mode.to_ascii_lowercase().as_str() {
        "" => Ok(Command::Cps),
        "status" => Ok(Command::CpsStatus),
        "lock" | "unlock" => Err(CommandError::Arguments {
            command: def.name,
            reason: "the tick rate is fixed by tick_rate in the configuration".into(),
        }),
        _ => Err(CommandError::Arguments {
            command: def.name,
            reason: format!("<mode> must be status, got {:?}", mode),
        }),
    }
}

fn parse_flag(def: &CommandDef, value: &str) -> Result<bool, CommandError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CommandError::Arguments {
            command: def.name,
            reason: format!("<ip> must be true or false, got {:?}", value),
        }),
    }
}

/// One row of `onlinelist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineEntry {
    pub slot: SlotId,
    pub kind: TransportKind,
    pub addr: SocketAddr,
    pub account: Option<String>,
    pub character: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Help,
    Usage(CommandKind),
    Shutdown,
    Announced {
        delivered: usize,
    },
    Online(Vec<OnlineEntry>),
    Cps(f64),
    CpsStatus {
        cps: f64,
        ticks: u64,
        overruns: u64,
    },
    Killed {
        name: String,
    },
    Kicked {
        name: String,
    },
    Banned {
        name: String,
        account: String,
        minutes: u32,
        ip: Option<IpAddr>,
    },
    Unbanned {
        account: String,
    },
    Muted {
        name: String,
        account: String,
        minutes: u32,
        ip: Option<IpAddr>,
    },
    Unmuted {
        account: String,
    },
    PowerSet {
        account: String,
        level: i32,
        online: bool,
    },
}

pub struct CommandExecutor {
    context: Arc<ServerContext>,
    issuer: String,
}

impl CommandExecutor {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self {
            context,
            issuer: CONSOLE_ISSUER.to_string(),
        }
    }

    pub fn execute_line(&self, line: &str) -> Result<CommandOutcome, CommandError> {
        let command = parse(line)?;
        self.execute(command)
    }

    pub fn execute(&self, command: Command) -> Result<CommandOutcome, CommandError> {
        match command {
            Command::Help => Ok(CommandOutcome::Help),
            Command::Usage(kind) => Ok(CommandOutcome::Usage(kind)),
            Command::Exit => Ok(CommandOutcome::Shutdown),
            Command::Announcement { message } => Ok(self.announce(message)),
            Command::OnlineList => Ok(self.online_list()),
            Command::Cps => Ok(CommandOutcome::Cps(self.context.stats.cps())),
            Command::CpsStatus => {
                let stats = &self.context.stats;
                Ok(CommandOutcome::CpsStatus {
                    cps: stats.cps(),
                    ticks: stats.ticks(),
                    overruns: stats.overruns(),
                })
            }
            Command::Kill { name } => self.kill(&name),
            Command::Kick { name } => self.kick(&name),
            Command::Ban {
                name,
                minutes,
                ip,
                reason,
            } => self.ban(&name, minutes, ip, reason),
            Command::Unban { account } => self.unban(account),
            Command::Mute {
                name,
                minutes,
                ip,
                reason,
            } => self.mute(&name, minutes, ip, reason),
            Command::Unmute { name } => self.unmute(&name),
            Command::Power { name, level } => self.power(&name, level),
            Command::PowerAccount { account, level } => self.power_account(account, level),
        }
    }

    fn target(&self, name: &str) -> Result<(ClientSession, String), CommandError> {
        let session = self
            .context
            .registry
            .find_by_name(name)
            .ok_or_else(|| CommandError::TargetNotFound(name.to_string()))?;
        let account = session
            .account
            .clone()
            .ok_or_else(|| CommandError::TargetNotFound(name.to_string()))?;
        Ok((session, account))
    }

    fn global(&self, message: String, exclude: Option<SlotId>) -> usize {
        self.context
            .registry
            .broadcast(&Packet::GlobalMessage { message }, exclude)
    }

    fn announce(&self, message: String) -> CommandOutcome {
        info!("Announcement: {}", message);
        CommandOutcome::Announced {
            delivered: self.global(message, None),
        }
    }

    fn online_list(&self) -> CommandOutcome {
        let mut entries: Vec<OnlineEntry> = self
            .context
            .registry
            .sessions()
            .into_iter()
            .map(|session| OnlineEntry {
                slot: session.slot,
                kind: session.kind,
                addr: session.addr,
                character: session.character_name().map(str::to_string),
                account: session.account,
            })
            .collect();
        entries.sort_by_key(|entry| entry.slot);
        CommandOutcome::Online(entries)
    }

    fn kill(&self, name: &str) -> Result<CommandOutcome, CommandError> {
        let (session, _) = self.target(name)?;
        let name = session.character_name().unwrap_or(name).to_string();

        self.context
            .send_world(WorldCommand::Kill { slot: session.slot });
        self.global(format!("{} has been killed by the server.", name), None);
        info!("Killed {}", name);
        Ok(CommandOutcome::Killed { name })
    }

    fn kick(&self, name: &str) -> Result<CommandOutcome, CommandError> {
        let (session, _) = self.target(name)?;
        let name = session.character_name().unwrap_or(name).to_string();

        self.global(
            format!("{} has been kicked by the server.", name),
            Some(session.slot),
        );
        self.context.end_session(
            session.slot,
            session.connection_id,
            Some("You have been kicked by the server."),
        );
        info!("Kicked {} ({})", name, session.addr);
        Ok(CommandOutcome::Kicked { name })
    }

    fn ban(
        &self,
        name: &str,
        minutes: u32,
        ip: bool,
        reason: String,
    ) -> Result<CommandOutcome, CommandError> {
        let (session, account) = self.target(name)?;
        let name = session.character_name().unwrap_or(name).to_string();
        let ip = ip.then(|| session.addr.ip());

        self.context.database.add_ban(Sanction::new(
            account.clone(),
            minutes,
            reason.clone(),
            self.issuer.clone(),
            ip,
        ))?;

        self.global(
            format!("{} has been banned by the server.", name),
            Some(session.slot),
        );
        let notice = if reason.is_empty() {
            "You have been banned.".to_string()
        } else {
            format!("You have been banned: {}", reason)
        };
        self.context
            .end_session(session.slot, session.connection_id, Some(&notice));
        info!(
            "Banned {} (account {}) for {} minutes{}",
            name,
            account,
            minutes,
            if ip.is_some() { " with address" } else { "" }
        );
        Ok(CommandOutcome::Banned {
            name,
            account,
            minutes,
            ip,
        })
    }

    fn unban(&self, account: String) -> Result<CommandOutcome, CommandError> {
        if !self.context.database.account_exists(&account)? {
            return Err(CommandError::AccountNotFound(account));
        }
        self.context.database.delete_ban(&account)?;
        info!("Unbanned {}", account);
        Ok(CommandOutcome::Unbanned { account })
    }

    fn mute(
        &self,
        name: &str,
        minutes: u32,
        ip: bool,
        reason: String,
    ) -> Result<CommandOutcome, CommandError> {
        let (session, account) = self.target(name)?;
        let name = session.character_name().unwrap_or(name).to_string();
        let ip = ip.then(|| session.addr.ip());

        self.context.database.add_mute(Sanction::new(
            account.clone(),
            minutes,
            reason.clone(),
            self.issuer.clone(),
            ip,
        ))?;

        // The session may have gone while the record was written.
        self.context
            .registry
            .update(session.slot, session.connection_id, |s| {
                s.muted = true;
                s.mute_reason = (!reason.is_empty()).then_some(reason);
            });
        self.global(format!("{} has been muted by the server.", name), None);
        info!("Muted {} (account {}) for {} minutes", name, account, minutes);
        Ok(CommandOutcome::Muted {
            name,
            account,
            minutes,
            ip,
        })
    }

    fn unmute(&self, name: &str) -> Result<CommandOutcome, CommandError> {
        let (session, account) = match self.target(name) {
            Ok((session, account)) => (Some(session), account),
            Err(_) if self.context.database.account_exists(name)? => (None, name.to_string()),
            Err(_) => return Err(CommandError::AccountNotFound(name.to_string())),
        };
        self.context.database.delete_mute(&account)?;

        // Mutes are per account; clear the flag on whichever session holds it.
        let session = session.or_else(|| self.context.registry.find_by_account(&account));
        if let Some(session) = session {
            self.context
                .registry
                .update(session.slot, session.connection_id, |s| {
                    s.muted = false;
                    s.mute_reason = None;
                });
            let name = session.character_name().unwrap_or(name);
            self.global(format!("{} has been unmuted by the server.", name), None);
        }
        info!("Unmuted {}", account);
        Ok(CommandOutcome::Unmuted { account })
    }

    fn power(&self, name: &str, level: i32) -> Result<CommandOutcome, CommandError> {
        let (session, account) = self.target(name)?;
        let name = session.character_name().unwrap_or(name).to_string();
        self.context.database.set_player_power(&account, level)?;
        self.context
            .registry
            .update(session.slot, session.connection_id, |s| s.power = level);
        if session.entity.is_some() {
            self.context.send_world(WorldCommand::PowerChanged {
                slot: session.slot,
                power: level,
            });
        }

        let announcement = if level > 0 {
            format!("{} has been given administrative powers.", name)
        } else {
            format!("{} has had administrative powers removed.", name)
        };
        self.global(announcement, None);
        info!("Set power of {} to {}", account, level);
        Ok(CommandOutcome::PowerSet {
            account,
            level,
            online: true,
        })
    }

    fn power_account(&self, account: String, level: i32) -> Result<CommandOutcome, CommandError> {
        if !self.context.database.account_exists(&account)? {
            return Err(CommandError::AccountNotFound(account));
        }
        self.context.database.set_player_power(&account, level)?;

        let online = match self.context.registry.find_by_account(&account) {
            Some(session) => self
                .context
                .registry
                .update(session.slot, session.connection_id, |s| s.power = level)
                .is_some(),
            None => false,
        };
        info!("Set power of account {} to {}", account, level);
        Ok(CommandOutcome::PowerSet {
            account,
            level,
            online,
        })
    }
}
