//! Operator console: reads command lines and prints what happened.
//!
//! All human-readable command text lives here; the executor only deals in
//! typed commands and outcomes.

use crate::admin::{
    definition, lookup, Arg, CommandDef, CommandExecutor, CommandKind, CommandOutcome, COMMANDS,
};
use crate::error::CommandError;
use log::warn;
use std::io::Write;
use tokio::io::{AsyncBufRead, Lines};

/// Why the console loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The operator typed `exit`.
    Command,
    EndOfInput,
}

/// One-line summary shown by `help` and usage requests.
pub fn description(kind: CommandKind) -> &'static str {
    match kind {
        CommandKind::Help => "Lists all commands.",
        CommandKind::Exit => "Saves every online character and stops the server.",
        CommandKind::Announcement => "Sends a message to every online player.",
        CommandKind::OnlineList => "Lists every connected session.",
        CommandKind::Cps => {
            "Shows how many ticks per second the server is running; status adds tick and overrun counts."
        }
        CommandKind::Kill => "Kills an online player.",
        CommandKind::Kick => "Disconnects an online player.",
        CommandKind::Ban => {
            "Bans an online player for a number of minutes, optionally by address, and disconnects them."
        }
        CommandKind::Unban => "Lifts every ban on an account.",
        CommandKind::Mute => "Mutes an online player for a number of minutes, optionally by address.",
        CommandKind::Unmute => "Lifts every mute on an online character's account, or on a named account.",
        CommandKind::Power => "Sets the power level of an online player.",
        CommandKind::PowerAccount => "Sets the power level of an account, online or not.",
    }
}

/// Usage line: `<arg>` is required, `[arg]` may be left off.
pub fn usage(def: &CommandDef) -> String {
    let mut text = def.name.to_string();
    for arg in def.args {
        let label = match arg {
            Arg::Word("ip") => "<true|false>".to_string(),
            Arg::Word(label) => format!("<{}>", label),
            Arg::Optional(label) => format!("[{}]", label),
            Arg::Rest(label) => format!("<{}...>", label),
            Arg::OptionalRest(label) => format!("[{}...]", label),
        };
        text.push(' ');
        text.push_str(&label);
    }
    text
}

/// Console text for a successful command.
pub fn render(outcome: &CommandOutcome) -> Vec<String> {
    match outcome {
        CommandOutcome::Help => {
            let mut lines = vec!["Commands:".to_string()];
            lines.extend(
                COMMANDS
                    .iter()
                    .map(|def| format!("  {:<14} {}", def.name, description(def.kind))),
            );
            lines.push("Type <command> /? for usage.".to_string());
            lines
        }
        CommandOutcome::Usage(kind) => vec![
            format!("Usage: {}", usage(definition(*kind))),
            format!("  {}", description(*kind)),
        ],
        CommandOutcome::Shutdown => vec!["Shutting down...".to_string()],
        CommandOutcome::Announced { delivered } => {
            vec![format!("Announcement sent to {} players.", delivered)]
        }
        CommandOutcome::Online(entries) => {
            if entries.is_empty() {
                return vec!["No players online.".to_string()];
            }
            let mut lines = vec![format!(
                "{:<6} {:<10} {:<22} {:<16} {}",
                "Slot", "Transport", "Address", "Account", "Character"
            )];
            lines.extend(entries.iter().map(|entry| {
                format!(
                    "{:<6} {:<10} {:<22} {:<16} {}",
                    entry.slot,
                    entry.kind.to_string(),
                    entry.addr.to_string(),
                    entry.account.as_deref().unwrap_or("-"),
                    entry.character.as_deref().unwrap_or("-")
                )
            }));
            lines
        }
        CommandOutcome::Cps(cps) => vec![format!("Current CPS: {:.1}", cps)],
        CommandOutcome::CpsStatus {
            cps,
            ticks,
            overruns,
        } => vec![
            format!("Current CPS: {:.1}", cps),
            format!("Ticks run: {}, overruns: {}", ticks, overruns),
            "The tick rate is fixed by configuration.".to_string(),
        ],
        CommandOutcome::Killed { name } => vec![format!("{} has been killed.", name)],
        CommandOutcome::Kicked { name } => vec![format!("{} has been kicked.", name)],
        CommandOutcome::Banned {
            name,
            account,
            minutes,
            ip,
        } => vec![format!(
            "{} (account {}) has been banned for {} minutes{}.",
            name,
            account,
            minutes,
            match ip {
                Some(ip) => format!(", including address {}", ip),
                None => String::new(),
            }
        )],
        CommandOutcome::Unbanned { account } => vec![format!("Account {} has been unbanned.", account)],
        CommandOutcome::Muted {
            name,
            account,
            minutes,
            ip,
        } => vec![format!(
            "{} (account {}) has been muted for {} minutes{}.",
            name,
            account,
            minutes,
            match ip {
                Some(ip) => format!(", including address {}", ip),
                None => String::new(),
            }
        )],
        CommandOutcome::Unmuted { account } => vec![format!("Account {} has been unmuted.", account)],
        CommandOutcome::PowerSet {
            account,
            level,
            online,
        } => vec![format!(
            "Power of account {} set to {}{}.",
            account,
            level,
            if *online { "" } else { " (offline)" }
        )],
    }
}

/// Console text for a failed command, with usage for argument errors.
pub fn render_error(error: &CommandError) -> String {
    match error {
        CommandError::NotFound(name) if name.is_empty() => "Command not found.".to_string(),
        CommandError::NotFound(name) => {
            format!("Command '{}' not found. Type help for a list.", name)
        }
        CommandError::Arguments { command, reason } => match lookup(command) {
            Some(def) => format!("Invalid arguments ({}). Usage: {}", reason, usage(def)),
            None => format!("Invalid arguments ({}).", reason),
        },
        CommandError::TargetNotFound(name) => format!("Player {} is not online.", name),
        CommandError::AccountNotFound(account) => format!("Account {} does not exist.", account),
        CommandError::Database(e) => format!("Database error: {}", e),
    }
}

/// Runs commands from `lines` until `exit` or end of input, writing every
/// response line to `output`. Lines after `exit` stay unread.
pub async fn run_console<R, W>(
    executor: &CommandExecutor,
    lines: &mut Lines<R>,
    mut output: W,
) -> ConsoleExit
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return ConsoleExit::EndOfInput,
            Err(e) => {
                warn!("Console input failed: {}", e);
                return ConsoleExit::EndOfInput;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (text, exit) = match executor.execute_line(line) {
            Ok(outcome) => (render(&outcome), matches!(outcome, CommandOutcome::Shutdown)),
            Err(e) => (vec![render_error(&e)], false),
        };
        for line in text {
            let _ = writeln!(output, "{}", line);
        }
        let _ = output.flush();

        if exit {
            return ConsoleExit::Command;
        }
    }
}
