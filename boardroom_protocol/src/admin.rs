// Admin command-line grammar.
//
// A command line is whitespace-separated tokens. The first token names the
// command (case-sensitive, exact match) and each command takes a fixed number
// of arguments. Anything else is an illegal command; there is no partial
// matching and no defaulting of missing arguments.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminCommand {
    Start,
    Shutdown,
    Lobbies,
    ShutdownLobby { lobby: String },
    ChangeLobbyName { old: String, new: String },
    ChangeLobbyPassword { lobby: String, password: String },
    Kick { lobby: String, user: String },
    Ban { lobby: String, user: String },
    Unban { lobby: String, user: String },
    GetLogFile,
    GetLogSize,
    ClearLogFile,
    LogLevel { filter: String },
    Help,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AdminParseError {
    #[error("illegal command: {0:?}")]
    Illegal(String),
}

/// `(syntax, description)` for every command, in `-help` order.
pub const USAGE: &[(&str, &str)] = &[
    ("-start", "start the session server"),
    ("-shutdown", "stop the session server"),
    ("-lobbies", "list active lobbies"),
    ("-shutdownlobby <lobby>", "close one lobby"),
    ("-changelobbyname <old> <new>", "rename a lobby"),
    ("-changelobbypassword <lobby> <password>", "reset a lobby password"),
    ("-kick <lobby> <user>", "disconnect a user"),
    ("-ban <lobby> <user>", "ban a user from a lobby"),
    ("-unban <lobby> <user>", "lift a ban"),
    ("-getlogfile", "print the log file"),
    ("-getlogsize", "print the log file size"),
    ("-clearlogfile", "truncate the log file"),
    ("-loglevel <filter>", "change the log filter (e.g. debug)"),
    ("-help", "print this list"),
];

impl FromStr for AdminCommand {
    type Err = AdminParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next().unwrap_or_default();
        let args: Vec<String> = tokens.map(str::to_owned).collect();
        let illegal = || AdminParseError::Illegal(line.trim().to_owned());

        let command = match (name, args.as_slice()) {
            ("-start", []) => AdminCommand::Start,
            ("-shutdown", []) => AdminCommand::Shutdown,
            ("-lobbies", []) => AdminCommand::Lobbies,
            ("-shutdownlobby", [lobby]) => AdminCommand::ShutdownLobby {
                lobby: lobby.clone(),
            },
            ("-changelobbyname", [old, new]) => AdminCommand::ChangeLobbyName {
                old: old.clone(),
                new: new.clone(),
            },
            ("-changelobbypassword", [lobby, password]) => AdminCommand::ChangeLobbyPassword {
                lobby: lobby.clone(),
                password: password.clone(),
            },
            ("-kick", [lobby, user]) => AdminCommand::Kick {
                lobby: lobby.clone(),
                user: user.clone(),
            },
            ("-ban", [lobby, user]) => AdminCommand::Ban {
                lobby: lobby.clone(),
                user: user.clone(),
            },
            ("-unban", [lobby, user]) => AdminCommand::Unban {
                lobby: lobby.clone(),
                user: user.clone(),
            },
            ("-getlogfile", []) => AdminCommand::GetLogFile,
            ("-getlogsize", []) => AdminCommand::GetLogSize,
            ("-clearlogfile", []) => AdminCommand::ClearLogFile,
            ("-loglevel", [filter]) => AdminCommand::LogLevel {
                filter: filter.clone(),
            },
            ("-help", []) => AdminCommand::Help,
            _ => return Err(illegal()),
        };
        Ok(command)
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminCommand::Start => f.write_str("-start"),
            AdminCommand::Shutdown => f.write_str("-shutdown"),
            AdminCommand::Lobbies => f.write_str("-lobbies"),
            AdminCommand::ShutdownLobby { lobby } => write!(f, "-shutdownlobby {lobby}"),
            AdminCommand::ChangeLobbyName { old, new } => write!(f, "-changelobbyname {old} {new}"),
            // Never echo the password.
            AdminCommand::ChangeLobbyPassword { lobby, .. } => {
                write!(f, "-changelobbypassword {lobby} ***")
            }
            AdminCommand::Kick { lobby, user } => write!(f, "-kick {lobby} {user}"),
            AdminCommand::Ban { lobby, user } => write!(f, "-ban {lobby} {user}"),
            AdminCommand::Unban { lobby, user } => write!(f, "-unban {lobby} {user}"),
            AdminCommand::GetLogFile => f.write_str("-getlogfile"),
            AdminCommand::GetLogSize => f.write_str("-getlogsize"),
            AdminCommand::ClearLogFile => f.write_str("-clearlogfile"),
            AdminCommand::LogLevel { filter } => write!(f, "-loglevel {filter}"),
            AdminCommand::Help => f.write_str("-help"),
        }
    }
}
