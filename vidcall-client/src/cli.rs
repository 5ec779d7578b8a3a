use std::str::FromStr;
use thiserror::Error;
use vidcall_webrtc::TrackKind;

pub const HELP: &str = "\
commands:
  call <id>            call a reachable endpoint
  answer               answer the incoming call
  reject               decline the incoming call
  hangup               end or cancel the current call
  mute audio|video     toggle a local track
  users                list reachable endpoints
  state                show the current call
  quit                 hang up and exit";

/// A line typed into the interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Call(String),
    Answer,
    Reject,
    HangUp,
    Mute(TrackKind),
    Users,
    State,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}, type `help` for a list of commands")]
pub struct ParseCommandError(String);

impl FromStr for CliCommand {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Err(ParseCommandError("empty command".to_string()));
        };
        let argument = words.next();
        if words.next().is_some() {
            return Err(ParseCommandError(format!("too many arguments for `{command}`")));
        }

        let command = match (command.to_ascii_lowercase().as_str(), argument) {
            ("call", Some(id)) => CliCommand::Call(id.to_string()),
            ("call", None) => {
                return Err(ParseCommandError("`call` needs an endpoint id".to_string()));
            }
            ("answer" | "accept", None) => CliCommand::Answer,
            ("reject" | "decline", None) => CliCommand::Reject,
            ("hangup" | "end", None) => CliCommand::HangUp,
            ("mute", Some(kind)) => match kind.to_ascii_lowercase().as_str() {
                "audio" | "mic" => CliCommand::Mute(TrackKind::Audio),
                "video" | "camera" => CliCommand::Mute(TrackKind::Video),
                other => {
                    return Err(ParseCommandError(format!("unknown track `{other}`")));
                }
            },
            ("mute", None) => CliCommand::Mute(TrackKind::Audio),
            ("users" | "who", None) => CliCommand::Users,
            ("state" | "status", None) => CliCommand::State,
            ("help" | "?", None) => CliCommand::Help,
            ("quit" | "exit", None) => CliCommand::Quit,
            (_, Some(_)) if is_known(command) => {
                return Err(ParseCommandError(format!("`{command}` takes no argument")));
            }
            _ => return Err(ParseCommandError(format!("unknown command `{command}`"))),
        };
        Ok(command)
    }
}

fn is_known(command: &str) -> bool {
    matches!(
        command.to_ascii_lowercase().as_str(),
        "answer"
            | "accept"
            | "reject"
            | "decline"
            | "hangup"
            | "end"
            | "users"
            | "who"
            | "state"
            | "status"
            | "help"
            | "?"
            | "quit"
            | "exit"
    )
}
