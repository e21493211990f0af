use std::path::PathBuf;

use psup_storage::DEFAULT_ACTIVITY_DAYS;

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open(Option<String>),
    Import(PathBuf),
    AttachCode(PathBuf),
    Clear,
    Solve,
    Unsolve,
    History,
    Delete(String),
    Activity(u32),
    SetKey(String),
    SetModel(String),
    Models,
    SetPrompt(String),
    ResetSettings,
    Help,
    Quit,
    Chat(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    MissingArgument(&'static str),
    InvalidNumber(String),
    Unknown(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingArgument(usage) => write!(formatter, "usage: {usage}"),
            Self::InvalidNumber(value) => write!(formatter, "not a number: {value}"),
            Self::Unknown(name) => write!(formatter, "unknown command /{name}, try /help"),
        }
    }
}

pub const HELP: &str = "\
/open [id]          open a cached problem (no id closes it)
/import <path>      cache a problem statement JSON file
/code <path>        attach a code file to the next message
/clear              clear the conversation
/solve, /unsolve    toggle today's solve record
/history            list cached problems
/delete <id>        delete a cached problem and its chat
/activity [days]    solve counts per day
/key <key>          set the API key
/model <id>         set the model
/models             list known models
/prompt [text]      set the system prompt (no text restores the default)
/reset-settings     restore default settings
/quit               exit
anything else is sent to the tutor";

pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Chat(line.to_string())));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };
    let required = |usage: &'static str| {
        if argument.is_empty() {
            Err(ParseError::MissingArgument(usage))
        } else {
            Ok(argument.to_string())
        }
    };

    let command = match name {
        "open" => Command::Open((!argument.is_empty()).then(|| argument.to_string())),
        "import" => Command::Import(PathBuf::from(required("/import <path>")?)),
        "code" => Command::AttachCode(PathBuf::from(required("/code <path>")?)),
        "clear" => Command::Clear,
        "solve" => Command::Solve,
        "unsolve" => Command::Unsolve,
        "history" => Command::History,
        "delete" => Command::Delete(required("/delete <id>")?),
        "activity" if argument.is_empty() => Command::Activity(DEFAULT_ACTIVITY_DAYS),
        "activity" => Command::Activity(
            argument
                .parse()
                .map_err(|_| ParseError::InvalidNumber(argument.to_string()))?,
        ),
        "key" => Command::SetKey(required("/key <key>")?),
        "model" => Command::SetModel(required("/model <id>")?),
        "models" => Command::Models,
        "prompt" => Command::SetPrompt(argument.to_string()),
        "reset-settings" => Command::ResetSettings,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_chat_message() {
        assert_eq!(
            parse("  how do I avoid TLE?  "),
            Ok(Some(Command::Chat("how do I avoid TLE?".to_string())))
        );
        assert_eq!(parse("   "), Ok(None));
    }

    #[test]
    fn open_accepts_optional_id() {
        assert_eq!(parse("/open 1000"), Ok(Some(Command::Open(Some("1000".to_string())))));
        assert_eq!(parse("/open"), Ok(Some(Command::Open(None))));
    }

    #[test]
    fn activity_defaults_to_a_year() {
        assert_eq!(parse("/activity"), Ok(Some(Command::Activity(365))));
        assert_eq!(parse("/activity 30"), Ok(Some(Command::Activity(30))));
        assert_eq!(
            parse("/activity month"),
            Err(ParseError::InvalidNumber("month".to_string()))
        );
    }

    #[test]
    fn missing_required_argument_reports_usage() {
        assert_eq!(
            parse("/code"),
            Err(ParseError::MissingArgument("/code <path>"))
        );
        assert_eq!(
            parse("/key"),
            Err(ParseError::MissingArgument("/key <key>"))
        );
    }

    #[test]
    fn prompt_keeps_inner_spacing() {
        assert_eq!(
            parse("/prompt Be  terse."),
            Ok(Some(Command::SetPrompt("Be  terse.".to_string())))
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert_eq!(parse("/frobnicate"), Err(ParseError::Unknown("frobnicate".to_string())));
    }
}
