use std::path::PathBuf;

use thiserror::Error;

pub const HELP_TEXT: &str = "\
Commands:
  prompt <text>        set the video title / prompt
  headshot <path>      attach a headshot (resets results)
  clear                remove the headshot (resets results)
  facelock on|off      keep the headshot's face exactly
  preview              generate a fast preview
  final | enhance      generate the Full HD thumbnail
  download [dir]       save the shown thumbnail as 1280x720 JPEG
  fetch <url> [dir]    download an existing video thumbnail
  status               show the session state
  help                 show this message
  quit                 leave the session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Prompt(String),
    Headshot(PathBuf),
    ClearHeadshot,
    FaceLock(bool),
    Preview,
    Final,
    Download(Option<PathBuf>),
    Fetch { url: String, dir: Option<PathBuf> },
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command `{0}`, type `help` for a list")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

impl SessionCommand {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "prompt" => {
                if rest.is_empty() {
                    return Err(CommandError::Usage("prompt <text>"));
                }
                Self::Prompt(rest.to_string())
            }
            "headshot" => {
                if rest.is_empty() {
                    return Err(CommandError::Usage("headshot <path>"));
                }
                Self::Headshot(PathBuf::from(rest))
            }
            "clear" => Self::ClearHeadshot,
            "facelock" => match rest.to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => Self::FaceLock(true),
                "off" | "false" | "0" => Self::FaceLock(false),
                _ => return Err(CommandError::Usage("facelock on|off")),
            },
            "preview" => Self::Preview,
            "final" | "enhance" => Self::Final,
            "download" => Self::Download(optional_path(rest)),
            "fetch" => {
                let mut parts = rest.splitn(2, char::is_whitespace);
                let url = parts.next().unwrap_or_default();
                if url.is_empty() {
                    return Err(CommandError::Usage("fetch <url> [dir]"));
                }
                Self::Fetch {
                    url: url.to_string(),
                    dir: optional_path(parts.next().unwrap_or_default().trim()),
                }
            }
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };

        Ok(Some(command))
    }
}

fn optional_path(rest: &str) -> Option<PathBuf> {
    (!rest.is_empty()).then(|| PathBuf::from(rest))
}
