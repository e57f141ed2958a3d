use std::path::PathBuf;

use snafu::{OptionExt, Snafu, ensure};

pub const HELP_TEXT: &str = "\
commands:
  <text>                       send a message
  /login <user> <password>     sign in
  /register <user> <pw> <pw>   create an account and sign in
  /logout                      sign out
  /docs                        list uploaded documents
  /upload <path.txt>           upload a text document
  /delete <document id>        delete a document
  /use [document id]           chat about a document, or about nothing in particular
  /ws | /rest                  switch to streaming or request/response replies
  /reconnect                   reopen the streaming connection
  /recs                        show suggested questions
  /help                        show this help
  /quit                        exit";

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Say(String),
    Login {
        username: String,
        password: String,
    },
    Register {
        username: String,
        password: String,
        confirmation: String,
    },
    Logout,
    ListDocuments,
    Upload(PathBuf),
    Delete(String),
    UseDocument(Option<String>),
    Streaming,
    Rest,
    Reconnect,
    Recommendations,
    Help,
    Quit,
    Empty,
}

impl InputCommand {
    /// Whether the command is usable before anyone has signed in.
    pub fn allowed_signed_out(&self) -> bool {
        matches!(
            self,
            Self::Login { .. } | Self::Register { .. } | Self::Help | Self::Quit | Self::Empty
        )
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    Unknown { stage: &'static str, name: String },
    #[snafu(display("usage: {usage}"))]
    Usage {
        stage: &'static str,
        usage: &'static str,
    },
}

pub fn parse_input(line: &str) -> Result<InputCommand, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(InputCommand::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(InputCommand::Say(line.to_string()));
    };

    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    let command = match name {
        "login" => {
            let [username, password] = exact(&args, "/login <user> <password>")?;
            InputCommand::Login {
                username: username.to_string(),
                password: password.to_string(),
            }
        }
        "register" => {
            let [username, password, confirmation] =
                exact(&args, "/register <user> <password> <password>")?;
            InputCommand::Register {
                username: username.to_string(),
                password: password.to_string(),
                confirmation: confirmation.to_string(),
            }
        }
        "logout" => no_args(&args, "/logout", InputCommand::Logout)?,
        "docs" => no_args(&args, "/docs", InputCommand::ListDocuments)?,
        "upload" => {
            // Paths may contain spaces, so take the raw remainder.
            let path = rest.trim_start()["upload".len()..].trim();
            ensure!(
                !path.is_empty(),
                UsageSnafu {
                    stage: "parse-upload",
                    usage: "/upload <path.txt>",
                }
            );
            InputCommand::Upload(PathBuf::from(path))
        }
        "delete" => {
            let [document_id] = exact(&args, "/delete <document id>")?;
            InputCommand::Delete(document_id.to_string())
        }
        "use" => match args.as_slice() {
            [] => InputCommand::UseDocument(None),
            [document_id] => InputCommand::UseDocument(Some(document_id.to_string())),
            _ => {
                return UsageSnafu {
                    stage: "parse-use",
                    usage: "/use [document id]",
                }
                .fail();
            }
        },
        "ws" | "stream" => no_args(&args, "/ws", InputCommand::Streaming)?,
        "rest" => no_args(&args, "/rest", InputCommand::Rest)?,
        "reconnect" => no_args(&args, "/reconnect", InputCommand::Reconnect)?,
        "recs" => no_args(&args, "/recs", InputCommand::Recommendations)?,
        "help" | "?" => InputCommand::Help,
        "quit" | "exit" => InputCommand::Quit,
        other => {
            return UnknownSnafu {
                stage: "parse-command",
                name: other.to_string(),
            }
            .fail();
        }
    };
    Ok(command)
}

fn exact<'a, const N: usize>(
    args: &[&'a str],
    usage: &'static str,
) -> Result<[&'a str; N], CommandError> {
    <[&str; N]>::try_from(args).ok().context(UsageSnafu {
        stage: "parse-arguments",
        usage,
    })
}

fn no_args(
    args: &[&str],
    usage: &'static str,
    command: InputCommand,
) -> Result<InputCommand, CommandError> {
    ensure!(
        args.is_empty(),
        UsageSnafu {
            stage: "parse-arguments",
            usage,
        }
    );
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            parse_input("  what does chapter two say? "),
            Ok(InputCommand::Say("what does chapter two say?".into()))
        );
        assert_eq!(parse_input("   "), Ok(InputCommand::Empty));
    }

    #[test]
    fn account_commands_need_every_argument() {
        assert_eq!(
            parse_input("/login ada secret"),
            Ok(InputCommand::Login {
                username: "ada".into(),
                password: "secret".into()
            })
        );
        assert!(matches!(
            parse_input("/login ada"),
            Err(CommandError::Usage { .. })
        ));
        assert_eq!(
            parse_input("/register ada pw pw"),
            Ok(InputCommand::Register {
                username: "ada".into(),
                password: "pw".into(),
                confirmation: "pw".into()
            })
        );
    }

    #[test]
    fn upload_keeps_spaces_in_the_path() {
        assert_eq!(
            parse_input("/upload /tmp/my notes.txt"),
            Ok(InputCommand::Upload(PathBuf::from("/tmp/my notes.txt")))
        );
        assert!(parse_input("/upload").is_err());
    }

    #[test]
    fn use_without_an_id_clears_the_selection() {
        assert_eq!(parse_input("/use"), Ok(InputCommand::UseDocument(None)));
        assert_eq!(
            parse_input("/use doc-7"),
            Ok(InputCommand::UseDocument(Some("doc-7".into())))
        );
    }

    #[test]
    fn unknown_and_malformed_commands_are_reported() {
        assert!(matches!(
            parse_input("/teleport"),
            Err(CommandError::Unknown { name, .. }) if name == "teleport"
        ));
        assert!(matches!(parse_input("/ws now"), Err(CommandError::Usage { .. })));
        assert_eq!(parse_input("/rest"), Ok(InputCommand::Rest));
    }

    #[test]
    fn only_account_commands_work_signed_out() {
        assert!(parse_input("/login a b").unwrap().allowed_signed_out());
        assert!(!parse_input("hello").unwrap().allowed_signed_out());
        assert!(!parse_input("/docs").unwrap().allowed_signed_out());
    }
}
