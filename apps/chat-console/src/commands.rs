//! Line grammar for the console.

use thiserror::Error;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Open { peer_id: String },
    Older,
    Send { peer_id: String, text: String },
    Retry { client_id: String },
    Search { query: String },
    /// Open the N-th user (1-based) from the latest search results.
    Pick { index: usize },
    Focus { peer_id: String },
    Close,
    Show,
    Hide,
    Refresh,
    SignOut,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown command '{0}'; type 'help'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &str = "\
open <peer>         open a conversation
older               load the previous history page
send <peer> <text>  send a message
retry <client-id>   re-send a failed message
search [query]      search the directory (blank lists verified users)
pick <n>            open the n-th search result
focus <peer>        open a conversation, looking the peer up if needed
close               close the open conversation
show | hide         toggle visibility
refresh             reload the conversation list
signout             drop the session and persisted counters
quit                exit";

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "open" => ConsoleCommand::Open {
            peer_id: single_arg(rest, "open <peer>")?,
        },
        "older" => ConsoleCommand::Older,
        "send" => {
            let Some((peer_id, text)) = rest.split_once(char::is_whitespace) else {
                return Err(ParseError::Usage("send <peer> <text>"));
            };
            ConsoleCommand::Send {
                peer_id: peer_id.to_owned(),
                text: text.trim().to_owned(),
            }
        }
        "retry" => ConsoleCommand::Retry {
            client_id: single_arg(rest, "retry <client-id>")?,
        },
        "search" => ConsoleCommand::Search {
            query: rest.to_owned(),
        },
        "pick" => {
            let index = rest
                .parse::<usize>()
                .ok()
                .filter(|index| *index > 0)
                .ok_or(ParseError::Usage("pick <n>, counting from 1"))?;
            ConsoleCommand::Pick { index }
        }
        "focus" => ConsoleCommand::Focus {
            peer_id: single_arg(rest, "focus <peer>")?,
        },
        "close" => ConsoleCommand::Close,
        "show" => ConsoleCommand::Show,
        "hide" => ConsoleCommand::Hide,
        "refresh" => ConsoleCommand::Refresh,
        "signout" | "logout" => ConsoleCommand::SignOut,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(ParseError::Unknown(other.to_owned())),
    };
    Ok(Some(command))
}

fn single_arg(rest: &str, usage: &'static str) -> Result<String, ParseError> {
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return Err(ParseError::Usage(usage));
    }
    Ok(rest.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_with_spaces_in_text() {
        assert_eq!(
            parse_line("send u7   see you at 5 ").expect("valid line"),
            Some(ConsoleCommand::Send {
                peer_id: "u7".into(),
                text: "see you at 5".into(),
            })
        );
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_line("   ").expect("blank is fine"), None);
    }

    #[test]
    fn search_allows_blank_query() {
        assert_eq!(
            parse_line("search").expect("valid line"),
            Some(ConsoleCommand::Search {
                query: String::new()
            })
        );
        assert_eq!(
            parse_line("SEARCH ada lovelace").expect("valid line"),
            Some(ConsoleCommand::Search {
                query: "ada lovelace".into()
            })
        );
    }

    #[test]
    fn reports_usage_for_bad_arguments() {
        assert_eq!(
            parse_line("open").expect_err("peer required"),
            ParseError::Usage("open <peer>")
        );
        assert_eq!(
            parse_line("send u7").expect_err("text required"),
            ParseError::Usage("send <peer> <text>")
        );
        assert!(matches!(parse_line("pick 0"), Err(ParseError::Usage(_))));
        assert_eq!(
            parse_line("dance").expect_err("unknown verb"),
            ParseError::Unknown("dance".into())
        );
    }

    #[test]
    fn parses_simple_verbs() {
        let cases = [
            ("older", ConsoleCommand::Older),
            ("close", ConsoleCommand::Close),
            ("show", ConsoleCommand::Show),
            ("hide", ConsoleCommand::Hide),
            ("refresh", ConsoleCommand::Refresh),
            ("logout", ConsoleCommand::SignOut),
            ("quit", ConsoleCommand::Quit),
            ("pick 2", ConsoleCommand::Pick { index: 2 }),
        ];
        for (line, expected) in cases {
            assert_eq!(parse_line(line).expect("valid line"), Some(expected), "{line}");
        }
    }
}
