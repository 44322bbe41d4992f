//! Slash-directive and stop-word parsing.
//!
//! Directives are matched at message start, case-insensitively, on the
//! normalized body. A directive-only message pins the session; a directive
//! followed by more text modifies just that turn. Bodies that open with the
//! ```` ```history ```` fence are batched history blocks and are never parsed
//! for directives or stop words.

use crate::session::{QueueMode, ThinkingLevel, VerboseMode};

/// Stop words that abort the in-flight agent instead of prompting it.
const STOP_WORDS: [&str; 5] = ["stop", "esc", "abort", "wait", "exit"];

/// Fence marker opening a batched history block.
const HISTORY_FENCE: &str = "```history";

/// `/queue` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirective {
    Mode(QueueMode),
    Reset,
}

/// A recognized directive. `rest` carries inline text following the directive,
/// when any; `None` means the message was directive-only (pin semantics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Think {
        level: ThinkingLevel,
        rest: Option<String>,
    },
    Verbose {
        mode: VerboseMode,
        rest: Option<String>,
    },
    Queue(QueueDirective),
    New,
    Model(String),
    Status,
    Restart,
}

/// Outcome of scanning a normalized body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// Exact stop-word match; abort the session.
    Stop,
    Directive(Directive),
    /// A directive token with an invalid argument; reply with the hint, change nothing.
    Invalid { hint: String },
    /// Plain prompt text.
    None,
}

/// True when the body opens a batched history block.
pub fn is_history_block(body: &str) -> bool {
    body.lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim_start().starts_with(HISTORY_FENCE))
        .unwrap_or(false)
}

/// Parse the normalized body for stop words and directives.
pub fn parse(body: &str) -> Parsed {
    if is_history_block(body) {
        return Parsed::None;
    }
    let trimmed = body.trim();
    let lowered = trimmed.to_lowercase();

    if STOP_WORDS.contains(&lowered.as_str()) {
        return Parsed::Stop;
    }

    if !trimmed.starts_with('/') {
        return Parsed::None;
    }

    let (token, rest) = split_token(trimmed);
    let token = token.to_lowercase();

    // `/think:high`, `/think=high`, `/think high`
    if let Some(arg) = strip_directive(&token, "/think") {
        return parse_think(arg, rest);
    }
    if token == "/think" {
        let (arg, rest2) = split_token(rest.unwrap_or(""));
        if arg.is_empty() {
            return Parsed::Invalid {
                hint: think_hint(),
            };
        }
        return parse_think(arg, rest2);
    }

    if token == "/verbose" {
        let (arg, rest2) = split_token(rest.unwrap_or(""));
        return match VerboseMode::parse(arg) {
            Some(mode) => Parsed::Directive(Directive::Verbose {
                mode,
                rest: rest2.map(str::to_string),
            }),
            None => Parsed::Invalid {
                hint: "Usage: /verbose <on|full|off>".to_string(),
            },
        };
    }

    if token == "/queue" {
        let (arg, _) = split_token(rest.unwrap_or(""));
        let directive = match arg.to_lowercase().as_str() {
            "queue" => QueueDirective::Mode(QueueMode::Queue),
            "interrupt" => QueueDirective::Mode(QueueMode::Interrupt),
            "reset" => QueueDirective::Reset,
            _ => {
                return Parsed::Invalid {
                    hint: "Usage: /queue <queue|interrupt|reset>".to_string(),
                }
            }
        };
        return Parsed::Directive(Directive::Queue(directive));
    }

    if token == "/new" {
        return Parsed::Directive(Directive::New);
    }

    if token == "/model" {
        let arg = rest.unwrap_or("").trim();
        if arg.is_empty() {
            return Parsed::Invalid {
                hint: "Usage: /model <ref>".to_string(),
            };
        }
        return Parsed::Directive(Directive::Model(arg.to_string()));
    }

    if token == "/status" {
        return Parsed::Directive(Directive::Status);
    }

    if token == "/restart" {
        return Parsed::Directive(Directive::Restart);
    }

    Parsed::None
}

fn parse_think(arg: &str, rest: Option<&str>) -> Parsed {
    match ThinkingLevel::parse(arg) {
        Some(level) => Parsed::Directive(Directive::Think {
            level,
            rest: rest.map(str::to_string),
        }),
        None => Parsed::Invalid {
            hint: think_hint(),
        },
    }
}

fn think_hint() -> String {
    "Usage: /think <off|minimal|low|medium|high|max>".to_string()
}

/// Split the leading whitespace-delimited token from the remainder. The
/// remainder is `None` when empty (directive-only message).
fn split_token(s: &str) -> (&str, Option<&str>) {
    let s = s.trim();
    match s.split_once(char::is_whitespace) {
        Some((tok, rest)) => {
            let rest = rest.trim();
            (tok, if rest.is_empty() { None } else { Some(rest) })
        }
        None => (s, None),
    }
}

/// `/think:high` or `/think=high` → Some("high").
fn strip_directive<'a>(token: &'a str, name: &str) -> Option<&'a str> {
    token
        .strip_prefix(name)
        .and_then(|r| r.strip_prefix([':', '=']))
        .filter(|r| !r.is_empty())
}

/// Confirmation text for a directive-only message.
pub fn confirmation(directive: &Directive) -> String {
    match directive {
        Directive::Think { level, .. } => {
            format!("Thinking level set to {}.", level.as_str())
        }
        Directive::Verbose { mode, .. } => format!("Verbose set to {}.", mode.as_str()),
        Directive::Queue(QueueDirective::Mode(QueueMode::Queue)) => {
            "Queue mode set to queue.".to_string()
        }
        Directive::Queue(QueueDirective::Mode(QueueMode::Interrupt)) => {
            "Queue mode set to interrupt.".to_string()
        }
        Directive::Queue(QueueDirective::Reset) => "Queue mode reset.".to_string(),
        Directive::New => "Session cleared. Next message starts fresh.".to_string(),
        Directive::Model(m) => format!("Model set to {}.", m),
        Directive::Status | Directive::Restart => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_words_match_exactly() {
        for w in ["stop", "ESC", "Abort", "wait", "exit"] {
            assert_eq!(parse(w), Parsed::Stop, "{}", w);
        }
        assert_eq!(parse("stop it"), Parsed::None);
        assert_eq!(parse("please abort"), Parsed::None);
    }

    #[test]
    fn think_pin_and_inline() {
        assert_eq!(
            parse("/think high"),
            Parsed::Directive(Directive::Think {
                level: ThinkingLevel::High,
                rest: None
            })
        );
        assert_eq!(
            parse("/think:low summarize my inbox"),
            Parsed::Directive(Directive::Think {
                level: ThinkingLevel::Low,
                rest: Some("summarize my inbox".into())
            })
        );
        assert_eq!(
            parse("/THINK=max"),
            Parsed::Directive(Directive::Think {
                level: ThinkingLevel::Max,
                rest: None
            })
        );
    }

    #[test]
    fn invalid_level_yields_hint_only() {
        match parse("/think enormous") {
            Parsed::Invalid { hint } => assert!(hint.contains("/think")),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn verbose_queue_model_new() {
        assert_eq!(
            parse("/verbose full"),
            Parsed::Directive(Directive::Verbose {
                mode: VerboseMode::Full,
                rest: None
            })
        );
        assert_eq!(
            parse("/queue interrupt"),
            Parsed::Directive(Directive::Queue(QueueDirective::Mode(
                QueueMode::Interrupt
            )))
        );
        assert_eq!(
            parse("/queue reset"),
            Parsed::Directive(Directive::Queue(QueueDirective::Reset))
        );
        assert_eq!(parse("/new"), Parsed::Directive(Directive::New));
        assert_eq!(
            parse("/model claude-opus"),
            Parsed::Directive(Directive::Model("claude-opus".into()))
        );
        assert_eq!(parse("/status"), Parsed::Directive(Directive::Status));
        assert_eq!(parse("/restart"), Parsed::Directive(Directive::Restart));
    }

    #[test]
    fn directives_inside_history_blocks_are_ignored() {
        let body = "```history\n[10:02] alice: /think high\n[10:03] bob: stop\n```";
        assert_eq!(parse(body), Parsed::None);
        assert!(is_history_block(body));
        assert!(is_history_block("\n   ```history\nx"));
        assert!(!is_history_block("regular ```history mention"));
    }

    #[test]
    fn plain_text_parses_to_none() {
        assert_eq!(parse("hello there"), Parsed::None);
        assert_eq!(parse("/unknown thing"), Parsed::None);
    }

    #[test]
    fn confirmations_name_the_change() {
        assert_eq!(
            confirmation(&Directive::Think {
                level: ThinkingLevel::High,
                rest: None
            }),
            "Thinking level set to high."
        );
    }
}
