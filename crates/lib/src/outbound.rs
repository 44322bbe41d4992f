//! Outbound delivery helpers: text chunking, think-segment and markup
//! stripping, per-kind media caps, and verbose tool-event coalescing.
//!
//! Streaming deltas never leave the process through external messaging
//! surfaces; only the control plane sees them. The final payload is chunked
//! at the channel's cap, preferring newline then word boundaries.

use crate::envelope::MediaKind;
use std::time::{Duration, Instant};

/// Default chunk cap for WhatsApp/WebChat-class surfaces.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 4000;

/// Images above this size are clamped before reaching the agent backend.
pub const AGENT_IMAGE_CAP_BYTES: u64 = 5 * 1024 * 1024;

/// Warning line appended when a media payload could not be sent.
pub const MEDIA_FAILED_WARNING: &str = "⚠️ attachment could not be sent";

/// Per-kind media size caps in bytes.
pub fn media_cap_bytes(kind: MediaKind) -> u64 {
    match kind {
        MediaKind::Image => 6 * 1024 * 1024,
        MediaKind::Audio | MediaKind::Video => 16 * 1024 * 1024,
        MediaKind::Document => 100 * 1024 * 1024,
    }
}

/// Whether a media payload fits the per-kind cap.
pub fn media_within_cap(kind: MediaKind, size_bytes: u64) -> bool {
    size_bytes <= media_cap_bytes(kind)
}

/// Split text into chunks of at most `max_chars`, preferring newline
/// boundaries, then word boundaries, then a hard cut.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max = max_chars.max(1);
    let mut out = Vec::new();
    let mut rest = text;
    while rest.chars().count() > max {
        let hard_end = rest
            .char_indices()
            .nth(max)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..hard_end];
        let cut = window
            .rfind('\n')
            .filter(|&i| i > 0)
            .or_else(|| window.rfind(char::is_whitespace).filter(|&i| i > 0))
            .unwrap_or(hard_end);
        let (chunk, tail) = rest.split_at(cut);
        let chunk = chunk.trim_end();
        if !chunk.is_empty() {
            out.push(chunk.to_string());
        }
        rest = tail.trim_start();
        if rest.is_empty() {
            return out;
        }
    }
    if !rest.trim().is_empty() {
        out.push(rest.trim_end().to_string());
    }
    out
}

/// Remove `<think>…</think>` segments (including unterminated ones) from a
/// payload bound for an external surface.
pub fn strip_think_segments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<think>") {
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find("</think>") {
                    Some(end_rel) => {
                        rest = &rest[start + end_rel + "</think>".len()..];
                    }
                    None => break, // unterminated: drop the tail
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out.trim().to_string()
}

/// Strip simple markup tags (`<b>`, `*`, `_`, backticks) so content checks
/// like the heartbeat OK filter see plain text.
pub fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            '*' | '_' | '`' | '~' => {}
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Suffix appended when a timed-out run delivers its partial output. This is
/// the only path where partial text reaches an external surface.
pub const TIMEOUT_SUFFIX: &str = "(truncated due to timeout)";

pub fn timeout_partial(partial: &str, max_chars: usize) -> String {
    let cap = if max_chars == 0 { 800 } else { max_chars.min(800) };
    let taken: String = partial.chars().take(cap).collect();
    format!("{}\n{}", taken.trim_end(), TIMEOUT_SUFFIX)
}

/// Tools whose result previews are forwarded in `verbose full` mode.
const PREVIEW_TOOLS: [&str; 5] = ["bash", "read", "edit", "write", "attach"];
const PREVIEW_MAX_CHARS: usize = 200;
const COALESCE_WINDOW: Duration = Duration::from_millis(1000);

/// Coalesces tool events for verbose forwarding: successive events for the
/// same tool within one second merge into a single `[🛠️ tool] arg1, arg2`
/// line. Feed events in arrival order; `flush` returns a formatted line when
/// a batch closes.
pub struct ToolCoalescer {
    full: bool,
    current: Option<Batch>,
}

struct Batch {
    tool: String,
    args: Vec<String>,
    last_event: Instant,
}

impl ToolCoalescer {
    pub fn new(full: bool) -> Self {
        Self {
            full,
            current: None,
        }
    }

    /// Record a tool_start. Returns a finished line when the previous batch
    /// closed (different tool or outside the merge window).
    pub fn tool_start(&mut self, tool: &str, arg: Option<&str>) -> Option<String> {
        let now = Instant::now();
        let mut flushed = None;
        let same_batch = self
            .current
            .as_ref()
            .map(|b| b.tool == tool && now.duration_since(b.last_event) < COALESCE_WINDOW)
            .unwrap_or(false);
        if !same_batch {
            flushed = self.flush();
            self.current = Some(Batch {
                tool: tool.to_string(),
                args: Vec::new(),
                last_event: now,
            });
        }
        if let Some(b) = self.current.as_mut() {
            if let Some(a) = arg {
                let a = a.trim();
                if !a.is_empty() {
                    b.args.push(a.to_string());
                }
            }
            b.last_event = now;
        }
        flushed
    }

    /// Record a tool_end; in `full` mode, preview lines for curated tools are
    /// returned immediately.
    pub fn tool_end(&mut self, tool: &str, preview: Option<&str>) -> Option<String> {
        if let Some(b) = self.current.as_mut() {
            if b.tool == tool {
                b.last_event = Instant::now();
            }
        }
        if !self.full {
            return None;
        }
        let preview = preview?.trim();
        if preview.is_empty() || !PREVIEW_TOOLS.contains(&tool) {
            return None;
        }
        let truncated: String = preview.chars().take(PREVIEW_MAX_CHARS).collect();
        Some(format!("[🛠️ {}] → {}", tool, truncated))
    }

    /// Close and format the current batch, if any.
    pub fn flush(&mut self) -> Option<String> {
        let b = self.current.take()?;
        if b.args.is_empty() {
            Some(format!("[🛠️ {}]", b.tool))
        } else if b.args.len() == 1 {
            Some(format!("[🛠️ {} {}]", b.tool, b.args[0]))
        } else {
            Some(format!("[🛠️ {}] {}", b.tool, b.args.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_prefers_newlines_then_words() {
        let text = "line one\nline two\nline three";
        let chunks = chunk_text(text, 12);
        assert_eq!(chunks, vec!["line one", "line two", "line three"]);

        let text = "word word word word";
        let chunks = chunk_text(text, 10);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn chunking_handles_no_boundaries() {
        let text = "a".repeat(25);
        let chunks = chunk_text(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 4000), vec!["hello".to_string()]);
        assert!(chunk_text("   ", 4000).is_empty());
    }

    #[test]
    fn think_segments_are_stripped() {
        assert_eq!(
            strip_think_segments("<think>hmm</think>Hello"),
            "Hello"
        );
        assert_eq!(
            strip_think_segments("A<think>x</think>B<think>y</think>C"),
            "ABC"
        );
        assert_eq!(strip_think_segments("ok<think>trailing"), "ok");
        assert_eq!(strip_think_segments("plain"), "plain");
    }

    #[test]
    fn markup_stripping_flattens_tags() {
        assert_eq!(strip_markup("<b>HEARTBEAT_OK</b>"), "HEARTBEAT_OK");
        assert_eq!(strip_markup("*bold* _it_ `code`"), "bold it code");
    }

    #[test]
    fn media_caps_per_kind() {
        assert!(media_within_cap(MediaKind::Image, 6 * 1024 * 1024));
        assert!(!media_within_cap(MediaKind::Image, 7 * 1024 * 1024));
        assert!(media_within_cap(MediaKind::Video, 16 * 1024 * 1024));
        assert!(!media_within_cap(MediaKind::Audio, 17 * 1024 * 1024));
        assert!(media_within_cap(MediaKind::Document, 100 * 1024 * 1024));
    }

    #[test]
    fn coalescer_merges_same_tool_args() {
        let mut c = ToolCoalescer::new(false);
        assert_eq!(c.tool_start("read", Some("a.txt")), None);
        assert_eq!(c.tool_start("read", Some("b.txt")), None);
        assert_eq!(c.flush(), Some("[🛠️ read] a.txt, b.txt".to_string()));
    }

    #[test]
    fn coalescer_flushes_on_tool_change() {
        let mut c = ToolCoalescer::new(false);
        c.tool_start("read", Some("a.txt"));
        let flushed = c.tool_start("bash", Some("ls"));
        assert_eq!(flushed, Some("[🛠️ read a.txt]".to_string()));
        assert_eq!(c.flush(), Some("[🛠️ bash ls]".to_string()));
    }

    #[test]
    fn full_mode_previews_curated_tools_only() {
        let mut c = ToolCoalescer::new(true);
        c.tool_start("bash", Some("ls"));
        let p = c.tool_end("bash", Some("file1\nfile2"));
        assert_eq!(p, Some("[🛠️ bash] → file1\nfile2".to_string()));
        assert_eq!(c.tool_end("websearch", Some("results")), None);

        let long = "x".repeat(500);
        let p = c.tool_end("read", Some(&long)).unwrap();
        assert!(p.chars().count() <= PREVIEW_MAX_CHARS + 16);
    }

    #[test]
    fn timeout_partial_is_capped_and_labelled() {
        let partial = "y".repeat(2000);
        let out = timeout_partial(&partial, 0);
        assert!(out.ends_with(TIMEOUT_SUFFIX));
        assert!(out.chars().count() <= 800 + TIMEOUT_SUFFIX.len() + 1);
    }
}
