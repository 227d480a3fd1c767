//! Stdout command protocol
//!
//! Jobs emit structured metadata (plots, graphs, image uploads) by
//! printing lines that start with a reserved prefix followed by a
//! command keyword and a JSON payload:
//!
//! ```text
//! forge-cmd PLOT {"id": "loss", "points": [[0, 1.5], [1, 0.9]]}
//! ```
//!
//! Everything else passes through untouched as ordinary log output.
//! Commands are numbered in the order they are seen so a resumed job can
//! skip the ones it already applied.

use serde_json::Value as JsonValue;

/// Reserved prefix marking a structured command line.
pub const COMMAND_PREFIX: &str = "forge-cmd";

/// Known command keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Graph,
    Plot,
    Line,
    /// Image upload markers, prefixed `IMG`/`IMAGE` for simple detection.
    ImageBasic,
    ImageCreate,
    ImageUpdate,
    /// Name-only update, no upload required.
    ImageName,
}

impl CommandKind {
    pub fn parse(keyword: &str) -> Option<Self> {
        match keyword {
            "GRAPH" => Some(CommandKind::Graph),
            "PLOT" => Some(CommandKind::Plot),
            "LINE" => Some(CommandKind::Line),
            "IMG-B" => Some(CommandKind::ImageBasic),
            "IMG-C" => Some(CommandKind::ImageCreate),
            "IMG-U" => Some(CommandKind::ImageUpdate),
            "IMAGE-N" => Some(CommandKind::ImageName),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            CommandKind::Graph => "GRAPH",
            CommandKind::Plot => "PLOT",
            CommandKind::Line => "LINE",
            CommandKind::ImageBasic => "IMG-B",
            CommandKind::ImageCreate => "IMG-C",
            CommandKind::ImageUpdate => "IMG-U",
            CommandKind::ImageName => "IMAGE-N",
        }
    }
}

/// One parsed command, numbered by its position in the stream (1-based).
#[derive(Debug, Clone)]
pub struct MetadataCommand {
    pub seq: u64,
    pub kind: CommandKind,
    pub payload: JsonValue,
}

/// Result of scanning a block of stdout.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Pass-through output with command lines removed.
    pub stdout: String,
    /// Commands with `seq > last_applied`, in stream order.
    pub commands: Vec<MetadataCommand>,
    /// Total commands seen in this block, including skipped ones.
    pub total_commands: u64,
    /// Per-line scan problems (unknown keyword, malformed payload).
    pub malformed: Vec<String>,
}

/// Scans `text` for embedded commands, skipping the first `last_applied`
/// commands (already applied before a resume).
pub fn scan(text: &str, last_applied: u64) -> ScanResult {
    let mut result = ScanResult::default();
    let mut seq = 0u64;
    let mut passthrough = Vec::new();

    for raw_line in text.replace('\u{0}', "").split('\n') {
        let line = strip_ansi(raw_line);
        let Some(start) = line.find(COMMAND_PREFIX) else {
            passthrough.push(resolve_carriage_returns(&line));
            continue;
        };

        let command = &line[start + COMMAND_PREFIX.len()..];
        let command = command.trim_start();
        let Some((keyword, payload)) = split_keyword(command) else {
            result.malformed.push(format!("missing keyword: {raw_line}"));
            continue;
        };

        seq += 1;
        let Some(kind) = CommandKind::parse(keyword) else {
            result
                .malformed
                .push(format!("unknown command {keyword:?}: {raw_line}"));
            continue;
        };

        if seq <= last_applied {
            continue;
        }

        match serde_json::from_str(payload) {
            Ok(payload) => result.commands.push(MetadataCommand { seq, kind, payload }),
            Err(err) => result
                .malformed
                .push(format!("bad {} payload: {err}", kind.keyword())),
        }
    }

    result.total_commands = seq;
    result.stdout = passthrough.join("\n");
    result
}

fn split_keyword(command: &str) -> Option<(&str, &str)> {
    let keyword = command.split_whitespace().next()?;
    let rest = &command[command.find(keyword)? + keyword.len()..];
    Some((keyword, rest.trim()))
}

/// Removes `ESC[...m` color sequences.
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            for c in chars.by_ref() {
                if c == 'm' {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Applies terminal carriage-return semantics within a line: only the
/// text after the last `\r` survives.
fn resolve_carriage_returns(line: &str) -> String {
    match line.rfind('\r') {
        Some(idx) => line[idx + 1..].to_string(),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_output_passes_through() {
        let result = scan("epoch 1\nepoch 2", 0);
        assert_eq!(result.stdout, "epoch 1\nepoch 2");
        assert!(result.commands.is_empty());
        assert_eq!(result.total_commands, 0);
    }

    #[test]
    fn test_commands_are_extracted_and_removed() {
        let text = "starting\nforge-cmd PLOT {\"id\": \"loss\"}\ndone";
        let result = scan(text, 0);

        assert_eq!(result.stdout, "starting\ndone");
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.commands[0].kind, CommandKind::Plot);
        assert_eq!(result.commands[0].payload, json!({"id": "loss"}));
        assert_eq!(result.total_commands, 1);
    }

    #[test]
    fn test_skip_offset_drops_applied_commands() {
        let text = "forge-cmd GRAPH {\"n\": 1}\nforge-cmd GRAPH {\"n\": 2}";
        let result = scan(text, 1);

        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.commands[0].seq, 2);
        assert_eq!(result.commands[0].payload, json!({"n": 2}));
        assert_eq!(result.total_commands, 2);
    }

    #[test]
    fn test_ansi_escapes_are_stripped() {
        let text = "\u{1b}[0;31mforge-cmd LINE {\"y\": 3}\u{1b}[0m";
        let result = scan(text, 0);
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.commands[0].kind, CommandKind::Line);
    }

    #[test]
    fn test_malformed_payload_is_reported_not_fatal() {
        let text = "forge-cmd PLOT {not json}\nstill here";
        let result = scan(text, 0);
        assert!(result.commands.is_empty());
        assert_eq!(result.malformed.len(), 1);
        assert_eq!(result.stdout, "still here");
    }

    #[test]
    fn test_carriage_returns_resolve_to_final_text() {
        let result = scan("progress 10%\rprogress 99%", 0);
        assert_eq!(result.stdout, "progress 99%");
    }
}
