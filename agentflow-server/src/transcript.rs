//! Claude Code transcript splice
//!
//! Claude Code `Stop` hooks don't carry the assistant's final text; the
//! transcript JSONL on the producer's disk does. When a `Stop` arrives with
//! a `transcript_path` and no `result`, the ingest handler splices the
//! latest assistant turn's text in from that file. Failures here are
//! silent: the event is still processed, just without the text.

use serde::Deserialize;
use serde_json::Value;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// At most this much of the transcript tail is read.
const MAX_READ_BYTES: u64 = 1024 * 1024;

/// At most this many characters are spliced into `event.result`.
const MAX_SPLICE_CHARS: usize = 100_000;

/// One transcript line; only the fields the splice needs.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TranscriptRecord {
    #[serde(rename = "type")]
    record_type: Option<String>,
    message: Option<TranscriptMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TranscriptMessage {
    content: Option<Value>,
}

/// Concatenated text of the latest assistant turn in a transcript file.
///
/// Scans the tail of the file (bounded by [`MAX_READ_BYTES`]); an
/// intervening user prompt resets the accumulator, tool-result user records
/// do not, so a multi-message assistant turn comes back whole. Returns None
/// on any failure.
pub fn latest_assistant_text(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();

    let mut reader = BufReader::new(file);
    let mut skip_first_line = false;
    if len > MAX_READ_BYTES {
        reader.seek(SeekFrom::Start(len - MAX_READ_BYTES)).ok()?;
        // We likely landed mid-line
        skip_first_line = true;
    }

    let mut turn_text: Vec<String> = Vec::new();
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if skip_first_line {
            skip_first_line = false;
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        let record: TranscriptRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let content = record.message.as_ref().and_then(|m| m.content.as_ref());

        match record.record_type.as_deref() {
            Some("assistant") => {
                if let Some(content) = content {
                    turn_text.extend(text_blocks(content));
                }
            }
            Some("user") => {
                // A real prompt starts a new turn; tool results belong to
                // the current one
                if is_prompt_content(content) {
                    turn_text.clear();
                }
            }
            _ => {}
        }
    }

    if turn_text.is_empty() {
        return None;
    }
    let mut joined = turn_text.join("\n");
    if joined.chars().count() > MAX_SPLICE_CHARS {
        joined = joined.chars().take(MAX_SPLICE_CHARS).collect();
    }
    Some(joined)
}

fn text_blocks(content: &Value) -> Vec<String> {
    match content {
        Value::String(s) => vec![s.clone()],
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .map(|s| s.to_string())
            .collect(),
        _ => vec![],
    }
}

fn is_prompt_content(content: Option<&Value>) -> bool {
    match content {
        Some(Value::String(_)) => true,
        Some(Value::Array(blocks)) => blocks
            .iter()
            .any(|b| b.get("type").and_then(Value::as_str) == Some("text")),
        _ => false,
    }
}
