//! Artifact report extraction
//!
//! Turns a downloaded artifact archive into a failure count. Artifacts arrive
//! in several shapes: plain JSON reports, sharded blob reports (JSONL event
//! streams, often inside nested archives), legacy single-file HTML reports
//! with an embedded base64 archive, and the modern bundled HTML report whose
//! data we cannot reassemble. Detection runs in a fixed order and stops at the
//! first definitive answer.

use crate::error::UnsupportedFormat;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::bytes::Regex;
use serde_json::Value;
use std::io::{Cursor, Read};
use std::sync::OnceLock;
use zip::ZipArchive;

/// Default nesting depth for archives inside archives. Blob reports wrap each
/// shard in its own zip, so two levels are common; three covers re-wrapped
/// uploads.
pub const MAX_NESTED_DEPTH: u32 = 3;

/// A long base64 run immediately before a closing script tag marks the
/// embedded archive of a legacy single-file HTML report.
fn embedded_payload_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"([A-Za-z0-9+/=]{100,})["'();\s]*</script>"#).unwrap())
}

/// Extract a failure count from artifact archive bytes.
///
/// Returns `Ok(None)` when the bytes are not an archive or no recognizable
/// report was found, and `Err(UnsupportedFormat)` when the artifact is
/// conclusively a bundled HTML report. `max_depth` bounds nested-archive
/// exploration; direct members always win over nested ones.
pub fn extract_failure_count(
    zip_bytes: &[u8],
    max_depth: u32,
) -> Result<Option<u32>, UnsupportedFormat> {
    let Ok(mut archive) = ZipArchive::new(Cursor::new(zip_bytes)) else {
        return Ok(None);
    };
    let names: Vec<String> = archive.file_names().map(String::from).collect();

    for name in prioritized_members(&names, ".json") {
        let Some(raw) = read_member(&mut archive, name) else {
            continue;
        };
        let Ok(value) = serde_json::from_slice::<Value>(&raw) else {
            continue;
        };
        if let Some(count) = stats_failure_count(&value) {
            return Ok(Some(count));
        }
    }

    for name in prioritized_members(&names, ".jsonl") {
        let Some(raw) = read_member(&mut archive, name) else {
            continue;
        };
        if let Some(count) = count_jsonl_failures(&raw) {
            return Ok(Some(count));
        }
    }

    for name in names.iter().filter(|n| n.ends_with(".html")) {
        let Some(raw) = read_member(&mut archive, name) else {
            continue;
        };
        let Some(payload) = embedded_archive(&raw) else {
            continue;
        };
        if let Some(count) = embedded_failure_count(&payload) {
            return Ok(Some(count));
        }
    }

    if is_bundled_html_report(&names) {
        return Err(UnsupportedFormat);
    }

    if max_depth == 0 {
        return Ok(None);
    }
    for name in names.iter().filter(|n| n.ends_with(".zip")) {
        let Some(nested) = read_member(&mut archive, name) else {
            continue;
        };
        if let Some(count) = extract_failure_count(&nested, max_depth - 1)? {
            return Ok(Some(count));
        }
    }

    Ok(None)
}

/// Members with the given extension, report/results filenames first.
fn prioritized_members<'a>(names: &'a [String], extension: &str) -> Vec<&'a str> {
    let mut members: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| n.ends_with(extension))
        .collect();
    members.sort_by_key(|n| {
        let lower = n.to_lowercase();
        !(lower.contains("report") || lower.contains("results"))
    });
    members
}

fn read_member(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Option<Vec<u8>> {
    let mut member = archive.by_name(name).ok()?;
    let mut buf = Vec::new();
    member.read_to_end(&mut buf).ok()?;
    Some(buf)
}

/// Failure count from a structured report's `stats` object.
///
/// The JSON reporter format is keyed on `unexpected` (with an optional
/// `flaky` count on top); other formats carry a plain `failed` counter.
/// A `flaky` key alone identifies neither.
fn stats_failure_count(value: &Value) -> Option<u32> {
    let stats = value.get("stats")?.as_object()?;
    if stats.contains_key("unexpected") {
        let unexpected = stats.get("unexpected").and_then(Value::as_u64).unwrap_or(0);
        let flaky = stats.get("flaky").and_then(Value::as_u64).unwrap_or(0);
        return Some((unexpected + flaky) as u32);
    }
    stats.get("failed").and_then(Value::as_u64).map(|n| n as u32)
}

/// Count failed tests in a blob-report event stream.
///
/// Returns `None` when no test-end events were seen at all, so a stream of
/// unrelated events is not mistaken for a clean run.
fn count_jsonl_failures(raw: &[u8]) -> Option<u32> {
    let text = String::from_utf8_lossy(raw);
    let mut failures = 0;
    let mut saw_test_end = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if event.get("method").and_then(Value::as_str) != Some("onTestEnd") {
            continue;
        }
        saw_test_end = true;
        let status = event.pointer("/params/result/status").and_then(Value::as_str);
        if matches!(status, Some("failed") | Some("timedOut")) {
            failures += 1;
        }
    }
    saw_test_end.then_some(failures)
}

/// Decode the archive embedded in a legacy single-file HTML report.
fn embedded_archive(html: &[u8]) -> Option<Vec<u8>> {
    let captures = embedded_payload_pattern().captures(html)?;
    let payload = captures.get(1)?.as_bytes();
    BASE64.decode(payload).ok()
}

/// Scan an embedded archive's JSON members for a stats object.
fn embedded_failure_count(payload: &[u8]) -> Option<u32> {
    let mut archive = ZipArchive::new(Cursor::new(payload)).ok()?;
    let names: Vec<String> = archive.file_names().map(String::from).collect();
    for name in prioritized_members(&names, ".json") {
        let Some(raw) = read_member(&mut archive, name) else {
            continue;
        };
        let Ok(value) = serde_json::from_slice::<Value>(&raw) else {
            continue;
        };
        if let Some(count) = stats_failure_count(&value) {
            return Some(count);
        }
    }
    None
}

/// The modern bundled HTML report ships an `index.html` entry point plus a
/// `data/` directory of per-test payloads.
fn is_bundled_html_report(names: &[String]) -> bool {
    let has_index = names
        .iter()
        .any(|n| n == "index.html" || n.ends_with("/index.html"));
    let has_data = names
        .iter()
        .any(|n| n.starts_with("data/") || n.contains("/data/"));
    has_index && has_data
}
