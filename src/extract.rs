//! Body decoding and cleanup.
//!
//! Turns the raw body bytes returned by the mail provider (base64 in its
//! transport encoding) into the plain text that gets chunked: decode,
//! convert HTML to text when needed, then strip quoted replies and
//! signatures so that a thread does not index the same text once per reply.
//!
//! All functions are pure and deterministic; re-cleaning an unchanged body
//! yields identical text.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("body is not valid base64")]
    InvalidEncoding,
}

/// Decode, convert, and strip a raw provider body.
pub fn clean_body(raw: &[u8]) -> Result<String, ExtractError> {
    let decoded = decode_body(raw)?;
    let text = if looks_like_html(&decoded) {
        html_to_text(&decoded)
    } else {
        decoded
    };

    let stripped = strip_quoted_and_signature(&text);
    // A message that is nothing but a forwarded quote keeps its full text.
    if stripped.is_empty() {
        Ok(collapse_blank_lines(&text))
    } else {
        Ok(stripped)
    }
}

/// Decode a base64 body (URL-safe or standard alphabet, padded or not) into
/// text with `\n` line endings. Invalid UTF-8 is replaced, not rejected.
pub fn decode_body(raw: &[u8]) -> Result<String, ExtractError> {
    let compact: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Ok(String::new());
    }

    let bytes = [URL_SAFE_NO_PAD, URL_SAFE, STANDARD, STANDARD_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(&compact).ok())
        .ok_or(ExtractError::InvalidEncoding)?;

    Ok(String::from_utf8_lossy(&bytes)
        .replace("\r\n", "\n")
        .replace('\r', "\n"))
}

fn looks_like_html(text: &str) -> bool {
    let head: String = text.chars().take(2048).collect::<String>().to_ascii_lowercase();
    ["<html", "<body", "<div", "<p>", "<p ", "<br", "<table", "<!doctype html"]
        .iter()
        .any(|tag| head.contains(tag))
}

/// Minimal HTML to text: drops `script`/`style` content and tags, turns
/// block boundaries into newlines, and decodes the common entities.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('>') else {
            rest = "";
            break;
        };
        let tag = rest[start + 1..start + end].trim().to_ascii_lowercase();
        rest = &rest[start + end + 1..];

        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();

        if (name == "script" || name == "style") && !tag.starts_with('/') {
            let close = format!("</{}", name);
            match rest.to_ascii_lowercase().find(&close) {
                Some(pos) => {
                    let after = &rest[pos..];
                    rest = after.find('>').map_or("", |gt| &after[gt + 1..]);
                }
                None => rest = "",
            }
            continue;
        }

        if matches!(
            name.as_str(),
            "br" | "p" | "div" | "tr" | "li" | "h1" | "h2" | "h3" | "h4" | "blockquote"
        ) && !out.ends_with('\n')
        {
            out.push('\n');
        }
    }
    out.push_str(rest);

    let decoded = decode_entities(&out);
    let lines: Vec<&str> = decoded.lines().map(str::trim_end).collect();
    collapse_blank_lines(&lines.join("\n"))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Remove quoted reply text and the trailing signature.
///
/// Everything from the first reply header (`On <date>, <who> wrote:`, an
/// Outlook `-----Original Message-----` block, or a `From:` line after an
/// underscore rule) onward is dropped, as is everything after a `-- `
/// signature delimiter. Remaining `>`-prefixed lines are dropped too.
pub fn strip_quoted_and_signature(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();

        if trimmed == "--" || *line == "-- " {
            break;
        }
        if is_reply_header(trimmed) {
            break;
        }
        // "On Tue, 3 Jan 2023 at 10:00, Alice\n<alice@x.com> wrote:"
        if trimmed.starts_with("On ")
            && lines
                .get(i + 1)
                .is_some_and(|next| next.trim_end().ends_with("wrote:"))
        {
            break;
        }
        if trimmed.starts_with('>') {
            continue;
        }
        kept.push(line);
    }

    while kept
        .last()
        .is_some_and(|l| l.trim().is_empty() || is_mobile_signature(l.trim()))
    {
        kept.pop();
    }

    collapse_blank_lines(&kept.join("\n"))
}

fn is_reply_header(line: &str) -> bool {
    (line.starts_with("On ") && line.ends_with("wrote:"))
        || line.eq_ignore_ascii_case("-----original message-----")
        || (line.starts_with("________________") && line.trim_start_matches('_').is_empty())
        || line.starts_with("---------- Forwarded message")
}

fn is_mobile_signature(line: &str) -> bool {
    line.starts_with("Sent from my ") || line.starts_with("Get Outlook for ")
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
