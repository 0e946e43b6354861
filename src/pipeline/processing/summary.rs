//! Prompt assembly and response parsing for the summarization backend.

use indexmap::IndexMap;

use crate::domain::Record;

/// Appended to every rendered prompt so replies come back as parseable lines.
pub const PROMPT_SUFFIX: &str = "\n\nAnswer briefly and to the point.\
\nReply strictly as `key: value` lines, one per field, with no explanations.\
\nDo not use <think> blocks or any other markup.";

/// Summarization input: `gpt_text`, else `excerpt`, else `text`. Blank values are skipped.
pub fn summary_input(record: &Record) -> Option<&str> {
    [&record.gpt_text, &record.excerpt, &record.text]
        .into_iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
}

/// Drop reasoning preambles and markup from a model reply.
pub fn clean_response(raw: &str) -> String {
    let text = match raw.rfind("</think>") {
        Some(pos) => &raw[pos + "</think>".len()..],
        None => raw,
    };
    let text = strip_simple_tags(text);
    collapse_blank_runs(&text).trim().to_string()
}

/// Parse `key: value` lines. Keys are lower-cased with spaces as `_`; lines without a colon
/// continue the previous value; `[n]` citation markers are removed.
pub fn parse_response(text: &str) -> IndexMap<String, String> {
    let mut fields: IndexMap<String, String> = IndexMap::new();
    let mut current: Option<String> = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase().replace(' ', "_");
            fields.insert(key.clone(), value.trim().to_string());
            current = Some(key);
        } else if let Some(value) = current.as_ref().and_then(|k| fields.get_mut(k)) {
            value.push(' ');
            value.push_str(line);
        }
    }

    for value in fields.values_mut() {
        *value = strip_citations(value).trim().to_string();
    }
    fields
}

// `<tag>` and `</tag>` with an ASCII-letter name
fn strip_simple_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open + 1..];
        let name = candidate.strip_prefix('/').unwrap_or(candidate);
        let letters = name.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        if letters > 0 && name[letters..].starts_with('>') {
            let consumed = (candidate.len() - name.len()) + letters + 1;
            rest = &candidate[consumed..];
        } else {
            out.push('<');
            rest = candidate;
        }
    }
    out.push_str(rest);
    out
}

// Three or more newlines become a single blank line
fn collapse_blank_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut newlines = 0;
    for c in s.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(c);
            }
        } else {
            newlines = 0;
            out.push(c);
        }
    }
    out
}

fn strip_citations(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let digits = after.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 && after[digits..].starts_with(']') {
            rest = &after[digits + 1..];
        } else {
            out.push('[');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaning_drops_reasoning_and_tags() {
        let raw = "<think>let me see</think>\n<b>Date</b>: 2024-05-01\n\n\n\nPlace: Hall";
        assert_eq!(clean_response(raw), "Date: 2024-05-01\n\nPlace: Hall");
    }

    #[test]
    fn parsing_handles_continuations_and_citations() {
        let parsed = parse_response("Event Date: 1 May [1]\nTopic: roads\nand bridges [12]\nnoise");
        assert_eq!(parsed.get("event_date").map(String::as_str), Some("1 May"));
        assert_eq!(parsed.get("topic").map(String::as_str), Some("roads and bridges  noise"));
        assert_eq!(parsed.keys().collect::<Vec<_>>(), vec!["event_date", "topic"]);
    }

    #[test]
    fn lines_before_first_key_are_ignored() {
        let parsed = parse_response("Sure!\nanswer: yes");
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn input_prefers_gpt_text() {
        let mut record = Record::new("https://a.org");
        record.text = Some("full".into());
        record.excerpt = Some("  ".into());
        assert_eq!(summary_input(&record), Some("full"));
        record.gpt_text = Some("short".into());
        assert_eq!(summary_input(&record), Some("short"));
    }
}
