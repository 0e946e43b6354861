//! Bounded excerpts from extracted document text.

use regex::{Regex, RegexBuilder};

use crate::config::ExcerptLimits;

/// Compiled keyword/pattern matcher. Keywords match word prefixes, patterns are raw regexes.
#[derive(Debug, Clone)]
pub struct ExcerptRules {
    matcher: Option<Regex>,
}

impl ExcerptRules {
    pub fn new(keywords: &[String], patterns: &[String]) -> Result<Self, regex::Error> {
        let mut alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|k| format!(r"\b{}\w*\b", regex::escape(k)))
            .collect();
        alternatives.extend(patterns.iter().map(|p| format!("(?:{p})")));

        if alternatives.is_empty() {
            return Ok(Self { matcher: None });
        }
        let matcher = RegexBuilder::new(&alternatives.join("|"))
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            matcher: Some(matcher),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.is_none()
    }

    /// Keyword-windowed excerpt when rules exist, head+tail truncation otherwise.
    pub fn excerpt(&self, text: &str, limits: &ExcerptLimits) -> String {
        match &self.matcher {
            Some(matcher) => {
                let fragments = keyword_fragments(text, matcher, limits.fragment_max);
                head_tail(&fragments, limits)
            }
            None => head_tail(text, limits),
        }
    }
}

/// One fragment per match, running from the match to the next full stop.
fn keyword_fragments(text: &str, matcher: &Regex, fragment_max: usize) -> String {
    let mut fragments = Vec::new();
    let mut covered_until = 0;
    for m in matcher.find_iter(text) {
        if m.start() < covered_until {
            continue;
        }
        let end = text[m.start()..]
            .find('.')
            .map(|i| m.start() + i + 1)
            .unwrap_or(text.len());
        covered_until = end;
        let fragment = text[m.start()..end].trim();
        if fragment.chars().count() > fragment_max {
            let cut: String = fragment.chars().take(fragment_max).collect();
            fragments.push(format!("{cut}..."));
        } else {
            fragments.push(fragment.to_string());
        }
    }
    fragments.join(" ")
}

/// Keep the head and tail of `text` when it exceeds `limits.text_max` characters.
pub fn head_tail(text: &str, limits: &ExcerptLimits) -> String {
    let total = text.chars().count();
    if total <= limits.text_max {
        return text.to_string();
    }
    let head: String = text.chars().take(limits.head).collect();
    let tail: String = text.chars().skip(total.saturating_sub(limits.tail)).collect();
    format!("{head} ... {tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ExcerptLimits {
        ExcerptLimits {
            fragment_max: 40,
            text_max: 100,
            head: 10,
            tail: 10,
        }
    }

    #[test]
    fn keyword_matches_word_prefix_to_sentence_end() {
        let rules = ExcerptRules::new(&["tender".into()], &[]).unwrap();
        let text = "Intro text. Tenders are open until May. Nothing else. The TENDER closes soon.";
        assert_eq!(
            rules.excerpt(text, &limits()),
            "Tenders are open until May. TENDER closes soon."
        );
    }

    #[test]
    fn long_fragments_are_capped() {
        let rules = ExcerptRules::new(&["budget".into()], &[]).unwrap();
        let text = format!("Budget {} end.", "x".repeat(100));
        let out = rules.excerpt(&text, &limits());
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), 43);
    }

    #[test]
    fn patterns_are_raw_regexes() {
        let rules = ExcerptRules::new(&[], &[r"\d{4}-\d{2}-\d{2}".into()]).unwrap();
        let out = rules.excerpt("Deadline 2024-05-01 at noon. Other.", &limits());
        assert_eq!(out, "2024-05-01 at noon.");
    }

    #[test]
    fn no_rules_falls_back_to_head_tail() {
        let rules = ExcerptRules::new(&[], &[]).unwrap();
        assert!(rules.is_empty());
        let text = format!("{}{}", "a".repeat(60), "b".repeat(60));
        assert_eq!(rules.excerpt(&text, &limits()), "aaaaaaaaaa ... bbbbbbbbbb");
        assert_eq!(rules.excerpt("short", &limits()), "short");
    }

    #[test]
    fn head_tail_is_char_safe() {
        let text = "я".repeat(150);
        let out = head_tail(&text, &limits());
        assert_eq!(out.chars().count(), 10 + 5 + 10);
    }
}
