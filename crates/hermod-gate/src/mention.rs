//! Mention pattern matching.
//!
//! Patterns come from per-surface config and are compiled once, case
//! insensitive. Invalid patterns are dropped with a warning so a single bad
//! entry never disables the surface.

use regex::{Regex, RegexBuilder};
use tracing::warn;

/// A cached set of compiled mention patterns for one surface.
#[derive(Debug, Clone, Default)]
pub struct MentionMatcher {
    patterns: Vec<Regex>,
}

impl MentionMatcher {
    pub fn compile(surface: &str, patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| {
                match RegexBuilder::new(p).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(%surface, pattern = %p, error = %e, "mention pattern skipped");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True when any configured pattern matches the body.
    pub fn hit(&self, body: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(body))
    }

    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_match() {
        let m = MentionMatcher::compile("whatsapp", &["@clawd".to_string()]);
        assert!(m.hit("hey @CLAWD hi"));
        assert!(!m.hit("hey claw"));
    }

    #[test]
    fn invalid_patterns_are_dropped_not_fatal() {
        let m = MentionMatcher::compile(
            "whatsapp",
            &["(unclosed".to_string(), "@bot".to_string()],
        );
        assert_eq!(m.patterns().len(), 1);
        assert!(m.hit("@bot hello"));
    }

    #[test]
    fn empty_set_never_hits() {
        let m = MentionMatcher::compile("whatsapp", &[]);
        assert!(m.is_empty());
        assert!(!m.hit("@anything"));
    }
}
