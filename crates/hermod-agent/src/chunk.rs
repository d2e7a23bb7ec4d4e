//! Block chunking: slicing assistant output into deliverable pieces.
//!
//! `paragraph` and `newline` preferences split eagerly at their separator, so
//! each natural paragraph/line ships as its own block as soon as it is
//! complete. `sentence` (and any over-long segment under the other
//! preferences) splits on fill: once the buffer holds `max_chars`, a break is
//! searched inside the `[min_chars, max_chars]` window, falling through
//! newline → sentence → whitespace → hard split.
//!
//! Empty chunks and consecutive duplicates are suppressed.

use hermod_core::config::{BreakPreference, ChunkingConfig};

pub struct BlockChunker {
    cfg: ChunkingConfig,
    pending: String,
    last_emitted: Option<String>,
}

impl BlockChunker {
    pub fn new(cfg: ChunkingConfig) -> Self {
        Self {
            cfg,
            pending: String::new(),
            last_emitted: None,
        }
    }

    /// Append streamed text and drain every chunk that is ready.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.pending.push_str(text);
        self.drain()
    }

    /// Boundary flush (`text_end` / `message_end`): emit whatever remains,
    /// even below `min_chars`.
    pub fn flush(&mut self) -> Vec<String> {
        let mut out = self.drain();
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        if !rest.is_empty() && self.last_emitted.as_deref() != Some(rest) {
            self.last_emitted = Some(rest.to_string());
            out.push(rest.to_string());
        }
        out
    }

    /// Discard buffered text and duplicate-tracking state (compaction retry).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_emitted = None;
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.trim().is_empty()
    }

    fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some((cut, skip)) = self.next_cut() {
            let chunk = self.pending[..cut].trim().to_string();
            self.pending.replace_range(..cut + skip, "");
            let lead = self.pending.len() - self.pending.trim_start().len();
            self.pending.replace_range(..lead, "");
            if !chunk.is_empty() && self.last_emitted.as_ref() != Some(&chunk) {
                self.last_emitted = Some(chunk.clone());
                out.push(chunk);
            }
        }
        out
    }

    /// Next `(cut, separator_len)` byte positions, or `None` if the buffer
    /// should keep filling.
    fn next_cut(&self) -> Option<(usize, usize)> {
        // Eager separator split for paragraph/newline preferences.
        let eager = match self.cfg.break_preference {
            BreakPreference::Paragraph => Some("\n\n"),
            BreakPreference::Newline => Some("\n"),
            BreakPreference::Sentence => None,
        };
        if let Some(sep) = eager {
            if let Some(p) = self.pending.find(sep) {
                if self.pending[..p].chars().count() <= self.cfg.max_chars {
                    return Some((p, sep.len()));
                }
            }
        }

        if self.pending.chars().count() < self.cfg.max_chars {
            return None;
        }
        Some((self.forced_cut(), 0))
    }

    /// Fill-based split: search the `[min_chars, max_chars]` window for the
    /// best break, falling down the preference ladder.
    fn forced_cut(&self) -> usize {
        let min_b = byte_of_char(&self.pending, self.cfg.min_chars);
        let max_b = byte_of_char(&self.pending, self.cfg.max_chars);
        let window = &self.pending[..max_b];

        let rungs: &[BreakPreference] = match self.cfg.break_preference {
            BreakPreference::Paragraph => &[
                BreakPreference::Paragraph,
                BreakPreference::Newline,
                BreakPreference::Sentence,
            ],
            BreakPreference::Newline => &[BreakPreference::Newline, BreakPreference::Sentence],
            BreakPreference::Sentence => &[BreakPreference::Sentence],
        };

        for rung in rungs {
            let cut = match rung {
                BreakPreference::Paragraph => window.rfind("\n\n").filter(|&p| p >= min_b),
                BreakPreference::Newline => window.rfind('\n').filter(|&p| p >= min_b),
                BreakPreference::Sentence => self.last_sentence_end(min_b, max_b),
            };
            if let Some(cut) = cut {
                return cut;
            }
        }

        // Last whitespace past min_chars, then hard split at max_chars.
        window
            .char_indices()
            .rev()
            .find(|&(i, c)| c.is_whitespace() && i >= min_b)
            .map(|(i, _)| i)
            .unwrap_or(max_b)
    }

    /// Position just past the last `.`/`!`/`?` that is followed by
    /// whitespace or the end of the buffer, inside `[min_b, max_b)`.
    fn last_sentence_end(&self, min_b: usize, max_b: usize) -> Option<usize> {
        self.pending[..max_b]
            .char_indices()
            .rev()
            .filter(|&(i, c)| {
                matches!(c, '.' | '!' | '?')
                    && i >= min_b
                    && self.pending[i + 1..]
                        .chars()
                        .next()
                        .is_none_or(char::is_whitespace)
            })
            .map(|(i, _)| i + 1)
            .next()
    }
}

/// Byte offset of the `n`-th char, clamped to the end of the string.
fn byte_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(min: usize, max: usize, pref: BreakPreference) -> BlockChunker {
        BlockChunker::new(ChunkingConfig {
            min_chars: min,
            max_chars: max,
            break_preference: pref,
        })
    }

    #[test]
    fn paragraph_preference_splits_on_blank_lines() {
        let mut c = chunker(20, 40, BreakPreference::Paragraph);
        let mut out = c.push("Line one is here.\n\nLine two follows here.\n\nLine three.");
        out.extend(c.flush());
        assert_eq!(
            out,
            vec!["Line one is here.", "Line two follows here.", "Line three."]
        );
    }

    #[test]
    fn incremental_push_matches_single_push() {
        let mut c = chunker(20, 40, BreakPreference::Paragraph);
        let mut out = Vec::new();
        for piece in ["Line one is here.\n", "\nLine two follows here.", "\n\nLine three."] {
            out.extend(c.push(piece));
        }
        out.extend(c.flush());
        assert_eq!(
            out,
            vec!["Line one is here.", "Line two follows here.", "Line three."]
        );
    }

    #[test]
    fn oversized_paragraph_falls_back_to_whitespace() {
        let mut c = chunker(10, 20, BreakPreference::Paragraph);
        let mut out = c.push("one two three four five six seven");
        out.extend(c.flush());
        assert!(out.len() >= 2);
        for block in &out {
            assert!(block.chars().count() <= 20, "block too long: {block:?}");
            assert!(!block.is_empty());
        }
    }

    #[test]
    fn sentence_preference_breaks_after_punctuation() {
        let mut c = chunker(10, 30, BreakPreference::Sentence);
        let mut out = c.push("First sentence here. Second one follows. Third.");
        out.extend(c.flush());
        assert_eq!(out[0], "First sentence here.");
    }

    #[test]
    fn hard_split_when_no_break_exists() {
        let mut c = chunker(5, 10, BreakPreference::Sentence);
        let mut out = c.push("abcdefghijklmnopqrstuvwxyz");
        out.extend(c.flush());
        assert_eq!(out[0], "abcdefghij");
        assert_eq!(out[1], "klmnopqrst");
        assert_eq!(out[2], "uvwxyz");
    }

    #[test]
    fn consecutive_duplicates_collapse() {
        let mut c = chunker(2, 80, BreakPreference::Paragraph);
        let mut out = c.push("same\n\nsame\n\ndifferent");
        out.extend(c.flush());
        assert_eq!(out, vec!["same", "different"]);
    }

    #[test]
    fn empty_chunks_suppressed() {
        let mut c = chunker(2, 80, BreakPreference::Paragraph);
        let mut out = c.push("\n\n\n\nhello\n\n\n\n");
        out.extend(c.flush());
        assert_eq!(out, vec!["hello"]);
    }

    #[test]
    fn flush_on_empty_is_empty() {
        let mut c = chunker(2, 80, BreakPreference::Paragraph);
        assert!(c.flush().is_empty());
    }

    #[test]
    fn every_block_within_max() {
        let text = "word ".repeat(500);
        let mut c = chunker(800, 1200, BreakPreference::Paragraph);
        let mut out = c.push(&text);
        out.extend(c.flush());
        for block in &out {
            assert!(block.chars().count() <= 1200);
            assert!(!block.is_empty());
        }
    }

    #[test]
    fn multibyte_text_never_splits_inside_char() {
        let text = "héllo wörld ".repeat(40);
        let mut c = chunker(20, 40, BreakPreference::Sentence);
        let mut out = c.push(&text);
        out.extend(c.flush());
        // If a split landed inside a UTF-8 sequence the slicing above would
        // have panicked; assert the output reassembles.
        assert!(!out.is_empty());
    }

    #[test]
    fn reset_clears_pending_and_dedup_state() {
        let mut c = chunker(2, 80, BreakPreference::Paragraph);
        c.push("partial text");
        c.reset();
        assert!(!c.has_pending());
        assert!(c.flush().is_empty());
    }
}
