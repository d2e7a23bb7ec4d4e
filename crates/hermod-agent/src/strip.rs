//! Thinking-tag stripping and `<final>` tag enforcement.
//!
//! Models emit `<think>…</think>` / `<thinking>…</thinking>` reasoning
//! segments that must never reach a consumer. Local models frequently emit
//! unpaired tags: an unclosed open tag swallows the remainder, a stray close
//! tag means everything before it was reasoning.

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";
const FINAL_OPEN: &str = "<final>";
const FINAL_CLOSE: &str = "</final>";

/// All tag literals a streaming tail could be a prefix of.
const ALL_TAGS: [&str; 6] = [
    THINK_OPEN,
    THINK_CLOSE,
    THINKING_OPEN,
    THINKING_CLOSE,
    FINAL_OPEN,
    FINAL_CLOSE,
];

/// ASCII-case-insensitive substring search. Safe to index with the returned
/// position: the needle is pure ASCII, so a match always starts on a char
/// boundary.
fn find_ci(hay: &str, needle: &str, from: usize) -> Option<usize> {
    let h = hay.as_bytes();
    let n = needle.as_bytes();
    if from + n.len() > h.len() {
        return None;
    }
    (from..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

struct TagHit {
    start: usize,
    end: usize,
    word: &'static str,
    open: bool,
}

/// Earliest thinking tag at or after `from`.
fn next_thinking_tag(text: &str, from: usize) -> Option<TagHit> {
    let candidates = [
        (THINKING_OPEN, "thinking", true),
        (THINKING_CLOSE, "thinking", false),
        (THINK_OPEN, "think", true),
        (THINK_CLOSE, "think", false),
    ];
    candidates
        .iter()
        .filter_map(|&(literal, word, open)| {
            find_ci(text, literal, from).map(|start| TagHit {
                start,
                end: start + literal.len(),
                word,
                open,
            })
        })
        .min_by_key(|hit| hit.start)
}

/// Find the close matching an already-consumed open tag, honouring nesting
/// of the same tag word. Returns the byte offset just past the close.
fn find_matching_close(text: &str, from: usize, word: &str) -> Option<usize> {
    let open = format!("<{word}>");
    let close = format!("</{word}>");
    let mut depth = 1usize;
    let mut pos = from;
    loop {
        let next_open = find_ci(text, &open, pos);
        let next_close = find_ci(text, &close, pos)?;
        if next_open.is_some_and(|o| o < next_close) {
            depth += 1;
            pos = next_open.unwrap() + open.len();
        } else {
            depth -= 1;
            pos = next_close + close.len();
            if depth == 0 {
                return Some(pos);
            }
        }
    }
}

/// Remove all thinking segments from `input`.
///
/// - Paired tags: the segment (tags included) is removed; nesting of the same
///   tag word is honoured.
/// - Unclosed open tag: everything from the tag onward is removed.
/// - Stray close tag: everything up to and including it is removed.
pub fn strip_thinking(input: &str) -> String {
    let mut out = String::new();
    let mut pos = 0usize;
    while pos < input.len() {
        let Some(hit) = next_thinking_tag(input, pos) else {
            out.push_str(&input[pos..]);
            break;
        };
        if hit.open {
            out.push_str(&input[pos..hit.start]);
            match find_matching_close(input, hit.end, hit.word) {
                Some(past_close) => pos = past_close,
                None => break,
            }
        } else {
            out.clear();
            pos = hit.end;
        }
    }
    out
}

/// Apply `<final>` enforcement to a complete message.
///
/// - Both tags present, well ordered → exactly the interior text.
/// - Only one tag (or reversed ordering) → elide the tag(s), publish the raw
///   remainder unchanged. No guessing.
/// - No tags → unchanged.
pub fn extract_final(input: &str) -> String {
    let open = find_ci(input, FINAL_OPEN, 0);
    let close = find_ci(input, FINAL_CLOSE, 0);
    match (open, close) {
        (Some(o), Some(c)) if c >= o + FINAL_OPEN.len() => {
            input[o + FINAL_OPEN.len()..c].to_string()
        }
        (None, None) => input.to_string(),
        _ => {
            let mut out = input.to_string();
            for tag in [FINAL_CLOSE, FINAL_OPEN] {
                while let Some(p) = find_ci(&out, tag, 0) {
                    out.replace_range(p..p + tag.len(), "");
                }
            }
            out
        }
    }
}

/// Streaming view of the final region: once `<final>` has been seen, the
/// interior so far; before that, nothing.
pub fn streaming_final_view(stripped: &str) -> &str {
    match find_ci(stripped, FINAL_OPEN, 0) {
        Some(o) => {
            let interior = &stripped[o + FINAL_OPEN.len()..];
            match find_ci(interior, FINAL_CLOSE, 0) {
                Some(c) => &interior[..c],
                None => interior,
            }
        }
        None => "",
    }
}

/// Length of the prefix of `text` that is safe to publish mid-stream: a tail
/// that could still grow into a known tag is held back so tag fragments never
/// leak into partial or block output.
pub fn safe_publish_len(text: &str) -> usize {
    let Some(lt) = text.rfind('<') else {
        return text.len();
    };
    let tail = &text[lt..];
    if tail.contains('>') {
        return text.len();
    }
    let dangling = ALL_TAGS.iter().any(|tag| {
        tag.len() > tail.len() && tag.as_bytes()[..tail.len()].eq_ignore_ascii_case(tail.as_bytes())
    });
    if dangling {
        lt
    } else {
        text.len()
    }
}
