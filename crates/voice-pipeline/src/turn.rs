//! Turn-taking policies used by the orchestrator.
//!
//! `SpanBuffer` decides when streamed LLM text is handed to TTS; `BargeIn`
//! tracks whether the user has said enough, for long enough, to interrupt the
//! agent.

use std::time::Duration;
use tokio::time::Instant;

/// Words that must be buffered before a span is flushed without punctuation.
pub const SPAN_FLUSH_WORDS: usize = 5;

/// Barge-in never fires on fewer words than this, whatever the config says.
pub const MIN_INTERRUPT_WORDS: usize = 2;

/// Whitespace-separated word count.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

fn has_alphanumeric(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

fn normalized(word: &str) -> String {
    word.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Words of `final_text` left over once the interim text in `committed` is
/// accounted for. Matching ignores case and punctuation. A final that stops
/// short of `committed` leaves nothing; `None` means the final is new speech.
pub fn remainder_after(committed: &str, final_text: &str) -> Option<String> {
    let mut words = final_text
        .split_whitespace()
        .filter(|word| has_alphanumeric(word));
    for expected in committed.split_whitespace().map(normalized).filter(|w| !w.is_empty()) {
        match words.next() {
            Some(word) if normalized(word) == expected => {}
            Some(_) => return None,
            None => return Some(String::new()),
        }
    }
    Some(words.collect::<Vec<_>>().join(" "))
}

/// Accumulates LLM deltas and releases synthesis-sized spans.
///
/// A span ends after the last sentence terminator (`.`, `!`, `?`) that is
/// followed by whitespace, or, when there is none, at the last whitespace once
/// at least [`SPAN_FLUSH_WORDS`] complete words are buffered. Spans are trimmed
/// and never split a word, so concatenating them reproduces the input modulo
/// whitespace.
#[derive(Debug, Default)]
pub struct SpanBuffer {
    pending: String,
    /// Everything flushed so far plus what is pending, for the assistant message.
    full_text: String,
}

impl SpanBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return any spans that are now ready.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.full_text.push_str(delta);
        self.pending.push_str(delta);

        let mut spans = Vec::new();
        while let Some(cut) = self.split_point() {
            let rest = self.pending.split_off(cut);
            let span = std::mem::replace(&mut self.pending, rest);
            let span = span.trim();
            if !span.is_empty() {
                spans.push(span.to_string());
            }
            let leading = self.pending.len() - self.pending.trim_start().len();
            self.pending.drain(..leading);
        }
        spans
    }

    /// Drain whatever is left once the LLM stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }

    /// The complete response text received so far.
    pub fn full_text(&self) -> &str {
        self.full_text.trim()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.trim().is_empty()
    }

    fn split_point(&self) -> Option<usize> {
        let text = self.pending.as_str();

        let mut sentence_end = None;
        let mut chars = text.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            if matches!(c, '.' | '!' | '?') {
                if let Some(&(_, next)) = chars.peek() {
                    if next.is_whitespace() {
                        sentence_end = Some(idx + c.len_utf8());
                    }
                }
            }
        }
        if let Some(cut) = sentence_end {
            if has_alphanumeric(&text[..cut]) {
                return Some(cut);
            }
        }

        // Only words followed by whitespace are complete; the tail may still grow.
        let mut complete = count_words(text);
        if !text.ends_with(char::is_whitespace) {
            complete = complete.saturating_sub(1);
        }
        if complete < SPAN_FLUSH_WORDS {
            return None;
        }
        let trimmed = text.trim_end();
        let cut = if trimmed.len() < text.len() {
            trimmed.len()
        } else {
            trimmed.rfind(char::is_whitespace)?
        };
        (cut > 0 && has_alphanumeric(&text[..cut])).then_some(cut)
    }
}

/// Word accounting for one barge-in window.
///
/// A window opens when VAD reports confident speech while the agent is
/// speaking. Interruption is due once the debounce has elapsed and the user
/// has produced at least `threshold` words (final transcripts plus the latest
/// interim).
#[derive(Debug, Clone)]
pub struct BargeIn {
    threshold: usize,
    ready_at: Instant,
    final_words: usize,
    interim_words: usize,
}

impl BargeIn {
    pub fn open(interrupt_min_words: usize, debounce: Duration) -> Self {
        Self::open_at(interrupt_min_words, debounce, Instant::now())
    }

    pub fn open_at(interrupt_min_words: usize, debounce: Duration, now: Instant) -> Self {
        Self {
            threshold: interrupt_min_words.max(MIN_INTERRUPT_WORDS),
            ready_at: now + debounce,
            final_words: 0,
            interim_words: 0,
        }
    }

    /// Interims revise each other; only the latest one counts.
    pub fn on_interim(&mut self, text: &str) {
        self.interim_words = count_words(text);
    }

    pub fn on_final(&mut self, text: &str) {
        self.final_words += count_words(text);
        self.interim_words = 0;
    }

    pub fn words(&self) -> usize {
        self.final_words + self.interim_words
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }

    pub fn should_interrupt(&self, now: Instant) -> bool {
        now >= self.ready_at && self.words() >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn squash(text: &str) -> String {
        text.chars().filter(|c| !c.is_whitespace()).collect()
    }

    fn feed(deltas: &[&str]) -> Vec<String> {
        let mut buffer = SpanBuffer::new();
        let mut spans = Vec::new();
        for delta in deltas {
            spans.extend(buffer.push(delta));
        }
        spans.extend(buffer.finish());
        spans
    }

    #[test]
    fn count_words_ignores_extra_whitespace() {
        assert_eq!(count_words(""), 0);
        assert_eq!(count_words("  yes  "), 1);
        assert_eq!(count_words("yes I disagree\tcompletely"), 4);
    }

    #[test]
    fn splits_on_sentence_boundary() {
        let spans = feed(&["Hello, world. ", "This is a test."]);
        assert_eq!(spans, vec!["Hello, world.", "This is a test."]);
    }

    #[test]
    fn concatenation_is_lossless_for_any_delta_size() {
        let text = "Hello, world. This is a test.";
        for size in 1..=text.len() {
            let bytes = text.as_bytes();
            let deltas: Vec<&str> = bytes
                .chunks(size)
                .map(|c| std::str::from_utf8(c).unwrap())
                .collect();
            let spans = feed(&deltas);
            assert_eq!(squash(&spans.concat()), squash(text), "delta size {}", size);
            for span in &spans {
                let ends_sentence = span.ends_with(['.', '!', '?']);
                assert!(
                    ends_sentence || count_words(span) >= SPAN_FLUSH_WORDS,
                    "span {:?} split at delta size {}",
                    span,
                    size
                );
            }
        }
    }

    #[test]
    fn long_clause_flushes_after_five_words() {
        let mut buffer = SpanBuffer::new();
        assert!(buffer.push("one two three four ").is_empty());
        // "five" is not complete until whitespace follows it.
        assert!(buffer.push("five").is_empty());
        assert_eq!(buffer.push(" six"), vec!["one two three four five"]);
        assert_eq!(buffer.finish().as_deref(), Some("six"));
    }

    #[test]
    fn decimal_points_do_not_split() {
        let spans = feed(&["It costs 3.50 dollars", " today."]);
        assert_eq!(spans, vec!["It costs 3.50 dollars today."]);
    }

    #[test]
    fn punctuation_only_prefix_is_not_a_span() {
        let mut buffer = SpanBuffer::new();
        assert!(buffer.push("... ").is_empty());
        assert_eq!(buffer.push("Well. Then"), vec!["... Well."]);
        assert_eq!(buffer.finish().as_deref(), Some("Then"));
    }

    #[test]
    fn full_text_keeps_everything() {
        let mut buffer = SpanBuffer::new();
        buffer.push("Hi there. ");
        buffer.push("Bye");
        assert_eq!(buffer.full_text(), "Hi there. Bye");
        assert!(!buffer.is_empty());
        buffer.finish();
        assert!(buffer.is_empty());
    }

    #[test]
    fn remainder_after_committed_interim() {
        assert_eq!(remainder_after("what time", "What time is it?").as_deref(), Some("is it?"));
        assert_eq!(remainder_after("what time is it", "what time").as_deref(), Some(""));
        assert_eq!(remainder_after("um", "Um.").as_deref(), Some(""));
        assert_eq!(remainder_after("um", "what time is it"), None);
        assert_eq!(remainder_after("um", "").as_deref(), Some(""));
    }

    #[test]
    fn barge_in_threshold_has_a_floor_of_two() {
        let now = Instant::now();
        let window = BargeIn::open_at(0, Duration::ZERO, now);
        assert_eq!(window.threshold(), 2);

        let window = BargeIn::open_at(3, Duration::ZERO, now);
        assert_eq!(window.threshold(), 3);
    }

    #[test]
    fn barge_in_counts_latest_interim_plus_finals() {
        let now = Instant::now();
        let mut window = BargeIn::open_at(3, Duration::from_millis(200), now);

        window.on_interim("yes");
        assert!(!window.should_interrupt(now + Duration::from_millis(300)));

        window.on_interim("yes I disagree completely");
        assert_eq!(window.words(), 4);
        assert!(!window.should_interrupt(now + Duration::from_millis(100)));
        assert!(window.should_interrupt(now + Duration::from_millis(200)));

        window.on_final("no");
        window.on_interim("wait");
        assert_eq!(window.words(), 2);
    }
}
