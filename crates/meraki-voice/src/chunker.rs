//! Sentence-boundary chunking of the streamed generation text.
//!
//! The generation stream is segmented into sentence-level units as tokens
//! arrive so synthesis can start before the full response exists. The
//! boundary heuristic is a strategy trait so it stays swappable: the default
//! is punctuation-terminal (`.` `!` `?`, trailing quotes included) with a
//! length fallback for long unpunctuated runs.

/// Tunables for the default sentence chunker.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Emit a unit at this length even without terminal punctuation.
    pub max_chunk_chars: usize,
    /// Units shorter than this (after trimming) are held for more text,
    /// so "Dr." alone does not fire a synthesis round-trip.
    pub min_chunk_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 240,
            min_chunk_chars: 4,
        }
    }
}

/// Incremental segmentation strategy over accumulated generation text.
pub trait ChunkStrategy: Send {
    /// Feed newly arrived text; returns every unit completed by it, in order.
    fn push(&mut self, token: &str) -> Vec<String>;

    /// Flush any trailing partial unit (end of response).
    fn flush(&mut self) -> Option<String>;

    /// Discard buffered text (interruption).
    fn reset(&mut self);
}

/// Default strategy: split on sentence-terminal punctuation, with a
/// max-length fallback so unpunctuated streams still pipeline.
#[derive(Debug)]
pub struct SentenceChunker {
    config: ChunkerConfig,
    buffer: String,
}

impl SentenceChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
        }
    }

    /// Index one past the first complete sentence terminal in `buffer`,
    /// including closing quotes/brackets that follow the punctuation.
    /// Stopping at the first terminal keeps one unit per sentence; the
    /// caller drains repeatedly when a token carries several sentences.
    fn boundary(buffer: &str) -> Option<usize> {
        let mut chars = buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if matches!(c, '.' | '!' | '?') {
                let mut stop = i + c.len_utf8();
                while let Some(&(j, next)) = chars.peek() {
                    if matches!(next, '"' | '\'' | ')' | ']' | '.' | '!' | '?') {
                        stop = j + next.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                return Some(stop);
            }
        }
        None
    }

    fn drain_complete(&mut self) -> Vec<String> {
        let mut units = Vec::new();
        'sentences: loop {
            let Some(mut stop) = Self::boundary(&self.buffer) else {
                break;
            };
            // Too short to speak on its own ("Dr.", "Hi."): extend to the
            // next sentence terminal, or hold the buffer for more text.
            while self.buffer[..stop].trim().chars().count() < self.config.min_chunk_chars {
                let Some(next) = Self::boundary(&self.buffer[stop..]) else {
                    break 'sentences;
                };
                stop += next;
            }
            let unit = self.buffer[..stop].trim().to_string();
            self.buffer.drain(..stop);
            if !unit.is_empty() {
                units.push(unit);
            }
        }
        // Length fallback: no punctuation in sight but plenty to say.
        while self.buffer.chars().count() >= self.config.max_chunk_chars {
            let split = self
                .buffer
                .char_indices()
                .take(self.config.max_chunk_chars)
                .filter(|(_, c)| c.is_whitespace())
                .map(|(i, _)| i)
                .last()
                .unwrap_or_else(|| {
                    self.buffer
                        .char_indices()
                        .nth(self.config.max_chunk_chars - 1)
                        .map(|(i, c)| i + c.len_utf8())
                        .unwrap_or(self.buffer.len())
                });
            let unit = self.buffer[..split].trim().to_string();
            self.buffer.drain(..split);
            if !unit.is_empty() {
                units.push(unit);
            } else {
                break;
            }
        }
        units
    }
}

impl ChunkStrategy for SentenceChunker {
    fn push(&mut self, token: &str) -> Vec<String> {
        if token.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(token);
        self.drain_complete()
    }

    fn flush(&mut self) -> Option<String> {
        let trailing = self.buffer.trim().to_string();
        self.buffer.clear();
        if trailing.is_empty() {
            None
        } else {
            Some(trailing)
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for SentenceChunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> SentenceChunker {
        SentenceChunker::default()
    }

    #[test]
    fn emits_on_sentence_terminal() {
        let mut c = chunker();
        assert!(c.push("Hello the").is_empty());
        let units = c.push("re! How are");
        assert_eq!(units, vec!["Hello there!".to_string()]);
        assert!(c.push(" you").is_empty());
        assert_eq!(c.push("?"), vec!["How are you?".to_string()]);
    }

    #[test]
    fn multiple_sentences_in_one_token() {
        let mut c = chunker();
        let units = c.push("One done. Two done! Three pending");
        assert_eq!(units, vec!["One done.".to_string(), "Two done!".to_string()]);
        assert_eq!(c.flush(), Some("Three pending".to_string()));
    }

    #[test]
    fn sentence_burst_yields_one_unit_per_sentence() {
        let mut c = chunker();
        let units = c.push("Alpha done. Beta done! Gamma done? tail");
        assert_eq!(
            units,
            vec![
                "Alpha done.".to_string(),
                "Beta done!".to_string(),
                "Gamma done?".to_string(),
            ]
        );
        assert_eq!(c.flush(), Some("tail".to_string()));
    }

    #[test]
    fn short_sentence_rides_with_the_next() {
        let mut c = chunker();
        assert!(c.push("Hi.").is_empty());
        let units = c.push(" Good morning to you! more");
        assert_eq!(units, vec!["Hi. Good morning to you!".to_string()]);
    }

    #[test]
    fn trailing_quote_stays_with_sentence() {
        let mut c = chunker();
        let units = c.push("She said \"go.\" Then left");
        assert_eq!(units, vec!["She said \"go.\"".to_string()]);
    }

    #[test]
    fn flush_returns_trailing_partial_once() {
        let mut c = chunker();
        c.push("no punctuation here");
        assert_eq!(c.flush(), Some("no punctuation here".to_string()));
        assert_eq!(c.flush(), None);
    }

    #[test]
    fn length_fallback_for_unpunctuated_stream() {
        let mut c = SentenceChunker::new(ChunkerConfig {
            max_chunk_chars: 20,
            min_chunk_chars: 1,
        });
        let units = c.push("aaaa bbbb cccc dddd eeee ffff");
        assert!(!units.is_empty());
        for u in &units {
            assert!(u.chars().count() <= 20);
        }
    }

    #[test]
    fn reset_discards_buffered_text() {
        let mut c = chunker();
        c.push("half a sent");
        c.reset();
        assert_eq!(c.flush(), None);
    }
}
