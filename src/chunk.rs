//! Overlapping text chunker.
//!
//! Splits extracted document text into segments of at most `max_tokens`
//! tokens, where consecutive segments share exactly `overlap_tokens` tokens
//! so context survives chunk boundaries. Splitting prefers sentence and
//! paragraph boundaries before falling back to hard token cuts.
//!
//! Tokens are whitespace-delimited words; the same estimator is used for
//! prompt budgeting in the synthesizer so the two stay consistent.

use crate::error::PipelineError;

/// One produced segment. `index` values are contiguous starting at 0.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub index: i64,
    pub text: String,
    pub token_count: usize,
}

/// Whitespace token count, shared with prompt assembly.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Lazy, finite, restartable chunk sequence over borrowed text.
///
/// Restart by constructing a new splitter (or cloning one before use);
/// identical input and configuration always yield identical output.
#[derive(Debug, Clone)]
pub struct ChunkSplitter<'a> {
    text: &'a str,
    /// Byte range of each whitespace token.
    tokens: Vec<(usize, usize)>,
    max_tokens: usize,
    overlap: usize,
    /// Next token position to start a segment from.
    pos: usize,
    next_index: i64,
}

impl<'a> ChunkSplitter<'a> {
    pub fn new(text: &'a str, max_tokens: usize, overlap: usize) -> Result<Self, PipelineError> {
        if max_tokens == 0 {
            return Err(PipelineError::InvalidInput(
                "max_tokens must be > 0".to_string(),
            ));
        }
        if overlap >= max_tokens {
            return Err(PipelineError::InvalidInput(
                "overlap_tokens must be < max_tokens".to_string(),
            ));
        }
        if text.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "document text is empty".to_string(),
            ));
        }

        let mut tokens = Vec::new();
        let mut start = None;
        for (i, ch) in text.char_indices() {
            if ch.is_whitespace() {
                if let Some(s) = start.take() {
                    tokens.push((s, i));
                }
            } else if start.is_none() {
                start = Some(i);
            }
        }
        if let Some(s) = start {
            tokens.push((s, text.len()));
        }

        Ok(Self {
            text,
            tokens,
            max_tokens,
            overlap,
            pos: 0,
            next_index: 0,
        })
    }

    /// True if the token at `j - 1` ends a sentence, or a paragraph break
    /// separates tokens `j - 1` and `j`.
    fn is_boundary(&self, j: usize) -> bool {
        let (_, end) = self.tokens[j - 1];
        let word = &self.text[self.tokens[j - 1].0..end];
        let trimmed = word.trim_end_matches(['"', '\'', ')', ']']);
        if trimmed.ends_with(['.', '!', '?']) {
            return true;
        }
        if j < self.tokens.len() {
            let gap = &self.text[end..self.tokens[j].0];
            if gap.matches('\n').count() >= 2 {
                return true;
            }
        }
        false
    }
}

impl Iterator for ChunkSplitter<'_> {
    type Item = ChunkPiece;

    fn next(&mut self) -> Option<ChunkPiece> {
        if self.pos >= self.tokens.len() {
            return None;
        }

        let hard_end = (self.pos + self.max_tokens).min(self.tokens.len());
        let mut end = hard_end;
        if hard_end < self.tokens.len() {
            // Prefer the latest sentence/paragraph boundary that still
            // advances past the overlap region, so progress is guaranteed.
            let floor = self.pos + self.overlap + 1;
            for j in (floor..=hard_end).rev() {
                if self.is_boundary(j) {
                    end = j;
                    break;
                }
            }
        }

        let text = &self.text[self.tokens[self.pos].0..self.tokens[end - 1].1];
        let piece = ChunkPiece {
            index: self.next_index,
            text: text.to_string(),
            token_count: end - self.pos,
        };
        self.next_index += 1;
        self.pos = if end >= self.tokens.len() {
            self.tokens.len()
        } else {
            end - self.overlap
        };
        Some(piece)
    }
}

/// Split eagerly. Convenience for callers that want the whole sequence.
pub fn chunk_text(
    text: &str,
    max_tokens: usize,
    overlap: usize,
) -> Result<Vec<ChunkPiece>, PipelineError> {
    Ok(ChunkSplitter::new(text, max_tokens, overlap)?.collect())
}
