//! Splitting documents into indexable chunks.
//!
//! Chunk ids are `{doc_id}-chunk-{n}` so answers can cite them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A piece of a document, ready to embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub chunk_index: usize,
    /// Character offset of the chunk start in the source text.
    pub start_offset: usize,
    pub metadata: HashMap<String, String>,
}

impl Chunk {
    fn new(doc_id: &str, index: usize, text: String, start_offset: usize) -> Self {
        Self {
            id: format!("{doc_id}-chunk-{index}"),
            document_id: doc_id.to_string(),
            text,
            chunk_index: index,
            start_offset,
            metadata: HashMap::new(),
        }
    }
}

/// How text is split. Sizes are in characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkingStrategy {
    FixedSize {
        chunk_size: usize,
        overlap: usize,
    },
    Sentence {
        max_sentences: usize,
        overlap_sentences: usize,
    },
    /// Split on the first separator that divides the text, packing pieces
    /// up to `chunk_size`.
    Recursive {
        separators: Vec<String>,
        chunk_size: usize,
        overlap: usize,
    },
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::Recursive {
            separators: vec!["\n\n".into(), "\n".into(), ". ".into(), " ".into()],
            chunk_size: 800,
            overlap: 80,
        }
    }
}

/// Chunk text with the given strategy. Blank text yields no chunks.
pub fn chunk_text(text: &str, doc_id: &str, strategy: &ChunkingStrategy) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    match strategy {
        ChunkingStrategy::FixedSize {
            chunk_size,
            overlap,
        } => chunk_fixed(text, doc_id, *chunk_size, *overlap),
        ChunkingStrategy::Sentence {
            max_sentences,
            overlap_sentences,
        } => chunk_sentence(text, doc_id, *max_sentences, *overlap_sentences),
        ChunkingStrategy::Recursive {
            separators,
            chunk_size,
            overlap,
        } => chunk_recursive(text, doc_id, separators, *chunk_size, *overlap),
    }
}

fn chunk_fixed(text: &str, doc_id: &str, size: usize, overlap: usize) -> Vec<Chunk> {
    let size = size.max(1);
    let overlap = overlap.min(size - 1);
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        chunks.push(Chunk::new(doc_id, chunks.len(), piece, start));
        if end == chars.len() {
            break;
        }
        start = end - overlap;
    }
    chunks
}

fn chunk_sentence(
    text: &str,
    doc_id: &str,
    max_sentences: usize,
    overlap_sentences: usize,
) -> Vec<Chunk> {
    let max_sentences = max_sentences.max(1);
    let overlap_sentences = overlap_sentences.min(max_sentences - 1);
    let sentences: Vec<&str> = text
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < sentences.len() {
        let end = (start + max_sentences).min(sentences.len());
        let joined = sentences[start..end].join(" ");
        let offset = char_offset_of(text, sentences[start]);
        chunks.push(Chunk::new(doc_id, chunks.len(), joined, offset));
        if end == sentences.len() {
            break;
        }
        start = end - overlap_sentences;
    }
    chunks
}

fn chunk_recursive(
    text: &str,
    doc_id: &str,
    separators: &[String],
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let Some(sep) = separators
        .iter()
        .find(|sep| !sep.is_empty() && text.contains(sep.as_str()))
    else {
        return chunk_fixed(text, doc_id, chunk_size, overlap);
    };

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_start = 0;
    let mut consumed: usize = 0;

    for part in text.split(sep.as_str()) {
        let part_len = part.chars().count();
        let sep_len = sep.chars().count();
        let candidate = current.chars().count() + sep_len + part_len;

        if candidate > chunk_size && !current.trim().is_empty() {
            let tail = char_suffix(&current, overlap);
            let tail_len = tail.chars().count();
            let emitted = std::mem::replace(&mut current, tail);
            chunks.push(Chunk::new(
                doc_id,
                chunks.len(),
                emitted.trim().to_string(),
                current_start,
            ));
            current_start = consumed.saturating_sub(sep_len + tail_len);
        }
        if current.is_empty() {
            current_start = consumed;
        } else {
            current.push_str(sep);
        }
        current.push_str(part);
        consumed += part_len + sep_len;
    }

    if !current.trim().is_empty() {
        chunks.push(Chunk::new(
            doc_id,
            chunks.len(),
            current.trim().to_string(),
            current_start,
        ));
    }
    chunks
}

/// The last `n` characters of `s`.
fn char_suffix(s: &str, n: usize) -> String {
    let len = s.chars().count();
    s.chars().skip(len.saturating_sub(n)).collect()
}

fn char_offset_of(text: &str, needle: &str) -> usize {
    text.find(needle)
        .map(|byte| text[..byte].chars().count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_fixed_with_overlap() {
        let chunks = chunk_text(
            "abcdefghij",
            "doc1",
            &ChunkingStrategy::FixedSize {
                chunk_size: 4,
                overlap: 1,
            },
        );
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "defg", "ghij"]);
        assert_eq!(chunks[1].id, "doc1-chunk-1");
        assert_eq!(chunks[2].start_offset, 6);
    }

    #[test]
    fn test_chunk_fixed_overlap_larger_than_size_terminates() {
        let chunks = chunk_text(
            "abcdef",
            "d",
            &ChunkingStrategy::FixedSize {
                chunk_size: 2,
                overlap: 10,
            },
        );
        assert_eq!(chunks.len(), 5);
    }

    #[test]
    fn test_chunk_sentence() {
        let text = "Spring Boot is out. It needs Java 17! Does it support GraphQL? Yes.";
        let chunks = chunk_text(
            text,
            "spring",
            &ChunkingStrategy::Sentence {
                max_sentences: 2,
                overlap_sentences: 0,
            },
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Spring Boot is out. It needs Java 17!");
        assert_eq!(chunks[1].text, "Does it support GraphQL? Yes.");
    }

    #[test]
    fn test_chunk_recursive_paragraphs() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text(
            text,
            "doc1",
            &ChunkingStrategy::Recursive {
                separators: vec!["\n\n".into()],
                chunk_size: 20,
                overlap: 0,
            },
        );
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["First paragraph.", "Second paragraph.", "Third paragraph."]
        );
        assert_eq!(chunks[1].start_offset, 18);
    }

    #[test]
    fn test_chunk_recursive_multibyte_overlap() {
        let text = "héllo wörld ünïcode tèxt ñice";
        let chunks = chunk_text(
            text,
            "u",
            &ChunkingStrategy::Recursive {
                separators: vec![" ".into()],
                chunk_size: 12,
                overlap: 3,
            },
        );
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.text.is_empty()));
    }

    #[test]
    fn test_blank_text_yields_nothing() {
        assert!(chunk_text("  \n ", "d", &ChunkingStrategy::default()).is_empty());
    }

    #[test]
    fn test_strategy_serde() {
        let strategy: ChunkingStrategy =
            serde_json::from_str(r#"{"type":"fixed_size","chunk_size":100,"overlap":10}"#).unwrap();
        assert_eq!(
            strategy,
            ChunkingStrategy::FixedSize {
                chunk_size: 100,
                overlap: 10
            }
        );
    }
}
