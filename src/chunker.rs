//! Sentence-aware text chunking
//!
//! Splits on sentence terminators (CJK and ASCII), keeps terminators
//! attached, and greedily packs sentences into chunks. A chunk may grow to
//! `chunk_size * max_expand_ratio` rather than cut a sentence; oversize
//! sentences are split again on minor punctuation. Closed chunks seed the
//! next one with a trailing-sentence overlap for continuity.
//!
//! All sizes are measured in characters, not bytes.

use crate::config::ChunkingConfig;
use crate::models::KnowledgeBase;

/// Text chunker with per-call parameters
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
    max_expand_ratio: f64,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize, max_expand_ratio: f64) -> Self {
        Self {
            chunk_size,
            overlap,
            max_expand_ratio,
        }
    }

    /// Resolve per-KB overrides against the global defaults
    pub fn for_knowledge_base(kb: &KnowledgeBase, defaults: &ChunkingConfig) -> Self {
        Self::new(
            kb.chunk_size.map(|v| v as usize).unwrap_or(defaults.chunk_size),
            kb.chunk_overlap
                .map(|v| v as usize)
                .unwrap_or(defaults.chunk_overlap),
            kb.chunk_max_expand_ratio.unwrap_or(defaults.max_expand_ratio),
        )
    }

    /// Split text into ordered, non-empty chunks
    pub fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() || self.chunk_size == 0 {
            return Vec::new();
        }

        let mut sentences = if text.chars().any(is_terminator) {
            split_sentences(text)
        } else {
            Vec::new()
        };

        if sentences.is_empty() {
            // No terminators at all: fall back to blank-line paragraphs
            let paragraphs: Vec<String> = text
                .split("\n\n")
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if paragraphs.len() <= 1 {
                // Single blob: fixed-size sliding window
                return self.sliding_window(text);
            }
            sentences = paragraphs;
        }

        self.pack(sentences)
    }

    fn sliding_window(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end >= chars.len() {
                break;
            }
            // Always make progress even when overlap >= chunk_size
            start = end.saturating_sub(self.overlap).max(start + 1);
        }
        chunks
    }

    fn pack(&self, sentences: Vec<String>) -> Vec<String> {
        let max_chunk = (self.chunk_size as f64 * self.max_expand_ratio) as usize;
        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_len = 0usize;

        for sentence in sentences {
            let sentence_len = sentence.chars().count();

            if sentence_len > max_chunk {
                // Oversize sentence: flush, then split on minor punctuation
                if !current.is_empty() {
                    chunks.push(current.join(" "));
                    current.clear();
                    current_len = 0;
                }
                for sub in split_subsentences(&sentence) {
                    let sub_len = sub.chars().count();
                    if current_len + sub_len <= max_chunk {
                        current.push(sub);
                        current_len += sub_len + 1;
                    } else {
                        if !current.is_empty() {
                            chunks.push(current.join(" "));
                        }
                        if sub_len > max_chunk {
                            // Pathological sub-sentence: stands alone
                            chunks.push(sub);
                            current = Vec::new();
                            current_len = 0;
                        } else {
                            current = vec![sub];
                            current_len = sub_len;
                        }
                    }
                }
                continue;
            }

            let separator = usize::from(!current.is_empty());
            let new_len = current_len + sentence_len + separator;

            if new_len <= max_chunk {
                // Within target, or over target but inside the allowed
                // expansion to keep the sentence whole
                current.push(sentence);
                current_len = new_len;
            } else {
                // Close the chunk, seeding the next with a trailing suffix
                let (overlap_sentences, overlap_len) = self.trailing_overlap(&current);
                if !current.is_empty() {
                    chunks.push(current.join(" "));
                }
                let seed_count = overlap_sentences.len();
                current = overlap_sentences;
                current.push(sentence);
                current_len = overlap_len + sentence_len + seed_count;
            }
        }

        if !current.is_empty() {
            chunks.push(current.join(" "));
        }
        chunks.retain(|c| !c.trim().is_empty());
        chunks
    }

    /// Trailing sentences of a closed chunk totalling at most `overlap`
    /// characters. A single-sentence chunk seeds nothing.
    fn trailing_overlap(&self, current: &[String]) -> (Vec<String>, usize) {
        let mut seed: Vec<String> = Vec::new();
        let mut seed_len = 0usize;
        if self.overlap == 0 || current.len() <= 1 {
            return (seed, 0);
        }
        for sentence in current.iter().rev() {
            let len = sentence.chars().count();
            if seed_len + len <= self.overlap {
                seed.insert(0, sentence.clone());
                seed_len += len + 1;
            } else {
                break;
            }
        }
        (seed, seed_len)
    }
}

const CJK_TERMINATORS: &[char] = &['。', '！', '？'];
const ASCII_TERMINATORS: &[char] = &['.', '!', '?'];

fn is_terminator(c: char) -> bool {
    c == '\n' || CJK_TERMINATORS.contains(&c) || ASCII_TERMINATORS.contains(&c)
}

/// Split on runs of sentence terminators, keeping each run attached to its
/// sentence. Newlines split but are not carried into the sentence text.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut terminator_run = String::new();

    for c in text.chars() {
        if is_terminator(c) {
            if c != '\n' {
                terminator_run.push(c);
            } else {
                terminator_run.push(' ');
            }
        } else {
            if !terminator_run.is_empty() {
                let sentence = current.trim();
                let run = terminator_run.trim();
                if !sentence.is_empty() {
                    sentences.push(format!("{}{}", sentence, run));
                }
                current.clear();
                terminator_run.clear();
            }
            current.push(c);
        }
    }
    if !terminator_run.is_empty() || !current.trim().is_empty() {
        let sentence = current.trim();
        let run = terminator_run.trim();
        if !sentence.is_empty() {
            sentences.push(format!("{}{}", sentence, run));
        }
    }
    sentences
}

const SUB_SEPARATORS: &[char] = &['，', '；', ',', ';'];

fn split_subsentences(sentence: &str) -> Vec<String> {
    sentence
        .split(|c: char| SUB_SEPARATORS.contains(&c))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_text_single_chunk() {
        let chunker = Chunker::new(500, 50, 1.3);
        let chunks = chunker.chunk("这是一个短文本。");
        assert_eq!(chunks, vec!["这是一个短文本。"]);
    }

    #[test]
    fn test_empty_text_no_chunks() {
        let chunker = Chunker::new(500, 50, 1.3);
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n ").is_empty());
    }

    #[test]
    fn test_sentences_kept_whole() {
        let chunker = Chunker::new(16, 0, 1.3);
        let text = "第一句话在这里。第二句话在这里。第三句话在这里。";
        let chunks = chunker.chunk(text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // Every chunk ends on a terminator; no sentence was cut
            assert!(chunk.ends_with('。'), "chunk not sentence-aligned: {}", chunk);
        }
    }

    #[test]
    fn test_mixed_ascii_terminators() {
        let chunks = split_sentences("First sentence. Second one! A question? Done");
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], "First sentence.");
        assert_eq!(chunks[2], "A question?");
        assert_eq!(chunks[3], "Done");
    }

    #[test]
    fn test_terminator_runs_stay_attached() {
        let chunks = split_sentences("真的吗？！后续内容。");
        assert_eq!(chunks, vec!["真的吗？！", "后续内容。"]);
    }

    #[test]
    fn test_expansion_keeps_sentence_whole() {
        // Second sentence would overflow the target but fits the expansion
        let chunker = Chunker::new(20, 0, 1.5);
        let text = "这一句正好十个字符啊。这一句也是十个字符啊。";
        let chunks = chunker.chunk(text);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_oversize_sentence_splits_on_commas() {
        let chunker = Chunker::new(10, 0, 1.3);
        let long = "甲部分内容很长很长很长，乙部分内容也很长很长，丙部分同样很长很长。";
        let chunks = chunker.chunk(long);
        assert!(chunks.len() > 1);
        let max = (10f64 * 1.3) as usize;
        for chunk in &chunks {
            let n = chunk.chars().count();
            // Sub-sentences may themselves exceed the ceiling only when a
            // single sub-sentence does
            if n > max {
                assert!(!chunk.contains('，'));
            }
        }
    }

    #[test]
    fn test_overlap_seeds_next_chunk() {
        let chunker = Chunker::new(24, 12, 1.0);
        let text = "一二三四五六七八。九十子丑寅卯辰巳。午未申酉戌亥甲乙。丙丁戊己庚辛壬癸。";
        let chunks = chunker.chunk(text);
        assert!(chunks.len() >= 2);
        // Some trailing sentence of chunk[0] reappears at the head of chunk[1]
        let first_tail = chunks[0].split(' ').last().unwrap();
        assert!(
            chunks[1].starts_with(first_tail),
            "expected overlap seed, got {:?}",
            chunks
        );
    }

    #[test]
    fn test_paragraph_fallback() {
        let chunker = Chunker::new(10, 0, 1.3);
        let text = "第一段没有终结符\n\n第二段也没有终结符";
        let chunks = chunker.chunk(text);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_sliding_window_fallback() {
        let chunker = Chunker::new(10, 2, 1.3);
        let text: String = "字".repeat(25);
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].chars().count(), 10);
        // Window advances by size - overlap
        assert_eq!(chunks[1].chars().count(), 10);
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(total >= 25);
    }

    proptest! {
        #[test]
        fn prop_chunks_nonempty_and_bounded(
            text in "[a-z \u{4e00}-\u{4e20}。.]{0,400}",
            size in 8usize..120,
            overlap in 0usize..8,
        ) {
            let ratio = 1.3;
            let chunker = Chunker::new(size, overlap, ratio);
            let chunks = chunker.chunk(&text);
            let ceiling = (size as f64 * ratio) as usize + overlap + 1;
            for chunk in &chunks {
                prop_assert!(!chunk.trim().is_empty());
                let n = chunk.chars().count();
                // The ceiling holds except for a chunk that is one
                // indivisible sub-sentence (terminators may only trail)
                if n > ceiling {
                    let body: String = chunk
                        .chars()
                        .rev()
                        .skip_while(|c| is_terminator(*c))
                        .collect();
                    prop_assert!(!body.chars().any(|c| SUB_SEPARATORS.contains(&c) || is_terminator(c)));
                }
            }
        }

        #[test]
        fn prop_no_content_lost_for_windowed_text(len in 1usize..200) {
            let text: String = "字".repeat(len);
            let chunker = Chunker::new(16, 4, 1.3);
            let total: usize = chunker.chunk(&text).iter().map(|c| c.chars().count()).sum();
            prop_assert!(total >= len);
        }
    }
}
