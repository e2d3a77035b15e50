//! Overlapping text chunker.
//!
//! Splits template content into spans of at most `chunk_size` characters,
//! with consecutive spans sharing up to `chunk_overlap` characters. Split
//! points are chosen hierarchically: paragraph breaks (`\n\n`), then line
//! breaks, then spaces. A whitespace-free token is never cut; if it alone
//! exceeds `chunk_size` it becomes its own oversized span.
//!
//! Spans are exact substrings of the input, so dropping each span's overlap
//! prefix and concatenating the rest reconstructs the original text.
//!
//! Each [`Chunk`] receives a deterministic id derived from the document id,
//! a SHA-256 hash of its source path, and its sequence index, so re-ingesting
//! an unchanged document yields the same ids.

use std::ops::Range;

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::models::{Chunk, ChunkMetadata, Document};

const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// Character-window splitter with overlap.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Chunker {
    /// Create a chunker. Fails if `chunk_size` is zero or
    /// `chunk_overlap >= chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if chunk_overlap >= chunk_size {
            bail!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap,
                chunk_size
            );
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split `text` into overlapping spans.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_ranges(text)
            .into_iter()
            .map(|r| text[r].to_string())
            .collect()
    }

    /// Byte ranges of the spans [`split`](Self::split) would produce.
    pub fn split_ranges(&self, text: &str) -> Vec<Range<usize>> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut pieces = Vec::new();
        collect_pieces(text, 0..text.len(), self.chunk_size, &SEPARATORS, &mut pieces);
        let lens: Vec<usize> = pieces.iter().map(|r| char_len(text, r)).collect();

        let mut spans = Vec::new();
        let mut start = 0;
        while start < pieces.len() {
            // Take pieces while they fit; the first one is always taken.
            let mut end = start;
            let mut len = 0;
            while end < pieces.len() && (end == start || len + lens[end] <= self.chunk_size) {
                len += lens[end];
                end += 1;
            }
            spans.push(pieces[start].start..pieces[end - 1].end);

            if end == pieces.len() {
                break;
            }

            // Carry trailing pieces into the next span as overlap, but only as
            // many as leave room for the next unseen piece.
            let mut next = end;
            let mut overlap = 0;
            while next > start + 1
                && overlap + lens[next - 1] <= self.chunk_overlap
                && overlap + lens[next - 1] + lens[end] <= self.chunk_size
            {
                overlap += lens[next - 1];
                next -= 1;
            }
            start = next;
        }

        spans
    }

    /// Split a document into chunks carrying its metadata.
    pub fn chunk_document(&self, doc: &Document) -> Vec<Chunk> {
        let spans = self.split(&doc.content);
        let total = spans.len();
        let path_hash = source_path_hash(&doc.metadata.source_path);

        spans
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                chunk_id: chunk_id(&doc.id, &path_hash, index),
                text,
                metadata: ChunkMetadata {
                    template: doc.metadata.clone(),
                    chunk_index: index,
                    total_chunks: total,
                    source_doc_id: doc.id.clone(),
                },
            })
            .collect()
    }
}

/// Deterministic chunk id: `{doc_id}_{path_hash}_chunk_{index}`.
pub fn chunk_id(doc_id: &str, path_hash: &str, index: usize) -> String {
    format!("{}_{}_chunk_{}", doc_id, path_hash, index)
}

/// First 12 hex digits of the SHA-256 of a source path.
pub fn source_path_hash(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

fn char_len(text: &str, range: &Range<usize>) -> usize {
    text[range.clone()].chars().count()
}

/// Break `range` into contiguous pieces no longer than `max_chars` where
/// possible, recursing through `separators`. Separators stay attached to
/// the piece they end.
fn collect_pieces(
    text: &str,
    range: Range<usize>,
    max_chars: usize,
    separators: &[&str],
    out: &mut Vec<Range<usize>>,
) {
    if char_len(text, &range) <= max_chars || separators.is_empty() {
        out.push(range);
        return;
    }

    let sep = separators[0];
    let slice = &text[range.clone()];
    let mut offset = 0;
    while let Some(pos) = slice[offset..].find(sep) {
        let end = offset + pos + sep.len();
        collect_pieces(
            text,
            range.start + offset..range.start + end,
            max_chars,
            &separators[1..],
            out,
        );
        offset = end;
    }
    if offset < slice.len() {
        collect_pieces(
            text,
            range.start + offset..range.end,
            max_chars,
            &separators[1..],
            out,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TemplateMetadata;

    fn doc(id: &str, path: &str, content: &str) -> Document {
        Document {
            id: id.to_string(),
            content: content.to_string(),
            metadata: TemplateMetadata {
                template_id: id.to_string(),
                source_path: path.to_string(),
                ..Default::default()
            },
        }
    }

    /// Rebuild the input by skipping the part of each span that overlaps
    /// the previous one.
    fn reconstruct(text: &str, ranges: &[Range<usize>]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for r in ranges {
            assert!(r.start <= covered, "gap before span {:?}", r);
            if r.end > covered {
                out.push_str(&text[covered..r.end]);
                covered = r.end;
            }
        }
        out
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(Chunker::new(100, 100).is_err());
        assert!(Chunker::new(100, 150).is_err());
        assert!(Chunker::new(0, 0).is_err());
        assert!(Chunker::new(100, 99).is_ok());
    }

    #[test]
    fn small_text_single_span() {
        let chunker = Chunker::new(1000, 200).unwrap();
        let spans = chunker.split("id: test-template\ninfo:\n  name: Test");
        assert_eq!(spans, vec!["id: test-template\ninfo:\n  name: Test"]);
    }

    #[test]
    fn empty_text_no_spans() {
        let chunker = Chunker::new(100, 10).unwrap();
        assert!(chunker.split("").is_empty());
        assert!(chunker.split("  \n\n ").is_empty());
    }

    #[test]
    fn spans_respect_size_and_cover_text() {
        let text = (0..80)
            .map(|i| format!("line {} with a few words in it", i))
            .collect::<Vec<_>>()
            .join("\n");
        for (size, overlap) in [(50, 0), (50, 20), (120, 40), (300, 299), (33, 5)] {
            let chunker = Chunker::new(size, overlap).unwrap();
            let ranges = chunker.split_ranges(&text);
            assert!(ranges.len() > 1);
            for r in &ranges {
                assert!(text[r.clone()].chars().count() <= size, "size {}", size);
            }
            for pair in ranges.windows(2) {
                let shared = pair[0].end.saturating_sub(pair[1].start);
                assert!(shared <= overlap, "overlap {} > {}", shared, overlap);
                assert!(pair[1].end > pair[0].end, "span made no progress");
            }
            assert_eq!(ranges.first().unwrap().start, 0);
            assert_eq!(ranges.last().unwrap().end, text.len());
            assert_eq!(reconstruct(&text, &ranges), text);
        }
    }

    #[test]
    fn overlap_is_applied_when_configured() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunker = Chunker::new(20, 8).unwrap();
        let ranges = chunker.split_ranges(text);
        assert!(ranges.windows(2).any(|p| p[0].end > p[1].start));
    }

    #[test]
    fn oversized_token_kept_whole() {
        let token = "x".repeat(40);
        let text = format!("short words {} after", token);
        let chunker = Chunker::new(10, 2).unwrap();
        let spans = chunker.split(&text);
        assert!(spans.iter().any(|s| s.trim_end() == token));
        for s in &spans {
            let len = s.chars().count();
            assert!(len <= 10 || s.split_whitespace().count() == 1);
        }
        assert_eq!(reconstruct(&text, &chunker.split_ranges(&text)), text);
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let text = "first paragraph here\n\nsecond paragraph here";
        let chunker = Chunker::new(25, 0).unwrap();
        let spans = chunker.split(text);
        assert_eq!(spans[0], "first paragraph here\n\n");
        assert_eq!(spans[1], "second paragraph here");
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "ünïcödé wörds ärë fïnë ".repeat(20);
        let chunker = Chunker::new(30, 10).unwrap();
        let spans = chunker.split(&text);
        assert!(spans.len() > 1);
        for s in &spans {
            assert!(s.chars().count() <= 30);
        }
    }

    #[test]
    fn chunk_ids_stable_across_runs() {
        let content = "id: a\n\n".to_string() + &"info line\n".repeat(200);
        let d = doc("cve-2024-0001", "/templates/http/cve-2024-0001.yaml", &content);
        let chunker = Chunker::new(200, 50).unwrap();
        let first: Vec<String> = chunker.chunk_document(&d).into_iter().map(|c| c.chunk_id).collect();
        let second: Vec<String> = chunker.chunk_document(&d).into_iter().map(|c| c.chunk_id).collect();
        assert_eq!(first, second);
        let unique: std::collections::HashSet<_> = first.iter().collect();
        assert_eq!(unique.len(), first.len());
    }

    #[test]
    fn chunk_ids_differ_by_source_path() {
        let chunker = Chunker::new(200, 50).unwrap();
        let a = chunker.chunk_document(&doc("dup", "/a/dup.yaml", "id: dup"));
        let b = chunker.chunk_document(&doc("dup", "/b/dup.yaml", "id: dup"));
        assert_ne!(a[0].chunk_id, b[0].chunk_id);
    }

    #[test]
    fn chunk_metadata_indices() {
        let chunker = Chunker::new(20, 0).unwrap();
        let chunks = chunker.chunk_document(&doc("d", "/d.yaml", &"word ".repeat(30)));
        let total = chunks.len();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.metadata.chunk_index, i);
            assert_eq!(c.metadata.total_chunks, total);
            assert_eq!(c.metadata.source_doc_id, "d");
        }
    }
}
