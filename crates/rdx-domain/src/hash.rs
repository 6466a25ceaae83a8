//! Content digests for chunk bodies.
//!
//! Chunk bodies are compared after normalizing them to end in exactly one
//! newline, so two bodies that differ only in trailing newlines share a
//! digest. [`ChunkHasher`] produces the same digest as [`chunk_hash`] while
//! only ever holding the run of trailing newlines it has not emitted yet.

use sha2::{Digest, Sha256};

/// Strip every trailing `\n` and append exactly one.
#[must_use]
pub fn normalize_trailing_newline(content: &[u8]) -> Vec<u8> {
    let end = content
        .iter()
        .rposition(|b| *b != b'\n')
        .map_or(0, |idx| idx + 1);
    let mut normalized = Vec::with_capacity(end + 1);
    normalized.extend_from_slice(&content[..end]);
    normalized.push(b'\n');
    normalized
}

/// Number of observations in a normalized tabular body (lines minus header).
#[must_use]
pub fn observation_count(normalized: &[u8]) -> u64 {
    let lines = normalized.iter().filter(|b| **b == b'\n').count() as u64;
    lines.saturating_sub(1)
}

/// Hex sha256 of `content` after newline normalization.
#[must_use]
pub fn chunk_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(normalize_trailing_newline(content)))
}

/// Streaming form of [`chunk_hash`].
#[derive(Clone, Default)]
pub struct ChunkHasher {
    digest: Sha256,
    pending_newlines: usize,
    lines: u64,
}

impl ChunkHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, piece: &[u8]) {
        let Some(last_content) = piece.iter().rposition(|b| *b != b'\n') else {
            self.pending_newlines += piece.len();
            return;
        };
        self.flush_pending();
        let (body, tail) = piece.split_at(last_content + 1);
        self.lines += body.iter().filter(|b| **b == b'\n').count() as u64;
        self.digest.update(body);
        self.pending_newlines = tail.len();
    }

    /// Digest and observation count of everything fed so far.
    #[must_use]
    pub fn finish(mut self) -> (String, u64) {
        self.digest.update(b"\n");
        let lines = self.lines + 1;
        (hex::encode(self.digest.finalize()), lines.saturating_sub(1))
    }

    fn flush_pending(&mut self) {
        if self.pending_newlines == 0 {
            return;
        }
        const NEWLINES: [u8; 64] = [b'\n'; 64];
        let mut remaining = self.pending_newlines;
        while remaining > 0 {
            let take = remaining.min(NEWLINES.len());
            self.digest.update(&NEWLINES[..take]);
            remaining -= take;
        }
        self.lines += self.pending_newlines as u64;
        self.pending_newlines = 0;
    }
}

/// Hash a body supplied as a sequence of pieces.
pub fn low_memory_chunk_hash<I, B>(pieces: I) -> String
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = ChunkHasher::new();
    for piece in pieces {
        hasher.update(piece.as_ref());
    }
    hasher.finish().0
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "timestamp,value\n1,a\n2,b\n";

    #[test]
    fn trailing_newline_count_does_not_change_digest() {
        let base = chunk_hash(BODY.as_bytes());
        assert_eq!(base, chunk_hash(format!("{BODY}\n").as_bytes()));
        assert_eq!(base, chunk_hash(format!("{BODY}\n\n\n").as_bytes()));
        assert_eq!(base, chunk_hash(BODY.trim_end_matches('\n').as_bytes()));
        assert_ne!(base, chunk_hash(b"timestamp,value\n1,a\n"));
    }

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        let digest = chunk_hash(b"");
        assert_eq!(digest, "01ba4719c80b6fe911b091a7c05124b64eeece964e09c058ef8f9805daca546b");
        assert!(chunk_hash(BODY.as_bytes())
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn streaming_matches_full_buffer_for_any_split() {
        let content = format!("{BODY}\n\n");
        let expected = chunk_hash(content.as_bytes());
        let bytes = content.as_bytes();
        for split in 0..=bytes.len() {
            let (left, right) = bytes.split_at(split);
            assert_eq!(low_memory_chunk_hash([left, right]), expected, "split {split}");
        }
        let single_bytes: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(low_memory_chunk_hash(single_bytes), expected);
    }

    #[test]
    fn interior_blank_lines_are_preserved() {
        let with_gap = "h\n\n\nrow\n";
        let mut hasher = ChunkHasher::new();
        hasher.update(b"h\n\n");
        hasher.update(b"\nrow\n\n");
        let (digest, observations) = hasher.finish();
        assert_eq!(digest, chunk_hash(with_gap.as_bytes()));
        assert_eq!(observations, 3);
    }

    #[test]
    fn counts_observations_without_header() {
        let normalized = normalize_trailing_newline(BODY.as_bytes());
        assert_eq!(observation_count(&normalized), 2);
        assert_eq!(observation_count(&normalize_trailing_newline(b"")), 0);
        let (_, streamed) = {
            let mut hasher = ChunkHasher::new();
            hasher.update(BODY.as_bytes());
            hasher.finish()
        };
        assert_eq!(streamed, 2);
    }
}
