//! Bounded output history kept for late subscribers.

use std::collections::VecDeque;

use bytes::Bytes;

/// Default number of chunks retained per session.
pub const DEFAULT_SCROLLBACK_CHUNKS: usize = 2048;

/// Default byte budget per session (1MB).
pub const DEFAULT_SCROLLBACK_BYTES: usize = 1024 * 1024;

/// FIFO of output chunks bounded both by count and by total size.
///
/// The oldest chunk is evicted first. The newest chunk is always kept, even
/// when it alone exceeds the byte budget.
#[derive(Debug, Clone)]
pub struct Scrollback {
    chunks: VecDeque<Bytes>,
    max_chunks: usize,
    max_bytes: usize,
    total_bytes: usize,
    evicted: u64,
}

impl Scrollback {
    /// Capacities of zero are raised to one.
    pub fn new(max_chunks: usize, max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            max_chunks: max_chunks.max(1),
            max_bytes: max_bytes.max(1),
            total_bytes: 0,
            evicted: 0,
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);

        while self.chunks.len() > self.max_chunks
            || (self.total_bytes > self.max_bytes && self.chunks.len() > 1)
        {
            if let Some(removed) = self.chunks.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(removed.len());
                self.evicted += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn capacity(&self) -> usize {
        self.max_chunks
    }

    /// Chunks dropped since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Retained chunks, oldest first. Cloning `Bytes` does not copy data.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.iter().cloned().collect()
    }

    /// Retained output as one contiguous buffer.
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// The last `max_bytes` of retained output.
    pub fn tail(&self, max_bytes: usize) -> Vec<u8> {
        let mut result = Vec::new();
        let mut remaining = max_bytes;

        for chunk in self.chunks.iter().rev() {
            if remaining == 0 {
                break;
            }
            let take = chunk.len().min(remaining);
            let mut piece = chunk[chunk.len() - take..].to_vec();
            piece.reverse();
            result.extend_from_slice(&piece);
            remaining -= take;
        }

        result.reverse();
        result
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_CHUNKS, DEFAULT_SCROLLBACK_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_keeps_most_recent_chunks_in_order() {
        let mut scrollback = Scrollback::new(3, usize::MAX);
        for i in 0..10 {
            scrollback.push(chunk(&format!("c{}", i)));
        }

        assert_eq!(scrollback.len(), 3);
        assert_eq!(
            scrollback.snapshot(),
            vec![chunk("c7"), chunk("c8"), chunk("c9")]
        );
        assert_eq!(scrollback.evicted(), 7);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut scrollback = Scrollback::new(5, usize::MAX);
        for i in 0..100 {
            scrollback.push(chunk(&i.to_string()));
            assert!(scrollback.len() <= 5);
        }
    }

    #[test]
    fn test_under_capacity_keeps_everything() {
        let mut scrollback = Scrollback::new(10, usize::MAX);
        scrollback.push(chunk("a"));
        scrollback.push(chunk("b"));
        assert_eq!(scrollback.snapshot(), vec![chunk("a"), chunk("b")]);
        assert_eq!(scrollback.contents(), b"ab");
        assert_eq!(scrollback.total_bytes(), 2);
    }

    #[test]
    fn test_byte_budget_evicts_oldest() {
        let mut scrollback = Scrollback::new(100, 6);
        scrollback.push(chunk("aaa"));
        scrollback.push(chunk("bbb"));
        scrollback.push(chunk("ccc"));

        assert_eq!(scrollback.snapshot(), vec![chunk("bbb"), chunk("ccc")]);
        assert_eq!(scrollback.total_bytes(), 6);
    }

    #[test]
    fn test_oversized_chunk_is_kept_alone() {
        let mut scrollback = Scrollback::new(100, 4);
        scrollback.push(chunk("ab"));
        scrollback.push(chunk("0123456789"));

        assert_eq!(scrollback.len(), 1);
        assert_eq!(scrollback.contents(), b"0123456789");
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut scrollback = Scrollback::new(0, 0);
        assert_eq!(scrollback.capacity(), 1);
        scrollback.push(chunk("x"));
        scrollback.push(chunk("y"));
        assert_eq!(scrollback.snapshot(), vec![chunk("y")]);
    }

    #[test]
    fn test_tail_spans_chunks() {
        let mut scrollback = Scrollback::new(10, usize::MAX);
        scrollback.push(chunk("hello "));
        scrollback.push(chunk("world"));

        assert_eq!(scrollback.tail(7), b"o world");
        assert_eq!(scrollback.tail(3), b"rld");
        assert_eq!(scrollback.tail(100), b"hello world");
        assert!(scrollback.tail(0).is_empty());
    }
}
