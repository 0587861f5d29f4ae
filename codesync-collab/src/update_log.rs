//! Append-only log of opaque CRDT update blobs for one document.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                UpdateLog                   │
//! │                                            │
//! │  blob ── blob ── blob ── … ── blob         │
//! │                                            │
//! │  gc: count > ceiling → [concat(all blobs)] │
//! └────────────────────────────────────────────┘
//! ```
//!
//! The encoded state is the byte-wise concatenation of every blob in
//! insertion order. Compaction merges blobs into one without changing that
//! concatenation, so clients reconstruct identical state before and after.

/// Blob-count ceiling above which the log is compacted.
pub const DEFAULT_GC_CEILING: usize = 200;

/// Statistics for a single update log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateLogStats {
    /// Number of stored blobs
    pub count: usize,
    /// Total bytes across all blobs
    pub total_bytes: usize,
    /// Number of compactions performed
    pub compactions: u64,
}

/// Ordered sequence of update blobs.
#[derive(Debug, Default, Clone)]
pub struct UpdateLog {
    updates: Vec<Vec<u8>>,
    total_bytes: usize,
    compactions: u64,
}

impl UpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a blob. Amortized O(1).
    pub fn append(&mut self, blob: Vec<u8>) {
        self.total_bytes += blob.len();
        self.updates.push(blob);
    }

    /// Concatenation of all stored blobs in insertion order.
    ///
    /// An empty log yields an empty vector.
    pub fn encoded_state(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for blob in &self.updates {
            out.extend_from_slice(blob);
        }
        out
    }

    /// Number of stored blobs (not bytes).
    pub fn count(&self) -> usize {
        self.updates.len()
    }

    /// Total logical size in bytes.
    pub fn byte_len(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    /// Compact the log into a single merged blob when `count() > ceiling`.
    ///
    /// Returns `true` if compaction happened. `encoded_state()` is unchanged.
    pub fn gc(&mut self, ceiling: usize) -> bool {
        if self.updates.len() <= ceiling {
            return false;
        }
        let merged = self.encoded_state();
        self.updates.clear();
        self.updates.push(merged);
        self.compactions += 1;
        true
    }

    pub fn stats(&self) -> UpdateLogStats {
        UpdateLogStats {
            count: self.updates.len(),
            total_bytes: self.total_bytes,
            compactions: self.compactions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log() {
        let log = UpdateLog::new();
        assert!(log.is_empty());
        assert_eq!(log.count(), 0);
        assert!(log.encoded_state().is_empty());
    }

    #[test]
    fn test_encoded_state_is_concatenation() {
        let mut log = UpdateLog::new();
        log.append(vec![1, 2]);
        log.append(vec![]);
        log.append(vec![3]);
        log.append(vec![4, 5, 6]);

        assert_eq!(log.count(), 4);
        assert_eq!(log.byte_len(), 6);
        assert_eq!(log.encoded_state(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_gc_below_ceiling_is_noop() {
        let mut log = UpdateLog::new();
        for i in 0..10u8 {
            log.append(vec![i]);
        }
        assert!(!log.gc(10));
        assert_eq!(log.count(), 10);
        assert_eq!(log.stats().compactions, 0);
    }

    #[test]
    fn test_gc_preserves_encoded_state() {
        let mut log = UpdateLog::new();
        let mut expected = Vec::new();
        for i in 0..250u32 {
            let blob = i.to_le_bytes()[..(i as usize % 4) + 1].to_vec();
            expected.extend_from_slice(&blob);
            log.append(blob);
        }

        let before = log.encoded_state();
        assert_eq!(before, expected);

        assert!(log.gc(DEFAULT_GC_CEILING));
        assert_eq!(log.count(), 1);
        assert_eq!(log.encoded_state(), before);
        assert_eq!(log.byte_len(), expected.len());

        // Appending after compaction keeps concatenation semantics.
        log.append(vec![0xFF]);
        expected.push(0xFF);
        assert_eq!(log.encoded_state(), expected);
        assert_eq!(log.count(), 2);
    }

    #[test]
    fn test_gc_is_idempotent() {
        let mut log = UpdateLog::new();
        for i in 0..5u8 {
            log.append(vec![i, i]);
        }
        assert!(log.gc(2));
        let once = log.encoded_state();
        assert!(!log.gc(2));
        assert_eq!(log.encoded_state(), once);
        assert_eq!(log.stats().compactions, 1);
    }
}
