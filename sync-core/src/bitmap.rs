//! Chunk completion bitmap.
//!
//! The bitmap is the only resumability state of a chunked pull: a retry
//! requests exactly the chunks still marked pending.

/// One entry per chunk: done or pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    bits: Vec<bool>,
    completed: usize,
}

impl ChunkBitmap {
    /// All chunks pending.
    pub fn new(chunk_count: usize) -> Self {
        Self {
            bits: vec![false; chunk_count],
            completed: 0,
        }
    }

    /// Restore from the persisted `0`/`1` form. Any non-zero byte counts as done.
    pub fn from_persisted(bytes: &[u8]) -> Self {
        let bits: Vec<bool> = bytes.iter().map(|b| *b != 0).collect();
        let completed = bits.iter().filter(|b| **b).count();
        Self { bits, completed }
    }

    /// The persisted `0`/`1` form.
    pub fn to_persisted(&self) -> Vec<u8> {
        self.bits.iter().map(|b| u8::from(*b)).collect()
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True when there are no chunks at all.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Mark a chunk done.
    ///
    /// Returns `false` (and changes nothing) when the index is out of range
    /// or the chunk was already done.
    pub fn mark_done(&mut self, index: usize) -> bool {
        match self.bits.get_mut(index) {
            Some(bit) if !*bit => {
                *bit = true;
                self.completed += 1;
                true
            }
            _ => false,
        }
    }

    /// Whether a chunk is done.
    pub fn is_done(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Indices still pending, ascending.
    pub fn pending(&self) -> Vec<usize> {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of chunks done.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Whether every chunk is done.
    pub fn is_complete(&self) -> bool {
        self.completed == self.bits.len()
    }

    /// Done chunks over total chunks. An empty bitmap counts as complete.
    pub fn progress(&self) -> f64 {
        if self.bits.is_empty() {
            return 1.0;
        }
        self.completed as f64 / self.bits.len() as f64
    }
}
