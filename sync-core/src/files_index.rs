//! Deterministic partition of a paste's files into fixed-size chunks.
//!
//! Chunks never span files: each file is cut into `chunk_size` ranges and
//! only the last range of a file may be shorter. Chunk indices run across
//! all files in item order, so the same file list and chunk size always
//! produce the same index.

/// Fixed chunk size used on the wire (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// One file of a paste, as seen by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    /// Path relative to the paste's file root.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
}

impl IndexedFile {
    /// Create an index entry.
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// One contiguous byte range of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesChunk {
    /// Stable chunk index within the paste.
    pub index: u32,
    /// Which file (position in the index's file list) the range belongs to.
    pub file_index: usize,
    /// Byte offset within that file.
    pub offset: u64,
    /// Length of the range.
    pub len: u64,
}

/// Chunk plan for one paste.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesIndex {
    files: Vec<IndexedFile>,
    chunks: Vec<FilesChunk>,
    chunk_size: u64,
}

impl FilesIndex {
    /// Build the chunk plan. A zero chunk size is treated as one byte.
    ///
    /// An empty file still gets one zero-length chunk so it is created on
    /// the receiving side.
    pub fn build(files: Vec<IndexedFile>, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut chunks = Vec::new();

        for (file_index, file) in files.iter().enumerate() {
            if file.size == 0 {
                chunks.push(FilesChunk {
                    index: chunks.len() as u32,
                    file_index,
                    offset: 0,
                    len: 0,
                });
                continue;
            }
            let mut offset = 0;
            while offset < file.size {
                let len = chunk_size.min(file.size - offset);
                chunks.push(FilesChunk {
                    index: chunks.len() as u32,
                    file_index,
                    offset,
                    len,
                });
                offset += len;
            }
        }

        Self {
            files,
            chunks,
            chunk_size,
        }
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Look up a chunk by index.
    pub fn chunk(&self, index: usize) -> Option<&FilesChunk> {
        self.chunks.get(index)
    }

    /// All chunks in index order.
    pub fn chunks(&self) -> &[FilesChunk] {
        &self.chunks
    }

    /// The indexed files in item order.
    pub fn files(&self) -> &[IndexedFile] {
        &self.files
    }

    /// Chunk size the index was built with.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Total payload size in bytes.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}
