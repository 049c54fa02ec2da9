//! Show the chunk plan for a set of files.

use anyhow::{Context, Result};
use std::path::PathBuf;
use sync_client::{resolve_names, PullFileItem};
use sync_core::{FilesIndex, IndexedFile};

/// Build the plan the receiving side would use for `files`.
pub async fn plan(files: &[PathBuf], chunk_size: u64) -> Result<FilesIndex> {
    let mut items = Vec::with_capacity(files.len());
    for path in files {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a file", path.display());
        }
        items.push(PullFileItem::new(path.display().to_string(), metadata.len()));
    }

    let names = resolve_names(&items);
    let indexed = names
        .into_iter()
        .zip(&items)
        .map(|(name, item)| IndexedFile::new(name, item.size))
        .collect();
    Ok(FilesIndex::build(indexed, chunk_size))
}

/// Run the chunks command.
pub async fn run(files: &[PathBuf], chunk_size: u64) -> Result<()> {
    let index = plan(files, chunk_size).await?;

    println!(
        "{} file(s), {} bytes, {} chunk(s) of up to {} bytes",
        index.files().len(),
        index.total_size(),
        index.chunk_count(),
        index.chunk_size()
    );
    println!();
    println!("{:>6}  {:<24} {:>12} {:>10}", "CHUNK", "FILE", "OFFSET", "LEN");
    for chunk in index.chunks() {
        let file = &index.files()[chunk.file_index];
        println!(
            "{:>6}  {:<24} {:>12} {:>10}",
            chunk.index, file.path, chunk.offset, chunk.len
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn plan_uses_resolved_names_and_sizes() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        let b = nested.join("a.txt");
        std::fs::write(&a, vec![0u8; 10]).unwrap();
        std::fs::write(&b, Vec::<u8>::new()).unwrap();

        let index = plan(&[a, b], 4).await.unwrap();
        assert_eq!(index.chunk_count(), 4);
        assert_eq!(index.files()[0].path, "a.txt");
        assert_eq!(index.files()[1].path, "a(1).txt");
        assert_eq!(index.chunk(2).unwrap().len, 2);
        assert_eq!(index.chunk(3).unwrap().len, 0);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let result = plan(&[dir.path().join("nope")], 4).await;
        assert!(result.is_err());
    }
}
