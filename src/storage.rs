// Sequential block storage used by transfer sessions.
//
// A session only ever needs "give me the next block" while sending and "store this block" while
// receiving, so these types expose exactly that. Each one owns its file handle for the lifetime of
// a single transfer.

use crate::tftp::DATA_BUFFER_SIZE;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// Reads a file one TFTP block at a time.
#[derive(Debug)]
pub struct BlockReader {
    f: File,
    bytes_read: u64,
}

impl BlockReader {
    pub async fn open(path: &Path) -> Result<BlockReader, io::Error> {
        let f = File::open(path).await?;
        if f.metadata().await?.is_dir() {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "path names a directory"));
        }
        Ok(BlockReader { f, bytes_read: 0 })
    }

    /// Returns the next block of the file. A block shorter than `DATA_BUFFER_SIZE` (possibly empty)
    /// means the end of the file was reached.
    pub async fn read_next_block(&mut self) -> Result<Vec<u8>, io::Error> {
        let mut buf = vec![0_u8; DATA_BUFFER_SIZE];
        let mut cursor = 0;

        // A single read is not guaranteed to fill the buffer, so keep reading into the unfilled
        // tail until it is full or the file is exhausted.
        loop {
            let s = self.f.read(&mut buf[cursor..]).await?;
            cursor += s;
            if cursor == buf.len() || s == 0 {
                buf.truncate(cursor);
                self.bytes_read += cursor as u64;
                return Ok(buf);
            }
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Writes a file one TFTP block at a time.
#[derive(Debug)]
pub struct BlockWriter {
    f: File,
    bytes_written: u64,
}

impl BlockWriter {
    /// Opens `path` for writing. Without `overwrite` an existing file is an error, which is what
    /// the server wants for uploads.
    pub async fn create(path: &Path, overwrite: bool) -> Result<BlockWriter, io::Error> {
        log::info!("Writing to {}", path.display());
        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let f = options.open(path).await?;
        Ok(BlockWriter { f, bytes_written: 0 })
    }

    /// Appends one block and reports whether more blocks are expected after it.
    pub async fn write_next_block(&mut self, buf: &[u8]) -> Result<bool, io::Error> {
        self.f.write_all(buf).await?;
        self.bytes_written += buf.len() as u64;

        if buf.len() < DATA_BUFFER_SIZE {
            self.f.flush().await?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_open_missing_file() {
        let err = assert_err!(BlockReader::open(Path::new("/some/invalid/file.txt")).await);
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_open_directory_is_refused() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let err = assert_err!(BlockReader::open(tmpdir.path()).await);
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_reads_blocks_in_order() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        let mut contents = vec![0x78; 1024];
        contents.extend_from_slice(b"testing");
        tokio::fs::write(&path, &contents).await.unwrap();

        let mut reader = assert_ok!(BlockReader::open(&path).await);
        assert_eq!(assert_ok!(reader.read_next_block().await), vec![0x78; 512]);
        assert_eq!(assert_ok!(reader.read_next_block().await), vec![0x78; 512]);
        assert_eq!(assert_ok!(reader.read_next_block().await), b"testing".to_vec());
        assert_eq!(reader.bytes_read(), 1031);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_block() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        tokio::fs::write(&path, vec![0x01; 512]).await.unwrap();

        let mut reader = assert_ok!(BlockReader::open(&path).await);
        assert_eq!(assert_ok!(reader.read_next_block().await).len(), 512);
        assert!(assert_ok!(reader.read_next_block().await).is_empty());
    }

    #[tokio::test]
    async fn test_create_refuses_existing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        tokio::fs::write(&path, b"old").await.unwrap();

        let err = assert_err!(BlockWriter::create(&path, false).await);
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_ok!(BlockWriter::create(&path, true).await);
    }

    #[tokio::test]
    async fn test_writes_blocks_until_short_one() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");

        let mut writer = assert_ok!(BlockWriter::create(&path, false).await);
        assert!(assert_ok!(writer.write_next_block(&[0x61; 512]).await));
        assert!(!assert_ok!(writer.write_next_block(b"tail").await));
        assert_eq!(writer.bytes_written(), 516);

        let stored = tokio::fs::read(&path).await.unwrap();
        assert_eq!(stored.len(), 516);
        assert_eq!(&stored[512..], b"tail");
    }
}
