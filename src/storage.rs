// Byte streams the transfer sessions read files from and write uploads to.
//
// Sessions never touch the filesystem directly. They ask a Storage for a source or a sink by the
// filename found in the request, and from then on only see an AsyncRead or an AsyncWrite. This
// keeps the state machine testable against in-memory buffers.

use crate::tftp;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite};

/// Where a read request pulls its blocks from.
pub type ByteSource = Box<dyn AsyncRead + Unpin + Send>;

/// Where a write request pushes received blocks. Shutting it down closes it.
pub type ByteSink = Box<dyn AsyncWrite + Unpin + Send>;

/// Opens byte streams for the filenames named in requests.
pub trait Storage {
    fn open_read(&self, name: &str) -> impl Future<Output = io::Result<ByteSource>> + Send;

    fn open_write(&self, name: &str) -> impl Future<Output = io::Result<ByteSink>> + Send;
}

/// Serves files from a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
    overwrite: bool,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>, overwrite: bool) -> FsStorage {
        FsStorage {
            root: root.into(),
            overwrite,
        }
    }

    /// Maps a requested filename to a path below the root directory.
    ///
    /// Leading slashes are dropped so "/boot.img" and "boot.img" name the same file. Names that
    /// would climb out of the root are refused.
    pub fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("'{name}' points outside of the served directory"),
                    ))
                }
            }
        }
        Ok(self.root.join(relative))
    }
}

impl Storage for FsStorage {
    async fn open_read(&self, name: &str) -> io::Result<ByteSource> {
        let path = self.resolve(name)?;
        log::debug!("Reading from {}", path.display());
        let f = File::open(&path).await?;
        if f.metadata().await?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is a directory", path.display()),
            ));
        }
        Ok(Box::new(f))
    }

    async fn open_write(&self, name: &str) -> io::Result<ByteSink> {
        let path = self.resolve(name)?;
        log::debug!("Writing to {}", path.display());
        let mut options = OpenOptions::new();
        options.write(true);
        if self.overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        Ok(Box::new(options.open(&path).await?))
    }
}

/// Reads the next block of up to 512 bytes from the source.
///
/// A single call to read may return fewer bytes than asked for even when more are coming, so
/// this keeps reading into the rest of the buffer. The block only comes back short at EOF.
pub async fn read_block<R: AsyncRead + Unpin + ?Sized>(source: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut cursor = 0;
    while cursor < buf.len() {
        match source.read(&mut buf[cursor..]).await? {
            0 => break,
            n => cursor += n,
        }
    }
    buf.truncate(cursor);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_open_read_missing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let storage = FsStorage::new(tmpdir.path(), true);
        assert_eq!(
            storage.open_read("nope.txt").await.err().unwrap().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_open_read_directory_is_not_found() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::create_dir(tmpdir.path().join("sub")).unwrap();
        let storage = FsStorage::new(tmpdir.path(), true);
        assert_eq!(
            storage.open_read("sub").await.err().unwrap().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_open_read_strips_leading_slash() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("test.txt"), b"testing").unwrap();
        let storage = FsStorage::new(tmpdir.path(), true);

        let mut source = storage.open_read("/test.txt").await.unwrap();
        assert_eq!(read_block(&mut source).await.unwrap(), b"testing");
    }

    #[test]
    fn test_resolve_refuses_parent_components() {
        let storage = FsStorage::new("/srv/tftp", true);
        assert_eq!(
            storage.resolve("../etc/passwd").err().unwrap().kind(),
            io::ErrorKind::PermissionDenied
        );
        assert_eq!(
            storage.resolve("boot/../../etc/passwd").err().unwrap().kind(),
            io::ErrorKind::PermissionDenied
        );
        assert_eq!(storage.resolve("boot/./x.img").unwrap(), PathBuf::from("/srv/tftp/boot/./x.img"));
        assert_eq!(storage.resolve("//x.img").unwrap(), PathBuf::from("/srv/tftp/x.img"));
    }

    #[tokio::test]
    async fn test_open_write_without_overwrite() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("taken.txt"), b"old").unwrap();
        let storage = FsStorage::new(tmpdir.path(), false);

        assert_eq!(
            storage.open_write("taken.txt").await.err().unwrap().kind(),
            io::ErrorKind::AlreadyExists
        );
        assert!(storage.open_write("fresh.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_open_write_overwrite_truncates() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("taken.txt");
        std::fs::write(&path, b"a much longer old body").unwrap();
        let storage = FsStorage::new(tmpdir.path(), true);

        let mut sink = storage.open_write("taken.txt").await.unwrap();
        sink.write_all(b"new").await.unwrap();
        sink.shutdown().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_open_write_missing_directory() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let storage = FsStorage::new(tmpdir.path(), true);
        assert_eq!(
            storage.open_write("no/such/dir.txt").await.err().unwrap().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_read_block_fills_across_short_reads() {
        let mut source = tokio_test::io::Builder::new()
            .read(&[0x78; 100])
            .read(&[0x78; 500])
            .read(b"tail")
            .build();

        let first = read_block(&mut source).await.unwrap();
        assert_eq!(first, vec![0x78; 512]);

        let second = read_block(&mut source).await.unwrap();
        let mut expected = vec![0x78; 88];
        expected.extend_from_slice(b"tail");
        assert_eq!(second, expected);

        assert!(read_block(&mut source).await.unwrap().is_empty());
    }
}
