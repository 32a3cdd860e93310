#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-opener-file** – Local filesystem driver for the object opener.
//!
//! Objects are plain files addressed by absolute path. Attribute updates and
//! signed URLs are remote-provider concepts and are reported as unsupported.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};

use bosun_opener_core::{
    AttrUpdate, ByteReader, ObjectAttrs, ObjectInfo, ObjectIterator, ObjectPath, ObjectStorage,
    ObjectWriter, OpenerError, Provider, SignedUrlOptions, WriteOptions,
};

/// Default writer buffer when the caller gives no hint.
const DEFAULT_BUFFER: usize = 64 * 1024;

/// Local filesystem implementation of [`ObjectStorage`].
#[derive(Debug, Clone, Default)]
pub struct FileStorage;

impl FileStorage {
    /// Create the driver.
    pub fn new() -> Self {
        Self
    }
}

fn classify_io(path: &ObjectPath, err: std::io::Error) -> OpenerError {
    match err.kind() {
        ErrorKind::NotFound => OpenerError::NotExist(path.to_string()),
        ErrorKind::AlreadyExists => OpenerError::PreconditionFailed(path.to_string()),
        _ => OpenerError::Io {
            path: path.to_string(),
            source: err,
        },
    }
}

#[async_trait]
impl ObjectStorage for FileStorage {
    async fn reader(&self, path: &ObjectPath) -> Result<ByteReader> {
        let file = File::open(&path.path)
            .await
            .map_err(|err| classify_io(path, err))?;
        Ok(Box::new(file))
    }

    async fn range_reader(
        &self,
        path: &ObjectPath,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader> {
        let mut file = File::open(&path.path)
            .await
            .map_err(|err| classify_io(path, err))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|err| classify_io(path, err))?;
        match length {
            Some(length) => Ok(Box::new(file.take(length))),
            None => Ok(Box::new(file)),
        }
    }

    async fn writer(
        &self,
        path: &ObjectPath,
        opts: &WriteOptions,
    ) -> Result<Box<dyn ObjectWriter>> {
        if let Some(parent) = Path::new(&path.path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| classify_io(path, err))?;
        }
        let mut options = OpenOptions::new();
        options.write(true);
        if opts.must_not_exist {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        let file = options
            .open(&path.path)
            .await
            .map_err(|err| classify_io(path, err))?;
        let capacity = opts.buffer_size.unwrap_or(DEFAULT_BUFFER);
        Ok(Box::new(FileWriter {
            buf: BufWriter::with_capacity(capacity, file),
        }))
    }

    async fn attributes(&self, path: &ObjectPath) -> Result<ObjectAttrs> {
        let meta = tokio::fs::metadata(&path.path)
            .await
            .map_err(|err| classify_io(path, err))?;
        Ok(ObjectAttrs {
            size: meta.len(),
            updated: meta.modified().ok().map(DateTime::<Utc>::from),
            ..ObjectAttrs::default()
        })
    }

    async fn update_attributes(
        &self,
        _path: &ObjectPath,
        _update: AttrUpdate,
    ) -> Result<ObjectAttrs> {
        Err(OpenerError::Unsupported {
            provider: Provider::File,
            operation: "attribute updates",
        }
        .into())
    }

    async fn signed_url(&self, _path: &ObjectPath, _opts: &SignedUrlOptions) -> Result<String> {
        Err(OpenerError::Unsupported {
            provider: Provider::File,
            operation: "signed URLs",
        }
        .into())
    }

    async fn iterator(
        &self,
        prefix: &ObjectPath,
        delimiter: &str,
    ) -> Result<Box<dyn ObjectIterator>> {
        let root = PathBuf::from(&prefix.path);
        let entries = if delimiter.is_empty() {
            walk_subtree(prefix, &root).await?
        } else {
            list_one_level(prefix, &root).await?
        };
        Ok(Box::new(BufferedIterator { entries }))
    }
}

/// Buffering writer committed on close.
struct FileWriter {
    buf: BufWriter<File>,
}

#[async_trait]
impl ObjectWriter for FileWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.write_all(chunk).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        this.buf.flush().await?;
        this.buf.into_inner().sync_all().await?;
        Ok(())
    }
}

struct BufferedIterator {
    entries: VecDeque<ObjectInfo>,
}

#[async_trait]
impl ObjectIterator for BufferedIterator {
    async fn next(&mut self) -> Option<Result<ObjectInfo>> {
        self.entries.pop_front().map(Ok)
    }
}

async fn list_one_level(prefix: &ObjectPath, root: &Path) -> Result<VecDeque<ObjectInfo>> {
    let mut dir = tokio::fs::read_dir(root)
        .await
        .map_err(|err| classify_io(prefix, err))?;
    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await.map_err(|err| classify_io(prefix, err))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = entry.metadata().await.map_err(|err| classify_io(prefix, err))?;
        entries.push(ObjectInfo {
            full_name: root.join(&name).to_string_lossy().into_owned(),
            leaf_name: name,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            updated: meta.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    entries.sort_by(|a, b| a.leaf_name.cmp(&b.leaf_name));
    Ok(entries.into())
}

async fn walk_subtree(prefix: &ObjectPath, root: &Path) -> Result<VecDeque<ObjectInfo>> {
    let mut pending = VecDeque::from([root.to_path_buf()]);
    let mut files = Vec::new();
    while let Some(dir_path) = pending.pop_front() {
        let mut dir = tokio::fs::read_dir(&dir_path)
            .await
            .map_err(|err| classify_io(prefix, err))?;
        while let Some(entry) = dir.next_entry().await.map_err(|err| classify_io(prefix, err))? {
            let meta = entry.metadata().await.map_err(|err| classify_io(prefix, err))?;
            if meta.is_dir() {
                pending.push_back(entry.path());
            } else {
                files.push(ObjectInfo {
                    full_name: entry.path().to_string_lossy().into_owned(),
                    leaf_name: entry.file_name().to_string_lossy().into_owned(),
                    is_dir: false,
                    size: meta.len(),
                    updated: meta.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }
    }
    files.sort_by(|a, b| a.full_name.cmp(&b.full_name));
    Ok(files.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use bosun_opener_core::is_not_exist;
    use tokio::io::AsyncReadExt;

    fn object(path: &Path) -> ObjectPath {
        ObjectPath::parse(path.to_str().unwrap()).unwrap()
    }

    async fn read_all(mut reader: ByteReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    async fn write_object(storage: &FileStorage, path: &ObjectPath, bytes: &[u8], opts: &WriteOptions) -> Result<()> {
        let mut writer = storage.writer(path, opts).await?;
        writer.write(bytes).await?;
        writer.close().await
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new();
        let path = object(&dir.path().join("nested/dir/artifact.txt"));

        write_object(&storage, &path, b"contents", &WriteOptions::default())
            .await
            .unwrap();
        let got = read_all(storage.reader(&path).await.unwrap()).await;
        assert_eq!(got, b"contents");

        let attrs = storage.attributes(&path).await.unwrap();
        assert_eq!(attrs.size, 8);
    }

    #[tokio::test]
    async fn missing_object_is_not_exist_even_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new();
        let path = object(&dir.path().join("missing"));

        let err = storage
            .reader(&path)
            .await
            .map(|_| ())
            .context("opening build log")
            .unwrap_err();
        assert!(is_not_exist(&err));

        let err = storage.attributes(&path).await.unwrap_err();
        assert!(is_not_exist(&err));
    }

    #[tokio::test]
    async fn must_not_exist_guards_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new();
        let path = object(&dir.path().join("once"));
        let opts = WriteOptions {
            must_not_exist: true,
            ..WriteOptions::default()
        };

        write_object(&storage, &path, b"first", &opts).await.unwrap();
        let err = write_object(&storage, &path, b"second", &opts)
            .await
            .unwrap_err();
        let opener = err.downcast_ref::<OpenerError>().unwrap();
        assert!(matches!(opener, OpenerError::PreconditionFailed(_)));

        // The original object is untouched.
        let got = read_all(storage.reader(&path).await.unwrap()).await;
        assert_eq!(got, b"first");
    }

    #[tokio::test]
    async fn range_reader_honors_offset_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new();
        let path = object(&dir.path().join("ranged"));
        write_object(&storage, &path, b"0123456789", &WriteOptions::default())
            .await
            .unwrap();

        let got = read_all(storage.range_reader(&path, 2, Some(4)).await.unwrap()).await;
        assert_eq!(got, b"2345");
        let got = read_all(storage.range_reader(&path, 7, None).await.unwrap()).await;
        assert_eq!(got, b"789");
    }

    #[tokio::test]
    async fn iterator_lists_one_level_or_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new();
        for rel in ["a.txt", "sub/b.txt", "sub/deeper/c.txt"] {
            let path = object(&dir.path().join(rel));
            write_object(&storage, &path, b"x", &WriteOptions::default())
                .await
                .unwrap();
        }

        let root = object(dir.path());
        let mut one_level = Vec::new();
        let mut iter = storage.iterator(&root, "/").await.unwrap();
        while let Some(entry) = iter.next().await {
            one_level.push(entry.unwrap());
        }
        assert_eq!(one_level.len(), 2);
        assert_eq!(one_level[0].leaf_name, "a.txt");
        assert!(!one_level[0].is_dir);
        assert_eq!(one_level[1].leaf_name, "sub");
        assert!(one_level[1].is_dir);

        let mut subtree = Vec::new();
        let mut iter = storage.iterator(&root, "").await.unwrap();
        while let Some(entry) = iter.next().await {
            subtree.push(entry.unwrap().leaf_name);
        }
        assert_eq!(subtree.len(), 3);
        assert!(subtree.contains(&"c.txt".to_owned()));
    }

    #[tokio::test]
    async fn iterator_on_missing_prefix_is_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new();
        let root = object(&dir.path().join("nope"));
        let err = storage.iterator(&root, "/").await.map(|_| ()).unwrap_err();
        assert!(is_not_exist(&err));
    }

    #[tokio::test]
    async fn unsupported_operations_say_so() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new();
        let path = object(&dir.path().join("x"));
        let err = storage
            .signed_url(&path, &SignedUrlOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OpenerError>(),
            Some(OpenerError::Unsupported { .. })
        ));
    }
}
