use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tokio::fs::{self, File};
use tokio::io::AsyncRead;

use crate::crypto;
use crate::error::Error;
use crate::{DEFAULT_ROOT, KEY_SIZE};

/// Where a key lives on disk, split into the sharded directory chain and
/// the final file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub path_name: String,
    pub filename: String,
}

impl PathKey {
    /// The path of the file relative to the store's namespace root.
    pub fn full_path(&self) -> PathBuf {
        Path::new(&self.path_name).join(&self.filename)
    }

    /// The top-level shard directory, which `delete` removes as a whole.
    pub fn first_path_name(&self) -> &str {
        self.path_name.split('/').next().unwrap_or("")
    }
}

pub type PathTransformFn = fn(&str) -> PathKey;

/// Derives a directory-sharded path from a key: the hex SHA-1 digest is
/// split into eight five-character segments forming the directory chain,
/// and the full digest is the file name. Identical keys always map to
/// the identical path.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));

    let block_size = 5;
    let segments: Vec<&str> = (0..digest.len() / block_size)
        .map(|i| &digest[i * block_size..(i + 1) * block_size])
        .collect();

    PathKey {
        path_name: segments.join("/"),
        filename: digest,
    }
}

/// Uses the key verbatim as both directory and file name.
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        path_name: key.to_string(),
        filename: key.to_string(),
    }
}

pub struct StoreOpts {
    /// Folder containing every node's files.
    pub root: String,
    /// Namespace for this node, so several nodes can share one root.
    pub id: String,
    pub path_transform: PathTransformFn,
}

impl Default for StoreOpts {
    fn default() -> Self {
        StoreOpts {
            root: DEFAULT_ROOT.to_string(),
            id: crypto::generate_id(),
            path_transform: default_path_transform,
        }
    }
}

/// Local keyed blob store. Files are immutable once written; writing the
/// same key again truncates and replaces.
pub struct Store {
    opts: StoreOpts,
}

impl Store {
    pub fn new(opts: StoreOpts) -> Self {
        Store { opts }
    }

    pub fn id(&self) -> &str {
        &self.opts.id
    }

    fn full_path(&self, key: &str) -> PathBuf {
        let path_key = (self.opts.path_transform)(key);
        Path::new(&self.opts.root)
            .join(&self.opts.id)
            .join(path_key.full_path())
    }

    async fn open_for_writing(&self, key: &str) -> Result<File, Error> {
        let path_key = (self.opts.path_transform)(key);
        let dir = Path::new(&self.opts.root)
            .join(&self.opts.id)
            .join(&path_key.path_name);
        fs::create_dir_all(&dir).await?;

        let file = File::create(dir.join(&path_key.filename)).await?;
        Ok(file)
    }

    /// Streams `reader` into the file for `key`, creating any missing
    /// shard directories. Returns the number of bytes written.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> Result<i64, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self.open_for_writing(key).await?;
        let n = tokio::io::copy(reader, &mut file).await?;
        Ok(n as i64)
    }

    /// Like `write`, but pipes `reader` through the stream decryptor
    /// first. Returns the plaintext byte count.
    pub async fn write_decrypted<R>(
        &self,
        enc_key: &[u8; KEY_SIZE],
        key: &str,
        reader: &mut R,
    ) -> Result<i64, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self.open_for_writing(key).await?;
        crypto::copy_decrypt(reader, &mut file, enc_key).await
    }

    /// Opens the file for `key`; the caller owns the returned handle.
    pub async fn read(&self, key: &str) -> Result<File, Error> {
        match File::open(self.full_path(key)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match fs::metadata(self.full_path(key)).await {
            Ok(meta) => meta.is_file(),
            Err(_) => false,
        }
    }

    pub async fn size(&self, key: &str) -> Result<i64, Error> {
        match fs::metadata(self.full_path(key)).await {
            Ok(meta) => Ok(meta.len() as i64),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Removes the whole top-level shard directory for `key`. Deleting a
    /// key that is already gone is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        let path_key = (self.opts.path_transform)(key);
        let shard = Path::new(&self.opts.root)
            .join(&self.opts.id)
            .join(path_key.first_path_name());

        match fs::remove_dir_all(shard).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Removes the store root, every node namespace included.
    pub async fn clear(&self) -> Result<(), Error> {
        match fs::remove_dir_all(&self.opts.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
