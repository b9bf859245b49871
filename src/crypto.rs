use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use md5::{Digest, Md5};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::{IV_SIZE, KEY_SIZE, STREAM_BUF_SIZE};

/// AES-256 in counter mode with a big-endian block counter, keyed per
/// node and re-seeded with a fresh IV per transfer.
type Aes256Ctr = Ctr128BE<Aes256>;

/// Generates the random identifier that namespaces a node's on-disk
/// storage, hex-encoded so it is safe as a directory name.
pub fn generate_id() -> String {
    let mut id = [0u8; crate::ID_SIZE];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

/// Generates a fresh 32-byte AES-256 key for a node. Peers that must
/// exchange files need to share this key out-of-band.
pub fn new_encryption_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Hashes a user-chosen key into the identifier used on the wire and on
/// disk. The cleartext key never leaves the node that received it.
pub fn hash_key(key: &str) -> String {
    let digest = Md5::digest(key.as_bytes());
    hex::encode(digest)
}

/// Encrypt `src` into `dst` as a stream: a fresh random 16-byte IV is
/// written first, then the plaintext XORed through the keystream in
/// buffered chunks.
///
/// # Returns
/// Total bytes written to `dst`, IV included.
pub async fn copy_encrypt<R, W>(src: &mut R, dst: &mut W, key: &[u8; KEY_SIZE]) -> Result<i64, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    // prepend the iv to the encrypted data
    dst.write_all(&iv).await?;

    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    let n = copy_stream(&mut cipher, src, dst).await?;
    Ok(n + IV_SIZE as i64)
}

/// Decrypt `src` into `dst`: reads exactly the 16-byte IV the encrypting
/// side prepended, then streams the remainder through the keystream.
///
/// # Returns
/// Total plaintext bytes written to `dst`.
pub async fn copy_decrypt<R, W>(src: &mut R, dst: &mut W, key: &[u8; KEY_SIZE]) -> Result<i64, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_SIZE];
    src.read_exact(&mut iv).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Crypto("short read on iv".to_string())
        } else {
            Error::Io(e)
        }
    })?;

    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    copy_stream(&mut cipher, src, dst).await
}

/// Pump `src` through the keystream into `dst` with a single reusable
/// buffer. CTR mode means the same routine serves both directions.
async fn copy_stream<R, W>(cipher: &mut Aes256Ctr, src: &mut R, dst: &mut W) -> Result<i64, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STREAM_BUF_SIZE];
    let mut written: i64 = 0;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as i64;
    }

    Ok(written)
}
