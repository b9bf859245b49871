use log::{debug, info};

use crate::crypto;
use crate::error::Error;
use crate::server::{FileServer, FileServerOpts};
use crate::storage::cas_path_transform;
use crate::KEY_SIZE;

/// Function handler to kickoff a storage node:
///     - Parse the shared encryption key, or generate one and log it so
///       the operator can start the rest of the cluster with it
///     - Construct the server over the given listen address and root
///     - Dial the bootstrap peers and serve until interrupted
pub async fn run(
    listen: String,
    bootstrap: Vec<String>,
    root: String,
    key: Option<String>,
) -> Result<(), Error> {
    let encrypt_key = match key {
        Some(hex_key) => parse_key(&hex_key)?,
        None => {
            let generated = crypto::new_encryption_key();
            info!(
                "generated encryption key: {} (pass it to the other nodes with --key)",
                hex::encode(generated)
            );
            generated
        }
    };

    debug!("starting node on {} with root {}", listen, root);

    let server = FileServer::new(FileServerOpts {
        encrypt_key,
        listen_addr: listen,
        storage_root: root,
        path_transform: cas_path_transform,
        bootstrap_nodes: bootstrap,
    });

    server.start().await
}

fn parse_key(hex_key: &str) -> Result<[u8; KEY_SIZE], Error> {
    let bytes =
        hex::decode(hex_key).map_err(|e| Error::Crypto(format!("invalid key hex: {}", e)))?;
    if bytes.len() != KEY_SIZE {
        return Err(Error::Crypto(format!(
            "key must be {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}
