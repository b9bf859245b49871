use std::sync::Arc;
use std::time::Duration;

use log::error;
use tokio::io::AsyncReadExt;

use crate::crypto;
use crate::error::Error;
use crate::server::{FileServer, FileServerOpts};
use crate::storage::cas_path_transform;
use crate::KEY_SIZE;

/// Brings up two nodes on localhost, the second bootstrapping off the
/// first, then stores ten keys through one node and reads each back
/// from the other.
pub async fn run() -> Result<(), Error> {
    let key = crypto::new_encryption_key();

    let node_a = make_server(&key, "127.0.0.1:3000", &[]);
    let node_b = make_server(&key, "127.0.0.1:3001", &["127.0.0.1:3000"]);

    spawn_server(&node_a, "node a");
    spawn_server(&node_b, "node b");

    // let the listeners come up and the bootstrap dial settle
    tokio::time::sleep(Duration::from_secs(1)).await;

    for i in 0..10 {
        let key_name = format!("hello{}", i);
        let payload = format!("hello world {}", i);

        node_b.store(&key_name, &mut payload.as_bytes()).await?;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let mut file = node_a.get(&key_name).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        println!("{}", contents);
    }

    node_a.stop();
    node_b.stop();
    Ok(())
}

fn make_server(key: &[u8; KEY_SIZE], listen: &str, bootstrap: &[&str]) -> Arc<FileServer> {
    Arc::new(FileServer::new(FileServerOpts {
        encrypt_key: *key,
        listen_addr: listen.to_string(),
        storage_root: format!("{}_storage", listen.replace(':', "_")),
        path_transform: cas_path_transform,
        bootstrap_nodes: bootstrap.iter().map(|s| s.to_string()).collect(),
    }))
}

fn spawn_server(server: &Arc<FileServer>, name: &'static str) {
    let server = Arc::clone(server);
    tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("{}: {}", name, e);
        }
    });
}
