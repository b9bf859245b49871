use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use log::{debug, error, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use crate::crypto::{self, hash_key};
use crate::error::Error;
use crate::frame::{self, STREAM_FRAME};
use crate::message::Message;
use crate::storage::{PathTransformFn, Store, StoreOpts};
use crate::transport::{TcpPeer, TcpTransport, TcpTransportOpts};
use crate::{IV_SIZE, KEY_SIZE, REPLY_TIMEOUT, STREAM_WAIT_TIMEOUT};

type PeerMap = Arc<RwLock<HashMap<SocketAddr, Arc<TcpPeer>>>>;

pub struct FileServerOpts {
    /// AES-256 key shared out-of-band by every interoperating node.
    pub encrypt_key: [u8; KEY_SIZE],
    pub listen_addr: String,
    pub storage_root: String,
    pub path_transform: PathTransformFn,
    /// Peer addresses dialed at startup. Empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
}

/// A node in the cluster: local store plus the request/response
/// protocol over every connected peer. Keys are hashed once on entry,
/// so the cleartext key never reaches the wire or the disk.
pub struct FileServer {
    encrypt_key: [u8; KEY_SIZE],
    bootstrap_nodes: Vec<String>,
    store: Store,
    transport: Arc<TcpTransport>,
    peers: PeerMap,
    quit_tx: watch::Sender<bool>,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Self {
        let peers: PeerMap = Arc::new(RwLock::new(HashMap::new()));

        // Registry insertion happens on the connection worker before its
        // read loop starts; the map lock is never held across awaits.
        let on_peer = {
            let peers = Arc::clone(&peers);
            Arc::new(move |peer: Arc<TcpPeer>| -> Result<(), Error> {
                let addr = peer.remote_addr();
                peers.write().unwrap().insert(addr, peer);
                info!("peer connected: {}", addr);
                Ok(())
            }) as crate::transport::OnPeerFn
        };

        let transport = TcpTransport::new(TcpTransportOpts {
            listen_addr: opts.listen_addr,
            handshake: None,
            on_peer: Some(on_peer),
        });

        let store = Store::new(StoreOpts {
            root: opts.storage_root,
            id: crypto::generate_id(),
            path_transform: opts.path_transform,
        });

        let (quit_tx, _) = watch::channel(false);

        FileServer {
            encrypt_key: opts.encrypt_key,
            bootstrap_nodes: opts.bootstrap_nodes,
            store,
            transport,
            peers,
            quit_tx,
        }
    }

    /// Starts listening, dials the bootstrap nodes, and runs the
    /// dispatch loop until `stop` is called.
    pub async fn start(&self) -> Result<(), Error> {
        self.transport.listen_and_accept().await?;
        self.bootstrap();
        self.dispatch().await;
        Ok(())
    }

    /// Signals the dispatch loop to close the transport and return.
    pub fn stop(&self) {
        let _ = self.quit_tx.send(true);
    }

    /// The address the transport actually bound.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.transport.listen_addr()
    }

    /// Whether `key` is present in this node's local store.
    pub async fn exists(&self, key: &str) -> bool {
        self.store.exists(&hash_key(key)).await
    }

    /// Writes `reader` under `key` locally, then replicates it to every
    /// connected peer: a `StoreFile` announcement followed by the
    /// encrypted payload on each connection.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        let hashed = hash_key(key);

        // Buffered once: written to the local store and then streamed to
        // every peer.
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        let n = self.store.write(&hashed, &mut &buf[..]).await?;

        self.broadcast(&Message::StoreFile {
            key: hashed,
            size: n,
        })
        .await?;

        // Encrypt once so every peer receives identical bytes, marker
        // first. The announcement above is already on each socket, so
        // FIFO ordering per peer holds.
        let mut wire = vec![STREAM_FRAME];
        crypto::copy_encrypt(&mut &buf[..], &mut wire, &self.encrypt_key).await?;

        let peers = self.connected_peers();
        for peer in &peers {
            peer.send(&wire).await?;
        }

        debug!(
            "stored {} ({} bytes), streamed to {} peers",
            key,
            n,
            peers.len()
        );
        Ok(())
    }

    /// Returns a reader over the file for `key`, fetching it from the
    /// first responding peer when it is not held locally.
    pub async fn get(&self, key: &str) -> Result<File, Error> {
        let hashed = hash_key(key);

        if self.store.exists(&hashed).await {
            debug!("serving {} from local store", key);
            return self.store.read(&hashed).await;
        }

        info!("{} not found locally, asking peers", key);

        // Subscribe before broadcasting so the first reply cannot slip
        // past; first responder wins.
        let mut replies = self.transport.subscribe_streams();
        self.broadcast(&Message::GetFile {
            key: hashed.clone(),
        })
        .await?;

        let from = match timeout(REPLY_TIMEOUT, Self::next_reply(&mut replies)).await {
            Ok(Some(addr)) => addr,
            _ => return Err(Error::NotFound(key.to_string())),
        };

        let peer = self.peer_at(from)?;

        // Consume the begin latch so a later inbound handler on this
        // peer cannot mistake it for its own stream.
        Self::await_stream_begin(&peer, from).await?;
        {
            let mut reader = peer.reader().lock().await;
            let size = reader.read_i64_le().await?;
            let mut limited = (&mut *reader).take(IV_SIZE as u64 + size as u64);
            let n = self
                .store
                .write_decrypted(&self.encrypt_key, &hashed, &mut limited)
                .await?;
            debug!("received {} bytes for {} from {}", n, key, from);
        }
        peer.close_stream();

        // Any late responder gets its reply drained so its read loop is
        // not left parked on the latch.
        while let Ok(addr) = replies.try_recv() {
            if let Ok(peer) = self.peer_at(addr) {
                if let Err(e) = Self::discard_reply(&peer).await {
                    warn!("draining late reply from {}: {}", addr, e);
                }
            }
        }

        self.store.read(&hashed).await
    }

    /// Waits until `peer`'s worker has consumed a stream marker and
    /// parked, leaving the bulk bytes next on the read half.
    async fn await_stream_begin(peer: &TcpPeer, from: SocketAddr) -> Result<(), Error> {
        timeout(STREAM_WAIT_TIMEOUT, peer.wait_stream_begin())
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("peer {} announced a stream but never started it", from),
                ))
            })
    }

    async fn next_reply(replies: &mut broadcast::Receiver<SocketAddr>) -> Option<SocketAddr> {
        loop {
            match replies.recv().await {
                Ok(addr) => return Some(addr),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn discard_reply(peer: &TcpPeer) -> Result<(), Error> {
        Self::await_stream_begin(peer, peer.remote_addr()).await?;
        {
            let mut reader = peer.reader().lock().await;
            let size = reader.read_i64_le().await?;
            let mut limited = (&mut *reader).take(IV_SIZE as u64 + size as u64);
            tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        }
        peer.close_stream();
        Ok(())
    }

    /// Serializes `msg` into one control frame and writes it to every
    /// connected peer. A failed send aborts this broadcast.
    async fn broadcast(&self, msg: &Message) -> Result<(), Error> {
        let payload = msg.encode()?;
        let wire = frame::encode_message(&payload)?;

        for peer in self.connected_peers() {
            peer.send(&wire).await?;
        }
        Ok(())
    }

    fn connected_peers(&self) -> Vec<Arc<TcpPeer>> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    fn peer_at(&self, addr: SocketAddr) -> Result<Arc<TcpPeer>, Error> {
        self.peers
            .read()
            .unwrap()
            .get(&addr)
            .cloned()
            .ok_or(Error::PeerGone(addr))
    }

    fn bootstrap(&self) {
        for addr in &self.bootstrap_nodes {
            if addr.is_empty() {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let addr = addr.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.dial(&addr).await {
                    error!("{}", e);
                }
            });
        }
    }

    /// Waits for either the quit signal or the next inbound control
    /// frame. Decode failures drop the frame; handler failures are
    /// logged and survived.
    async fn dispatch(&self) {
        let mut rpc_rx = self.transport.consume();
        let mut quit_rx = self.quit_tx.subscribe();

        // stop() may have fired before this subscription existed
        if *quit_rx.borrow() {
            self.transport.close();
            return;
        }

        loop {
            tokio::select! {
                _ = quit_rx.changed() => {
                    info!("file server stopping");
                    self.transport.close();
                    return;
                }
                maybe_rpc = rpc_rx.recv() => {
                    let Some(rpc) = maybe_rpc else { return };
                    let msg = match Message::decode(&rpc.payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("dropping frame from {}: {}", rpc.from, e);
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_message(rpc.from, msg).await {
                        error!("handling message from {}: {}", rpc.from, e);
                    }
                }
            }
        }
    }

    async fn handle_message(&self, from: SocketAddr, msg: Message) -> Result<(), Error> {
        match msg {
            Message::StoreFile { key, size } => self.handle_store_file(from, key, size).await,
            Message::GetFile { key } => self.handle_get_file(from, key).await,
        }
    }

    /// A peer announced an incoming file: consume exactly the encrypted
    /// payload from its connection and persist the plaintext.
    async fn handle_store_file(
        &self,
        from: SocketAddr,
        key: String,
        size: i64,
    ) -> Result<(), Error> {
        let peer = self.peer_at(from)?;

        // The worker owns the marker byte; wait until it has parked
        // before touching the read half.
        Self::await_stream_begin(&peer, from).await?;

        let n = {
            let mut reader = peer.reader().lock().await;
            let mut limited = (&mut *reader).take(IV_SIZE as u64 + size as u64);
            self.store
                .write_decrypted(&self.encrypt_key, &key, &mut limited)
                .await?
        };
        peer.close_stream();

        info!("stored {} ({} bytes) from {}", key, n, from);
        Ok(())
    }

    /// A peer asked for a file: reply on its connection with a stream
    /// marker, the plaintext size, and the encrypted bytes.
    async fn handle_get_file(&self, from: SocketAddr, key: String) -> Result<(), Error> {
        if !self.store.exists(&key).await {
            return Err(Error::NotFound(key));
        }

        let size = self.store.size(&key).await?;
        let mut file = self.store.read(&key).await?;
        let peer = self.peer_at(from)?;

        // One write lock for the whole reply so nothing interleaves
        // between marker, length, and payload.
        let n = {
            let mut writer = peer.writer().lock().await;
            writer.write_u8(STREAM_FRAME).await?;
            writer.write_i64_le(size).await?;
            let n = crypto::copy_encrypt(&mut file, &mut *writer, &self.encrypt_key).await?;
            writer.flush().await?;
            n
        };

        info!("served {} ({} bytes) to {}", key, n, from);
        Ok(())
    }
}
