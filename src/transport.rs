use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use log::{debug, error, info};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};

use crate::error::Error;
use crate::frame;

/// Whether we dialed the peer or accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A control frame delivered to the server, tagged with its origin.
#[derive(Debug)]
pub struct Rpc {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
}

pub type HandshakeFn = Arc<dyn Fn(&TcpPeer) -> Result<(), Error> + Send + Sync>;
pub type OnPeerFn = Arc<dyn Fn(Arc<TcpPeer>) -> Result<(), Error> + Send + Sync>;

/// A live connection to another node.
///
/// The read half is behind a mutex shared between the transport's frame
/// decoder and the application: whoever is consuming bytes holds the
/// lock, and the begin/done latch pair sequences the hand-off around a
/// bulk stream. The write half has its own mutex so control frames and
/// bulk payloads from different tasks never interleave mid-write.
pub struct TcpPeer {
    addr: SocketAddr,
    direction: Direction,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    stream_begin: Notify,
    stream_done: Notify,
    streaming: AtomicBool,
}

impl TcpPeer {
    fn new(stream: TcpStream, direction: Direction) -> Result<Self, Error> {
        let addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(TcpPeer {
            addr,
            direction,
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            stream_begin: Notify::new(),
            stream_done: Notify::new(),
            streaming: AtomicBool::new(false),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Writes a complete buffer to the peer under the write lock.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// The read half. The application locks this for the duration of a
    /// bulk read, after the begin latch fired.
    pub fn reader(&self) -> &Mutex<OwnedReadHalf> {
        &self.reader
    }

    /// The write half, for streaming a bulk payload under one lock.
    pub fn writer(&self) -> &Mutex<OwnedWriteHalf> {
        &self.writer
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Resolves once the connection worker has consumed a stream marker
    /// and parked; the bulk bytes are next on the read half.
    pub async fn wait_stream_begin(&self) {
        self.stream_begin.notified().await;
    }

    /// Unblocks the connection worker after the bulk bytes have been
    /// read off the socket.
    pub fn close_stream(&self) {
        self.stream_done.notify_one();
    }

    fn begin_stream(&self) {
        self.streaming.store(true, Ordering::SeqCst);
        self.stream_begin.notify_one();
    }

    async fn wait_stream_done(&self) {
        self.stream_done.notified().await;
        self.streaming.store(false, Ordering::SeqCst);
    }
}

pub struct TcpTransportOpts {
    pub listen_addr: String,
    /// Runs right after `on_peer`; a failure drops the connection. No
    /// handshake by default.
    pub handshake: Option<HandshakeFn>,
    /// Invoked for every new connection before its read loop starts.
    pub on_peer: Option<OnPeerFn>,
}

/// TCP transport: owns the listener, one worker task per connection,
/// and the channel on which decoded control frames reach the server.
pub struct TcpTransport {
    opts: TcpTransportOpts,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: StdMutex<Option<mpsc::Receiver<Rpc>>>,
    stream_tx: broadcast::Sender<SocketAddr>,
    bound_addr: OnceLock<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Arc<Self> {
        let (rpc_tx, rpc_rx) = mpsc::channel(1024);
        let (stream_tx, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(TcpTransport {
            opts,
            rpc_tx,
            rpc_rx: StdMutex::new(Some(rpc_rx)),
            stream_tx,
            bound_addr: OnceLock::new(),
            shutdown_tx,
        })
    }

    /// Binds the listener and spawns the accept loop.
    pub async fn listen_and_accept(self: &Arc<Self>) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.opts.listen_addr)
            .await
            .map_err(|e| Error::Bind {
                addr: self.opts.listen_addr.clone(),
                source: e,
            })?;

        let bound = listener.local_addr()?;
        let _ = self.bound_addr.set(bound);
        info!("listening on {}", bound);

        let transport = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("accept loop shutting down");
                        return;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(
                                Arc::clone(&transport).handle_conn(stream, Direction::Inbound),
                            );
                        }
                        Err(e) => {
                            error!("accept failed: {}", e);
                            return;
                        }
                    },
                }
            }
        });

        Ok(())
    }

    /// Opens an outbound connection and starts its worker.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<(), Error> {
        let stream = TcpStream::connect(addr).await.map_err(|e| Error::Dial {
            addr: addr.to_string(),
            source: e,
        })?;

        debug!("dialed {}", addr);
        tokio::spawn(Arc::clone(self).handle_conn(stream, Direction::Outbound));
        Ok(())
    }

    /// The receive end of the control-frame channel. Single consumer:
    /// frames are FIFO per peer, unordered across peers.
    pub fn consume(&self) -> mpsc::Receiver<Rpc> {
        self.rpc_rx
            .lock()
            .unwrap()
            .take()
            .expect("consume may only be called once")
    }

    /// A fresh subscription to stream-begin events: the address of each
    /// peer whose worker just consumed a stream marker.
    pub fn subscribe_streams(&self) -> broadcast::Receiver<SocketAddr> {
        self.stream_tx.subscribe()
    }

    /// Stops accepting new connections. Existing workers drain until
    /// their sockets close.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// The address actually bound, once `listen_and_accept` returned.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.get().copied()
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, direction: Direction) {
        let peer = match TcpPeer::new(stream, direction) {
            Ok(peer) => Arc::new(peer),
            Err(e) => {
                error!("failed to wrap connection: {}", e);
                return;
            }
        };
        let addr = peer.remote_addr();
        debug!("new {:?} peer {}", direction, addr);

        if let Some(on_peer) = &self.opts.on_peer {
            if let Err(e) = on_peer(Arc::clone(&peer)) {
                error!("on_peer rejected {}: {}", addr, e);
                return;
            }
        }

        if let Some(handshake) = &self.opts.handshake {
            if let Err(e) = handshake(&peer) {
                error!("handshake with {} failed: {}", addr, e);
                return;
            }
        }

        loop {
            let decoded = {
                let mut reader = peer.reader().lock().await;
                frame::decode(&mut *reader).await
            };

            match decoded {
                Ok(None) => {
                    debug!("peer {} closed the connection", addr);
                    return;
                }
                Err(e) => {
                    error!("frame decode from {}: {}", addr, e);
                    return;
                }
                Ok(Some(frame)) if frame.stream => {
                    // Bulk bytes are next on this socket. Park the read
                    // loop until the application has drained them; the
                    // begin latch tells it the marker has been consumed.
                    debug!("({}) incoming stream, pausing read loop", addr);
                    peer.begin_stream();
                    let _ = self.stream_tx.send(addr);
                    peer.wait_stream_done().await;
                    debug!("({}) stream closed, resuming read loop", addr);
                }
                Ok(Some(frame)) => {
                    let rpc = Rpc {
                        from: addr,
                        payload: frame.payload,
                    };
                    if self.rpc_tx.send(rpc).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
