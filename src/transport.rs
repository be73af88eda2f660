//! TCP transport: one accept loop plus a background thread per outbound
//! peer link (see `orchestrator::Orchestrator` for how the mailbox ties in).
//!
//! Framing: one JSON object per line (`MAX_FRAME_BYTES` ceiling). A node
//! does not distinguish peer sockets from client sockets at this layer —
//! only by message type, once decoded.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, info, warn};

use crate::common::{PeerId, PeerInfo, MAX_FRAME_BYTES};
use crate::error::ClusterError;
use crate::orchestrator::Inbound;
use crate::wire::Message;

/// Messages a `PeerLink` background thread accepts from the orchestrator.
enum PeerLinkMessage {
    Send(Message),
    Shutdown,
}

struct PeerLinkHandle {
    to_peer: Sender<PeerLinkMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for PeerLinkHandle {
    fn drop(&mut self) {
        if let Some(t) = self.thread.take() {
            let _ = self.to_peer.send(PeerLinkMessage::Shutdown);
            let _ = t.join();
        }
    }
}

/// Accepts inbound framed streams, maintains pooled outbound links, and
/// dispatches decoded messages to a single mailbox.
pub struct Transport {
    self_id: PeerId,
    links: Arc<Mutex<HashMap<PeerId, PeerLinkHandle>>>,
    listener_thread: Option<thread::JoinHandle<()>>,
}

impl Transport {
    /// Binds `(host, port)` and starts the accept loop, dispatching every
    /// decoded message to `inbound_tx`.
    pub fn start(
        self_id: PeerId,
        host: IpAddr,
        port: u16,
        inbound_tx: Sender<Inbound>,
    ) -> Result<Self, ClusterError> {
        let listener = TcpListener::bind(SocketAddr::new(host, port))?;
        info!("node {self_id}: listening on {}", listener.local_addr()?);

        let listener_thread = thread::spawn(move || {
            for conn in listener.incoming() {
                match conn {
                    Ok(stream) => {
                        let tx = inbound_tx.clone();
                        thread::spawn(move || read_loop(stream, tx));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        });

        Ok(Transport { self_id, links: Arc::new(Mutex::new(HashMap::new())), listener_thread: Some(listener_thread) })
    }

    /// Sends `msg` to `peer`, opening (and pooling) an outbound connection
    /// lazily. Non-blocking from the caller's perspective: the actual I/O
    /// happens on the peer's dedicated background thread, so the
    /// orchestrator's mailbox loop never blocks on a slow peer.
    pub fn send_to(&self, peer: &PeerInfo, msg: Message) {
        let mut links = self.links.lock().unwrap();
        let handle = links.entry(peer.peer_id).or_insert_with(|| spawn_peer_link(*peer));
        if handle.to_peer.send(PeerLinkMessage::Send(msg)).is_err() {
            // Peer thread died (it shouldn't, but be defensive); drop and let
            // the next send respawn it.
            links.remove(&peer.peer_id);
        }
    }

    /// Sends `msg` to every peer in `peers` concurrently (each peer link is
    /// already its own thread); a failure on one peer never blocks another.
    pub fn broadcast(&self, peers: &[PeerInfo], msg: &Message) {
        for peer in peers {
            self.send_to(peer, msg.clone());
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // The accept loop thread is intentionally left to die with the
        // process (TcpListener has no clean "stop accepting" short of
        // closing the fd, which happens on process exit); peer links are
        // joined explicitly via their own Drop impl.
        let _ = self.listener_thread.take();
    }
}

fn spawn_peer_link(peer: PeerInfo) -> PeerLinkHandle {
    let (to_peer, from_orchestrator) = channel::<PeerLinkMessage>();
    let thread = thread::spawn(move || peer_link_main(peer, from_orchestrator));
    PeerLinkHandle { to_peer, thread: Some(thread) }
}

/// Background thread body for one outbound peer link: owns at most one
/// `TcpStream`, reconnecting lazily on failure. A single thread per peer
/// is what gives us "single writer per connection" for free.
fn peer_link_main(peer: PeerInfo, from_orchestrator: std::sync::mpsc::Receiver<PeerLinkMessage>) {
    let mut conn: Option<TcpStream> = None;
    loop {
        match from_orchestrator.recv() {
            Ok(PeerLinkMessage::Send(msg)) => {
                if conn.is_none() {
                    match TcpStream::connect(peer.addr()) {
                        Ok(stream) => conn = Some(stream),
                        Err(source) => {
                            warn!("{}", ClusterError::TransientTransport { peer_id: peer.peer_id, addr: peer.addr(), source });
                            continue;
                        }
                    }
                }
                if let Some(stream) = conn.as_mut() {
                    if let Err(source) = write_frame(stream, &msg) {
                        warn!("{}", ClusterError::TransientTransport { peer_id: peer.peer_id, addr: peer.addr(), source });
                        conn = None;
                    }
                }
            }
            Ok(PeerLinkMessage::Shutdown) | Err(_) => break,
        }
    }
}

fn write_frame(stream: &mut TcpStream, msg: &Message) -> std::io::Result<()> {
    let mut line = serde_json::to_string(msg).map_err(std::io::Error::other)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()
}

/// Inbound read loop for one accepted socket: accumulates bytes until a
/// newline, decodes one JSON object per line, forwards it to the mailbox.
/// Never propagates an error to its caller — malformed input just closes
/// this connection (`ProtocolViolation`); it never takes the node down.
fn read_loop(stream: TcpStream, inbound_tx: Sender<Inbound>) {
    let peer_addr = stream.peer_addr().ok();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let n = match reader.read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(n) => n,
            Err(e) => {
                debug!("connection read error: {e}");
                break;
            }
        };
        if n > MAX_FRAME_BYTES {
            warn!("{}", protocol_violation(peer_addr, format!("oversize frame ({n} bytes)")));
            break;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(trimmed) {
            Ok(msg) => {
                if inbound_tx.send(Inbound::Wire(msg)).is_err() {
                    break; // orchestrator shut down
                }
            }
            Err(e) => {
                warn!("{}", protocol_violation(peer_addr, e.to_string()));
                break;
            }
        }
    }
}

fn protocol_violation(peer_addr: Option<SocketAddr>, reason: String) -> ClusterError {
    ClusterError::ProtocolViolation { addr: peer_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0)), reason }
}
