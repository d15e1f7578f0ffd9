// Inbound listener
//
// Accepts connections from the previous hop (or a sender) and feeds every
// well-sized frame into the pipeline. Nothing is ever written back on an
// inbound connection, so a sender cannot tell a forwarded packet from a
// dropped one.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::framing::{read_frame, FrameRead};
use super::TransportError;
use crate::metrics::DropReason;
use crate::packet::Packet;
use crate::pipeline::Pipeline;

/// Cloneable stop switch shared by the listener and its connections.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also counts as shutdown
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Accept until `shutdown` fires.
pub async fn serve(listener: TcpListener, pipeline: Arc<Pipeline>, shutdown: ShutdownSignal) -> Result<(), TransportError> {
    let local = listener.local_addr()?;
    info!("Mixnode listening on {}", local);
    let mut stop = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = stopped(&mut stop) => {
                info!("Listener on {} shutting down", local);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(handle_connection(stream, peer, Arc::clone(&pipeline), shutdown.subscribe()));
                }
                Err(e) => warn!("Accept failed on {}: {}", local, e),
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
    mut stop: watch::Receiver<bool>,
) {
    let metrics = Arc::clone(pipeline.node().metrics());
    metrics.connection_opened();
    debug!("Connection from {}", peer);

    loop {
        let frame = tokio::select! {
            _ = stopped(&mut stop) => break,
            frame = read_frame(&mut stream, pipeline.pool()) => frame,
        };
        match frame {
            Ok(FrameRead::Packet(buf)) => {
                metrics.record_received();
                match Packet::from_buffer(buf) {
                    // A full queue is already counted by the pipeline
                    Ok(packet) => {
                        let _ = pipeline.submit(packet);
                    }
                    Err(_) => metrics.record_drop(DropReason::Format),
                }
            }
            Ok(FrameRead::WrongSize(len)) => {
                trace!("Discarded {}-byte frame from {}", len, peer);
                metrics.record_received();
                metrics.record_drop(DropReason::Format);
            }
            Ok(FrameRead::Eof) => break,
            Err(TransportError::FrameTooLarge(len)) => {
                warn!("Closing {}: frame length {} over limit", peer, len);
                metrics.record_drop(DropReason::Format);
                break;
            }
            Err(e) => {
                debug!("Connection from {} ended: {}", peer, e);
                break;
            }
        }
    }

    metrics.connection_closed();
    debug!("Connection from {} closed", peer);
}
