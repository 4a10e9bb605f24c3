// A framed TCP connection on the relay side.
//
// The stream is split into a read half owned by a reader task and a write
// half owned by a writer task, so neither direction ever blocks the relay's
// main loop:
//
// - The reader decodes `ClientMessage` frames and queues them as `Inbound`.
//   A frame that does not decode is queued as `Inbound::Malformed` and the
//   reader carries on; a transport error ends the reader, which closes the
//   inbound queue (`recv` returns `None`).
// - The writer drains an unbounded `ServerMessage` queue. It exits once every
//   sender is gone or a write fails.
//
// Dropping an `Endpoint` aborts the reader. The writer finishes flushing what
// was already queued and then drops the write half, closing the socket.

use std::io;
use std::net::SocketAddr;

use gamesync_protocol::{ClientMessage, ServerMessage, recv_json, send_json};
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub enum Inbound {
    Message(ClientMessage),
    /// A frame that arrived intact but did not decode.
    Malformed(String),
}

pub struct Endpoint {
    peer: SocketAddr,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    reader: JoinHandle<()>,
}

impl Endpoint {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                let item = match recv_json::<_, ClientMessage>(&mut reader).await {
                    Ok(Ok(msg)) => Inbound::Message(msg),
                    Ok(Err(err)) => Inbound::Malformed(err.to_string()),
                    Err(err) => {
                        debug!(%peer, %err, "endpoint reader finished");
                        break;
                    }
                };
                if in_tx.send(item).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = send_json(&mut writer, &msg).await {
                    debug!(%peer, %err, "endpoint writer failed");
                    break;
                }
            }
        });

        Ok(Self {
            peer,
            inbound: in_rx,
            outbound: out_tx,
            reader,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// A handle for queueing writes independently of this endpoint.
    pub fn sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.outbound.clone()
    }

    /// Queue a message. Returns `false` if the writer has stopped.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.outbound.send(msg).is_ok()
    }

    /// Next inbound item, or `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
