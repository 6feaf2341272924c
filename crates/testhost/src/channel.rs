//! Message channel to the controller
//!
//! A connected stream is split into a reader task that decodes frames into
//! [`Message`]s for an [`Inbound`] receiver, and a writer task fed by any
//! number of cloned [`Outbound`] handles. Sends never block the caller.

use crate::protocol::{codec, Message};
use crate::result::{TestHostError, TestHostResult};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receiving side of a channel
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Inbound {
    /// Next message; `None` once the controller side is gone
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Sending side of a channel
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbound {
    /// Queue a message for delivery
    pub fn send(&self, message: Message) -> TestHostResult<()> {
        self.tx
            .send(message)
            .map_err(|_| TestHostError::ChannelClosed)
    }

    /// Whether the writer side has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Connect to a controller endpoint over TCP
pub async fn connect_tcp(addr: SocketAddr) -> TestHostResult<(Inbound, Outbound)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!(%addr, "connected to controller");
    Ok(framed_channel(stream))
}

/// Run the frame codec over any byte stream.
///
/// Must be called from within a tokio runtime.
pub fn framed_channel<S>(stream: S) -> (Inbound, Outbound)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_loop(reader, in_tx));
    tokio::spawn(write_loop(writer, out_rx));
    (Inbound { rx: in_rx }, Outbound { tx: out_tx })
}

async fn read_loop<R>(mut reader: R, tx: mpsc::UnboundedSender<Message>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match codec::read_frame(&mut reader).await {
            Ok(Some(text)) => match Message::from_json(&text) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "dropping undecodable message"),
            },
            Ok(None) => {
                debug!("controller closed the channel");
                break;
            }
            Err(e) => {
                warn!(error = %e, "channel read failed");
                break;
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, message_type = ?message.message_type, "dropping unserializable message");
                continue;
            }
        };
        if let Err(e) = codec::write_frame(&mut writer, &json).await {
            warn!(error = %e, "channel write failed");
            break;
        }
    }
}

/// Controller side of an in-memory channel
#[derive(Debug)]
pub struct ControllerEnd {
    to_host: mpsc::UnboundedSender<Message>,
    from_host: mpsc::UnboundedReceiver<Message>,
}

impl ControllerEnd {
    /// Deliver a message to the host
    pub fn send(&self, message: Message) -> TestHostResult<()> {
        self.to_host
            .send(message)
            .map_err(|_| TestHostError::ChannelClosed)
    }

    /// Next message the host sent
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_host.recv().await
    }

    /// Message the host already sent, without waiting
    pub fn try_recv(&mut self) -> Option<Message> {
        self.from_host.try_recv().ok()
    }
}

/// In-memory channel: host-side halves plus the controller end
#[must_use]
pub fn memory_channel() -> (Inbound, Outbound, ControllerEnd) {
    let (to_host, host_rx) = mpsc::unbounded_channel();
    let (host_tx, from_host) = mpsc::unbounded_channel();
    (
        Inbound { rx: host_rx },
        Outbound { tx: host_tx },
        ControllerEnd { to_host, from_host },
    )
}
