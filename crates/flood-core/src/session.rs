use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::fatal;

/// One queued roundtrip: the payload to send, and the wall time it was
/// scheduled, echoed back on completion for latency accounting.
pub struct Request {
    pub block: Bytes,
    pub started: Duration,
}

/// Completion token delivered to the driver once the response is read.
pub struct Completion {
    pub started: Duration,
}

/// One TCP connection with independent send and receive pipelines. Each
/// pipeline is a loop holding at most one request on the wire; queued
/// requests wait in its channel. A written request is handed to the receive
/// loop in order, and the wire is a FIFO stream, so completions fire in
/// submission order without any framing.
///
/// There is no error recovery: a socket failure on either pipeline takes
/// the process down.
pub struct Session {
    peer: SocketAddr,
    queue: Option<UnboundedSender<Request>>,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self { peer, queue: None }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Take ownership of an established connection and start the pipelines.
    pub fn start(&mut self, stream: TcpStream, done: UnboundedSender<Completion>) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let (submit, send_queue) = mpsc::unbounded_channel();
        let (handoff, recv_queue) = mpsc::unbounded_channel();
        tokio::spawn(send_loop(write, send_queue, handoff));
        tokio::spawn(recv_loop(read, recv_queue, done));
        self.queue = Some(submit);
        Ok(())
    }

    /// Enqueue one roundtrip. The session must be connected.
    pub fn roundtrip(&self, request: Request) {
        let Some(queue) = &self.queue else {
            fatal!("roundtrip", "session not connected");
        };
        // A closed queue means a pipeline hit a socket error and the
        // process is already exiting.
        let _ = queue.send(request);
    }
}

async fn send_loop(
    mut write: OwnedWriteHalf,
    mut queue: UnboundedReceiver<Request>,
    handoff: UnboundedSender<Request>,
) {
    while let Some(request) = queue.recv().await {
        if let Err(err) = write.write_all(&request.block).await {
            fatal!("send", err);
        }
        if handoff.send(request).is_err() {
            return;
        }
    }
}

async fn recv_loop(
    mut read: OwnedReadHalf,
    mut queue: UnboundedReceiver<Request>,
    done: UnboundedSender<Completion>,
) {
    let mut scratch = Vec::new();
    while let Some(request) = queue.recv().await {
        // The server is contracted to return exactly one byte per request
        // byte, so the read length is known up front.
        let length = request.block.len();
        if scratch.len() < length {
            scratch.resize(length, 0);
        }
        if let Err(err) = read.read_exact(&mut scratch[..length]).await {
            fatal!("recv", err);
        }
        if done
            .send(Completion {
                started: request.started,
            })
            .is_err()
        {
            return;
        }
    }
}
