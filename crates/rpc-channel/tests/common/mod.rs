//! Scripted loopback server for integration tests.

#![allow(dead_code)]

use bytes::BytesMut;
use futures::StreamExt;
use proven_rpc_channel::protocol::Frame;
use proven_rpc_channel::{
    Error, Packet, RpcRequest, RpcResponse, ServiceInstance, StandardProtocol, WireProtocol,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a log subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wait for `condition` to hold, polling every few milliseconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

async fn step<T>(what: &str, fut: impl Future<Output = Option<T>>) -> T {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("channel closed waiting for {what}"))
}

struct ServerDecoder(Arc<StandardProtocol>);

impl Decoder for ServerDecoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        self.0.decode_frame(src)
    }
}

/// Server that hands every accepted connection to the test.
pub struct TestServer {
    addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    /// Listen on an ephemeral loopback port.
    pub async fn start(protocol: StandardProtocol) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let protocol = Arc::new(protocol);
        let (tx, accepted) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read_half, writer) = stream.into_split();
                let (packet_tx, packets) = mpsc::unbounded_channel();

                let decoder_protocol = Arc::clone(&protocol);
                tokio::spawn(async move {
                    let mut frames =
                        FramedRead::new(read_half, ServerDecoder(Arc::clone(&decoder_protocol)));
                    while let Some(Ok(frame)) = frames.next().await {
                        let Ok(packet) = decoder_protocol.decode(frame) else {
                            break;
                        };
                        if packet_tx.send(packet).is_err() {
                            break;
                        }
                    }
                });

                let conn = ServerConn {
                    protocol: Arc::clone(&protocol),
                    packets,
                    writer,
                };
                if tx.send(conn).is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            accepted,
            accept_task,
        }
    }

    /// Instance pointing at this server.
    pub fn instance(&self, service: &str) -> ServiceInstance {
        ServiceInstance::new(service, "127.0.0.1", self.addr.port())
    }

    /// Next accepted connection.
    pub async fn accept(&mut self) -> ServerConn {
        step("connection", self.accepted.recv()).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Server side of one accepted connection.
pub struct ServerConn {
    protocol: Arc<StandardProtocol>,
    packets: mpsc::UnboundedReceiver<Packet>,
    writer: OwnedWriteHalf,
}

impl ServerConn {
    /// Next decoded packet from the client.
    pub async fn recv(&mut self) -> Packet {
        step("packet", self.packets.recv()).await
    }

    /// Next packet, which must be an ordinary request.
    pub async fn recv_request(&mut self) -> RpcRequest {
        match self.recv().await {
            Packet::Request(request) => request,
            other => panic!("expected request, got {other:?}"),
        }
    }

    /// Write a response frame.
    pub async fn respond(&mut self, response: RpcResponse) {
        let bytes = self.protocol.encode_response(&response).unwrap();
        self.writer.write_all(&bytes).await.unwrap();
    }

    /// Write a request frame (push calls).
    pub async fn send_request(&mut self, request: RpcRequest) {
        let bytes = self.protocol.encode_request(&request).unwrap();
        self.writer.write_all(&bytes).await.unwrap();
    }
}
