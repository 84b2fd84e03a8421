//! The loopback TCP transport: listener lifecycle and the per-connection
//! read/dispatch/write loop.
use crate::config::{Credentials, ServerConfig};
use crate::framing::{FrameBuffer, DELIMITER};
use crate::observe::{Observation, ObservationReceiver, ObservationSink};
use crate::service::{ConnectionContext, MockService, Session};
use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Upper bound on answers and events queued for one connection before the
/// writer drains them.
const MAX_PENDING_OUTBOUND: usize = 100;

/// A running mock server.
///
/// Bound to a loopback port chosen by the OS unless configured otherwise;
/// hand [`MockServer::credentials`] to the client under test.  Connections
/// are accepted and serviced until [`MockServer::shutdown`].
pub struct MockServer {
    local_addr: SocketAddr,
    token: String,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    /// Bind a listener and start accepting connections.
    ///
    /// Returns the server handle together with the observation channel the
    /// embedding harness may assert on.
    pub async fn bind(config: ServerConfig) -> Result<(Self, ObservationReceiver)> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let token = config.token.clone().unwrap_or_else(generate_token);

        let (observer, observations) = ObservationSink::channel();
        let cancel = CancellationToken::new();
        let service = Arc::new(MockService::new(token.clone(), observer.clone()));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            config.auth_grace,
            service,
            observer,
            cancel.clone(),
        ));

        info!(%local_addr, "listening");
        Ok((
            Self {
                local_addr,
                token,
                cancel,
                accept_task,
            },
            observations,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The discovery value for clients: host, port and shared secret.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            host: self.local_addr.ip(),
            port: self.local_addr.port(),
            token: self.token.clone(),
        }
    }

    /// Stop accepting and tear down every live connection.  Idempotent:
    /// repeated calls after the server stopped are no-ops.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until the accept loop and every connection task has finished.
    pub async fn closed(self) {
        let _ = self.accept_task.await;
    }
}

/// The shared secret: sixteen random alphanumerics.
fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

async fn accept_loop(
    listener: TcpListener,
    auth_grace: Duration,
    service: Arc<MockService>,
    observer: ObservationSink,
    cancel: CancellationToken,
) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("shutdown requested; no longer accepting");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "failed to set TCP_NODELAY");
                    }
                    connections.push(tokio::spawn(run_connection(
                        stream,
                        peer,
                        auth_grace,
                        Arc::clone(&service),
                        observer.clone(),
                        cancel.clone(),
                    )));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    observer.emit(Observation::ServerError {
                        error: e.to_string(),
                    });
                }
            },
        }
        connections.retain(|task| !task.is_finished());
    }

    drop(listener);
    for connection in connections {
        let _ = connection.await;
    }
    observer.emit(Observation::ServerClosed);
    info!("server closed");
}

/// One sequential unit of work per connection: frames are dispatched in
/// arrival order and each is fully handled before the next is taken.  The
/// authorization deadline races the handshake in the same loop and is
/// disabled, exactly once, by a successful `auth`.
#[instrument(skip_all, fields(%peer))]
async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    auth_grace: Duration,
    service: Arc<MockService>,
    observer: ObservationSink,
    cancel: CancellationToken,
) {
    observer.emit(Observation::ConnectionOpened { peer });

    let (outbound_tx, mut outbound_rx) = mpsc::channel(MAX_PENDING_OUTBOUND);
    let ctx = ConnectionContext::new(outbound_tx);
    let mut session = Session::new();
    let mut framer = FrameBuffer::new();
    let (mut reader, mut writer) = stream.into_split();
    let mut chunk = [0u8; 4096];

    let deadline = tokio::time::sleep(auth_grace);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("server shutdown; closing connection");
                break;
            }
            _ = &mut deadline, if !session.authorized() => {
                info!("authorization deadline expired; closing connection");
                break;
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!("peer closed connection");
                    break;
                }
                Ok(n) => {
                    let mut closing = false;
                    for frame in framer.push(&chunk[..n]) {
                        service.handle_frame(&mut session, &ctx, &frame).await;
                        if ctx.close_requested() {
                            closing = true;
                            break;
                        }
                    }
                    if closing {
                        flush_outbound(&mut outbound_rx, &mut writer).await;
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "connection read error");
                    observer.emit(Observation::ConnectionError {
                        peer,
                        error: e.to_string(),
                    });
                    break;
                }
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        warn!(error = %e, "connection write error");
                        observer.emit(Observation::ConnectionError {
                            peer,
                            error: e.to_string(),
                        });
                        break;
                    }
                }
                // This task holds the context, so the channel cannot close
                // while the loop runs.
                None => break,
            },
        }
    }

    observer.emit(Observation::ConnectionClosed { peer });
    debug!("connection closed");
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &str) -> std::io::Result<()> {
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(&[DELIMITER]).await?;
    writer.flush().await
}

/// Write everything handlers queued before a close request, then let the
/// connection drop.
async fn flush_outbound(outbound: &mut mpsc::Receiver<String>, writer: &mut OwnedWriteHalf) {
    while let Ok(frame) = outbound.try_recv() {
        if let Err(e) = write_frame(writer, &frame).await {
            debug!(error = %e, "write failed during connection teardown");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    struct TestClient {
        stream: TcpStream,
        framer: FrameBuffer,
        ready: VecDeque<Vec<u8>>,
    }

    impl TestClient {
        async fn connect(server: &MockServer) -> Self {
            let stream = TcpStream::connect(server.local_addr()).await.unwrap();
            Self {
                stream,
                framer: FrameBuffer::new(),
                ready: VecDeque::new(),
            }
        }

        async fn call(&mut self, frame: &str) {
            self.stream.write_all(frame.as_bytes()).await.unwrap();
            self.stream.write_all(&[DELIMITER]).await.unwrap();
        }

        /// Next decoded frame from the server, or `None` once the server
        /// closed the connection.
        async fn next(&mut self) -> Option<Value> {
            loop {
                if let Some(frame) = self.ready.pop_front() {
                    return Some(serde_json::from_slice(&frame).unwrap());
                }
                let mut chunk = [0u8; 1024];
                let n = self.stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return None;
                }
                let frames: Vec<_> = self.framer.push(&chunk[..n]).collect();
                self.ready.extend(frames);
            }
        }

        async fn auth(&mut self, token: &str) -> Value {
            self.call(&format!(
                r#"{{"jsonrpc":"2.0","id":1,"method":"auth","params":["{token}"]}}"#
            ))
            .await;
            self.next().await.unwrap()
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            token: Some("sesame".to_owned()),
            ..ServerConfig::default()
        }
    }

    fn drain(observations: &mut ObservationReceiver) -> Vec<Observation> {
        let mut seen = Vec::new();
        while let Ok(observation) = observations.try_recv() {
            seen.push(observation);
        }
        seen
    }

    #[tokio::test]
    async fn auth_then_ping_end_to_end() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (server, _observations) = MockServer::bind(test_config()).await.unwrap();
        let credentials = server.credentials();
        assert_eq!(credentials.token, "sesame");

        let mut client = TestClient::connect(&server).await;
        let answer = client.auth(&credentials.token).await;
        assert_eq!(answer["result"], json!([null, true, "authorized"]));

        client
            .call(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
            .await;
        let answer = client.next().await.unwrap();
        assert_eq!(answer["result"], json!([null, true, "pong"]));

        server.shutdown();
        server.closed().await;
    }

    #[tokio::test]
    async fn wrong_token_answers_401_and_disconnects() {
        let (server, mut observations) = MockServer::bind(test_config()).await.unwrap();

        let mut client = TestClient::connect(&server).await;
        let answer = client.auth("wrong-token").await;
        assert_eq!(answer["error"], json!({"code": 401, "message": "Unauthorized"}));

        // The 401 is the last frame; the server closes the connection.
        assert_eq!(client.next().await, None);

        server.shutdown();
        server.closed().await;
        let seen = drain(&mut observations);
        assert!(seen.contains(&Observation::Dispatch {
            method: "auth".to_owned(),
            authorized: false,
        }));
        assert_eq!(
            seen.iter()
                .filter(|o| matches!(o, Observation::ConnectionClosed { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn unauthenticated_connection_is_closed_by_deadline() {
        let config = ServerConfig {
            auth_grace: Duration::from_millis(50),
            ..test_config()
        };
        let (server, mut observations) = MockServer::bind(config).await.unwrap();

        let mut client = TestClient::connect(&server).await;
        // Never authenticate; the deadline closes the connection.
        assert_eq!(client.next().await, None);

        server.shutdown();
        server.closed().await;
        let seen = drain(&mut observations);
        assert!(seen.iter().any(|o| matches!(o, Observation::ConnectionClosed { .. })));
        assert!(!seen.iter().any(|o| matches!(o, Observation::Dispatch { .. })));
    }

    #[tokio::test]
    async fn test_event_handshake_end_to_end() {
        let (server, _observations) = MockServer::bind(test_config()).await.unwrap();
        let mut client = TestClient::connect(&server).await;
        client.auth("sesame").await;

        client
            .call(r#"{"jsonrpc":"2.0","id":2,"method":"bindEvent","params":[0,"testEvent",42,{"testCtx":true}]}"#)
            .await;
        assert_eq!(client.next().await.unwrap()["result"], json!([null, true]));

        client
            .call(r#"{"jsonrpc":"2.0","id":3,"method":"perform","params":[0,"testEvent"]}"#)
            .await;
        let answer = client.next().await.unwrap();
        assert_eq!(answer["result"], json!([null, true, "firingTestEvent"]));

        let event = client.next().await.unwrap();
        assert_eq!(event["method"], json!("event"));
        assert_eq!(event["params"]["evtType"], json!("testEvent"));
        assert_eq!(event["params"]["selfId"], json!(0));
        let token = event["params"]["evt"].as_str().unwrap().to_owned();

        client
            .call(&format!(
                r#"{{"jsonrpc":"2.0","id":4,"method":"perform","params":[0,"{token}"]}}"#
            ))
            .await;
        assert_eq!(
            client.next().await.unwrap()["result"],
            json!([null, true, "awesome"])
        );
        let event = client.next().await.unwrap();
        assert_eq!(event["params"]["evt"], Value::Null);
        assert_eq!(event["params"]["ctx"], json!({"testCtx": true}));

        server.shutdown();
        server.closed().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_connections() {
        let (server, mut observations) = MockServer::bind(test_config()).await.unwrap();

        let mut client = TestClient::connect(&server).await;
        // A full round trip guarantees the connection task is running.
        client
            .call(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await;
        client.next().await.unwrap();

        server.shutdown();
        server.shutdown();
        assert_eq!(client.next().await, None);
        server.closed().await;

        let seen = drain(&mut observations);
        assert_eq!(
            seen.iter()
                .filter(|o| matches!(o, Observation::ServerClosed))
                .count(),
            1
        );
        assert_eq!(
            seen.iter()
                .filter(|o| matches!(o, Observation::ConnectionClosed { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn connections_have_private_state() {
        let (server, _observations) = MockServer::bind(test_config()).await.unwrap();

        let mut first = TestClient::connect(&server).await;
        let mut second = TestClient::connect(&server).await;
        first.auth("sesame").await;

        // The second connection is still unauthenticated and gated.
        second
            .call(r#"{"jsonrpc":"2.0","id":1,"method":"perform","params":[0,"testEvent"]}"#)
            .await;
        assert_eq!(
            second.next().await.unwrap()["result"],
            json!(["unknown method ", null])
        );

        // The first one is unaffected by the second's traffic.
        first
            .call(r#"{"jsonrpc":"2.0","id":2,"method":"perform","params":[0,"echo"]}"#)
            .await;
        assert_eq!(
            first.next().await.unwrap()["result"],
            json!([null, {"a mock": "result"}])
        );

        server.shutdown();
        server.closed().await;
    }
}
