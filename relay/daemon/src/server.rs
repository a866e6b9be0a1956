//! Daemon Server Implementation
//!
//! Accept loop and per-connection handling for the relay daemon:
//! - Accepts connections on a Unix socket
//! - Spawns a reader and a writer task per connection
//! - Registers identified connections with the hub for delivery
//! - Detaches closed connections from every stream they followed
//! - Supports graceful shutdown
//!
//! # Connection Layout
//!
//! ```text
//!          socket (NDJSON)
//!        ┌──────┴──────┐
//!     reader         writer ◄── replies (request answers)
//!        │              ▲
//!        ▼              └────── events (hub channel, RelayMessage)
//!   StreamingEngine ──► ConnectionRegistry
//! ```
//!
//! The writer owns the socket's write half so a reader blocked inside the
//! engine never stops events from draining. Request lines are read with a
//! hard bound of [`MAX_LINE_BYTES`]; a longer line closes the connection.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

use relay_core::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, ProjectId, RelayMessage, SendMessage,
    StreamingEngine, UserId,
};

use crate::protocol::{decode_request, encode_line, ClientRequest, Outbound, ServerReply, MAX_LINE_BYTES};

/// Connection state tracking (internal to server, separate from the hub handle)
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Per-connection event channel capacity
    pub connection_channel_capacity: usize,
    /// How often the hub is swept for connections whose writer has gone away
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connection_channel_capacity: 256,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Per-connection request context
struct Session {
    conn_id: ConnectionId,
    /// Event sender, handed to the hub on hello
    events_tx: mpsc::Sender<RelayMessage>,
    identity: Option<(UserId, ProjectId)>,
}

/// The main daemon server
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Server configuration
    server_config: ServerConfig,
    /// The delivery engine
    engine: StreamingEngine,
    /// Live connections, as seen by the engine's delivery router
    hub: ConnectionRegistry,
    /// Active connection state (task handles)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf, engine: StreamingEngine, hub: ConnectionRegistry) -> Self {
        Self {
            socket_path,
            server_config: ServerConfig::default(),
            engine,
            hub,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Run the daemon server until `shutdown` is set
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        // Conversations left processing by a previous run have no stream now
        let swept = self
            .engine
            .sweep_stale_processing()
            .await
            .context("Startup sweep of processing conversations failed")?;
        if !swept.is_empty() {
            info!(count = swept.len(), "Interrupted conversations left processing");
        }

        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        info!(path = ?self.socket_path, "Listening for connections");

        // Set socket permissions (owner-only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        // Periodically drop connections whose writer has gone away
        let hub_for_cleanup = self.hub.clone();
        let engine_for_cleanup = self.engine.clone();
        let cleanup_interval = self.server_config.cleanup_interval;
        let cleanup_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(cleanup_interval).await;
                for conn_id in hub_for_cleanup.cleanup_disconnected() {
                    engine_for_cleanup.connection_closed(conn_id).await;
                }
            }
        });

        // Main accept loop
        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let accept_result =
                tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;

            let stream = match accept_result {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::new();
            info!(
                conn_id = %conn_id,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let task_handle = tokio::spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    self.server_config.connection_channel_capacity,
                    self.engine.clone(),
                    self.hub.clone(),
                    Arc::clone(&self.connection_states),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    abort_handle: task_handle.abort_handle(),
                },
            );
        }

        cleanup_task.abort();
        self.shutdown()
    }

    /// Handle a single client connection
    ///
    /// Reads requests line by line and answers each one; streamed events for
    /// this connection are written by a separate writer task.
    async fn handle_connection(
        conn_id: ConnectionId,
        stream: UnixStream,
        channel_capacity: usize,
        engine: StreamingEngine,
        hub: ConnectionRegistry,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    ) {
        info!("Connection handler started");

        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::channel::<RelayMessage>(channel_capacity);
        let (replies_tx, replies_rx) = mpsc::channel::<ServerReply>(channel_capacity);

        let writer = tokio::spawn(
            Self::write_loop(write_half, events_rx, replies_rx).in_current_span(),
        );

        let mut session = Session {
            conn_id,
            events_tx,
            identity: None,
        };
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();

        loop {
            let line = match read_line(&mut reader, &mut buf).await {
                Ok(LineRead::Line) => match std::str::from_utf8(&buf) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Request line is not UTF-8, closing connection");
                        break;
                    }
                },
                Ok(LineRead::Eof) => {
                    info!("Client disconnected (EOF)");
                    break;
                }
                Ok(LineRead::TooLong) => {
                    warn!(limit = MAX_LINE_BYTES, "Request line too long, closing connection");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Read error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = match decode_request(line) {
                Ok(request) => {
                    debug!(request = ?request, "Received request");
                    Self::handle_request(&engine, &hub, &mut session, request).await
                }
                Err(e) => {
                    warn!(error = %e, "Failed to decode request");
                    ServerReply::failed(format!("malformed request: {e}"))
                }
            };
            if replies_tx.send(reply).await.is_err() {
                info!("Writer stopped");
                break;
            }
        }

        // Detach from every stream before the hub forgets the connection
        hub.unregister(conn_id);
        let detached = engine.connection_closed(conn_id).await;
        drop(session);
        drop(replies_tx);
        if let Err(e) = writer.await {
            debug!(error = %e, "Writer task ended abnormally");
        }
        let uptime_secs = connection_states
            .remove(&conn_id)
            .map(|(_, state)| state.connected_at.elapsed().as_secs());

        info!(
            detached_streams = detached.len(),
            uptime_secs = ?uptime_secs,
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut events: mpsc::Receiver<RelayMessage>,
        mut replies: mpsc::Receiver<ServerReply>,
    ) {
        loop {
            let outbound = tokio::select! {
                Some(reply) = replies.recv() => Outbound::Reply(reply),
                Some(event) = events.recv() => Outbound::Event(event),
                else => break,
            };
            match encode_line(&outbound) {
                Ok(line) => {
                    if let Err(e) = writer.write_all(&line).await {
                        error!(error = %e, "Write error");
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode message"),
            }
        }
    }

    async fn handle_request(
        engine: &StreamingEngine,
        hub: &ConnectionRegistry,
        session: &mut Session,
        request: ClientRequest,
    ) -> ServerReply {
        if let ClientRequest::Hello { user_id, project_id } = request {
            if session.identity.is_some() {
                return ServerReply::failed("hello already received");
            }
            hub.register(ConnectionHandle::new(
                session.conn_id,
                user_id.clone(),
                project_id.clone(),
                session.events_tx.clone(),
            ));
            info!(user_id = %user_id, project_id = %project_id, "Connection identified");
            session.identity = Some((user_id, project_id));
            return ServerReply::Welcome {
                connection_id: session.conn_id.as_u64(),
            };
        }

        let Some((user_id, project_id)) = session.identity.clone() else {
            return ServerReply::failed("send hello first");
        };
        let conn_id = session.conn_id;

        match request {
            ClientRequest::Hello { .. } => ServerReply::failed("hello already received"),
            ClientRequest::CreateConversation { title } => {
                match engine.create_conversation(project_id, user_id, title).await {
                    Ok(conversation) => ServerReply::ConversationCreated { conversation },
                    Err(e) => ServerReply::failed(e),
                }
            }
            ClientRequest::SendMessage {
                conversation_id,
                content,
            } => {
                let request = SendMessage {
                    conversation_id: conversation_id.clone(),
                    user_id,
                    content,
                    origin: Some(conn_id),
                };
                match engine.submit_user_message(request).await {
                    // The drive task runs on its own; the ticket is not awaited
                    Ok(ticket) => ServerReply::MessageAccepted {
                        conversation_id,
                        message_id: ticket.message_id,
                    },
                    Err(e) => ServerReply::failed(e),
                }
            }
            ClientRequest::Attach { conversation_id } => {
                match engine.attach(&conversation_id, &user_id, conn_id).await {
                    Ok(streaming) => ServerReply::Attached {
                        conversation_id,
                        streaming,
                    },
                    Err(e) => ServerReply::failed(e),
                }
            }
            ClientRequest::Detach { conversation_id } => {
                match engine.detach(&conversation_id, &user_id, conn_id).await {
                    Ok(_) => ServerReply::Detached { conversation_id },
                    Err(e) => ServerReply::failed(e),
                }
            }
            ClientRequest::LoadConversation { conversation_id } => {
                match engine.load_for_display(&conversation_id, &user_id).await {
                    Ok(view) => ServerReply::ConversationLoaded { view },
                    Err(e) => ServerReply::failed(e),
                }
            }
        }
    }

    /// Graceful shutdown
    fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(conn_id = %conn_id, "Aborting connection");
                conn_state.abort_handle.abort();
            }
        }

        let dropped = self.engine.shutdown();
        if dropped > 0 {
            info!(streams = dropped, "Dropped resident streams");
        }

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Result of reading one request line
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    /// A full line (or a final unterminated one) is in the buffer
    Line,
    /// The peer closed the connection
    Eof,
    /// More than [`MAX_LINE_BYTES`] arrived without a newline
    TooLong,
}

/// Read one newline-terminated line into `buf`, never buffering more than
/// [`MAX_LINE_BYTES`] plus the terminator
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_LINE_BYTES as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_LINE_BYTES {
        return Ok(LineRead::TooLong);
    }
    Ok(LineRead::Line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{
        EngineConfig, InMemoryStore, ScriptedGenerator, StaticToolRegistry, StreamRegistry,
    };

    fn server(socket_path: PathBuf) -> DaemonServer {
        let hub = ConnectionRegistry::new();
        let engine = StreamingEngine::new(
            EngineConfig::default(),
            Arc::new(StreamRegistry::default()),
            Arc::new(hub.clone()),
            Arc::new(InMemoryStore::new()),
            Arc::new(ScriptedGenerator::echo()),
            Arc::new(StaticToolRegistry::new()),
        );
        DaemonServer::new(socket_path, engine, hub)
    }

    async fn connect(socket_path: &std::path::Path) -> UnixStream {
        for _ in 0..50 {
            if let Ok(stream) = UnixStream::connect(socket_path).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("daemon did not start");
    }

    async fn read_json(lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>) -> serde_json::Value {
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("socket closed");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_request_before_hello_fails() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ConnectionRegistry::new();
        let mut session = Session {
            conn_id: ConnectionId::new(),
            events_tx: mpsc::channel(1).0,
            identity: None,
        };
        let server = server(dir.path().join("relay.sock"));
        let reply = DaemonServer::handle_request(
            &server.engine,
            &hub,
            &mut session,
            ClientRequest::CreateConversation { title: "t".into() },
        )
        .await;
        assert!(matches!(reply, ServerReply::RequestFailed { .. }));
        assert_eq!(hub.count(), 0);
    }

    #[tokio::test]
    async fn test_read_line_splits_on_newline() {
        let mut reader: &[u8] = b"{\"a\":1}\n\nlast";
        let mut buf = Vec::new();

        assert_eq!(read_line(&mut reader, &mut buf).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"{\"a\":1}");
        assert_eq!(read_line(&mut reader, &mut buf).await.unwrap(), LineRead::Line);
        assert!(buf.is_empty());
        assert_eq!(read_line(&mut reader, &mut buf).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"last");
        assert_eq!(read_line(&mut reader, &mut buf).await.unwrap(), LineRead::Eof);
    }

    #[tokio::test]
    async fn test_read_line_stops_at_limit() {
        let oversized = vec![b'x'; MAX_LINE_BYTES * 2];
        let mut reader: &[u8] = &oversized;
        let mut buf = Vec::new();

        assert_eq!(read_line(&mut reader, &mut buf).await.unwrap(), LineRead::TooLong);
        assert_eq!(buf.len(), MAX_LINE_BYTES + 1);

        // A line of exactly the limit is still accepted
        let mut exact = vec![b'y'; MAX_LINE_BYTES];
        exact.push(b'\n');
        let mut reader: &[u8] = &exact;
        assert_eq!(read_line(&mut reader, &mut buf).await.unwrap(), LineRead::Line);
        assert_eq!(buf.len(), MAX_LINE_BYTES);
    }

    #[tokio::test]
    async fn test_oversized_line_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("relay.sock");
        let mut server = server(socket_path.clone());
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_server = Arc::clone(&shutdown);
        let server_task = tokio::spawn(async move { server.run(shutdown_for_server).await });

        let (mut read_half, mut write_half) = connect(&socket_path).await.into_split();
        let writer = tokio::spawn(async move {
            let chunk = vec![b'x'; 64 * 1024];
            for _ in 0..(MAX_LINE_BYTES / chunk.len() + 2) {
                // The server hangs up mid-write
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            write_half
        });

        // EOF, or a reset when our unread bytes were discarded: closed either way
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), read_half.read_to_end(&mut rest))
            .await
            .expect("connection stayed open after an oversized line")
            .ok();
        assert!(rest.is_empty());
        drop(writer.await.unwrap());

        shutdown.store(true, Ordering::SeqCst);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_echo_round_trip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("relay.sock");
        let mut server = server(socket_path.clone());
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_server = Arc::clone(&shutdown);
        let server_task = tokio::spawn(async move { server.run(shutdown_for_server).await });

        let (read_half, mut write_half) = connect(&socket_path).await.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"type\":\"hello\",\"user_id\":\"user-1\",\"project_id\":\"proj-1\"}\n")
            .await
            .unwrap();
        assert_eq!(read_json(&mut lines).await["type"], "welcome");

        write_half
            .write_all(b"{\"type\":\"create_conversation\",\"title\":\"demo\"}\n")
            .await
            .unwrap();
        let created = read_json(&mut lines).await;
        assert_eq!(created["type"], "conversation_created");
        let conv_id = created["conversation"]["id"].as_str().unwrap().to_string();

        let send = format!("{{\"type\":\"send_message\",\"conversation_id\":\"{conv_id}\",\"content\":\"ping pong\"}}\n");
        write_half.write_all(send.as_bytes()).await.unwrap();

        let mut final_content = None;
        for _ in 0..20 {
            let value = read_json(&mut lines).await;
            if value["type"] == "assistant_response" && value["done"] == true {
                final_content = Some(value["content"].as_str().unwrap().to_string());
                break;
            }
        }
        assert_eq!(final_content.as_deref(), Some("ping pong"));

        drop(write_half);
        // The server closes our side once it sees EOF
        let mut rest = Vec::new();
        let _ = lines.into_inner().read_to_end(&mut rest).await;

        shutdown.store(true, Ordering::SeqCst);
        server_task.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }
}
