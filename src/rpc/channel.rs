//! RPC channel server
//!
//! Owns one job's private duplex endpoint: a Unix domain socket bound to
//! the job-unique endpoint name `runner-{uid}` under the node's temp path.
//! Exactly one subprocess connection is served at a time; on disconnect
//! (not cancellation) the accept loop restarts and waits for a new
//! connection, which tolerates a subprocess crash-and-relaunch.
//!
//! Reads are line-delimited JSON requests, each dispatched on its own task
//! so a slow handler cannot block subsequent reads. All outbound writes
//! (responses and server-initiated pushes) funnel through one
//! mutual-exclusion gate so concurrent handler tasks cannot interleave
//! bytes on the shared stream.

use crate::coordinator::CoordinatorClient;
use crate::model::job::JobUid;
use crate::rpc::dispatcher::Dispatcher;
use crate::rpc::message::{abort_push_line, RpcRequest, RpcResponse, GREETING};
use crate::utils::errors::{NodeError, Result};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Endpoint name for a job's channel
pub fn endpoint_name(job_uid: JobUid) -> String {
    format!("runner-{job_uid}")
}

struct Shared {
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<dyn CoordinatorClient>,
    /// The single-writer gate over the connected stream
    writer: Mutex<Option<OwnedWriteHalf>>,
}

/// Channel server for one job's subprocess
pub struct ChannelServer {
    endpoint: String,
    socket_path: PathBuf,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ChannelServer {
    /// Create a server for a job; the socket lives under `runtime_dir`
    pub fn new(
        runtime_dir: &Path,
        job_uid: JobUid,
        dispatcher: Arc<Dispatcher>,
        coordinator: Arc<dyn CoordinatorClient>,
    ) -> Self {
        let endpoint = endpoint_name(job_uid);
        let socket_path = runtime_dir.join(format!("{endpoint}.sock"));
        Self {
            endpoint,
            socket_path,
            shared: Arc::new(Shared {
                dispatcher,
                coordinator,
                writer: Mutex::new(None),
            }),
            cancel: CancellationToken::new(),
            accept_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the endpoint and start the accept loop
    pub fn start(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            NodeError::Channel(format!(
                "Failed to bind endpoint {}: {e}",
                self.socket_path.display()
            ))
        })?;

        info!(endpoint = %self.endpoint, "Channel server listening");

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let endpoint = self.endpoint.clone();
        let task = tokio::spawn(accept_loop(listener, shared, cancel, endpoint));
        *self.accept_task.lock() = Some(task);
        Ok(())
    }

    /// Push the cooperative `{"Method":"Abort"}` notification, bypassing
    /// the request/response envelope
    pub async fn abort(&self) -> Result<()> {
        info!(endpoint = %self.endpoint, "Pushing cooperative abort");
        write_line(&self.shared.writer, &abort_push_line())
            .await
            .map_err(|e| NodeError::Channel(e.to_string()))
    }

    /// Cancel the accept loop, wait for it to finish, then release the
    /// endpoint and the write gate
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(endpoint = %self.endpoint, %error, "Channel accept loop aborted");
            }
        }
        *self.shared.writer.lock().await = None;
        let _ = std::fs::remove_file(&self.socket_path);
        debug!(endpoint = %self.endpoint, "Channel server stopped");
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn accept_loop(
    listener: UnixListener,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    endpoint: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    debug!(%endpoint, "Runner subprocess connected");
                    handle_connection(stream, &shared, &cancel).await;
                    debug!(%endpoint, "Runner subprocess disconnected");
                }
                Err(error) => {
                    warn!(%endpoint, %error, "Accept failed on runner channel");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }
}

/// Serve one connection until it drops or cancellation is requested
async fn handle_connection(stream: UnixStream, shared: &Arc<Shared>, cancel: &CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    *shared.writer.lock().await = Some(write_half);

    let mut lines = FramedRead::new(read_half, LinesCodec::new());
    let mut first_line = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next() => match line {
                None => break,
                Some(Err(error)) => {
                    warn!(%error, "Read failed on runner channel");
                    break;
                }
                Some(Ok(line)) => {
                    let is_first = std::mem::take(&mut first_line);
                    if is_first && line == GREETING {
                        continue;
                    }
                    process_line(line, shared).await;
                }
            }
        }
    }

    *shared.writer.lock().await = None;
}

async fn process_line(line: String, shared: &Arc<Shared>) {
    let request: RpcRequest = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(error) => {
            warn!(%error, "Dropping undecodable channel line");
            return;
        }
    };

    // Refuse work while disconnected from the coordinator so the
    // subprocess's call fails fast instead of hanging.
    if !shared.coordinator.is_connected() {
        if !request.is_notification() {
            let response = RpcResponse::error(request.id, "Not connected to server");
            send_response(shared, &response).await;
        }
        return;
    }

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        if let Some(response) = shared.dispatcher.handle_request(request).await {
            // Fire-and-forget: nothing goes back on the wire for id 0,
            // even when the handler produced a result.
            if response.id != 0 {
                send_response(&shared, &response).await;
            }
        }
    });
}

async fn send_response(shared: &Shared, response: &RpcResponse) {
    let line = match serde_json::to_string(response) {
        Ok(line) => line,
        Err(error) => {
            error!(%error, "Failed to serialize RPC response");
            return;
        }
    };

    // Unknown-method responses would spam the logs for benign polling;
    // suppress the log line only, the response is still sent.
    if !line.to_ascii_lowercase().contains("unknown method") {
        debug!(%line, "Sending channel response");
    }

    if let Err(error) = write_line(&shared.writer, &line).await {
        warn!(%error, "Failed to write channel response");
    }
}

async fn write_line(writer: &Mutex<Option<OwnedWriteHalf>>, line: &str) -> std::io::Result<()> {
    let mut guard = writer.lock().await;
    let Some(stream) = guard.as_mut() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no subprocess connection",
        ));
    };
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Severity;
    use crate::model::job::{Job, JobUid};
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use ulid::Ulid;

    struct StubCoordinator {
        connected: AtomicBool,
    }

    impl StubCoordinator {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
            })
        }
    }

    impl CoordinatorClient for StubCoordinator {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn file_start_processing<'a>(&'a self, _job: &'a Job) -> BoxFuture<'a, Result<bool>> {
            Box::pin(async { Ok(true) })
        }

        fn file_finish_processing<'a>(
            &'a self,
            _job: &'a Job,
            _log: &'a str,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn file_log_append<'a>(
            &'a self,
            _uid: JobUid,
            _text: &'a str,
            _is_first: bool,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn notify<'a>(&'a self, _severity: Severity, _message: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn ping_dispatcher() -> Arc<Dispatcher> {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register("Ping", |_params| async { Ok(json!("pong")) });
        dispatcher
    }

    async fn start_server(
        dir: &Path,
        dispatcher: Arc<Dispatcher>,
        coordinator: Arc<dyn CoordinatorClient>,
    ) -> (ChannelServer, JobUid) {
        let uid = Ulid::new();
        let server = ChannelServer::new(dir, uid, dispatcher, coordinator);
        server.start().unwrap();
        (server, uid)
    }

    #[tokio::test]
    async fn test_request_round_trip_with_greeting() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _uid) =
            start_server(dir.path(), ping_dispatcher(), StubCoordinator::new(true)).await;

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("{GREETING}\n{}\n", r#"{"Id":5,"Method":"Ping","Params":[]}"#).as_bytes())
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), r#"{"Id":5,"Result":"pong"}"#);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_notification_response_suppressed_on_wire() {
        let dispatcher = ping_dispatcher();
        dispatcher.register("Peek", |_params| async { Ok(json!(1)) });
        let dir = tempfile::tempdir().unwrap();
        let (server, _uid) =
            start_server(dir.path(), dispatcher, StubCoordinator::new(true)).await;

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // A notification whose handler returns a value, then a normal call.
        write_half
            .write_all(
                format!(
                    "{}\n{}\n",
                    r#"{"Id":0,"Method":"Peek","Params":[]}"#,
                    r#"{"Id":1,"Method":"Ping","Params":[]}"#
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        // The first (and only) line on the wire belongs to the Ping call.
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), r#"{"Id":1,"Result":"pong"}"#);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_not_connected_synthesizes_error() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _uid) =
            start_server(dir.path(), ping_dispatcher(), StubCoordinator::new(false)).await;

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("{}\n", r#"{"Id":4,"Method":"Ping","Params":[]}"#).as_bytes())
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), r#"{"Id":4,"Error":"Not connected to server"}"#);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_line_dropped_without_killing_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _uid) =
            start_server(dir.path(), ping_dispatcher(), StubCoordinator::new(true)).await;

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(
                format!("this is not json\n{}\n", r#"{"Id":2,"Method":"Ping","Params":[]}"#)
                    .as_bytes(),
            )
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), r#"{"Id":2,"Result":"pong"}"#);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_method_sent_on_wire() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _uid) =
            start_server(dir.path(), ping_dispatcher(), StubCoordinator::new(true)).await;

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("{}\n", r#"{"Id":7,"Method":"DoesNotExist","Params":[]}"#).as_bytes())
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(
            line.trim_end(),
            r#"{"Id":7,"Result":"Unknown method 'DoesNotExist'"}"#
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_responses_are_not_interleaved() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register("Echo", |params| async move {
            // Stagger handlers so completions overlap.
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(params.into_iter().next().unwrap_or(serde_json::Value::Null))
        });
        let dir = tempfile::tempdir().unwrap();
        let (server, _uid) =
            start_server(dir.path(), dispatcher, StubCoordinator::new(true)).await;

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut batch = String::new();
        for id in 1..=100 {
            batch.push_str(&format!(
                "{{\"Id\":{id},\"Method\":\"Echo\",\"Params\":[{id}]}}\n"
            ));
        }
        write_half.write_all(batch.as_bytes()).await.unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let response: RpcResponse = serde_json::from_str(line.trim_end()).unwrap();
            assert_eq!(response.result, Some(json!(response.id)));
            assert!(seen.insert(response.id));
        }
        assert_eq!(seen.len(), 100);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_abort_push_reaches_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _uid) =
            start_server(dir.path(), ping_dispatcher(), StubCoordinator::new(true)).await;

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        write_half
            .write_all(format!("{GREETING}\n").as_bytes())
            .await
            .unwrap();

        // The write gate is armed once the accept loop picks up the
        // connection; retry until the push goes through.
        let mut pushed = false;
        for _ in 0..50 {
            if server.abort().await.is_ok() {
                pushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pushed);

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), r#"{"Method":"Abort"}"#);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_accept_loop_restarts_after_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _uid) =
            start_server(dir.path(), ping_dispatcher(), StubCoordinator::new(true)).await;

        // First connection drops immediately.
        drop(UnixStream::connect(server.socket_path()).await.unwrap());

        // A relaunched subprocess can still connect and be served.
        let mut response = None;
        for _ in 0..50 {
            let stream = UnixStream::connect(server.socket_path()).await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            if write_half
                .write_all(format!("{}\n", r#"{"Id":9,"Method":"Ping","Params":[]}"#).as_bytes())
                .await
                .is_err()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            let mut line = String::new();
            match tokio::time::timeout(Duration::from_millis(500), reader.read_line(&mut line)).await
            {
                Ok(Ok(n)) if n > 0 => {
                    response = Some(line.trim_end().to_string());
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        assert_eq!(response.as_deref(), Some(r#"{"Id":9,"Result":"pong"}"#));

        server.stop().await;
    }
}
