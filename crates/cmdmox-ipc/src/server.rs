// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! IPC server: a tokio accept loop on a background thread.
//!
//! Each launcher connection is served by its own task. Handler callbacks run
//! on the blocking pool so user-supplied handlers may take their time (or
//! panic) without stalling the accept loop; a panic becomes a failure
//! response recorded in the journal rather than a dead connection.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use cmdmox_proto::{decode_line, encode_line, Invocation, PassthroughResult, Response};
use cmdmox_proto::{WireRequest, WireResponse};

use crate::socket_utils::{cleanup_stale_socket, wait_for_endpoint};
use crate::{Endpoint, Result, TransportError};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Callbacks the controller registers for the two request kinds.
pub trait IpcHandlers: Send + Sync + 'static {
    fn on_invocation(&self, invocation: Invocation) -> Response;
    fn on_passthrough_result(&self, result: PassthroughResult) -> Response;
}

/// Synchronous facade over the async server.
///
/// `start` returns once the endpoint is accepting connections; `stop` (also
/// run on drop) shuts the accept loop down and unlinks the socket file.
pub struct IpcServer {
    endpoint: Endpoint,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IpcServer {
    pub fn start(
        endpoint: Endpoint,
        handlers: Arc<dyn IpcHandlers>,
        startup_timeout: Duration,
    ) -> Result<Self> {
        crate::validate_timeout(startup_timeout)?;
        cleanup_stale_socket(&endpoint)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let serve_endpoint = endpoint.clone();
        let thread = std::thread::Builder::new()
            .name("cmdmox-ipc-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(%err, "failed to build IPC runtime");
                        return;
                    }
                };
                if let Err(err) = runtime.block_on(serve(serve_endpoint, handlers, shutdown_rx)) {
                    error!(%err, "IPC server terminated with error");
                }
            })
            .map_err(TransportError::Io)?;

        let server = Self {
            endpoint,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        };
        wait_for_endpoint(&server.endpoint, startup_timeout)?;
        Ok(server)
    }

    /// The endpoint this server is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Shut down the accept loop, join workers, and unlink the socket.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("IPC server thread panicked during shutdown");
            }
        }
        #[cfg(unix)]
        {
            let path = self.endpoint.logical_path();
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
async fn serve(
    endpoint: Endpoint,
    handlers: Arc<dyn IpcHandlers>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let listener = tokio::net::UnixListener::bind(endpoint.logical_path())?;
    debug!(path = %endpoint.logical_path().display(), "IPC server listening");

    loop {
        match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, _addr))) => {
                let handlers = Arc::clone(&handlers);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, handlers).await {
                        warn!(%err, "IPC connection failed");
                    }
                });
            }
            Ok(Err(err)) => return Err(TransportError::Io(err)),
            Err(_elapsed) => match shutdown.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => break,
                Err(oneshot::error::TryRecvError::Empty) => {}
            },
        }
    }

    drop(listener);
    let _ = std::fs::remove_file(endpoint.logical_path());
    Ok(())
}

#[cfg(windows)]
async fn serve(
    endpoint: Endpoint,
    handlers: Arc<dyn IpcHandlers>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let pipe_name = endpoint.pipe_name();
    let mut instance = ServerOptions::new()
        .first_pipe_instance(true)
        .create(&pipe_name)?;
    debug!(pipe = %pipe_name, "IPC server listening");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            connected = instance.connect() => {
                connected?;
                let stream = instance;
                instance = ServerOptions::new().create(&pipe_name)?;
                let handlers = Arc::clone(&handlers);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, handlers).await {
                        warn!(%err, "IPC connection failed");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_connection<S>(stream: S, handlers: Arc<dyn IpcHandlers>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Ok(());
        }

        let response = match decode_line::<WireRequest>(&line) {
            Ok(request) => dispatch(Arc::clone(&handlers), request).await,
            Err(err) => {
                warn!(%err, "rejecting malformed IPC request");
                Response::failure(format!("cmdmox: protocol error: {err}"), 1)
            }
        };

        let payload = encode_line(&WireResponse::Response(response))?;
        reader.get_mut().write_all(&payload).await?;
        reader.get_mut().flush().await?;
    }
}

async fn dispatch(handlers: Arc<dyn IpcHandlers>, request: WireRequest) -> Response {
    let outcome = tokio::task::spawn_blocking(move || match request {
        WireRequest::Invocation(invocation) => handlers.on_invocation(invocation),
        WireRequest::PassthroughResult(result) => handlers.on_passthrough_result(result),
    })
    .await;

    match outcome {
        Ok(response) => response,
        Err(err) if err.is_panic() => {
            let message = panic_message(err);
            warn!(%message, "IPC handler panicked");
            Response::failure(message, 1)
        }
        Err(err) => Response::failure(err.to_string(), 1),
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string()),
        Err(err) => err.to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::client::{invoke_server, RetryConfig};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct EchoHandlers {
        seen: Mutex<Vec<Invocation>>,
    }

    impl IpcHandlers for EchoHandlers {
        fn on_invocation(&self, invocation: Invocation) -> Response {
            let mut response = Response::with_stdout(invocation.command.clone());
            response.exit_code = 0;
            self.seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(invocation);
            response
        }

        fn on_passthrough_result(&self, _result: PassthroughResult) -> Response {
            Response::default()
        }
    }

    fn sample_invocation(command: &str) -> Invocation {
        Invocation::new(
            command,
            vec!["-v".to_string()],
            "",
            BTreeMap::new(),
            "inv-1",
        )
    }

    #[test]
    fn round_trip_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::new(dir.path().join("ipc.sock"));
        let handlers = Arc::new(EchoHandlers {
            seen: Mutex::new(Vec::new()),
        });
        let mut server = IpcServer::start(
            endpoint.clone(),
            Arc::clone(&handlers) as Arc<dyn IpcHandlers>,
            Duration::from_secs(5),
        )
        .unwrap();

        let response = invoke_server(
            &endpoint,
            &sample_invocation("hi"),
            Duration::from_secs(5),
            &RetryConfig::default(),
        )
        .unwrap();
        assert_eq!(response.stdout, "hi");

        server.stop();
        assert!(!endpoint.logical_path().exists());
        let seen = handlers.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].args, vec!["-v".to_string()]);
    }

    #[test]
    fn concurrent_clients_are_all_served() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::new(dir.path().join("ipc.sock"));
        let handlers = Arc::new(EchoHandlers {
            seen: Mutex::new(Vec::new()),
        });
        let _server = IpcServer::start(
            endpoint.clone(),
            Arc::clone(&handlers) as Arc<dyn IpcHandlers>,
            Duration::from_secs(5),
        )
        .unwrap();

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let endpoint = endpoint.clone();
                std::thread::spawn(move || {
                    let invocation = Invocation::new(
                        format!("cmd{worker}"),
                        Vec::new(),
                        "",
                        BTreeMap::new(),
                        format!("inv-{worker}"),
                    );
                    invoke_server(
                        &endpoint,
                        &invocation,
                        Duration::from_secs(5),
                        &RetryConfig::default(),
                    )
                    .unwrap()
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let seen = handlers.seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
    }

    struct PanickyHandlers;

    impl IpcHandlers for PanickyHandlers {
        fn on_invocation(&self, _invocation: Invocation) -> Response {
            panic!("handler exploded");
        }

        fn on_passthrough_result(&self, _result: PassthroughResult) -> Response {
            Response::default()
        }
    }

    #[test]
    fn handler_panic_becomes_failure_response() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::new(dir.path().join("ipc.sock"));
        let _server = IpcServer::start(
            endpoint.clone(),
            Arc::new(PanickyHandlers),
            Duration::from_secs(5),
        )
        .unwrap();

        let response = invoke_server(
            &endpoint,
            &sample_invocation("boom"),
            Duration::from_secs(5),
            &RetryConfig::default(),
        )
        .unwrap();
        assert_eq!(response.exit_code, 1);
        assert!(response.stderr.contains("handler exploded"));
    }
}
