//! Line-delimited JSON-RPC transport to one capability server subprocess.
//!
//! One writer guarded by a mutex, one reader task resolving pending requests
//! through oneshot channels. Every request is bounded by the per-server
//! timeout so a hung server process can never block the agent loop forever.

use super::{PromptDescriptor, RemoteToolSpec, ResourceDescriptor, TransportNotice};
use crate::config::ServerConfig;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn capability server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("capability server '{server}' transport error: {message}")]
    Io { server: String, message: String },
    #[error("capability server '{server}' returned invalid JSON: {source}")]
    InvalidJson {
        server: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("capability server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("capability server '{server}' terminated unexpectedly")]
    Terminated { server: String },
    #[error("request '{method}' to capability server '{server}' timed out")]
    Timeout { server: String, method: String },
}

pub struct ServerProcess {
    inner: Arc<ProcessInner>,
}

struct ProcessInner {
    server: String,
    timeout: Duration,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Result<Value, TransportError>>>>,
    id_counter: AtomicU64,
    notices: UnboundedSender<TransportNotice>,
}

impl ServerProcess {
    /// Spawns the configured subprocess and starts the reader task. The
    /// returned receiver carries transport-level notices (catalog changes,
    /// unexpected termination) for the connection owner to react to.
    pub async fn spawn(
        config: &ServerConfig,
    ) -> Result<(Self, UnboundedReceiver<TransportNotice>), TransportError> {
        let mut command = Command::new(&config.command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if !config.args.is_empty() {
            command.args(&config.args);
        }
        if let Some(dir) = &config.workdir {
            command.current_dir(dir);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            server: config.name.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io_error(&config.name, "failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(&config.name, "failed to capture server stdout"))?;

        let (notices, notice_rx) = unbounded_channel();
        let inner = Arc::new(ProcessInner {
            server: config.name.clone(),
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            child: AsyncMutex::new(Some(child)),
            writer: AsyncMutex::new(Some(BufWriter::new(stdin))),
            pending: AsyncMutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            notices,
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            reader_inner.reader_loop(stdout).await;
        });

        Ok((Self { inner }, notice_rx))
    }

    /// The MCP handshake. Returns the optional server instructions text from
    /// the initialize result.
    pub async fn initialize(&self) -> Result<Option<String>, TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        let result = self.inner.request("initialize", params).await?;
        let instructions = result
            .get("instructions")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.inner
            .notification("notifications/initialized", json!({}))
            .await?;
        Ok(instructions)
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, TransportError> {
        let result = self.inner.request("tools/list", json!({})).await?;
        let specs = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|tool| {
                        let name = tool.get("name").and_then(Value::as_str)?;
                        Some(RemoteToolSpec {
                            name: name.to_string(),
                            description: tool
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            input_schema: tool.get("inputSchema").cloned(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(specs)
    }

    /// Raw `tools/call` round trip; the result still carries the remote
    /// `content`/`isError` shape for the adapter to interpret.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, TransportError> {
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        self.inner.request("tools/call", params).await
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, TransportError> {
        let result = self.inner.request("resources/list", json!({})).await?;
        let descriptors = result
            .get("resources")
            .and_then(Value::as_array)
            .map(|resources| {
                resources
                    .iter()
                    .filter_map(|resource| {
                        let uri = resource.get("uri").and_then(Value::as_str)?;
                        Some(ResourceDescriptor {
                            uri: uri.to_string(),
                            description: resource
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            metadata: resource.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(descriptors)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, TransportError> {
        self.inner
            .request("resources/read", json!({ "uri": uri }))
            .await
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, TransportError> {
        let result = self.inner.request("prompts/list", json!({})).await?;
        let descriptors = result
            .get("prompts")
            .and_then(Value::as_array)
            .map(|prompts| {
                prompts
                    .iter()
                    .filter_map(|prompt| {
                        let name = prompt.get("name").and_then(Value::as_str)?;
                        Some(PromptDescriptor {
                            name: name.to_string(),
                            description: prompt
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            metadata: prompt.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(descriptors)
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
        self.inner
            .request("prompts/get", json!({ "name": name, "arguments": arguments }))
            .await
    }

    pub async fn shutdown(&self) {
        self.inner.reset().await;
    }
}

impl ProcessInner {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(TransportError::Terminated {
                server: self.server.clone(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::Timeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                })
            }
        }
    }

    async fn notification(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write_message(&payload).await
    }

    async fn respond(&self, id: Value, result: Value) -> Result<(), TransportError> {
        let mut payload = json!({
            "jsonrpc": "2.0",
            "result": result
        });
        if let Value::Object(ref mut map) = payload {
            map.insert("id".to_string(), id);
        }
        self.write_message(&payload).await
    }

    async fn respond_error(&self, id: Value, error: Value) -> Result<(), TransportError> {
        let mut payload = json!({
            "jsonrpc": "2.0",
            "error": error
        });
        if let Value::Object(ref mut map) = payload {
            map.insert("id".to_string(), id);
        }
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), TransportError> {
        let encoded =
            serde_json::to_string(message).map_err(|source| TransportError::InvalidJson {
                server: self.server.clone(),
                source,
            })?;

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| io_error(&self.server, "transport already closed"))?;
        for chunk in [encoded.as_bytes(), b"\n"] {
            stream
                .write_all(chunk)
                .await
                .map_err(|source| io_error(&self.server, source.to_string()))?;
        }
        stream
            .flush()
            .await
            .map_err(|source| io_error(&self.server, source.to_string()))?;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(item) = lines.next_line().await {
            match item {
                Some(raw) => {
                    if raw.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&raw) {
                        Ok(value) => self.process_inbound(value).await,
                        Err(source) => {
                            warn!(
                                server = %self.server,
                                line = raw,
                                %source,
                                "received invalid JSON from capability server"
                            );
                        }
                    }
                }
                None => break,
            }
        }

        self.reset().await;
        let _ = self.notices.send(TransportNotice::Closed);
    }

    async fn process_inbound(&self, value: Value) {
        if let Some(id) = value.get("id").cloned() {
            if value.get("method").is_some() {
                self.handle_server_request(id, value).await;
            } else {
                self.handle_response(id, value).await;
            }
        } else if value.get("method").is_some() {
            self.handle_notification(value);
        }
    }

    async fn handle_response(&self, id: Value, value: Value) {
        let key = match &id {
            Value::String(text) => text.clone(),
            Value::Number(num) => num.to_string(),
            _ => return,
        };

        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };

        let Some(sender) = responder else {
            debug!(server = %self.server, response_id = key, "response for unknown request");
            return;
        };

        if value.get("error").is_some() {
            let (code, message) = value
                .get("error")
                .and_then(Value::as_object)
                .map(|err| {
                    (
                        err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                        err.get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    )
                })
                .unwrap_or((-32000, "missing error payload".to_string()));
            let _ = sender.send(Err(TransportError::Rpc {
                server: self.server.clone(),
                code,
                message,
            }));
        } else {
            let _ = sender.send(Ok(value));
        }
    }

    async fn handle_server_request(&self, id: Value, value: Value) {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let outcome = match method {
            "ping" => self.respond(id, json!({})).await,
            other => {
                warn!(server = %self.server, method = other, "server sent unsupported request");
                let error = json!({
                    "code": -32601,
                    "message": format!("client does not implement method '{other}'"),
                });
                self.respond_error(id, error).await
            }
        };
        if let Err(err) = outcome {
            warn!(server = %self.server, %err, "failed to answer server request");
        }
    }

    fn handle_notification(&self, value: Value) {
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            debug!(server = %self.server, method, "received notification from server");
            if method == "notifications/tools/list_changed" {
                let _ = self.notices.send(TransportNotice::ToolsChanged);
            }
        }
    }

    async fn reset(&self) {
        {
            let mut writer = self.writer.lock().await;
            *writer = None;
        }

        {
            let mut child = self.child.lock().await;
            if let Some(mut running) = child.take() {
                if let Err(err) = running.kill().await {
                    debug!(
                        server = %self.server,
                        %err,
                        "failed to kill capability server process (may have already exited)"
                    );
                }
                let _ = running.wait().await;
            }
        }

        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(TransportError::Terminated {
                server: self.server.clone(),
            }));
        }
    }

    fn next_id(&self) -> String {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("req-{id}")
    }
}

fn io_error(server: &str, message: impl Into<String>) -> TransportError {
    TransportError::Io {
        server: server.to_string(),
        message: message.into(),
    }
}
