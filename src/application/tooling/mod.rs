//! Capability-server protocol client.
//!
//! Owns every long-lived connection to an external tool server: the
//! connect/discover/register pipeline, the disconnect/cleanup pipeline, the
//! per-server state map, and the resource/prompt catalogs. Discovered tools
//! are pushed into the shared [`ToolRegistry`] and pulled back out when a
//! server goes away, possibly while a chat turn is in flight.

mod content;
mod process;

pub use content::{extract_error_message, flatten_content};
pub use process::{ServerProcess, TransportError};

use crate::application::registry::{Tool, ToolFailure, ToolRegistry};
use crate::config::ServerConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A tool as described by a server's `tools/list` response.
#[derive(Debug, Clone)]
pub struct RemoteToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

/// Read-only descriptor for a server-exposed resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub description: Option<String>,
    pub metadata: Value,
}

/// Read-only descriptor for a server-exposed prompt template.
#[derive(Debug, Clone, Serialize)]
pub struct PromptDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub metadata: Value,
}

/// Transport-level signals surfaced by the reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportNotice {
    ToolsChanged,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Observable state of one configured server. Created the instant a
/// connection attempt begins, before any process I/O, so observers never see
/// "no state" for a server the reload has already taken on. Removed only on
/// explicit disconnect or config removal.
#[derive(Debug, Clone, Serialize)]
pub struct ServerState {
    pub name: String,
    pub config: ServerConfig,
    pub status: ServerStatus,
    pub error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub instructions: Option<String>,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    pub registered_tools: Vec<String>,
}

impl ServerState {
    fn connecting(config: ServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            config,
            status: ServerStatus::Connecting,
            error: None,
            connected_at: None,
            instructions: None,
            tool_count: 0,
            resource_count: 0,
            prompt_count: 0,
            registered_tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEventKind {
    Connected,
    Disconnected,
    Error,
    ToolsUpdated,
}

/// Fire-and-forget notification of a server state transition.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub kind: ServerEventKind,
    pub server: String,
    pub detail: Option<String>,
}

/// A capability server explicitly flagged a tool result as failed.
#[derive(Debug, Error)]
#[error("capability server '{server}' reported failure from tool '{tool}': {message}")]
pub struct RemoteToolError {
    pub server: String,
    pub tool: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("capability server '{0}' is not connected")]
    NotConnected(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct ConnectSummary {
    instructions: Option<String>,
    registered_tools: Vec<String>,
    resource_count: usize,
    prompt_count: usize,
}

pub struct ServerManager {
    registry: Arc<ToolRegistry>,
    states: RwLock<HashMap<String, ServerState>>,
    transports: Mutex<HashMap<String, Arc<ServerProcess>>>,
    resources: RwLock<HashMap<String, Vec<ResourceDescriptor>>>,
    prompts: RwLock<HashMap<String, Vec<PromptDescriptor>>>,
    events: broadcast::Sender<ServerEvent>,
}

impl ServerManager {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            states: RwLock::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            prompts: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribers that lag or drop their receiver can never fail the client;
    /// the broadcast channel simply discards what nobody is listening for.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Consistent snapshot of all server states, sorted by name.
    pub fn states(&self) -> Vec<ServerState> {
        let states = self.states.read().expect("server state lock");
        let mut snapshot: Vec<ServerState> = states.values().cloned().collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    pub fn state(&self, name: &str) -> Option<ServerState> {
        self.states
            .read()
            .expect("server state lock")
            .get(name)
            .cloned()
    }

    pub fn resources(&self, server: &str) -> Vec<ResourceDescriptor> {
        self.resources
            .read()
            .expect("resource catalog lock")
            .get(server)
            .cloned()
            .unwrap_or_default()
    }

    pub fn prompts(&self, server: &str) -> Vec<PromptDescriptor> {
        self.prompts
            .read()
            .expect("prompt catalog lock")
            .get(server)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<Value, CatalogError> {
        let transport = self
            .transport(server)
            .ok_or_else(|| CatalogError::NotConnected(server.to_string()))?;
        Ok(transport.read_resource(uri).await?)
    }

    pub async fn get_prompt(
        &self,
        server: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, CatalogError> {
        let transport = self
            .transport(server)
            .ok_or_else(|| CatalogError::NotConnected(server.to_string()))?;
        Ok(transport.get_prompt(name, arguments).await?)
    }

    /// Drives the configured server set to match `target`. Stale servers are
    /// disconnected and cleaned up; new or changed servers are (re)connected.
    /// Connections proceed concurrently and failures are isolated per server:
    /// one bad config never takes a sibling down.
    pub async fn reload(self: &Arc<Self>, target: &HashMap<String, ServerConfig>) {
        let current: Vec<String> = {
            let states = self.states.read().expect("server state lock");
            states.keys().cloned().collect()
        };

        for name in &current {
            if !target.contains_key(name) {
                info!(server = %name, "Server removed from configuration; disconnecting");
                self.disconnect(name).await;
            }
        }

        let mut handles = Vec::new();
        for (name, config) in target {
            let unchanged = self
                .state(name)
                .is_some_and(|state| state.config == *config);
            if unchanged {
                continue;
            }

            if self.state(name).is_some() {
                info!(server = %name, "Server configuration changed; reconnecting");
                self.disconnect(name).await;
            }

            // Pre-register the state before any process I/O so observers
            // never find a configured server absent mid-connect.
            {
                let mut states = self.states.write().expect("server state lock");
                states.insert(name.clone(), ServerState::connecting(config.clone()));
            }

            let manager = Arc::clone(self);
            let name = name.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                manager.connect(name, config).await;
            }));
        }

        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                warn!(%err, "Server connect task panicked");
            }
        }
    }

    /// Disconnects every configured server. Used at shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        self.reload(&HashMap::new()).await;
    }

    async fn connect(self: &Arc<Self>, name: String, config: ServerConfig) {
        let mut outcome = self.connect_pipeline(&name, &config).await;
        if outcome.is_err() && config.auto_reconnect {
            warn!(server = %name, "Connect failed; retrying once (auto_reconnect)");
            // The failed attempt may have left a live subprocess behind; kill
            // it before spawning another.
            self.drop_transport(&name).await;
            outcome = self.connect_pipeline(&name, &config).await;
        }

        match outcome {
            Ok(summary) => {
                let tool_count = summary.registered_tools.len();
                let state_updated = {
                    let mut states = self.states.write().expect("server state lock");
                    match states.get_mut(&name) {
                        Some(state) => {
                            state.status = ServerStatus::Connected;
                            state.error = None;
                            state.connected_at = Some(Utc::now());
                            state.instructions = summary.instructions;
                            state.tool_count = tool_count;
                            state.resource_count = summary.resource_count;
                            state.prompt_count = summary.prompt_count;
                            state.registered_tools = summary.registered_tools.clone();
                            true
                        }
                        None => false,
                    }
                };

                if !state_updated {
                    // A disconnect removed the server while this connect was
                    // in flight; roll back everything the pipeline installed.
                    info!(server = %name, "Server removed mid-connect; rolling back");
                    for tool in &summary.registered_tools {
                        self.registry.unregister(tool);
                    }
                    {
                        let mut catalog = self.resources.write().expect("resource catalog lock");
                        catalog.remove(&name);
                    }
                    {
                        let mut catalog = self.prompts.write().expect("prompt catalog lock");
                        catalog.remove(&name);
                    }
                    self.drop_transport(&name).await;
                    return;
                }

                info!(server = %name, tools = tool_count, "Capability server connected");
                self.emit(ServerEventKind::Connected, &name, None);
            }
            Err(err) => {
                warn!(server = %name, %err, "Capability server connect failed");
                self.drop_transport(&name).await;
                {
                    let mut states = self.states.write().expect("server state lock");
                    if let Some(state) = states.get_mut(&name) {
                        state.status = ServerStatus::Error;
                        state.error = Some(err.to_string());
                    }
                }
                self.emit(ServerEventKind::Error, &name, Some(err.to_string()));
            }
        }
    }

    /// Open transport, handshake, discover tools then resources then prompts,
    /// adapt and register each tool. Only tool discovery failure blocks
    /// reaching `connected`; resource and prompt discovery are best-effort.
    async fn connect_pipeline(
        self: &Arc<Self>,
        name: &str,
        config: &ServerConfig,
    ) -> Result<ConnectSummary, TransportError> {
        let (process, notices) = ServerProcess::spawn(config).await?;
        let process = Arc::new(process);
        {
            let mut transports = self.transports.lock().expect("transport map lock");
            transports.insert(name.to_string(), Arc::clone(&process));
        }

        let instructions = process.initialize().await?;
        let tools = process.list_tools().await?;

        let resources = match process.list_resources().await {
            Ok(resources) => resources,
            Err(err) => {
                debug!(server = %name, %err, "Resource discovery unavailable");
                Vec::new()
            }
        };
        let prompts = match process.list_prompts().await {
            Ok(prompts) => prompts,
            Err(err) => {
                debug!(server = %name, %err, "Prompt discovery unavailable");
                Vec::new()
            }
        };

        let registered_tools = self.register_remote_tools(name, &process, tools);
        let resource_count = resources.len();
        let prompt_count = prompts.len();
        {
            let mut catalog = self.resources.write().expect("resource catalog lock");
            catalog.insert(name.to_string(), resources);
        }
        {
            let mut catalog = self.prompts.write().expect("prompt catalog lock");
            catalog.insert(name.to_string(), prompts);
        }

        let manager = Arc::clone(self);
        let watched = name.to_string();
        let transport = Arc::clone(&process);
        tokio::spawn(async move {
            manager.watch_transport(watched, transport, notices).await;
        });

        Ok(ConnectSummary {
            instructions,
            registered_tools,
            resource_count,
            prompt_count,
        })
    }

    fn register_remote_tools(
        &self,
        server: &str,
        transport: &Arc<ServerProcess>,
        specs: Vec<RemoteToolSpec>,
    ) -> Vec<String> {
        let mut registered = Vec::with_capacity(specs.len());
        for spec in specs {
            let tool = RemoteTool::new(server.to_string(), spec, Arc::clone(transport));
            let name = tool.spec.name.clone();
            // Replacing registration: the same server republishing a name on
            // reconnect or refresh must not trip the duplicate check.
            self.registry.register_replacing(Arc::new(tool));
            registered.push(name);
        }
        registered
    }

    /// Reacts to transport notices for a connected server: catalog change
    /// notifications re-run tool discovery, an unexpected close degrades the
    /// server to `error` and pulls its tools.
    async fn watch_transport(
        self: Arc<Self>,
        name: String,
        transport: Arc<ServerProcess>,
        mut notices: UnboundedReceiver<TransportNotice>,
    ) {
        while let Some(notice) = notices.recv().await {
            match notice {
                TransportNotice::ToolsChanged => {
                    debug!(server = %name, "Server announced tool catalog change");
                    match transport.list_tools().await {
                        Ok(specs) => {
                            let previous = self
                                .state(&name)
                                .map(|state| state.registered_tools)
                                .unwrap_or_default();
                            let registered =
                                self.register_remote_tools(&name, &transport, specs);
                            for stale in previous.iter().filter(|t| !registered.contains(t)) {
                                self.registry.unregister(stale);
                            }
                            {
                                let mut states =
                                    self.states.write().expect("server state lock");
                                if let Some(state) = states.get_mut(&name) {
                                    state.tool_count = registered.len();
                                    state.registered_tools = registered;
                                }
                            }
                            self.emit(ServerEventKind::ToolsUpdated, &name, None);
                        }
                        Err(err) => {
                            warn!(server = %name, %err, "Failed to refresh tool catalog");
                        }
                    }
                }
                TransportNotice::Closed => {
                    // A deliberate disconnect removes the state first; only an
                    // unexpected close still finds it here.
                    if self.state(&name).is_none() {
                        break;
                    }
                    warn!(server = %name, "Capability server transport closed unexpectedly");
                    let registered = {
                        let mut states = self.states.write().expect("server state lock");
                        match states.get_mut(&name) {
                            Some(state) => {
                                state.status = ServerStatus::Error;
                                state.error = Some("transport closed".to_string());
                                std::mem::take(&mut state.registered_tools)
                            }
                            None => Vec::new(),
                        }
                    };
                    for tool in &registered {
                        self.registry.unregister(tool);
                    }
                    self.drop_transport(&name).await;
                    self.emit(
                        ServerEventKind::Error,
                        &name,
                        Some("transport closed".to_string()),
                    );
                    break;
                }
            }
        }
    }

    /// Full teardown for one server: tools out of the registry, catalogs
    /// dropped, transport closed, state removed.
    pub async fn disconnect(&self, name: &str) {
        let state = {
            let mut states = self.states.write().expect("server state lock");
            states.remove(name)
        };
        if let Some(state) = &state {
            for tool in &state.registered_tools {
                self.registry.unregister(tool);
            }
        }
        {
            let mut catalog = self.resources.write().expect("resource catalog lock");
            catalog.remove(name);
        }
        {
            let mut catalog = self.prompts.write().expect("prompt catalog lock");
            catalog.remove(name);
        }
        self.drop_transport(name).await;
        if state.is_some() {
            info!(server = %name, "Capability server disconnected");
            self.emit(ServerEventKind::Disconnected, name, None);
        }
    }

    fn transport(&self, name: &str) -> Option<Arc<ServerProcess>> {
        self.transports
            .lock()
            .expect("transport map lock")
            .get(name)
            .cloned()
    }

    async fn drop_transport(&self, name: &str) {
        let transport = {
            let mut transports = self.transports.lock().expect("transport map lock");
            transports.remove(name)
        };
        if let Some(transport) = transport {
            transport.shutdown().await;
        }
    }

    fn emit(&self, kind: ServerEventKind, server: &str, detail: Option<String>) {
        let _ = self.events.send(ServerEvent {
            kind,
            server: server.to_string(),
            detail,
        });
    }
}

/// Adapter wrapping a round trip to the owning server. The registry treats it
/// like any other tool.
struct RemoteTool {
    server: String,
    description: String,
    spec: RemoteToolSpec,
    transport: Arc<ServerProcess>,
}

impl RemoteTool {
    fn new(server: String, spec: RemoteToolSpec, transport: Arc<ServerProcess>) -> Self {
        let description = spec.description.clone().unwrap_or_else(|| {
            format!("Tool provided by capability server '{server}'")
        });
        Self {
            server,
            description,
            spec,
            transport,
        }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.spec
            .input_schema
            .clone()
            .unwrap_or_else(|| json!({ "type": "object" }))
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolFailure> {
        let result = self.transport.call_tool(&self.spec.name, arguments).await?;
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_error {
            return Err(Box::new(RemoteToolError {
                server: self.server.clone(),
                tool: self.spec.name.clone(),
                message: extract_error_message(&result),
            }));
        }
        Ok(Value::String(flatten_content(&result)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::application::registry::{RegistryError, ToolCall};
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    // A capability server faked with /bin/sh: request ids are deterministic
    // ("req-1", "req-2", ...) so a canned line-per-request script suffices.
    const SCRIPTED_SERVER: &str = r##"
read line; echo '{"jsonrpc":"2.0","id":"req-1","result":{"instructions":"prefer remote_echo"}}'
read line
read line; echo '{"jsonrpc":"2.0","id":"req-2","result":{"tools":[{"name":"remote_echo","description":"Echo text back","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}'
read line; echo '{"jsonrpc":"2.0","id":"req-3","result":{"resources":[{"uri":"mem://greeting","description":"a greeting"}]}}'
read line; echo '{"jsonrpc":"2.0","id":"req-4","result":{"prompts":[]}}'
read line; echo '{"jsonrpc":"2.0","id":"req-5","result":{"content":[{"type":"text","text":"pong"}],"isError":false}}'
read line; echo '{"jsonrpc":"2.0","id":"req-6","result":{"content":[{"type":"text","text":"boom"}],"isError":true}}'
cat >/dev/null
"##;

    fn scripted_config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            command: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), SCRIPTED_SERVER.to_string()],
            env: HashMap::new(),
            workdir: None,
            timeout_secs: Some(5),
            auto_reconnect: false,
        }
    }

    fn hanging_config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            command: PathBuf::from("/bin/sleep"),
            args: vec!["5".to_string()],
            env: HashMap::new(),
            workdir: None,
            timeout_secs: Some(1),
            auto_reconnect: false,
        }
    }

    fn broken_config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            command: PathBuf::from("/nonexistent/capability-server"),
            args: Vec::new(),
            env: HashMap::new(),
            workdir: None,
            timeout_secs: Some(1),
            auto_reconnect: false,
        }
    }

    fn manager() -> (Arc<ServerManager>, Arc<ToolRegistry>) {
        let registry = Arc::new(ToolRegistry::new());
        (Arc::new(ServerManager::new(Arc::clone(&registry))), registry)
    }

    #[tokio::test]
    async fn state_is_preregistered_before_connect_resolves() {
        let (manager, _registry) = manager();
        let mut target = HashMap::new();
        target.insert("slow".to_string(), hanging_config("slow"));

        let reload_manager = Arc::clone(&manager);
        let reload = tokio::spawn(async move {
            reload_manager.reload(&target).await;
        });

        // Give reload a beat to take the server on; its connect cannot have
        // resolved because the fake server never answers the handshake.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = manager.state("slow").expect("state present mid-connect");
        assert_eq!(state.status, ServerStatus::Connecting);

        reload.await.expect("reload completes");
        let state = manager.state("slow").expect("state survives failure");
        assert_eq!(state.status, ServerStatus::Error);
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn connects_discovers_and_registers_tools() {
        let (manager, registry) = manager();
        let mut events = manager.subscribe();
        let mut target = HashMap::new();
        target.insert("echo".to_string(), scripted_config("echo"));

        manager.reload(&target).await;

        let state = manager.state("echo").expect("state exists");
        assert_eq!(state.status, ServerStatus::Connected);
        assert_eq!(state.tool_count, 1);
        assert_eq!(state.resource_count, 1);
        assert_eq!(state.prompt_count, 0);
        assert_eq!(state.registered_tools, vec!["remote_echo".to_string()]);
        assert_eq!(state.instructions.as_deref(), Some("prefer remote_echo"));
        assert!(state.connected_at.is_some());
        assert!(registry.contains("remote_echo"));
        assert_eq!(manager.resources("echo").len(), 1);

        let event = events.recv().await.expect("connected event");
        assert_eq!(event.kind, ServerEventKind::Connected);
        assert_eq!(event.server, "echo");

        // Round trip through the registry: validated, dispatched, flattened.
        let result = registry
            .execute(&ToolCall {
                id: "call-1".into(),
                name: "remote_echo".into(),
                arguments: json!({ "text": "ping" }),
            })
            .await
            .expect("remote call succeeds");
        assert_eq!(result, json!("pong"));

        // The scripted server answers the next call with isError=true.
        let err = registry
            .execute(&ToolCall {
                id: "call-2".into(),
                name: "remote_echo".into(),
                arguments: json!({ "text": "ping" }),
            })
            .await
            .expect_err("remote error surfaces");
        match err {
            RegistryError::ToolExecution { tool, source } => {
                assert_eq!(tool, "remote_echo");
                assert!(source.to_string().contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn disconnect_removes_tools_and_catalogs() {
        let (manager, registry) = manager();
        let mut target = HashMap::new();
        target.insert("echo".to_string(), scripted_config("echo"));
        manager.reload(&target).await;
        assert!(registry.contains("remote_echo"));

        // An empty target set means full teardown.
        manager.reload(&HashMap::new()).await;

        assert!(manager.state("echo").is_none());
        assert!(!registry.contains("remote_echo"));
        assert!(manager.resources("echo").is_empty());
        assert!(manager.prompts("echo").is_empty());

        let err = registry
            .execute(&ToolCall {
                id: "call-1".into(),
                name: "remote_echo".into(),
                arguments: json!({ "text": "ping" }),
            })
            .await
            .expect_err("tool is gone");
        assert!(matches!(err, RegistryError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn connect_failures_are_isolated_per_server() {
        let (manager, registry) = manager();
        let mut target = HashMap::new();
        target.insert("echo".to_string(), scripted_config("echo"));
        target.insert("bad".to_string(), broken_config("bad"));

        manager.reload(&target).await;

        let good = manager.state("echo").expect("good server state");
        assert_eq!(good.status, ServerStatus::Connected);
        assert!(registry.contains("remote_echo"));

        let bad = manager.state("bad").expect("bad server state");
        assert_eq!(bad.status, ServerStatus::Error);
        assert!(bad.error.as_deref().is_some_and(|e| e.contains("spawn")));
    }

    #[tokio::test]
    async fn failed_auto_reconnect_leaves_no_live_processes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_log = dir.path().join("pids");
        // Each attempt records its pid and then hangs past the timeout, so
        // both the first attempt and the retry must be killed.
        let script = format!("echo $$ >> {}; sleep 30", pid_log.display());
        let config = ServerConfig {
            name: "stuck".to_string(),
            command: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script],
            env: HashMap::new(),
            workdir: None,
            timeout_secs: Some(1),
            auto_reconnect: true,
        };

        let (manager, _registry) = manager();
        let mut target = HashMap::new();
        target.insert("stuck".to_string(), config);
        manager.reload(&target).await;

        let state = manager.state("stuck").expect("state");
        assert_eq!(state.status, ServerStatus::Error);

        let pids: Vec<String> = std::fs::read_to_string(&pid_log)
            .expect("pid log written")
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(pids.len(), 2, "both connect attempts should have spawned");
        for pid in &pids {
            let alive = std::process::Command::new("kill")
                .args(["-0", pid])
                .status()
                .expect("kill probe runs")
                .success();
            assert!(!alive, "server process {pid} should have been killed");
        }
    }

    #[tokio::test]
    async fn connect_rolls_back_when_server_was_removed_mid_flight() {
        let (manager, registry) = manager();

        // No pre-registered state: this is what a connect task finds when a
        // disconnect removed the server while the pipeline was in flight.
        manager
            .connect("echo".to_string(), scripted_config("echo"))
            .await;

        assert!(manager.state("echo").is_none());
        assert!(!registry.contains("remote_echo"));
        assert!(manager.resources("echo").is_empty());
        assert!(manager.prompts("echo").is_empty());
        assert!(manager.transport("echo").is_none());
    }

    #[tokio::test]
    async fn unchanged_config_is_left_alone_on_reload() {
        let (manager, _registry) = manager();
        let mut target = HashMap::new();
        target.insert("echo".to_string(), scripted_config("echo"));
        manager.reload(&target).await;
        let first = manager.state("echo").expect("state");
        let connected_at = first.connected_at;

        manager.reload(&target).await;
        let second = manager.state("echo").expect("state");
        assert_eq!(second.connected_at, connected_at);
    }
}
