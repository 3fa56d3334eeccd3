//! The tool registry is the single gateway between the agent loop and every
//! capability the runtime can exercise. Tools registered here may be local
//! closures over the host environment or adapters round-tripping to a
//! capability server; the registry never inspects those internals.

mod schema;

pub use schema::{CompiledSchema, SchemaViolation};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

pub type ToolFailure = Box<dyn std::error::Error + Send + Sync>;

/// A capability the agent can invoke. Interface dispatch, deliberately not
/// duck typing: filesystem tools, subprocess tools, and remote-protocol tools
/// all implement this one seam.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-Schema-like description of the accepted arguments; compiled into
    /// a validator at registration time.
    fn schema(&self) -> Value;

    async fn execute(&self, arguments: Value) -> Result<Value, ToolFailure>;
}

/// A directive extracted from one model turn. Multiple calls per turn run
/// sequentially in model order; later calls may depend on side effects of
/// earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Summary of a registered tool, used when composing the system prompt.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a tool named '{0}' is already registered")]
    DuplicateName(String),
    #[error("unknown tool requested: {0}")]
    UnknownTool(String),
    #[error("invalid parameters for tool '{tool}': {violation}")]
    InvalidParameters {
        tool: String,
        violation: SchemaViolation,
    },
    #[error("tool '{tool}' failed during execution: {source}")]
    ToolExecution {
        tool: String,
        #[source]
        source: ToolFailure,
    },
}

struct Registered {
    tool: Arc<dyn Tool>,
    validator: Arc<CompiledSchema>,
}

/// Name-to-tool map shared between the orchestrator (lookups, execution) and
/// the capability-server client (registration, removal). The lock is never
/// held across an await; `execute` clones the entry out before invoking it,
/// so a concurrent disconnect can never expose a half-removed tool.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Registered>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        let validator = Arc::new(CompiledSchema::compile(&tool.schema()));
        let mut tools = self.tools.write().expect("tool registry lock");
        if tools.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        debug!(tool = %name, "Registered tool");
        tools.insert(name, Registered { tool, validator });
        Ok(())
    }

    /// The unregister-then-register path used when a capability server
    /// reconnects and republishes a tool under the same name.
    pub fn register_replacing(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let validator = Arc::new(CompiledSchema::compile(&tool.schema()));
        let mut tools = self.tools.write().expect("tool registry lock");
        if tools.insert(name.clone(), Registered { tool, validator }).is_some() {
            debug!(tool = %name, "Replaced existing tool registration");
        } else {
            debug!(tool = %name, "Registered tool");
        }
    }

    /// No-op when the name is absent; used during server disconnect cleanup.
    pub fn unregister(&self, name: &str) {
        let mut tools = self.tools.write().expect("tool registry lock");
        if tools.remove(name).is_some() {
            debug!(tool = %name, "Unregistered tool");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("tool registry lock")
            .contains_key(name)
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().expect("tool registry lock");
        let mut descriptors: Vec<ToolDescriptor> = tools
            .values()
            .map(|entry| ToolDescriptor {
                name: entry.tool.name().to_string(),
                description: entry.tool.description().to_string(),
                schema: entry.tool.schema(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Validated dispatch. Every failure mode from inside the tool body comes
    /// back as `RegistryError::ToolExecution` so the agent loop has a single
    /// failure shape to recover from.
    pub async fn execute(&self, call: &ToolCall) -> Result<Value, RegistryError> {
        let (tool, validator) = {
            let tools = self.tools.read().expect("tool registry lock");
            let Some(entry) = tools.get(&call.name) else {
                warn!(tool = %call.name, "Unknown tool requested");
                return Err(RegistryError::UnknownTool(call.name.clone()));
            };
            (entry.tool.clone(), entry.validator.clone())
        };

        validator
            .validate(&call.arguments)
            .map_err(|violation| RegistryError::InvalidParameters {
                tool: call.name.clone(),
                violation,
            })?;

        tool.execute(call.arguments.clone())
            .await
            .map_err(|source| RegistryError::ToolExecution {
                tool: call.name.clone(),
                source,
            })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) struct StaticTool {
        pub name: String,
        pub schema: Value,
        pub reply: Value,
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "test fixture"
        }

        fn schema(&self) -> Value {
            self.schema.clone()
        }

        async fn execute(&self, _arguments: Value) -> Result<Value, ToolFailure> {
            Ok(self.reply.clone())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }

        async fn execute(&self, _arguments: Value) -> Result<Value, ToolFailure> {
            Err("disk on fire".into())
        }
    }

    fn fixture(name: &str) -> Arc<dyn Tool> {
        Arc::new(StaticTool {
            name: name.to_string(),
            schema: json!({ "type": "object" }),
            reply: json!("ok"),
        })
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ToolRegistry::new();
        registry.register(fixture("fmt")).expect("first registration");
        let err = registry.register(fixture("fmt")).expect_err("second rejected");
        assert!(matches!(err, RegistryError::DuplicateName(name) if name == "fmt"));

        registry.unregister("fmt");
        registry
            .register(fixture("fmt"))
            .expect("registration after unregister succeeds");
    }

    #[test]
    fn unregister_of_absent_name_is_a_noop() {
        let registry = ToolRegistry::new();
        registry.unregister("never-registered");
        assert!(!registry.contains("never-registered"));
    }

    #[tokio::test]
    async fn execute_reports_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute(&ToolCall {
                id: "call-1".into(),
                name: "ghost".into(),
                arguments: json!({}),
            })
            .await
            .expect_err("unknown tool fails");
        assert!(matches!(err, RegistryError::UnknownTool(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn execute_validates_parameters() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(StaticTool {
                name: "read_file".into(),
                schema: json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
                reply: json!("contents"),
            }))
            .expect("register");

        let err = registry
            .execute(&ToolCall {
                id: "call-1".into(),
                name: "read_file".into(),
                arguments: json!({ "path": 42 }),
            })
            .await
            .expect_err("bad arguments rejected");
        assert!(matches!(err, RegistryError::InvalidParameters { .. }));

        let result = registry
            .execute(&ToolCall {
                id: "call-2".into(),
                name: "read_file".into(),
                arguments: json!({ "path": "src/main.rs" }),
            })
            .await
            .expect("valid arguments accepted");
        assert_eq!(result, json!("contents"));
    }

    #[tokio::test]
    async fn execution_failures_are_wrapped() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool)).expect("register");

        let err = registry
            .execute(&ToolCall {
                id: "call-1".into(),
                name: "broken".into(),
                arguments: json!({}),
            })
            .await
            .expect_err("failure surfaces");
        match err {
            RegistryError::ToolExecution { tool, source } => {
                assert_eq!(tool, "broken");
                assert!(source.to_string().contains("disk on fire"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
