use tokio::sync::mpsc::UnboundedSender;

/// Observational turn events: fire-and-forget, no acknowledgment channel, and
/// never part of control flow.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Thinking {
        turn: usize,
    },
    Thought {
        text: String,
    },
    ToolStart {
        id: String,
        name: String,
    },
    ToolEnd {
        id: String,
        name: String,
        success: bool,
        detail: String,
    },
}

/// Optional outlet for [`AgentEvent`]s. A dropped receiver is silently
/// tolerated; observers can never fail the loop.
#[derive(Clone, Default)]
pub struct EventSink {
    sender: Option<UnboundedSender<AgentEvent>>,
}

impl EventSink {
    pub fn new(sender: UnboundedSender<AgentEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}
