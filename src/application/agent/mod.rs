mod directive;
mod events;
mod runner;


pub use directive::Directive;
pub use events::{AgentEvent, EventSink};
pub use runner::{
    AgentError, AgentOptions, ChatOutcome, Conversation, MAX_TURNS_MARKER, Orchestrator,
};
