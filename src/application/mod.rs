pub mod agent;
pub mod registry;
pub mod tooling;
