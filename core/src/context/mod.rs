//! Execution context.

mod flow_context;

pub use flow_context::FlowContext;
