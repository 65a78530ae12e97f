pub mod component;
pub mod context;
pub mod error;
pub mod events;
pub mod expression;
pub mod git;
pub mod node;
pub mod recorder;
pub mod rerun;
pub mod resource;
pub mod result;
pub mod run;
pub mod runner;
pub mod template;
pub mod validation;

/// Every value flowing between nodes (inputs, outputs, outcomes, bindings) is JSON.
pub type NodeValue = serde_json::Value;
