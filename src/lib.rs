pub mod config;
pub mod context;
pub mod coordinator;
pub mod corrections;
pub mod editing;
pub mod llm;
pub mod plan;
pub mod slots;
pub mod specialists;
pub mod state;
pub mod synthesis;
pub mod workflow;
