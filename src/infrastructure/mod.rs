//! Infrastructure layer: LLM transport, tool servers, persistence,
//! knowledge retrieval, configuration and logging.

pub mod config;
pub mod knowledge;
pub mod llm;
pub mod logging;
pub mod persistence;
pub mod tools;
