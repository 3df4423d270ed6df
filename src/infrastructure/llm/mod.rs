//! LLM transport.

pub mod client;
pub mod salvage;

pub use client::HttpLlmClient;
pub use salvage::salvage_json;
