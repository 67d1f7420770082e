pub mod app;
pub mod breaker;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod idempotency;
pub mod llm;
pub mod parse;
pub mod ratelimit;
pub mod route;
pub mod serdes;
pub mod server;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod types;

// Crate-wide prelude. Modules import this with `use crate::*`.
pub use std::collections::HashMap;

pub use anyhow::Context as _;
pub use gateway_core::prelude::*;
pub use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use crate::config::Config;
pub use crate::serdes::*;
