//! RemoteWiz: a remote-control gateway for a coding-agent CLI.
//!
//! Chat clients send free-form prompts naming a configured project; the
//! gateway runs one fresh Agent CLI subprocess per prompt inside the
//! project's working directory, streams and summarizes the result, gates
//! sensitive actions behind human approval, and persists everything durably.
//!
//! The crate is the execution engine; client transports plug in through
//! [`channels::ChannelAdapter`] and call in through [`gateway::Gateway`].

pub mod channels;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod redact;
pub mod settings;
pub mod uploads;

pub use channels::{AdapterBus, ApprovalPrompt, ChannelAdapter, TaskUpdate};
pub use config::{Config, EngineConfig, ProjectConfig, ProjectsConfig};
pub use db::Database;
pub use engine::Engine;
pub use error::Error;
pub use gateway::{ApprovalAction, EnqueueRequest, Gateway};
pub use settings::Settings;
