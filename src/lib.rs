//! murmur - coordinator-free persona replies for live group conversations
//!
//! Personas decide for themselves whether to answer a new message. Any
//! number of murmur processes can run against one database: a storage
//! lock per conversation, a cooldown, and two last-message guards make
//! sure at most one persona reply lands per trigger and that personas
//! never reply back-to-back.
//!
//! The daemon is in `main.rs`, the admin CLI in `bin/murmur-admin.rs`.

pub mod backoff;
pub mod completion;
pub mod config;
pub mod context;
pub mod cooldown;
pub mod db;
pub mod feed;
pub mod http;
pub mod lock;
pub mod orchestrator;
pub mod paths;
pub mod scorer;
pub mod telemetry;
pub mod trigger;
