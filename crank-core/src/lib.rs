//! crank core library: event keys, handler specs, payloads, config loading.
//!
//! Public API surface:
//! - [`types`]: newtypes, handler specs and event payloads
//! - [`error`]: [`ConfigError`]
//! - [`config`]: load / save / example config

pub mod config;
pub mod error;
pub mod types;

pub use error::ConfigError;
pub use types::{
    Config, EventKey, HandlerMode, HandlerSpec, LocationInfo, Payload, Section, ServiceInfo,
    SourceKind,
};
