//! Low-level mechanism for the heterogeneous-memory allocator interposer:
//! the header protocol, concrete backends, statistics, the call-stack
//! cache, the module map, and process configuration. Business logic that
//! must stay free of raw pointers (classification, routing) lives in
//! `flexmem-core`; the `extern "C"` front end lives in `flexmem-abi`.

pub mod backend;
pub mod backends;
pub mod cache;
pub mod config;
pub mod error;
pub mod header;
pub mod module_map;
pub mod platform;
pub mod prebuffer;
pub mod registry;
pub mod report;
pub mod stats;

pub use backend::Backend;
pub use error::{BackendError, ConfigError};
pub use header::{BackendId, Header, NO_BACKEND};
pub use registry::Registry;
