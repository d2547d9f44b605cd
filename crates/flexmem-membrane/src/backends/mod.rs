//! Concrete backend implementations.
//!
//! Two backends ship unconditionally: [`posix::PosixBackend`] (the platform
//! heap, capacity-less, the natural fallback) and
//! [`capacity_pool::CapacityPoolBackend`] (a fixed-capacity arena carved
//! once from the platform heap, standing in for a high-bandwidth or
//! persistent-memory pool — the specific named vendor backends are out of
//! scope; this is the pluggable shape they would implement).
//! [`debug::DebugBackend`] is a wrapper adding canary-byte corruption
//! checks around any other backend.

pub mod capacity_pool;
pub mod debug;
pub mod posix;
