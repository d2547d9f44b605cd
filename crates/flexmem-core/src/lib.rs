//! Safe business logic for the heterogeneous-memory allocator interposer:
//! call-stack classification and backend routing. Everything that must
//! dereference a raw pointer lives one layer down, in `flexmem-membrane`.

pub mod classifier;
pub mod router;
pub mod rule;

pub use classifier::Classifier;
pub use router::{MinSizeThreshold, Router};
pub use rule::{parse_rule_line, FrameSpec, Rule, RuleStats};
