//! Core module: leaf data structures untuk connection engine
//!
//! Prinsip desain:
//! - No dangling: object direferensikan lewat generational handle
//! - No bypass: call depth hanya bisa naik/turun lewat RAII guard
//! - No allocation failure di enqueue: node pool pre-allocated

mod arena;
mod guard;
mod node_pool;

pub use arena::{Arena, Handle};
pub use guard::{CallDepth, DepthGuard};
pub use node_pool::NodePool;
