//! Control-flow primitives that compose steps: conditional branch, bounded
//! loop, data-dependent router and concurrent fan-out.

pub mod condition;
pub mod loops;
pub mod parallel;
pub mod router;

pub use condition::Condition;
pub use loops::Loop;
pub use parallel::Parallel;
pub use router::{Choice, Choices, Router};
