//! Strand kernel: durable workflow instances ("strands"), their call stacks,
//! semaphores and deadlines, the step primitives a Prog returns, and the
//! storage contract the dispatcher drives.

pub mod kernel;

pub use kernel::*;
