//! The Xenon virtual machine: a 16-bit, word-addressed accumulator machine
//! with an `A`/`D` register pair, a 2051-cell memory map, a 16-deep call
//! stack, and a double-buffered 48x28 pixel framebuffer.

pub mod constants;
pub mod framebuffer;
pub mod memory;
pub mod processor;

pub use framebuffer::Framebuffer;
pub use memory::Memory;
pub use processor::{Processor, RunOutcome, VmFault};
