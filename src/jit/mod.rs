//! Baseline x86-64 backend for flow graphs.
//!
//! This module provides:
//! - Code buffer with labels and the x86-64 instruction encoder
//! - PC descriptor tables
//! - The flow-graph compiler: prologue, per-instruction rules, type tests
//! - Executable memory for installing compiled code (`jit` feature)

mod codebuf;
mod codegen;
mod compiler;
mod descriptors;
mod error;
#[cfg(feature = "jit")]
mod memory;
mod prologue;
pub mod x86_64;

pub use codebuf::{CodeBuffer, Distance, Label};
#[cfg(feature = "jit")]
pub use compiler::InstalledFunction;
pub use compiler::{CompileResult, CompiledFunction, ExceptionHandler, FlowGraphCompiler, compile, regs};
pub use descriptors::{DescriptorKind, DescriptorList, PcDescriptor, PcDescriptors};
pub use error::CompileError;
#[cfg(feature = "jit")]
pub use memory::{ExecutableMemory, MemoryError};
