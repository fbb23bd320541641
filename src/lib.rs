//! flowjit - a baseline x86-64 code generator for flow graphs
//!
//! The compiler turns one function's flow graph into x86-64 machine code
//! with a PC descriptor table. Functions it cannot lower are reported as
//! bailouts so that another tier can run them.

pub mod config;
pub mod driver;
pub mod il;
pub mod jit;
pub mod runtime;

// Re-export commonly used types
pub use config::{CompilerConfig, ConfigError, OutputFormat};
pub use driver::{CompilationUnit, CompileOutcome, Driver, DriverError};
pub use il::{FlowGraph, ParsedFunction};
pub use jit::{CompileError, CompiledFunction, compile};
pub use runtime::{CompilerContext, Heap, Runtime};
