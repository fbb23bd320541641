//! Compilation driver.
//!
//! Loads a compilation unit, sets up the runtime tables it needs and runs
//! the flow-graph compiler. A bailout is an expected outcome here, not an
//! error: the caller decides how to run the function instead.

use crate::config::CompilerConfig;
use crate::il::{FlowGraph, ParsedFunction};
use crate::jit::{CompileError, CompiledFunction, DescriptorKind, compile};
use crate::runtime::{ClassDecl, CompilerContext, Heap, Runtime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid compilation unit {}: {source}", path.display())]
    Unit {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// One function with its flow graph and the classes it refers to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationUnit {
    /// Registered in order after the core library; ids continue from the
    /// last core class.
    #[serde(default)]
    pub classes: Vec<ClassDecl>,
    pub function: ParsedFunction,
    pub graph: FlowGraph,
}

impl CompilationUnit {
    pub fn from_json(content: &str, path: &Path) -> Result<Self, DriverError> {
        serde_json::from_str(content).map_err(|source| DriverError::Unit {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, DriverError> {
        let content = fs::read_to_string(path).map_err(|source| DriverError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content, path)
    }
}

#[derive(Debug)]
pub enum CompileOutcome {
    Compiled(CompiledFunction),
    /// The function must be run by another tier.
    BailedOut { function: String, reason: String },
}

impl CompileOutcome {
    pub fn compiled(&self) -> Option<&CompiledFunction> {
        match self {
            CompileOutcome::Compiled(compiled) => Some(compiled),
            CompileOutcome::BailedOut { .. } => None,
        }
    }
}

/// Owns the runtime tables and the heap shared by the compilations it runs.
pub struct Driver {
    config: CompilerConfig,
    runtime: Runtime,
    heap: Heap,
}

impl Driver {
    pub fn new(config: CompilerConfig) -> Self {
        let (runtime, heap) = Runtime::bootstrap();
        Driver { config, runtime, heap }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Register the unit's classes, then compile its function.
    pub fn compile_unit(&mut self, unit: &CompilationUnit) -> Result<CompileOutcome, DriverError> {
        for decl in &unit.classes {
            let id = self.runtime.register_class(&mut self.heap, decl);
            debug!(class = %decl.name, id = id.0, "registered class");
        }
        self.compile_function(&unit.function, &unit.graph)
    }

    pub fn compile_function(
        &mut self,
        function: &ParsedFunction,
        graph: &FlowGraph,
    ) -> Result<CompileOutcome, DriverError> {
        let mut ctx = CompilerContext::new(&self.config, &self.runtime, &mut self.heap);
        match compile(&mut ctx, function, graph) {
            Ok(compiled) => Ok(CompileOutcome::Compiled(compiled)),
            Err(CompileError::Bailout { function, reason }) => {
                warn!(function = %function, reason = %reason, "bailout");
                Ok(CompileOutcome::BailedOut { function, reason })
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Serialized form of a compilation, as printed by `--format json`.
#[derive(Debug, Serialize)]
pub struct Report<'a> {
    #[serde(flatten)]
    pub function: &'a CompiledFunction,
    pub calls: Vec<CallSite>,
}

/// A call recorded in the descriptor table, with its decoded target.
#[derive(Debug, Serialize)]
pub struct CallSite {
    pub offset: usize,
    pub kind: DescriptorKind,
    pub target: Option<u64>,
    pub label: Option<String>,
}

impl<'a> Report<'a> {
    pub fn new(function: &'a CompiledFunction, runtime: &Runtime) -> Self {
        let calls = function
            .descriptors
            .iter()
            .filter(|descriptor| !matches!(descriptor.kind, DescriptorKind::Return | DescriptorKind::PatchCode))
            .map(|descriptor| {
                let target = function.call_target(descriptor);
                CallSite {
                    offset: descriptor.offset,
                    kind: descriptor.kind,
                    target,
                    label: target.and_then(|address| runtime.stub_label(address)),
                }
            })
            .collect();
        Report { function, calls }
    }
}

/// Listing of a compiled function: hex dump, then the descriptor table.
pub struct Listing<'a> {
    function: &'a CompiledFunction,
    runtime: &'a Runtime,
}

impl<'a> Listing<'a> {
    pub fn new(function: &'a CompiledFunction, runtime: &'a Runtime) -> Self {
        Listing { function, runtime }
    }
}

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let function = self.function;
        writeln!(f, "function `{}`", function.name)?;
        writeln!(f, "  code size:  {} bytes", function.code.len())?;
        writeln!(f, "  frame size: {} bytes", function.frame_size)?;
        writeln!(f)?;

        for (row, chunk) in function.code.chunks(16).enumerate() {
            let bytes: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
            writeln!(f, "{:06x}  {}", row * 16, bytes.join(" "))?;
        }
        writeln!(f)?;

        writeln!(f, "{:<8} {:<10} {:>6} {:>6}  target", "offset", "kind", "node", "token")?;
        for descriptor in function.descriptors.iter() {
            let node = descriptor.node_id.map_or_else(|| "-".to_string(), |id| id.to_string());
            let target = match function.call_target(descriptor) {
                Some(address) => self
                    .runtime
                    .stub_label(address)
                    .unwrap_or_else(|| format!("{address:#x}")),
                None => String::new(),
            };
            writeln!(
                f,
                "{:<8} {:<10} {:>6} {:>6}  {}",
                format!("{:#06x}", descriptor.offset),
                format!("{:?}", descriptor.kind),
                node,
                descriptor.token_index,
                target
            )?;
        }

        if !function.comments.is_empty() {
            writeln!(f)?;
            for (offset, comment) in &function.comments {
                writeln!(f, "{offset:#06x}  ; {comment}")?;
            }
        }
        Ok(())
    }
}

pub fn render_human(function: &CompiledFunction, runtime: &Runtime) -> String {
    Listing::new(function, runtime).to_string()
}
