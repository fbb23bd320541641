//! The explicit compilation context.

use super::heap::Heap;
use super::stubs::{StubCode, StubTable};
use super::types::{ClassDecl, ClassId, ClassTable};
use crate::config::CompilerConfig;
use crate::il::ParsedFunction;
use serde::{Deserialize, Serialize};

/// Process-wide runtime tables, read-only while compiling.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub classes: ClassTable,
    pub stubs: StubCode,
    pub allocation_stubs: StubTable,
    /// Address of the word holding the current stack limit.
    pub stack_limit_address: u64,
}

impl Runtime {
    pub const HEAP_BASE: u64 = 0x1000_0000;
    pub const STACK_LIMIT_ADDRESS: u64 = 0x3000_0000;
    pub const STUB_BASE: u64 = 0x4000_0000;
    pub const ALLOCATION_STUB_BASE: u64 = 0x4800_0000;

    /// Runtime with the core library and a fresh heap.
    pub fn bootstrap() -> (Runtime, Heap) {
        let (heap, classes) = Heap::bootstrap(Self::HEAP_BASE);
        let mut allocation_stubs = StubTable::with_base(Self::ALLOCATION_STUB_BASE);
        for class in classes.iter().filter(|class| !class.is_interface) {
            allocation_stubs.add_allocation_stub(class);
        }
        let runtime = Runtime {
            classes,
            stubs: StubCode::with_base(Self::STUB_BASE),
            allocation_stubs,
            stack_limit_address: Self::STACK_LIMIT_ADDRESS,
        };
        (runtime, heap)
    }

    /// Register a class; concrete classes also get an allocation stub.
    pub fn register_class(&mut self, heap: &mut Heap, decl: &ClassDecl) -> ClassId {
        let id = self.classes.register(heap, decl);
        if !decl.is_interface {
            if let Some(class) = self.classes.get(id) {
                self.allocation_stubs.add_allocation_stub(class);
            }
        }
        id
    }

    /// Label for any stub address, for listings.
    pub fn stub_label(&self, address: u64) -> Option<String> {
        self.stubs
            .label(address)
            .or_else(|| self.allocation_stubs.label(address).map(str::to_string))
    }
}

/// Where the instantiator type arguments of the function being compiled
/// live at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstantiatorSource {
    /// A frame slot, `[rbp + index * 8]`.
    Local { index: i32 },
    /// A field of the receiver held in a frame slot.
    ReceiverField { receiver_index: i32, offset: i32 },
}

/// Resolves the generic context of a function.
pub trait InstantiatorResolver {
    fn instantiator(&self, function: &ParsedFunction) -> Option<InstantiatorSource>;
}

/// Resolver for code without generic context; every query fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInstantiator;

impl InstantiatorResolver for NoInstantiator {
    fn instantiator(&self, _function: &ParsedFunction) -> Option<InstantiatorSource> {
        None
    }
}

/// Resolver that answers from the function's own declaration.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclaredInstantiator;

impl InstantiatorResolver for DeclaredInstantiator {
    fn instantiator(&self, function: &ParsedFunction) -> Option<InstantiatorSource> {
        function.instantiator
    }
}

/// Everything one compilation reads from its environment.
pub struct CompilerContext<'a> {
    pub config: &'a CompilerConfig,
    pub runtime: &'a Runtime,
    /// Canonical objects are interned on demand.
    pub heap: &'a mut Heap,
    pub resolver: &'a dyn InstantiatorResolver,
}

impl<'a> CompilerContext<'a> {
    pub fn new(config: &'a CompilerConfig, runtime: &'a Runtime, heap: &'a mut Heap) -> Self {
        CompilerContext {
            config,
            runtime,
            heap,
            resolver: &DeclaredInstantiator,
        }
    }

    pub fn with_resolver(mut self, resolver: &'a dyn InstantiatorResolver) -> Self {
        self.resolver = resolver;
        self
    }
}
