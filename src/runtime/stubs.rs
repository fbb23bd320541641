//! Stub and runtime entry addresses.

use super::types::{Class, ClassId};
use serde::Serialize;
use std::collections::HashMap;

/// Runtime functions reachable through the call-to-runtime stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RuntimeEntry {
    Instanceof,
    Throw,
    ReThrow,
    ClosureArgumentMismatch,
    StackOverflow,
    InstantiateTypeArguments,
    TraceFunctionEntry,
    TraceFunctionExit,
}

impl RuntimeEntry {
    pub const ALL: [RuntimeEntry; 8] = [
        RuntimeEntry::Instanceof,
        RuntimeEntry::Throw,
        RuntimeEntry::ReThrow,
        RuntimeEntry::ClosureArgumentMismatch,
        RuntimeEntry::StackOverflow,
        RuntimeEntry::InstantiateTypeArguments,
        RuntimeEntry::TraceFunctionEntry,
        RuntimeEntry::TraceFunctionExit,
    ];

    /// Number of stack arguments the entry expects.
    pub fn argument_count(self) -> usize {
        match self {
            RuntimeEntry::Instanceof => 4,
            RuntimeEntry::Throw => 1,
            RuntimeEntry::ReThrow => 2,
            RuntimeEntry::ClosureArgumentMismatch => 0,
            RuntimeEntry::StackOverflow => 0,
            RuntimeEntry::InstantiateTypeArguments => 2,
            RuntimeEntry::TraceFunctionEntry => 1,
            RuntimeEntry::TraceFunctionExit => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RuntimeEntry::Instanceof => "Instanceof",
            RuntimeEntry::Throw => "Throw",
            RuntimeEntry::ReThrow => "ReThrow",
            RuntimeEntry::ClosureArgumentMismatch => "ClosureArgumentMismatch",
            RuntimeEntry::StackOverflow => "StackOverflow",
            RuntimeEntry::InstantiateTypeArguments => "InstantiateTypeArguments",
            RuntimeEntry::TraceFunctionEntry => "TraceFunctionEntry",
            RuntimeEntry::TraceFunctionExit => "TraceFunctionExit",
        }
    }
}

/// Entry points of the shared stubs.
#[derive(Debug, Clone)]
pub struct StubCode {
    pub call_to_runtime: u64,
    pub one_arg_check_inline_cache: u64,
    pub two_args_check_inline_cache: u64,
    pub call_static_function: u64,
    pub call_closure_function: u64,
    pub call_native_cfunction: u64,
    pub call_no_such_method_function: u64,
    pub allocate_array: u64,
    pub fix_callers_target: u64,
    runtime_entries: [u64; RuntimeEntry::ALL.len()],
}

impl StubCode {
    /// Distance between two consecutive entries laid out by [`StubCode::with_base`].
    pub const ENTRY_SPACING: u64 = 0x40;

    /// Lay stubs out at fixed spacing from `base`, followed by the runtime
    /// entries.
    pub fn with_base(base: u64) -> Self {
        let at = |slot: u64| base + slot * Self::ENTRY_SPACING;
        let mut runtime_entries = [0; RuntimeEntry::ALL.len()];
        for (i, address) in runtime_entries.iter_mut().enumerate() {
            *address = at(9 + i as u64);
        }
        StubCode {
            call_to_runtime: at(0),
            one_arg_check_inline_cache: at(1),
            two_args_check_inline_cache: at(2),
            call_static_function: at(3),
            call_closure_function: at(4),
            call_native_cfunction: at(5),
            call_no_such_method_function: at(6),
            allocate_array: at(7),
            fix_callers_target: at(8),
            runtime_entries,
        }
    }

    pub fn runtime_entry(&self, entry: RuntimeEntry) -> u64 {
        self.runtime_entries[entry as usize]
    }

    /// Human readable name of a stub or runtime entry address.
    pub fn label(&self, address: u64) -> Option<String> {
        let stubs = [
            (self.call_to_runtime, "CallToRuntime"),
            (self.one_arg_check_inline_cache, "OneArgCheckInlineCache"),
            (self.two_args_check_inline_cache, "TwoArgsCheckInlineCache"),
            (self.call_static_function, "CallStaticFunction"),
            (self.call_closure_function, "CallClosureFunction"),
            (self.call_native_cfunction, "CallNativeCFunction"),
            (self.call_no_such_method_function, "CallNoSuchMethodFunction"),
            (self.allocate_array, "AllocateArray"),
            (self.fix_callers_target, "FixCallersTarget"),
        ];
        if let Some((_, name)) = stubs.iter().find(|(a, _)| *a == address) {
            return Some(format!("_stub_{name}"));
        }
        RuntimeEntry::ALL
            .iter()
            .find(|entry| self.runtime_entry(**entry) == address)
            .map(|entry| format!("_runtime_{}", entry.name()))
    }

    /// First address past the stubs and runtime entries.
    pub fn end(&self) -> u64 {
        self.call_to_runtime + (9 + RuntimeEntry::ALL.len() as u64) * Self::ENTRY_SPACING
    }
}

/// An allocation stub: entry address plus a label for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StubEntry {
    pub address: u64,
    pub label: String,
}

/// Allocation stubs keyed by class or closure function.
///
/// The table is filled in by the runtime before compilation starts; the
/// compiler only looks entries up.
#[derive(Debug, Clone)]
pub struct StubTable {
    next: u64,
    classes: HashMap<ClassId, StubEntry>,
    closures: HashMap<String, StubEntry>,
}

impl StubTable {
    pub fn with_base(base: u64) -> Self {
        StubTable {
            next: base,
            classes: HashMap::new(),
            closures: HashMap::new(),
        }
    }

    fn next_address(&mut self) -> u64 {
        let address = self.next;
        self.next += StubCode::ENTRY_SPACING;
        address
    }

    pub fn add_allocation_stub(&mut self, class: &Class) -> StubEntry {
        if let Some(entry) = self.classes.get(&class.id) {
            return entry.clone();
        }
        let entry = StubEntry {
            address: self.next_address(),
            label: format!("_stub_Allocate{}", class.name),
        };
        self.classes.insert(class.id, entry.clone());
        entry
    }

    pub fn add_closure_allocation_stub(&mut self, function_name: &str) -> StubEntry {
        if let Some(entry) = self.closures.get(function_name) {
            return entry.clone();
        }
        let entry = StubEntry {
            address: self.next_address(),
            label: format!("_stub_AllocateClosure_{function_name}"),
        };
        self.closures.insert(function_name.to_string(), entry.clone());
        entry
    }

    pub fn allocation_stub(&self, class: ClassId) -> Option<&StubEntry> {
        self.classes.get(&class)
    }

    pub fn closure_allocation_stub(&self, function_name: &str) -> Option<&StubEntry> {
        self.closures.get(function_name)
    }

    /// Label of any stub in the table at `address`.
    pub fn label(&self, address: u64) -> Option<&str> {
        self.classes
            .values()
            .chain(self.closures.values())
            .find(|entry| entry.address == address)
            .map(|entry| entry.label.as_str())
    }
}
