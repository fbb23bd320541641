//! PC descriptors: call and return sites of compiled code.
//!
//! The compiler appends one descriptor per call, return and patch point
//! while emitting code. The list is finalized once into an immutable,
//! offset-ordered table that stack walkers look pcs up in.

use serde::Serialize;
use std::collections::HashSet;

/// What happens at a descriptor's pc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DescriptorKind {
    /// Inline-cache dispatch.
    IcCall,
    /// Static function call.
    FuncCall,
    /// Function return sequence (patchable by a debugger).
    Return,
    /// Trailing patch point used to redirect callers.
    PatchCode,
    /// Runtime and other stub calls.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PcDescriptor {
    pub kind: DescriptorKind,
    /// Offset from the entry point; for calls this is the return address.
    pub offset: usize,
    pub node_id: Option<usize>,
    pub token_index: usize,
    /// Always `None`: exception regions are not compiled by this tier.
    pub try_index: Option<usize>,
}

/// Append-only descriptor list of one compilation.
#[derive(Debug, Default)]
pub struct DescriptorList {
    descriptors: Vec<PcDescriptor>,
}

impl DescriptorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: DescriptorKind, offset: usize, node_id: Option<usize>, token_index: usize) {
        self.descriptors.push(PcDescriptor {
            kind,
            offset,
            node_id,
            token_index,
            try_index: None,
        });
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Freeze the list for code installed at `entry_point`.
    pub fn finalize(self, entry_point: u64) -> PcDescriptors {
        PcDescriptors {
            entry_point,
            descriptors: self.descriptors,
        }
    }
}

/// Finalized descriptor table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PcDescriptors {
    entry_point: u64,
    descriptors: Vec<PcDescriptor>,
}

impl PcDescriptors {
    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    /// The same table for code moved to `entry_point`.
    pub fn relocated(&self, entry_point: u64) -> PcDescriptors {
        PcDescriptors {
            entry_point,
            descriptors: self.descriptors.clone(),
        }
    }

    /// Absolute pc of a descriptor.
    pub fn pc(&self, descriptor: &PcDescriptor) -> u64 {
        self.entry_point + descriptor.offset as u64
    }

    pub fn iter(&self) -> impl Iterator<Item = &PcDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn count(&self, kind: DescriptorKind) -> usize {
        self.descriptors.iter().filter(|d| d.kind == kind).count()
    }

    /// Descriptor recorded exactly at absolute `pc`.
    pub fn lookup(&self, pc: u64) -> Option<&PcDescriptor> {
        let offset = usize::try_from(pc.checked_sub(self.entry_point)?).ok()?;
        let start = self.descriptors.partition_point(|d| d.offset < offset);
        self.descriptors.get(start).filter(|d| d.offset == offset)
    }

    /// Check the table invariants: pcs never decrease, and an optimizable
    /// function has at most one inline-cache call per node.
    pub fn verify(&self, optimizable: bool) -> Result<(), String> {
        for pair in self.descriptors.windows(2) {
            if pair[1].offset < pair[0].offset {
                return Err(format!(
                    "descriptor at {:#x} follows descriptor at {:#x}",
                    pair[1].offset, pair[0].offset
                ));
            }
        }
        if optimizable {
            let mut seen = HashSet::new();
            for descriptor in self.descriptors.iter().filter(|d| d.kind == DescriptorKind::IcCall) {
                if let Some(node_id) = descriptor.node_id {
                    if !seen.insert(node_id) {
                        return Err(format!("node {node_id} has more than one inline-cache call"));
                    }
                }
            }
        }
        Ok(())
    }
}
