//! Flow-graph intermediate language consumed by the backend.
//!
//! Values live on an explicit operand stack: a `Bind` pushes its result as
//! a new temp, and consumers pop temps in reverse order of creation.

mod computation;
mod function;

pub use computation::{Computation, Site, StrictKind, Value};
pub use function::{LocalVariable, OptionalKind, Parameter, ParsedFunction};

use serde::{Deserialize, Serialize};

/// Index of a block in [`FlowGraph::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub usize);

/// Entry kind of a block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// A merge point with any number of predecessors.
    Join,
    /// The single successor of a branch or of the graph entry.
    #[default]
    Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    /// Evaluate for effect.
    Do { computation: Computation },
    /// Evaluate and push the result as temp `temp`.
    Bind { temp: usize, computation: Computation },
    /// Push a copy of temp `source`; the copy becomes temp `destination`.
    PickTemp { source: usize, destination: usize },
    /// Overwrite temp `destination` with the top of stack, temp `source`.
    TuckTemp { source: usize, destination: usize },
}

/// How control leaves a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Exit {
    Goto {
        successor: BlockId,
    },
    Return {
        value: Value,
        #[serde(default)]
        token_index: usize,
    },
    /// Take `true_successor` when `value` is the canonical true object.
    Branch {
        value: Value,
        true_successor: BlockId,
        false_successor: BlockId,
    },
}

impl Exit {
    /// Successors in depth-first visiting order: the last one visited is
    /// placed right after the block.
    fn successors(&self) -> Vec<BlockId> {
        match self {
            Exit::Goto { successor } => vec![*successor],
            Exit::Return { .. } => vec![],
            Exit::Branch {
                true_successor,
                false_successor,
                ..
            } => vec![*false_successor, *true_successor],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub kind: BlockKind,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    pub exit: Exit,
}

impl Block {
    pub fn target(instructions: Vec<Instruction>, exit: Exit) -> Self {
        Block {
            kind: BlockKind::Target,
            instructions,
            exit,
        }
    }

    pub fn join(instructions: Vec<Instruction>, exit: Exit) -> Self {
        Block {
            kind: BlockKind::Join,
            instructions,
            exit,
        }
    }
}

/// A function body; block 0 is the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub blocks: Vec<Block>,
}

impl FlowGraph {
    pub fn new(blocks: Vec<Block>) -> Self {
        FlowGraph { blocks }
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0)
    }

    /// Check that every successor names an existing block.
    pub fn validate(&self) -> Result<(), String> {
        if self.blocks.is_empty() {
            return Err("flow graph has no blocks".to_string());
        }
        for (i, block) in self.blocks.iter().enumerate() {
            for successor in block.exit.successors() {
                if successor.0 >= self.blocks.len() {
                    return Err(format!("block B{i} jumps to missing block B{}", successor.0));
                }
            }
        }
        Ok(())
    }

    /// Blocks reachable from the entry in depth-first postorder.
    ///
    /// Emission walks this list back to front, so the entry block comes
    /// first in the code.
    pub fn postorder(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.blocks.len());
        if self.blocks.is_empty() {
            return order;
        }
        let mut visited = vec![false; self.blocks.len()];
        // (block, index of the next successor to visit)
        let mut stack = vec![(BlockId(0), 0)];
        visited[0] = true;

        while let Some(&(block, next)) = stack.last() {
            let successors = self.blocks[block.0].exit.successors();
            match successors.get(next) {
                Some(&successor) => {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    if successor.0 < self.blocks.len() && !visited[successor.0] {
                        visited[successor.0] = true;
                        stack.push((successor, 0));
                    }
                }
                None => {
                    order.push(block);
                    stack.pop();
                }
            }
        }
        order
    }
}
