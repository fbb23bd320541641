//! The parsed function: parameters, scope and frame sizes.

use crate::runtime::{InstantiatorSource, Object};
use serde::{Deserialize, Serialize};

/// How optional parameters are passed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionalKind {
    #[default]
    Positional,
    Named,
}

/// An optional parameter with its default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub default_value: Object,
}

/// A variable of the function scope.
///
/// `index` is the frame slot: `[rbp + index * 8]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVariable {
    pub name: String,
    pub index: i32,
    #[serde(default)]
    pub is_captured: bool,
}

impl LocalVariable {
    pub fn new(name: &str, index: i32) -> Self {
        LocalVariable {
            name: name.to_string(),
            index,
            is_captured: false,
        }
    }

    pub fn captured(mut self) -> Self {
        self.is_captured = true;
        self
    }
}

fn default_optimizable() -> bool {
    true
}

/// A function as handed over by the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFunction {
    pub name: String,
    #[serde(default)]
    pub token_index: usize,
    #[serde(default)]
    pub is_closure: bool,
    #[serde(default = "default_optimizable")]
    pub is_optimizable: bool,
    #[serde(default)]
    pub fixed_parameters: Vec<String>,
    #[serde(default)]
    pub optional_parameters: Vec<Parameter>,
    #[serde(default)]
    pub optional_kind: OptionalKind,
    /// Locals and temps living below the frame pointer.
    #[serde(default)]
    pub stack_local_count: usize,
    /// Scope variables, reported verbatim as variable descriptors.
    #[serde(default)]
    pub variables: Vec<LocalVariable>,
    #[serde(default)]
    pub instantiator: Option<InstantiatorSource>,
}

impl ParsedFunction {
    pub fn new(name: &str) -> Self {
        ParsedFunction {
            name: name.to_string(),
            token_index: 0,
            is_closure: false,
            is_optimizable: true,
            fixed_parameters: Vec::new(),
            optional_parameters: Vec::new(),
            optional_kind: OptionalKind::Positional,
            stack_local_count: 0,
            variables: Vec::new(),
            instantiator: None,
        }
    }

    pub fn fixed(mut self, names: &[&str]) -> Self {
        self.fixed_parameters = names.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn optional(mut self, kind: OptionalKind, parameters: &[(&str, Object)]) -> Self {
        self.optional_kind = kind;
        self.optional_parameters = parameters
            .iter()
            .map(|(name, default_value)| Parameter {
                name: name.to_string(),
                default_value: *default_value,
            })
            .collect();
        self
    }

    pub fn closure(mut self) -> Self {
        self.is_closure = true;
        self
    }

    pub fn locals(mut self, count: usize) -> Self {
        self.stack_local_count = count;
        self
    }

    pub fn num_fixed_parameters(&self) -> usize {
        self.fixed_parameters.len()
    }

    pub fn num_optional_parameters(&self) -> usize {
        self.optional_parameters.len()
    }

    pub fn num_parameters(&self) -> usize {
        self.num_fixed_parameters() + self.num_optional_parameters()
    }

    pub fn has_optional_parameters(&self) -> bool {
        !self.optional_parameters.is_empty()
    }

    /// Optional parameters that may be supplied positionally.
    pub fn num_optional_positional_parameters(&self) -> usize {
        match self.optional_kind {
            OptionalKind::Positional => self.num_optional_parameters(),
            OptionalKind::Named => 0,
        }
    }

    /// Parameters copied into the frame by the prologue.
    pub fn copied_parameter_count(&self) -> usize {
        if self.has_optional_parameters() { self.num_parameters() } else { 0 }
    }

    /// Slot of the first stack local, right below the copied parameters.
    pub fn first_stack_local_index(&self) -> i32 {
        -1 - self.copied_parameter_count() as i32
    }

    /// Frame size in words.
    pub fn stack_size(&self) -> usize {
        self.stack_local_count + self.copied_parameter_count()
    }

    /// Name of parameter `position` in the formal parameter list.
    pub fn parameter_name(&self, position: usize) -> Option<&str> {
        let fixed = self.num_fixed_parameters();
        if position < fixed {
            Some(self.fixed_parameters[position].as_str())
        } else {
            self.optional_parameters
                .get(position - fixed)
                .map(|parameter| parameter.name.as_str())
        }
    }
}
