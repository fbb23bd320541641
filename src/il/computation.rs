//! Computations: the operations a block instruction evaluates.

use super::function::LocalVariable;
use crate::runtime::{AbstractType, ClassId, Object, TypeArguments};
use serde::{Deserialize, Serialize};

/// An operand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// A stack slot holding a previously bound result.
    Temp(usize),
    Constant(Object),
}

impl Value {
    pub fn temp_index(&self) -> Option<usize> {
        match self {
            Value::Temp(index) => Some(*index),
            Value::Constant(_) => None,
        }
    }
}

/// Source position of a computation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    #[serde(default)]
    pub node_id: Option<usize>,
    #[serde(default)]
    pub token_index: usize,
}

impl Site {
    pub fn new(node_id: usize, token_index: usize) -> Self {
        Site {
            node_id: Some(node_id),
            token_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrictKind {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Computation {
    /// Materialize a value in the result register.
    Use {
        #[serde(default)]
        site: Site,
        value: Value,
    },
    CurrentContext {
        #[serde(default)]
        site: Site,
    },
    InstanceCall {
        #[serde(default)]
        site: Site,
        function_name: String,
        arguments: Vec<Value>,
        #[serde(default)]
        argument_names: Vec<String>,
        checked_argument_count: usize,
    },
    StaticCall {
        #[serde(default)]
        site: Site,
        function_name: String,
        arguments: Vec<Value>,
        #[serde(default)]
        argument_names: Vec<String>,
    },
    /// `arguments` starts with the closure; `context` holds the saved
    /// context, pushed below them.
    ClosureCall {
        #[serde(default)]
        site: Site,
        context: Value,
        arguments: Vec<Value>,
        #[serde(default)]
        argument_names: Vec<String>,
    },
    NativeCall {
        #[serde(default)]
        site: Site,
        name: String,
        native_function: u64,
        argument_count: usize,
        #[serde(default)]
        has_optional_parameters: bool,
    },
    LoadLocal {
        #[serde(default)]
        site: Site,
        local: LocalVariable,
    },
    StoreLocal {
        #[serde(default)]
        site: Site,
        local: LocalVariable,
        value: Value,
    },
    LoadInstanceField {
        #[serde(default)]
        site: Site,
        instance: Value,
        field_name: String,
        offset_in_bytes: i32,
    },
    StoreInstanceField {
        #[serde(default)]
        site: Site,
        instance: Value,
        value: Value,
        field_name: String,
        offset_in_bytes: i32,
    },
    LoadStaticField {
        #[serde(default)]
        site: Site,
        field_name: String,
    },
    StoreStaticField {
        #[serde(default)]
        site: Site,
        field_name: String,
        value: Value,
    },
    StoreIndexed {
        #[serde(default)]
        site: Site,
        array: Value,
        index: Value,
        value: Value,
    },
    InstanceSetter {
        #[serde(default)]
        site: Site,
        field_name: String,
        receiver: Value,
        value: Value,
    },
    /// `kind` is spelled `compare` in JSON; `kind` is the variant tag.
    StrictCompare {
        #[serde(default)]
        site: Site,
        #[serde(rename = "compare")]
        kind: StrictKind,
        left: Value,
        right: Value,
    },
    BooleanNegate {
        #[serde(default)]
        site: Site,
        value: Value,
    },
    InstanceOf {
        #[serde(default)]
        site: Site,
        value: Value,
        #[serde(rename = "type")]
        ty: AbstractType,
        #[serde(default)]
        negate_result: bool,
    },
    AssertAssignable {
        #[serde(default)]
        site: Site,
        value: Value,
        dst_type: AbstractType,
        dst_name: String,
    },
    AllocateObject {
        #[serde(default)]
        site: Site,
        class: ClassId,
        #[serde(default)]
        arguments: Vec<Value>,
    },
    CreateArray {
        #[serde(default)]
        site: Site,
        elements: Vec<Value>,
        #[serde(default)]
        type_arguments: Option<TypeArguments>,
    },
    CreateClosure {
        #[serde(default)]
        site: Site,
        function_name: String,
        #[serde(default)]
        signature_has_type_arguments: bool,
        #[serde(default)]
        is_implicit_instance_closure: bool,
    },
    Throw {
        #[serde(default)]
        site: Site,
        exception: Value,
    },
    ReThrow {
        #[serde(default)]
        site: Site,
        exception: Value,
        stack_trace: Value,
    },
    NativeLoadField {
        #[serde(default)]
        site: Site,
        value: Value,
        offset_in_bytes: i32,
    },
    ExtractFactoryTypeArguments {
        #[serde(default)]
        site: Site,
        instantiator: Value,
        type_arguments: TypeArguments,
    },
    ExtractConstructorTypeArguments {
        #[serde(default)]
        site: Site,
        instantiator: Value,
        type_arguments: TypeArguments,
    },
    ExtractConstructorInstantiator {
        #[serde(default)]
        site: Site,
        value: Value,
        instantiator: Value,
        type_arguments: TypeArguments,
    },
}

impl Computation {
    pub fn name(&self) -> &'static str {
        match self {
            Computation::Use { .. } => "Use",
            Computation::CurrentContext { .. } => "CurrentContext",
            Computation::InstanceCall { .. } => "InstanceCall",
            Computation::StaticCall { .. } => "StaticCall",
            Computation::ClosureCall { .. } => "ClosureCall",
            Computation::NativeCall { .. } => "NativeCall",
            Computation::LoadLocal { .. } => "LoadLocal",
            Computation::StoreLocal { .. } => "StoreLocal",
            Computation::LoadInstanceField { .. } => "LoadInstanceField",
            Computation::StoreInstanceField { .. } => "StoreInstanceField",
            Computation::LoadStaticField { .. } => "LoadStaticField",
            Computation::StoreStaticField { .. } => "StoreStaticField",
            Computation::StoreIndexed { .. } => "StoreIndexed",
            Computation::InstanceSetter { .. } => "InstanceSetter",
            Computation::StrictCompare { .. } => "StrictCompare",
            Computation::BooleanNegate { .. } => "BooleanNegate",
            Computation::InstanceOf { .. } => "InstanceOf",
            Computation::AssertAssignable { .. } => "AssertAssignable",
            Computation::AllocateObject { .. } => "AllocateObject",
            Computation::CreateArray { .. } => "CreateArray",
            Computation::CreateClosure { .. } => "CreateClosure",
            Computation::Throw { .. } => "Throw",
            Computation::ReThrow { .. } => "ReThrow",
            Computation::NativeLoadField { .. } => "NativeLoadField",
            Computation::ExtractFactoryTypeArguments { .. } => "ExtractFactoryTypeArguments",
            Computation::ExtractConstructorTypeArguments { .. } => "ExtractConstructorTypeArguments",
            Computation::ExtractConstructorInstantiator { .. } => "ExtractConstructorInstantiator",
        }
    }
}
