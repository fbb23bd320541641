//! Classes and abstract types.

use super::ObjectRef;
use super::heap::Heap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Index of a class in the [`ClassTable`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(pub usize);

/// A class known to the runtime.
#[derive(Debug, Clone, Serialize)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    /// The class object itself, compared against an instance's class word.
    pub raw: ObjectRef,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    /// Interface-only classes have no instances of their own.
    pub is_interface: bool,
    pub num_type_parameters: usize,
}

impl Class {
    pub fn has_type_arguments(&self) -> bool {
        self.num_type_parameters > 0
    }
}

/// A class declaration handed over by the front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDecl {
    pub name: String,
    #[serde(default)]
    pub super_class: Option<ClassId>,
    #[serde(default)]
    pub interfaces: Vec<ClassId>,
    #[serde(default)]
    pub is_interface: bool,
    #[serde(default)]
    pub num_type_parameters: usize,
}

impl ClassDecl {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            super_class: None,
            interfaces: Vec::new(),
            is_interface: false,
            num_type_parameters: 0,
        }
    }

    pub fn extends(mut self, super_class: ClassId) -> Self {
        self.super_class = Some(super_class);
        self
    }

    pub fn implements(mut self, interface: ClassId) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn interface(mut self) -> Self {
        self.is_interface = true;
        self
    }

    pub fn type_parameters(mut self, count: usize) -> Self {
        self.num_type_parameters = count;
        self
    }
}

/// Ids of the classes of the core library.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreClasses {
    pub object: ClassId,
    pub null: ClassId,
    pub num: ClassId,
    pub int: ClassId,
    pub smi: ClassId,
    pub string_interface: ClassId,
    pub one_byte_string: ClassId,
    pub bool_interface: ClassId,
    pub bool_class: ClassId,
    pub list_interface: ClassId,
    pub object_array: ClassId,
    pub growable_object_array: ClassId,
    pub type_arguments: ClassId,
    pub type_class: ClassId,
    pub field: ClassId,
    pub function: ClassId,
    pub ic_data: ClassId,
}

/// Table of every class the compiler may reference.
#[derive(Debug, Clone)]
pub struct ClassTable {
    classes: Vec<Class>,
    by_name: HashMap<String, ClassId>,
    core: CoreClasses,
}

impl ClassTable {
    /// Build the table with the core library registered.
    ///
    /// Class objects are allocated in `heap`, which must not have any
    /// classes yet.
    pub(super) fn bootstrap(heap: &mut Heap) -> Self {
        let mut table = ClassTable {
            classes: Vec::new(),
            by_name: HashMap::new(),
            core: CoreClasses::default(),
        };

        let object = table.register(heap, &ClassDecl::new("Object"));
        let sub = |name: &str| ClassDecl::new(name).extends(object);
        let null = table.register(heap, &sub("Null"));
        let num = table.register(heap, &sub("num").interface());
        let int = table.register(heap, &sub("int").interface().implements(num));
        let smi = table.register(heap, &sub("Smi").implements(int));
        let string_interface = table.register(heap, &sub("String").interface());
        let one_byte_string =
            table.register(heap, &sub("OneByteString").implements(string_interface));
        let bool_interface = table.register(heap, &sub("bool").interface());
        let bool_class = table.register(heap, &sub("Bool").implements(bool_interface));
        let list_interface =
            table.register(heap, &sub("List").interface().type_parameters(1));
        let object_array = table.register(
            heap,
            &sub("ObjectArray").implements(list_interface).type_parameters(1),
        );
        let growable_object_array = table.register(
            heap,
            &sub("GrowableObjectArray").implements(list_interface).type_parameters(1),
        );
        let type_arguments = table.register(heap, &sub("TypeArguments"));
        let type_class = table.register(heap, &sub("Type"));
        let field = table.register(heap, &sub("Field"));
        let function = table.register(heap, &sub("Function"));
        let ic_data = table.register(heap, &sub("ICData"));

        table.core = CoreClasses {
            object,
            null,
            num,
            int,
            smi,
            string_interface,
            one_byte_string,
            bool_interface,
            bool_class,
            list_interface,
            object_array,
            growable_object_array,
            type_arguments,
            type_class,
            field,
            function,
            ic_data,
        };
        table
    }

    /// Register a class and allocate its class object.
    pub fn register(&mut self, heap: &mut Heap, decl: &ClassDecl) -> ClassId {
        let id = ClassId(self.classes.len());
        let raw = heap.allocate_class(id, &decl.name);
        self.classes.push(Class {
            id,
            name: decl.name.clone(),
            raw,
            super_class: decl.super_class,
            interfaces: decl.interfaces.clone(),
            is_interface: decl.is_interface,
            num_type_parameters: decl.num_type_parameters,
        });
        self.by_name.insert(decl.name.clone(), id);
        id
    }

    pub fn core(&self) -> &CoreClasses {
        &self.core
    }

    pub fn get(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.0)
    }

    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Class> {
        self.classes.iter()
    }

    /// Whether instances of `cls` are instances of `other`, following super
    /// classes and implemented interfaces.
    pub fn is_subclass_of(&self, cls: ClassId, other: ClassId) -> bool {
        let mut pending = vec![cls];
        let mut seen = HashSet::new();
        while let Some(current) = pending.pop() {
            if current == other {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(class) = self.get(current) {
                pending.extend(class.super_class);
                pending.extend(class.interfaces.iter().copied());
            }
        }
        false
    }
}

/// A type as written in the program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbstractType {
    Dynamic,
    Type {
        class: ClassId,
        #[serde(default)]
        arguments: Option<TypeArguments>,
    },
    TypeParameter {
        index: usize,
        name: String,
    },
}

impl AbstractType {
    pub fn class(class: ClassId) -> Self {
        AbstractType::Type { class, arguments: None }
    }

    pub fn parameterized(class: ClassId, arguments: Vec<AbstractType>) -> Self {
        AbstractType::Type {
            class,
            arguments: Some(TypeArguments(arguments)),
        }
    }

    /// Whether the type is free of type parameters.
    pub fn is_instantiated(&self) -> bool {
        match self {
            AbstractType::Dynamic => true,
            AbstractType::Type { arguments, .. } => {
                arguments.as_ref().is_none_or(TypeArguments::is_instantiated)
            }
            AbstractType::TypeParameter { .. } => false,
        }
    }

    pub fn type_class(&self) -> Option<ClassId> {
        match self {
            AbstractType::Type { class, .. } => Some(*class),
            _ => None,
        }
    }

    pub fn arguments(&self) -> Option<&TypeArguments> {
        match self {
            AbstractType::Type { arguments, .. } => arguments.as_ref(),
            _ => None,
        }
    }

    /// Every object is an instance of the top types.
    pub fn is_top(&self, core: &CoreClasses) -> bool {
        match self {
            AbstractType::Dynamic => true,
            AbstractType::Type { class, .. } => *class == core.object,
            AbstractType::TypeParameter { .. } => false,
        }
    }

    /// A parameterized class used without (or with only dynamic) arguments.
    pub fn is_raw(&self) -> bool {
        self.arguments()
            .is_none_or(|arguments| arguments.is_dynamic_types(arguments.len()))
    }
}

/// A type argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeArguments(pub Vec<AbstractType>);

impl TypeArguments {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_instantiated(&self) -> bool {
        self.0.iter().all(AbstractType::is_instantiated)
    }

    /// Whether the first `len` arguments are all `Dynamic`.
    pub fn is_dynamic_types(&self, len: usize) -> bool {
        self.0.len() >= len && self.0[..len].iter().all(|t| *t == AbstractType::Dynamic)
    }

    /// Whether argument `i` is type parameter `i` for every `i`, so the
    /// instantiator vector itself can serve as the instantiated vector.
    pub fn is_uninstantiated_identity(&self) -> bool {
        !self.0.is_empty()
            && self.0.iter().enumerate().all(|(position, t)| {
                matches!(t, AbstractType::TypeParameter { index, .. } if *index == position)
            })
    }
}
