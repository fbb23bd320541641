//! Canonical heap image.
//!
//! Generated code embeds object references as 64-bit immediates, so every
//! object the compiler names must already live at a stable address. The
//! heap hands out those addresses and keeps the words of each object so a
//! loader (or a test harness) can materialize the image.

use super::types::{AbstractType, ClassId, ClassTable, CoreClasses, TypeArguments};
use super::{Object, ObjectRef, layout, smi_raw};
use std::collections::HashMap;

const OBJECT_ALIGNMENT: u64 = 16;

/// What a heap object represents.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    Class { id: ClassId, name: String },
    Null,
    Bool(bool),
    Symbol(String),
    ArgumentsDescriptor { count: usize, names: Vec<String> },
    TypeArguments(TypeArguments),
    Type(AbstractType),
    Function { name: String },
    Field { name: String },
    IcData { target_name: String, argument_count: usize, checked_arguments: usize },
}

/// One allocated object, class word first.
#[derive(Debug, Clone)]
pub struct HeapObject {
    pub address: ObjectRef,
    pub kind: ObjectKind,
    pub words: Vec<u64>,
}

#[derive(Debug)]
pub struct Heap {
    next: u64,
    objects: Vec<HeapObject>,
    index: HashMap<ObjectRef, usize>,
    class_objects: Vec<ObjectRef>,
    core: CoreClasses,
    null: ObjectRef,
    true_object: ObjectRef,
    false_object: ObjectRef,
    symbols: HashMap<String, ObjectRef>,
    descriptors: HashMap<(usize, Vec<String>), ObjectRef>,
    functions: HashMap<String, ObjectRef>,
    fields: HashMap<String, ObjectRef>,
    types: HashMap<AbstractType, ObjectRef>,
    type_arguments: HashMap<TypeArguments, ObjectRef>,
}

impl Heap {
    /// Create a heap starting at `base` together with the core class table.
    pub fn bootstrap(base: u64) -> (Heap, ClassTable) {
        let mut heap = Heap {
            next: base.next_multiple_of(OBJECT_ALIGNMENT),
            objects: Vec::new(),
            index: HashMap::new(),
            class_objects: Vec::new(),
            core: CoreClasses::default(),
            null: ObjectRef(0),
            true_object: ObjectRef(0),
            false_object: ObjectRef(0),
            symbols: HashMap::new(),
            descriptors: HashMap::new(),
            functions: HashMap::new(),
            fields: HashMap::new(),
            types: HashMap::new(),
            type_arguments: HashMap::new(),
        };
        let classes = ClassTable::bootstrap(&mut heap);
        heap.core = *classes.core();

        heap.null = heap.allocate(heap.core.null, ObjectKind::Null, vec![]);
        heap.true_object = heap.allocate(heap.core.bool_class, ObjectKind::Bool(true), vec![1]);
        heap.false_object = heap.allocate(heap.core.bool_class, ObjectKind::Bool(false), vec![0]);
        (heap, classes)
    }

    fn allocate(&mut self, class: ClassId, kind: ObjectKind, body: Vec<u64>) -> ObjectRef {
        let class_word = self.class_objects.get(class.0).map_or(0, |c| c.0);
        self.allocate_with_class_word(class_word, kind, body)
    }

    fn allocate_with_class_word(&mut self, class_word: u64, kind: ObjectKind, body: Vec<u64>) -> ObjectRef {
        let address = ObjectRef(self.next + layout::HEAP_OBJECT_TAG as u64);
        let mut words = Vec::with_capacity(body.len() + 1);
        words.push(class_word);
        words.extend(body);
        let size = (words.len() as u64 * layout::WORD_SIZE as u64).next_multiple_of(OBJECT_ALIGNMENT);
        self.next += size;
        self.index.insert(address, self.objects.len());
        self.objects.push(HeapObject { address, kind, words });
        address
    }

    pub(super) fn allocate_class(&mut self, id: ClassId, name: &str) -> ObjectRef {
        let raw = self.allocate_with_class_word(
            0,
            ObjectKind::Class {
                id,
                name: name.to_string(),
            },
            vec![],
        );
        debug_assert_eq!(self.class_objects.len(), id.0);
        self.class_objects.push(raw);
        raw
    }

    pub fn null(&self) -> ObjectRef {
        self.null
    }

    pub fn true_object(&self) -> ObjectRef {
        self.true_object
    }

    pub fn false_object(&self) -> ObjectRef {
        self.false_object
    }

    pub fn bool_object(&self, value: bool) -> ObjectRef {
        if value { self.true_object } else { self.false_object }
    }

    /// The word generated code uses for a constant.
    pub fn raw(&self, object: Object) -> i64 {
        match object {
            Object::Null => self.null.raw(),
            Object::Bool(value) => self.bool_object(value).raw(),
            Object::Smi(value) => smi_raw(value),
            Object::Ref(r) => r.raw(),
        }
    }

    /// Canonical symbol for `name`.
    pub fn symbol(&mut self, name: &str) -> ObjectRef {
        if let Some(symbol) = self.symbols.get(name) {
            return *symbol;
        }
        let body = vec![smi_raw(name.len() as i64) as u64];
        let symbol = self.allocate(self.core.one_byte_string, ObjectKind::Symbol(name.to_string()), body);
        self.symbols.insert(name.to_string(), symbol);
        symbol
    }

    /// Canonical arguments descriptor for a call site.
    ///
    /// Named arguments are the last `names.len()` of `count`, in call order.
    /// The descriptor lists them sorted by name, each paired with its
    /// position, and is terminated by null.
    pub fn arguments_descriptor(&mut self, count: usize, names: &[String]) -> ObjectRef {
        let key = (count, names.to_vec());
        if let Some(descriptor) = self.descriptors.get(&key) {
            return *descriptor;
        }
        let positional = count.saturating_sub(names.len());
        let mut named: Vec<(&String, usize)> =
            names.iter().enumerate().map(|(i, name)| (name, positional + i)).collect();
        named.sort();

        let mut elements = vec![smi_raw(count as i64) as u64, smi_raw(positional as i64) as u64];
        for (name, position) in named {
            elements.push(self.symbol(name).0);
            elements.push(smi_raw(position as i64) as u64);
        }
        elements.push(self.null.0);

        let mut body = vec![self.null.0, smi_raw(elements.len() as i64) as u64];
        body.extend(elements);
        let descriptor = self.allocate(
            self.core.object_array,
            ObjectKind::ArgumentsDescriptor {
                count,
                names: names.to_vec(),
            },
            body,
        );
        self.descriptors.insert(key, descriptor);
        descriptor
    }

    /// Fresh inline cache for one call site.
    pub fn ic_data(&mut self, target_name: &str, argument_count: usize, checked_arguments: usize) -> ObjectRef {
        let body = vec![
            self.symbol(target_name).0,
            smi_raw(argument_count as i64) as u64,
            smi_raw(checked_arguments as i64) as u64,
        ];
        self.allocate(
            self.core.ic_data,
            ObjectKind::IcData {
                target_name: target_name.to_string(),
                argument_count,
                checked_arguments,
            },
            body,
        )
    }

    pub fn function(&mut self, name: &str) -> ObjectRef {
        if let Some(function) = self.functions.get(name) {
            return *function;
        }
        let body = vec![self.symbol(name).0];
        let function = self.allocate(
            self.core.function,
            ObjectKind::Function {
                name: name.to_string(),
            },
            body,
        );
        self.functions.insert(name.to_string(), function);
        function
    }

    /// Field object; static fields keep their value at
    /// [`layout::FIELD_VALUE_OFFSET`].
    pub fn field(&mut self, name: &str) -> ObjectRef {
        if let Some(field) = self.fields.get(name) {
            return *field;
        }
        let body = vec![self.symbol(name).0, self.null.0];
        let field = self.allocate(
            self.core.field,
            ObjectKind::Field {
                name: name.to_string(),
            },
            body,
        );
        self.fields.insert(name.to_string(), field);
        field
    }

    pub fn type_object(&mut self, ty: &AbstractType) -> ObjectRef {
        if let Some(object) = self.types.get(ty) {
            return *object;
        }
        let class_word = ty
            .type_class()
            .and_then(|class| self.class_objects.get(class.0))
            .map_or(self.null.0, |raw| raw.0);
        let arguments = match ty.arguments() {
            Some(arguments) => self.type_arguments(arguments).0,
            None => self.null.0,
        };
        let object = self.allocate(self.core.type_class, ObjectKind::Type(ty.clone()), vec![class_word, arguments]);
        self.types.insert(ty.clone(), object);
        object
    }

    pub fn type_arguments(&mut self, arguments: &TypeArguments) -> ObjectRef {
        if let Some(object) = self.type_arguments.get(arguments) {
            return *object;
        }
        let mut body = vec![smi_raw(arguments.len() as i64) as u64];
        for ty in &arguments.0 {
            body.push(self.type_object(ty).0);
        }
        let object = self.allocate(
            self.core.type_arguments,
            ObjectKind::TypeArguments(arguments.clone()),
            body,
        );
        self.type_arguments.insert(arguments.clone(), object);
        object
    }

    pub fn get(&self, address: ObjectRef) -> Option<&HeapObject> {
        self.index.get(&address).map(|i| &self.objects[*i])
    }

    pub fn objects(&self) -> impl Iterator<Item = &HeapObject> {
        self.objects.iter()
    }

    /// Every word of the image as `(untagged address, value)`.
    pub fn image(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.objects.iter().flat_map(|object| {
            let start = object.address.untagged();
            object
                .words
                .iter()
                .enumerate()
                .map(move |(i, word)| (start + i as u64 * layout::WORD_SIZE as u64, *word))
        })
    }

    /// First address past the image.
    pub fn end(&self) -> u64 {
        self.next
    }
}
