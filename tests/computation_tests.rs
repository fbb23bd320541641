mod common;

use common::{Exit, Harness, R15, RAX, RBX, RSP, smi};
use flowjit::il::{
    Block, Computation, Exit as BlockExit, FlowGraph, Instruction, LocalVariable, ParsedFunction, Site, StrictKind,
    Value,
};
use flowjit::jit::DescriptorKind;
use flowjit::runtime::{AbstractType, ClassDecl, ClassId, Object, ObjectKind, ObjectRef, RuntimeEntry, TypeArguments};
use flowjit::{CompileError, CompilerConfig};

const OBJECT_ADDRESS: u64 = 0x2000_0000;
const ARRAY_ADDRESS: u64 = 0x2100_0000;

fn bind(temp: usize, computation: Computation) -> Instruction {
    Instruction::Bind { temp, computation }
}

fn effect(computation: Computation) -> Instruction {
    Instruction::Do { computation }
}

fn use_value(temp: usize, object: Object) -> Instruction {
    bind(
        temp,
        Computation::Use {
            site: Site::default(),
            value: Value::Constant(object),
        },
    )
}

fn ret(value: Value) -> BlockExit {
    BlockExit::Return { value, token_index: 0 }
}

fn graph(instructions: Vec<Instruction>, exit: BlockExit) -> FlowGraph {
    FlowGraph::new(vec![Block::target(instructions, exit)])
}

fn load_argument(temp: usize, name: &str, index: i32) -> Instruction {
    bind(
        temp,
        Computation::LoadLocal {
            site: Site::default(),
            local: LocalVariable::new(name, index),
        },
    )
}

fn bailout_reason(result: Result<flowjit::CompiledFunction, CompileError>) -> String {
    match result {
        Err(CompileError::Bailout { reason, .. }) => reason,
        other => panic!("expected a bailout, got {other:?}"),
    }
}

fn identity_arguments(len: usize) -> TypeArguments {
    TypeArguments(
        (0..len)
            .map(|index| AbstractType::TypeParameter {
                index,
                name: format!("T{index}"),
            })
            .collect(),
    )
}

// ==================== Temps and locals ====================

#[test]
fn test_pick_temp_copies_an_older_temp() {
    let mut h = Harness::release();
    let body = graph(
        vec![
            use_value(0, Object::Smi(5)),
            use_value(1, Object::Smi(9)),
            Instruction::PickTemp {
                source: 0,
                destination: 2,
            },
        ],
        ret(Value::Temp(2)),
    );
    let compiled = h.compile(&ParsedFunction::new("pick"), &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    assert_eq!(h.machine(&compiled).invoke(&[], descriptor), Exit::Returned(smi(5)));
}

#[test]
fn test_tuck_temp_overwrites_an_older_temp() {
    let mut h = Harness::new(CompilerConfig::default());
    let body = graph(
        vec![
            use_value(0, Object::Smi(1)),
            use_value(1, Object::Smi(2)),
            Instruction::TuckTemp {
                source: 1,
                destination: 0,
            },
            effect(Computation::Use { site: Site::default(), value: Value::Temp(1) }),
        ],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&ParsedFunction::new("tuck"), &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    assert_eq!(h.machine(&compiled).invoke(&[], descriptor), Exit::Returned(smi(2)));
}

#[test]
fn test_pick_from_above_is_rejected() {
    let mut h = Harness::release();
    let body = graph(
        vec![
            use_value(0, Object::Smi(1)),
            Instruction::PickTemp {
                source: 2,
                destination: 1,
            },
        ],
        ret(Value::Temp(1)),
    );
    let error = h.compile(&ParsedFunction::new("pick"), &body).unwrap_err();
    assert!(matches!(error, CompileError::InvalidGraph { .. }));
}

#[test]
fn test_store_local_then_load() {
    let mut h = Harness::new(CompilerConfig::default());
    let function = ParsedFunction::new("local").locals(1);
    let body = graph(
        vec![
            effect(Computation::StoreLocal {
                site: Site::default(),
                local: LocalVariable::new("v", -1),
                value: Value::Constant(Object::Smi(31)),
            }),
            load_argument(0, "v", -1),
        ],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&function, &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    assert_eq!(h.machine(&compiled).invoke(&[], descriptor), Exit::Returned(smi(31)));
}

#[test]
fn test_captured_locals_bail_out() {
    let mut h = Harness::new(CompilerConfig::default());
    let function = ParsedFunction::new("closure_user").locals(1);
    let load = graph(
        vec![bind(
            0,
            Computation::LoadLocal {
                site: Site::default(),
                local: LocalVariable::new("v", -1).captured(),
            },
        )],
        ret(Value::Temp(0)),
    );
    assert_eq!(bailout_reason(h.compile(&function, &load)), "load of context variable `v`");

    let store = graph(
        vec![effect(Computation::StoreLocal {
            site: Site::default(),
            local: LocalVariable::new("v", -1).captured(),
            value: Value::Constant(Object::Null),
        })],
        ret(Value::Constant(Object::Null)),
    );
    assert_eq!(bailout_reason(h.compile(&function, &store)), "store to context variable `v`");
}

// ==================== Fields ====================

#[test]
fn test_static_field_store_then_load() {
    let mut h = Harness::new(CompilerConfig::default());
    let body = graph(
        vec![
            effect(Computation::StoreStaticField {
                site: Site::default(),
                field_name: "counter".to_string(),
                value: Value::Constant(Object::Smi(7)),
            }),
            bind(
                0,
                Computation::LoadStaticField {
                    site: Site::default(),
                    field_name: "counter".to_string(),
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&ParsedFunction::new("statics"), &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    let field = h.heap.field("counter");
    let mut machine = h.machine(&compiled);
    assert_eq!(machine.invoke(&[], descriptor), Exit::Returned(smi(7)));
    assert_eq!(machine.field(field.0, 16), smi(7));
}

#[test]
fn test_instance_field_store_then_load() {
    let mut h = Harness::new(CompilerConfig::default());
    let function = ParsedFunction::new("fields").fixed(&["p"]);
    let body = graph(
        vec![
            load_argument(0, "p", 2),
            use_value(1, Object::Smi(11)),
            effect(Computation::StoreInstanceField {
                site: Site::default(),
                instance: Value::Temp(0),
                value: Value::Temp(1),
                field_name: "x".to_string(),
                offset_in_bytes: 8,
            }),
            load_argument(0, "p", 2),
            bind(
                0,
                Computation::LoadInstanceField {
                    site: Site::default(),
                    instance: Value::Temp(0),
                    field_name: "x".to_string(),
                    offset_in_bytes: 8,
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&function, &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(1, &[]);
    let mut machine = h.machine(&compiled);
    assert_eq!(machine.invoke(&[OBJECT_ADDRESS + 1], descriptor), Exit::Returned(smi(11)));
    assert_eq!(machine.read(OBJECT_ADDRESS + 8), smi(11));
}

#[test]
fn test_native_load_field() {
    let mut h = Harness::new(CompilerConfig::default());
    let function = ParsedFunction::new("length").fixed(&["list"]);
    let body = graph(
        vec![
            load_argument(0, "list", 2),
            bind(
                0,
                Computation::NativeLoadField {
                    site: Site::default(),
                    value: Value::Temp(0),
                    offset_in_bytes: 16,
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&function, &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(1, &[]);
    let mut machine = h.machine(&compiled);
    machine.write(ARRAY_ADDRESS + 16, smi(4));
    assert_eq!(machine.invoke(&[ARRAY_ADDRESS + 1], descriptor), Exit::Returned(smi(4)));
}

// ==================== Comparisons ====================

#[test]
fn test_strict_compare_of_references() {
    let mut h = Harness::new(CompilerConfig::default());
    let cases = [
        (StrictKind::Eq, Object::Null, Object::Null, true),
        (StrictKind::Ne, Object::Null, Object::Null, false),
        (StrictKind::Eq, Object::Bool(true), Object::Bool(false), false),
        (StrictKind::Ne, Object::Smi(1), Object::Null, true),
    ];
    for (kind, left, right, expected) in cases {
        let body = graph(
            vec![bind(
                0,
                Computation::StrictCompare {
                    site: Site::default(),
                    kind,
                    left: Value::Constant(left),
                    right: Value::Constant(right),
                },
            )],
            ret(Value::Temp(0)),
        );
        let compiled = h.compile(&ParsedFunction::new("compare"), &body).unwrap();
        let descriptor = h.heap.arguments_descriptor(0, &[]);
        let exit = h.machine(&compiled).invoke(&[], descriptor);
        assert_eq!(exit, Exit::Returned(h.raw(Object::Bool(expected))), "{kind:?} {left:?} {right:?}");
    }
}

#[test]
fn test_strict_compare_pops_right_operand_first() {
    let mut h = Harness::new(CompilerConfig::default());
    let function = ParsedFunction::new("same").fixed(&["a", "b"]);
    let body = graph(
        vec![
            load_argument(0, "a", 3),
            load_argument(1, "b", 2),
            bind(
                0,
                Computation::StrictCompare {
                    site: Site::default(),
                    kind: StrictKind::Eq,
                    left: Value::Temp(0),
                    right: Value::Temp(1),
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&function, &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(2, &[]);
    let (t, f) = (h.raw(Object::Bool(true)), h.raw(Object::Bool(false)));
    assert_eq!(h.machine(&compiled).invoke(&[smi(4), smi(4)], descriptor), Exit::Returned(t));
    assert_eq!(h.machine(&compiled).invoke(&[smi(4), smi(5)], descriptor), Exit::Returned(f));
}

#[test]
fn test_boolean_negate() {
    let mut h = Harness::new(CompilerConfig::default());
    for value in [true, false] {
        let body = graph(
            vec![bind(
                0,
                Computation::BooleanNegate {
                    site: Site::default(),
                    value: Value::Constant(Object::Bool(value)),
                },
            )],
            ret(Value::Temp(0)),
        );
        let compiled = h.compile(&ParsedFunction::new("not"), &body).unwrap();
        let descriptor = h.heap.arguments_descriptor(0, &[]);
        let exit = h.machine(&compiled).invoke(&[], descriptor);
        assert_eq!(exit, Exit::Returned(h.raw(Object::Bool(!value))));
    }
}

// ==================== Calls ====================

#[test]
fn test_static_call_passes_function_and_descriptor() {
    let mut h = Harness::new(CompilerConfig::default());
    let body = graph(
        vec![
            use_value(0, Object::Smi(1)),
            use_value(1, Object::Smi(2)),
            bind(
                0,
                Computation::StaticCall {
                    site: Site::new(3, 40),
                    function_name: "add".to_string(),
                    arguments: vec![Value::Temp(0), Value::Temp(1)],
                    argument_names: vec!["y".to_string()],
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&ParsedFunction::new("caller"), &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    let target = h.runtime.stubs.call_static_function;
    let mut machine = h.machine(&compiled);
    machine.on_call(target, |m| m.regs[RAX] = smi(3));
    assert_eq!(machine.invoke(&[], descriptor), Exit::Returned(smi(3)));

    let calls = machine.calls_to(target);
    assert_eq!(calls.len(), 1);
    assert_eq!(&calls[0].stack[..2], &[smi(2), smi(1)]);
    assert_eq!(
        h.heap.get(ObjectRef(calls[0].rbx)).unwrap().kind,
        ObjectKind::Function { name: "add".to_string() }
    );
    assert_eq!(
        h.heap.get(ObjectRef(calls[0].r10)).unwrap().kind,
        ObjectKind::ArgumentsDescriptor {
            count: 2,
            names: vec!["y".to_string()],
        }
    );
    assert_eq!(compiled.descriptors.count(DescriptorKind::FuncCall), 1);
}

#[test]
fn test_instance_call_selects_stub_by_checked_count() {
    let mut h = Harness::release();
    let call = |checked_argument_count: usize| {
        graph(
            vec![
                use_value(0, Object::Smi(1)),
                use_value(1, Object::Smi(2)),
                bind(
                    0,
                    Computation::InstanceCall {
                        site: Site::new(1, 1),
                        function_name: "+".to_string(),
                        arguments: vec![Value::Temp(0), Value::Temp(1)],
                        argument_names: vec![],
                        checked_argument_count,
                    },
                ),
            ],
            ret(Value::Temp(0)),
        )
    };
    let compiled = h.compile(&ParsedFunction::new("plus"), &call(2)).unwrap();
    let ic_call = compiled
        .descriptors
        .iter()
        .find(|d| d.kind == DescriptorKind::IcCall)
        .unwrap();
    assert_eq!(compiled.call_target(ic_call), Some(h.runtime.stubs.two_args_check_inline_cache));

    let reason = bailout_reason(h.compile(&ParsedFunction::new("plus"), &call(3)));
    assert_eq!(reason, "inline cache checking 3 arguments");
}

#[test]
fn test_call_arguments_must_be_consecutive() {
    let mut h = Harness::release();
    let body = graph(
        vec![
            use_value(0, Object::Smi(1)),
            use_value(1, Object::Smi(2)),
            bind(
                0,
                Computation::StaticCall {
                    site: Site::default(),
                    function_name: "f".to_string(),
                    arguments: vec![Value::Temp(1), Value::Temp(0)],
                    argument_names: vec![],
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let error = h.compile(&ParsedFunction::new("bad"), &body).unwrap_err();
    assert!(matches!(error, CompileError::InvalidGraph { .. }));
}

#[test]
fn test_closure_call_restores_the_context() {
    let mut h = Harness::new(CompilerConfig::default());
    let body = graph(
        vec![
            bind(0, Computation::CurrentContext { site: Site::default() }),
            use_value(1, Object::Smi(3)),
            use_value(2, Object::Smi(4)),
            bind(
                0,
                Computation::ClosureCall {
                    site: Site::new(2, 8),
                    context: Value::Temp(0),
                    arguments: vec![Value::Temp(1), Value::Temp(2)],
                    argument_names: vec![],
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&ParsedFunction::new("apply"), &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    let one_argument = h.heap.arguments_descriptor(1, &[]);
    let target = h.runtime.stubs.call_closure_function;

    let mut machine = h.machine(&compiled);
    machine.regs[R15] = 0xC0DE_0001;
    machine.on_call(target, |m| {
        m.regs[R15] = 0xBAD;
        m.regs[RAX] = smi(77);
    });
    assert_eq!(machine.invoke(&[], descriptor), Exit::Returned(smi(77)));
    assert_eq!(machine.regs[R15], 0xC0DE_0001);

    let calls = machine.calls_to(target);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].r10, one_argument.0);
    // closure, argument, saved context
    assert_eq!(&calls[0].stack[..3], &[smi(4), smi(3), 0xC0DE_0001]);
}

#[test]
fn test_closure_call_needs_context_below_closure() {
    let mut h = Harness::release();
    let body = graph(
        vec![
            bind(0, Computation::CurrentContext { site: Site::default() }),
            use_value(1, Object::Null),
            use_value(2, Object::Smi(3)),
            bind(
                0,
                Computation::ClosureCall {
                    site: Site::default(),
                    context: Value::Temp(0),
                    arguments: vec![Value::Temp(2)],
                    argument_names: vec![],
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let error = h.compile(&ParsedFunction::new("apply"), &body).unwrap_err();
    assert!(matches!(error, CompileError::InvalidGraph { .. }));
}

#[test]
fn test_native_call_result_slot() {
    let mut h = Harness::new(CompilerConfig {
        code_comments: true,
        ..CompilerConfig::default()
    });
    let native_function = 0x6100_0000;
    let function = ParsedFunction::new("native").fixed(&["a", "b"]);
    let body = graph(
        vec![bind(
            0,
            Computation::NativeCall {
                site: Site::new(1, 2),
                name: "Native_add".to_string(),
                native_function,
                argument_count: 2,
                has_optional_parameters: false,
            },
        )],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&function, &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(2, &[]);
    let target = h.runtime.stubs.call_native_cfunction;
    let mut machine = h.machine(&compiled);
    machine.on_call(target, |m| {
        let rsp = m.regs[RSP];
        m.write(rsp, smi(12));
        m.regs[RAX] = 0;
    });
    assert_eq!(machine.invoke(&[smi(5), smi(7)], descriptor), Exit::Returned(smi(12)));

    let calls = machine.calls_to(target);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].rbx, native_function);
    assert_eq!(calls[0].r10, 2);
    // RAX points at the first argument.
    assert_eq!(calls[0].rax, common::Machine::argument_address(0));
    assert!(compiled.comments.iter().any(|(_, comment)| comment == "native Native_add"));
}

// ==================== Allocation ====================

#[test]
fn test_allocate_object_calls_the_class_stub() {
    let mut h = Harness::new(CompilerConfig::default());
    let object = h.runtime.classes.core().object;
    let point = h.runtime.register_class(&mut h.heap, &ClassDecl::new("Point").extends(object));
    let body = graph(
        vec![
            use_value(0, Object::Null),
            bind(
                0,
                Computation::AllocateObject {
                    site: Site::new(1, 3),
                    class: point,
                    arguments: vec![Value::Temp(0)],
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&ParsedFunction::new("make"), &body).unwrap();
    let stub = h.runtime.allocation_stubs.allocation_stub(point).unwrap().address;
    assert_eq!(h.runtime.stub_label(stub).as_deref(), Some("_stub_AllocatePoint"));

    let descriptor = h.heap.arguments_descriptor(0, &[]);
    let mut machine = h.machine(&compiled);
    machine.on_call(stub, |m| m.regs[RAX] = OBJECT_ADDRESS + 1);
    assert_eq!(machine.invoke(&[], descriptor), Exit::Returned(OBJECT_ADDRESS + 1));
    assert_eq!(machine.calls_to(stub).len(), 1);
}

#[test]
fn test_allocate_without_stub_bails_out() {
    let mut h = Harness::new(CompilerConfig::default());
    let interface = h.runtime.register_class(&mut h.heap, &ClassDecl::new("Shape").interface());
    let body = |class: ClassId| {
        graph(
            vec![bind(
                0,
                Computation::AllocateObject {
                    site: Site::default(),
                    class,
                    arguments: vec![],
                },
            )],
            ret(Value::Temp(0)),
        )
    };
    let reason = bailout_reason(h.compile(&ParsedFunction::new("make"), &body(interface)));
    assert_eq!(reason, "no allocation stub for class Shape");
    let reason = bailout_reason(h.compile(&ParsedFunction::new("make"), &body(ClassId(999))));
    assert_eq!(reason, "no allocation stub for class #999");
}

#[test]
fn test_create_array_fills_elements() {
    let mut h = Harness::new(CompilerConfig::default());
    let core = *h.runtime.classes.core();
    let element_type = TypeArguments(vec![AbstractType::class(core.int)]);
    let body = graph(
        vec![
            use_value(0, Object::Smi(1)),
            use_value(1, Object::Smi(3)),
            bind(
                0,
                Computation::CreateArray {
                    site: Site::new(1, 4),
                    elements: vec![Value::Temp(0), Value::Constant(Object::Smi(2)), Value::Temp(1)],
                    type_arguments: Some(element_type.clone()),
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let compiled = h.compile(&ParsedFunction::new("literal"), &body).unwrap();
    let vector = h.heap.type_arguments(&element_type);
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    let target = h.runtime.stubs.allocate_array;
    let mut machine = h.machine(&compiled);
    machine.on_call(target, |m| m.regs[RAX] = ARRAY_ADDRESS + 1);
    assert_eq!(machine.invoke(&[], descriptor), Exit::Returned(ARRAY_ADDRESS + 1));

    let calls = machine.calls_to(target);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].r10, smi(3));
    assert_eq!(calls[0].rbx, vector.0);
    let elements: Vec<u64> = (0..3).map(|i| machine.read(ARRAY_ADDRESS + 24 + 8 * i)).collect();
    assert_eq!(elements, vec![smi(1), smi(2), smi(3)]);
}

#[test]
fn test_create_array_rejects_uninstantiated_element_type() {
    let mut h = Harness::release();
    let body = graph(
        vec![bind(
            0,
            Computation::CreateArray {
                site: Site::default(),
                elements: vec![],
                type_arguments: Some(identity_arguments(1)),
            },
        )],
        ret(Value::Temp(0)),
    );
    let error = h.compile(&ParsedFunction::new("literal"), &body).unwrap_err();
    assert!(matches!(error, CompileError::InvalidGraph { .. }));
}

#[test]
fn test_create_closure() {
    let mut h = Harness::new(CompilerConfig {
        code_comments: true,
        ..CompilerConfig::default()
    });
    let body = graph(
        vec![bind(
            0,
            Computation::CreateClosure {
                site: Site::default(),
                function_name: "lambda".to_string(),
                signature_has_type_arguments: false,
                is_implicit_instance_closure: false,
            },
        )],
        ret(Value::Temp(0)),
    );
    let reason = bailout_reason(h.compile(&ParsedFunction::new("outer"), &body));
    assert_eq!(reason, "no allocation stub for closure `lambda`");

    let stub = h.runtime.allocation_stubs.add_closure_allocation_stub("lambda");
    let compiled = h.compile(&ParsedFunction::new("outer"), &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    let mut machine = h.machine(&compiled);
    machine.on_call(stub.address, |m| m.regs[RAX] = OBJECT_ADDRESS + 1);
    assert_eq!(machine.invoke(&[], descriptor), Exit::Returned(OBJECT_ADDRESS + 1));
    assert!(compiled.comments.iter().any(|(_, comment)| *comment == stub.label));
}

// ==================== Exceptions ====================

#[test]
fn test_throw_calls_the_runtime_and_traps() {
    let mut h = Harness::new(CompilerConfig::default());
    let body = graph(
        vec![effect(Computation::Throw {
            site: Site::new(1, 6),
            exception: Value::Constant(Object::Smi(13)),
        })],
        ret(Value::Constant(Object::Null)),
    );
    let compiled = h.compile(&ParsedFunction::new("fail"), &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    let mut machine = h.machine(&compiled);
    assert!(matches!(machine.invoke(&[], descriptor), Exit::Trap { .. }));
    let calls = h.runtime_calls(&machine, RuntimeEntry::Throw);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].stack[0], smi(13));
}

#[test]
fn test_rethrow_is_gated_by_config() {
    let body = graph(
        vec![effect(Computation::ReThrow {
            site: Site::new(1, 6),
            exception: Value::Constant(Object::Smi(13)),
            stack_trace: Value::Constant(Object::Smi(14)),
        })],
        ret(Value::Constant(Object::Null)),
    );

    let mut h = Harness::new(CompilerConfig::default());
    let reason = bailout_reason(h.compile(&ParsedFunction::new("again"), &body));
    assert_eq!(reason, "rethrow is not validated");

    let mut h = Harness::new(CompilerConfig {
        enable_rethrow: true,
        ..CompilerConfig::default()
    });
    let compiled = h.compile(&ParsedFunction::new("again"), &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    let mut machine = h.machine(&compiled);
    assert!(matches!(machine.invoke(&[], descriptor), Exit::Trap { .. }));
    let calls = h.runtime_calls(&machine, RuntimeEntry::ReThrow);
    assert_eq!(calls.len(), 1);
    assert_eq!(&calls[0].stack[..2], &[smi(14), smi(13)]);
    assert_eq!(calls[0].r10, 2);
}

// ==================== Type arguments ====================

fn extract(factory: bool, instantiator: Object, type_arguments: TypeArguments) -> FlowGraph {
    let site = Site::new(1, 9);
    let instantiator = Value::Constant(instantiator);
    let computation = if factory {
        Computation::ExtractFactoryTypeArguments {
            site,
            instantiator,
            type_arguments,
        }
    } else {
        Computation::ExtractConstructorTypeArguments {
            site,
            instantiator,
            type_arguments,
        }
    };
    graph(vec![bind(0, computation)], ret(Value::Temp(0)))
}

fn run_extract(h: &mut Harness, body: &FlowGraph, runtime_answer: u64) -> (u64, usize) {
    let compiled = h.compile(&ParsedFunction::new("extract"), body).unwrap();
    let descriptor = h.heap.arguments_descriptor(0, &[]);
    let entry = h.runtime.stubs.runtime_entry(RuntimeEntry::InstantiateTypeArguments);
    let mut machine = h.machine(&compiled);
    machine.on_call(h.runtime.stubs.call_to_runtime, move |m| {
        if m.regs[RBX] == entry {
            let rsp = m.regs[RSP];
            m.write(rsp + 16, runtime_answer);
        }
    });
    let Exit::Returned(result) = machine.invoke(&[], descriptor) else {
        panic!("extraction did not return");
    };
    let calls = h.runtime_calls(&machine, RuntimeEntry::InstantiateTypeArguments).len();
    (result, calls)
}

#[test]
fn test_null_instantiator_yields_raw_type() {
    let mut h = Harness::new(CompilerConfig::default());
    let null = h.raw(Object::Null);
    for factory in [true, false] {
        let body = extract(factory, Object::Null, identity_arguments(1));
        assert_eq!(run_extract(&mut h, &body, smi(1)), (null, 0));
    }
}

#[test]
fn test_matching_instantiator_is_used_directly() {
    let mut h = Harness::new(CompilerConfig::default());
    let core = *h.runtime.classes.core();
    let instantiator = h.heap.type_arguments(&TypeArguments(vec![AbstractType::class(core.int)]));
    for factory in [true, false] {
        let body = extract(factory, Object::Ref(instantiator), identity_arguments(1));
        assert_eq!(run_extract(&mut h, &body, smi(1)), (instantiator.0, 0));
    }
}

#[test]
fn test_factory_instantiates_through_the_runtime() {
    let mut h = Harness::new(CompilerConfig::default());
    let core = *h.runtime.classes.core();
    let instantiator = h.heap.type_arguments(&TypeArguments(vec![
        AbstractType::class(core.int),
        AbstractType::class(core.num),
    ]));
    let answer = 0x2200_0001;
    let body = extract(true, Object::Ref(instantiator), identity_arguments(1));
    assert_eq!(run_extract(&mut h, &body, answer), (answer, 1));
}

#[test]
fn test_constructor_passes_uninstantiated_vector() {
    let mut h = Harness::new(CompilerConfig::default());
    let core = *h.runtime.classes.core();
    let instantiator = h.heap.type_arguments(&TypeArguments(vec![
        AbstractType::class(core.int),
        AbstractType::class(core.num),
    ]));
    let type_arguments = identity_arguments(1);
    let vector = h.heap.type_arguments(&type_arguments);
    let body = extract(false, Object::Ref(instantiator), type_arguments);
    assert_eq!(run_extract(&mut h, &body, smi(1)), (vector.0, 0));
}

#[test]
fn test_constructor_instantiator() {
    let mut h = Harness::new(CompilerConfig::default());
    let core = *h.runtime.classes.core();
    let matching = h.heap.type_arguments(&TypeArguments(vec![AbstractType::class(core.int)]));
    let longer = h.heap.type_arguments(&TypeArguments(vec![
        AbstractType::class(core.int),
        AbstractType::class(core.num),
    ]));
    let null = h.raw(Object::Null);

    for (instantiator, expected) in [(matching.0, null), (longer.0, longer.0), (null, null)] {
        let body = graph(
            vec![
                use_value(0, Object::Ref(ObjectRef(instantiator))),
                use_value(1, Object::Smi(0)),
                bind(
                    0,
                    Computation::ExtractConstructorInstantiator {
                        site: Site::default(),
                        value: Value::Temp(1),
                        instantiator: Value::Temp(0),
                        type_arguments: identity_arguments(1),
                    },
                ),
            ],
            ret(Value::Temp(0)),
        );
        let compiled = h.compile(&ParsedFunction::new("instantiator"), &body).unwrap();
        let descriptor = h.heap.arguments_descriptor(0, &[]);
        let exit = h.machine(&compiled).invoke(&[], descriptor);
        assert_eq!(exit, Exit::Returned(expected));
    }
}

#[test]
fn test_constructor_instantiator_operand_order() {
    let mut h = Harness::release();
    let body = graph(
        vec![
            use_value(0, Object::Smi(0)),
            use_value(1, Object::Null),
            bind(
                0,
                Computation::ExtractConstructorInstantiator {
                    site: Site::default(),
                    value: Value::Temp(0),
                    instantiator: Value::Temp(1),
                    type_arguments: identity_arguments(1),
                },
            ),
        ],
        ret(Value::Temp(0)),
    );
    let error = h.compile(&ParsedFunction::new("instantiator"), &body).unwrap_err();
    assert!(matches!(error, CompileError::InvalidGraph { .. }));
}

#[test]
fn test_mismatch_handler_receives_the_arguments_descriptor() {
    let mut h = Harness::new(CompilerConfig::default());
    let function = ParsedFunction::new("f")
        .fixed(&["a"])
        .optional(flowjit::il::OptionalKind::Positional, &[("b", Object::Null)]);
    let body = graph(vec![], ret(Value::Constant(Object::Null)));
    let compiled = h.compile(&function, &body).unwrap();
    let descriptor = h.heap.arguments_descriptor(3, &[]);
    let mut machine = h.machine(&compiled);
    machine.invoke(&[smi(1), smi(2), smi(3)], descriptor);
    let calls = machine.calls_to(h.runtime.stubs.call_no_such_method_function);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].r10, descriptor.0);
}
