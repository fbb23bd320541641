//! Code generation rules for instructions and computations.
//!
//! Every computation leaves its result in RAX; `Bind` pushes it as the
//! next temp. Operands that are temps are popped in reverse order of
//! creation, so a rule loads its last operand first.

use super::codebuf::{Distance, Label};
use super::compiler::{CompileResult, FlowGraphCompiler, frame_slot, regs, smi_imm, words};
use super::descriptors::DescriptorKind;
use super::x86_64::{Address, Cond, Reg};
use crate::il::{Computation, Instruction, LocalVariable, Site, StrictKind, Value};
use crate::runtime::{ClassId, Object, RuntimeEntry, TypeArguments, layout};

/// Selector of the indexed assignment operator.
const ASSIGN_INDEX: &str = "[]=";

fn setter_name(field_name: &str) -> String {
    format!("set:{field_name}")
}

impl FlowGraphCompiler<'_, '_> {
    pub(super) fn visit_instruction(&mut self, instruction: &Instruction) -> CompileResult {
        match instruction {
            Instruction::Do { computation } => self.visit_computation(computation),
            Instruction::Bind { computation, .. } => {
                self.visit_computation(computation)?;
                self.asm().push(regs::RESULT);
                Ok(())
            }
            Instruction::PickTemp { source, destination } => {
                // `destination` is the new top, so `source` is
                // `destination - source - 1` slots below the current top.
                let offset = *destination as i64 - *source as i64 - 1;
                if offset < 0 {
                    return Err(self.invalid(format!("pick of t{source} into t{destination}")));
                }
                self.asm().push_m(Address::new(regs::SP, words(offset as usize)));
                Ok(())
            }
            Instruction::TuckTemp { source, destination } => {
                let offset = *source as i64 - *destination as i64;
                if offset < 0 {
                    return Err(self.invalid(format!("tuck of t{source} into t{destination}")));
                }
                let mut asm = self.asm();
                asm.mov_rm(regs::RESULT, Address::new(regs::SP, 0));
                asm.mov_mr(Address::new(regs::SP, words(offset as usize)), regs::RESULT);
                Ok(())
            }
        }
    }

    fn visit_computation(&mut self, computation: &Computation) -> CompileResult {
        match computation {
            Computation::Use { value, .. } => {
                self.load_value(regs::RESULT, *value);
                Ok(())
            }
            Computation::CurrentContext { .. } => {
                self.asm().mov_rr(regs::RESULT, regs::CTX);
                Ok(())
            }
            Computation::InstanceCall {
                site,
                function_name,
                arguments,
                argument_names,
                checked_argument_count,
            } => {
                self.verify_call_arguments(computation.name(), arguments)?;
                self.emit_instance_call(
                    *site,
                    function_name,
                    arguments.len(),
                    argument_names,
                    *checked_argument_count,
                )
            }
            Computation::StaticCall {
                site,
                function_name,
                arguments,
                argument_names,
            } => {
                self.verify_call_arguments(computation.name(), arguments)?;
                let function = self.ctx.heap.function(function_name);
                let arguments_descriptor = self.ctx.heap.arguments_descriptor(arguments.len(), argument_names);
                self.load_ref(regs::CALL_TARGET, function);
                self.load_ref(regs::ARGS_DESC, arguments_descriptor);
                let target = self.ctx.runtime.stubs.call_static_function;
                self.generate_call(site.token_index, target, DescriptorKind::FuncCall);
                self.asm().add_ri32(regs::SP, words(arguments.len()));
                Ok(())
            }
            Computation::ClosureCall {
                site,
                context,
                arguments,
                argument_names,
            } => self.visit_closure_call(*site, *context, arguments, argument_names),
            Computation::NativeCall {
                site,
                name,
                native_function,
                argument_count,
                has_optional_parameters,
            } => {
                self.comment(format!("native {name}"));
                self.push_object(Object::Null);
                // RAX points to the first argument.
                let first_argument = if *has_optional_parameters {
                    frame_slot(-1)
                } else {
                    frame_slot(1 + *argument_count as i32)
                };
                self.asm().lea(regs::RESULT, first_argument);
                self.asm().mov_ri64(regs::CALL_TARGET, *native_function as i64);
                self.asm().mov_ri(regs::ARGS_DESC, *argument_count as i64);
                let target = self.ctx.runtime.stubs.call_native_cfunction;
                self.generate_call(site.token_index, target, DescriptorKind::Other);
                self.asm().pop(regs::RESULT);
                Ok(())
            }
            Computation::LoadLocal { local, .. } => {
                self.check_local(local, "load of context variable")?;
                self.asm().mov_rm(regs::RESULT, frame_slot(local.index));
                Ok(())
            }
            Computation::StoreLocal { local, value, .. } => {
                self.check_local(local, "store to context variable")?;
                self.load_value(regs::RESULT, *value);
                self.asm().mov_mr(frame_slot(local.index), regs::RESULT);
                Ok(())
            }
            Computation::LoadInstanceField {
                instance,
                offset_in_bytes,
                ..
            } => {
                self.load_value(regs::RESULT, *instance);
                self.asm().mov_rm(regs::RESULT, Address::field(regs::RESULT, *offset_in_bytes));
                Ok(())
            }
            Computation::StoreInstanceField {
                instance,
                value,
                offset_in_bytes,
                ..
            } => {
                self.verify_values(computation.name(), *instance, *value)?;
                self.load_value(regs::OPERAND, *value);
                self.load_value(regs::RESULT, *instance);
                self.asm()
                    .mov_mr(Address::field(regs::RESULT, *offset_in_bytes), regs::OPERAND);
                Ok(())
            }
            Computation::LoadStaticField { field_name, .. } => {
                let field = self.ctx.heap.field(field_name);
                self.load_ref(regs::OPERAND, field);
                self.asm().mov_rm(
                    regs::RESULT,
                    Address::field(regs::OPERAND, layout::FIELD_VALUE_OFFSET),
                );
                Ok(())
            }
            Computation::StoreStaticField { field_name, value, .. } => {
                self.load_value(regs::RESULT, *value);
                let field = self.ctx.heap.field(field_name);
                self.load_ref(regs::OPERAND, field);
                self.asm().mov_mr(
                    Address::field(regs::OPERAND, layout::FIELD_VALUE_OFFSET),
                    regs::RESULT,
                );
                Ok(())
            }
            Computation::StoreIndexed {
                site,
                array,
                index,
                value,
            } => {
                self.verify_call_arguments(computation.name(), &[*array, *index, *value])?;
                // Keep a copy of the value under the arguments as the result.
                let mut asm = self.asm();
                asm.pop(Reg::Rax); // value
                asm.pop(Reg::Rbx); // index
                asm.pop(Reg::Rcx); // receiver
                asm.push(Reg::Rax);
                asm.push(Reg::Rcx);
                asm.push(Reg::Rbx);
                asm.push(Reg::Rax);
                self.emit_instance_call(*site, ASSIGN_INDEX, 3, &[], 1)?;
                self.asm().pop(regs::RESULT);
                Ok(())
            }
            Computation::InstanceSetter {
                site,
                field_name,
                receiver,
                value,
            } => {
                self.verify_call_arguments(computation.name(), &[*receiver, *value])?;
                let mut asm = self.asm();
                asm.pop(Reg::Rax); // value
                asm.pop(Reg::Rbx); // receiver
                asm.push(Reg::Rax);
                asm.push(Reg::Rbx);
                asm.push(Reg::Rax);
                self.emit_instance_call(*site, &setter_name(field_name), 2, &[], 1)?;
                self.asm().pop(regs::RESULT);
                Ok(())
            }
            Computation::StrictCompare { kind, left, right, .. } => {
                self.load_value(regs::OPERAND, *right);
                self.load_value(regs::RESULT, *left);
                self.asm().cmp_rr(regs::RESULT, regs::OPERAND);
                let load_true = self.buf.new_label();
                let done = self.buf.new_label();
                let cond = match kind {
                    StrictKind::Eq => Cond::E,
                    StrictKind::Ne => Cond::Ne,
                };
                self.asm().jcc(cond, load_true, Distance::Near);
                self.load_object(regs::RESULT, Object::Bool(false));
                self.asm().jmp(done, Distance::Near);
                self.asm().bind(load_true);
                self.load_object(regs::RESULT, Object::Bool(true));
                self.asm().bind(done);
                Ok(())
            }
            Computation::BooleanNegate { value, .. } => {
                let done = self.buf.new_label();
                self.load_value(regs::OPERAND, *value);
                self.load_object(regs::RESULT, Object::Bool(true));
                self.asm().cmp_rr(regs::RESULT, regs::OPERAND);
                self.asm().jcc(Cond::Ne, done, Distance::Near);
                self.load_object(regs::RESULT, Object::Bool(false));
                self.asm().bind(done);
                Ok(())
            }
            Computation::InstanceOf {
                site,
                value,
                ty,
                negate_result,
            } => {
                self.load_value(regs::RESULT, *value);
                self.generate_instance_of(*site, ty, *negate_result)
            }
            Computation::AssertAssignable { .. } => Err(self.bailout("assert assignable")),
            Computation::AllocateObject { site, class, arguments } => {
                self.visit_allocate_object(*site, *class, arguments.len())
            }
            Computation::CreateArray {
                site,
                elements,
                type_arguments,
            } => self.visit_create_array(*site, elements, type_arguments.as_ref()),
            Computation::CreateClosure {
                site,
                function_name,
                signature_has_type_arguments,
                is_implicit_instance_closure,
            } => {
                let runtime = self.ctx.runtime;
                let Some(stub) = runtime.allocation_stubs.closure_allocation_stub(function_name) else {
                    return Err(self.bailout(format!("no allocation stub for closure `{function_name}`")));
                };
                let address = stub.address;
                self.comment(stub.label.clone());
                self.generate_call(site.token_index, address, DescriptorKind::Other);
                if *signature_has_type_arguments {
                    self.asm().pop(Reg::Rcx); // type arguments
                }
                if *is_implicit_instance_closure {
                    self.asm().pop(Reg::Rcx); // receiver
                }
                Ok(())
            }
            Computation::Throw { site, exception } => {
                self.load_value(regs::RESULT, *exception);
                self.asm().push(regs::RESULT);
                self.generate_call_runtime(site.node_id, site.token_index, RuntimeEntry::Throw);
                self.asm().int3();
                Ok(())
            }
            Computation::ReThrow {
                site,
                exception,
                stack_trace,
            } => {
                if !self.ctx.config.enable_rethrow {
                    return Err(self.bailout("rethrow is not validated"));
                }
                self.load_value(Reg::Rbx, *stack_trace);
                self.load_value(regs::RESULT, *exception);
                self.asm().push(regs::RESULT);
                self.asm().push(Reg::Rbx);
                self.generate_call_runtime(site.node_id, site.token_index, RuntimeEntry::ReThrow);
                self.asm().int3();
                Ok(())
            }
            Computation::NativeLoadField { value, offset_in_bytes, .. } => {
                self.load_value(regs::RESULT, *value);
                self.asm().mov_rm(regs::RESULT, Address::field(regs::RESULT, *offset_in_bytes));
                Ok(())
            }
            Computation::ExtractFactoryTypeArguments {
                site,
                instantiator,
                type_arguments,
            } => self.visit_extract_type_arguments(*site, *instantiator, type_arguments, true),
            Computation::ExtractConstructorTypeArguments {
                site,
                instantiator,
                type_arguments,
            } => self.visit_extract_type_arguments(*site, *instantiator, type_arguments, false),
            Computation::ExtractConstructorInstantiator {
                value,
                instantiator,
                type_arguments,
                ..
            } => {
                self.verify_values(computation.name(), *instantiator, *value)?;
                self.load_value(Reg::Rcx, *value); // discarded
                self.load_value(regs::RESULT, *instantiator);
                if type_arguments.is_uninstantiated_identity() {
                    // The instantiator was used as the type arguments; the
                    // allocation then needs a null instantiator.
                    let use_instantiator = self.buf.new_label();
                    self.compare_object(regs::RESULT, Object::Null);
                    self.asm().jcc(Cond::E, use_instantiator, Distance::Near);
                    self.check_type_arguments_vector(type_arguments.len(), use_instantiator);
                    self.asm().jcc(Cond::Ne, use_instantiator, Distance::Near);
                    self.load_object(regs::RESULT, Object::Null);
                    self.asm().bind(use_instantiator);
                }
                Ok(())
            }
        }
    }

    /// Locals captured by a closure live in the context, which this tier
    /// does not address.
    fn check_local(&self, local: &LocalVariable, reason: &str) -> CompileResult {
        if local.is_captured {
            return Err(self.bailout(format!("{reason} `{}`", local.name)));
        }
        Ok(())
    }

    fn visit_closure_call(
        &mut self,
        site: Site,
        context: Value,
        arguments: &[Value],
        argument_names: &[String],
    ) -> CompileResult {
        if !matches!(context, Value::Temp(_)) {
            return Err(self.invalid("ClosureCall: saved context is not a temp"));
        }
        let Some(closure) = arguments.first() else {
            return Err(self.invalid("ClosureCall: missing closure argument"));
        };
        self.verify_values("ClosureCall", context, *closure)?;
        self.verify_call_arguments("ClosureCall", arguments)?;

        // The descriptor describes the closure's own arguments.
        let arguments_descriptor = self
            .ctx
            .heap
            .arguments_descriptor(arguments.len() - 1, argument_names);
        self.load_ref(regs::ARGS_DESC, arguments_descriptor);
        let target = self.ctx.runtime.stubs.call_closure_function;
        self.generate_call(site.token_index, target, DescriptorKind::Other);
        self.asm().add_ri32(regs::SP, words(arguments.len()));
        self.asm().pop(regs::CTX);
        Ok(())
    }

    fn visit_allocate_object(&mut self, site: Site, class: ClassId, argument_count: usize) -> CompileResult {
        let runtime = self.ctx.runtime;
        let Some(stub) = runtime.allocation_stubs.allocation_stub(class) else {
            let name = runtime
                .classes
                .get(class)
                .map_or_else(|| format!("#{}", class.0), |class| class.name.clone());
            return Err(self.bailout(format!("no allocation stub for class {name}")));
        };
        let address = stub.address;
        self.comment(stub.label.clone());
        self.generate_call(site.token_index, address, DescriptorKind::Other);
        for _ in 0..argument_count {
            self.asm().pop(Reg::Rcx); // allocation argument
        }
        Ok(())
    }

    fn visit_create_array(
        &mut self,
        site: Site,
        elements: &[Value],
        type_arguments: Option<&TypeArguments>,
    ) -> CompileResult {
        // R10: length, RBX: element type arguments.
        let element_type = match type_arguments {
            Some(arguments) if !arguments.is_instantiated() => {
                return Err(self.invalid("CreateArray: element type is not instantiated"));
            }
            Some(arguments) => self.ctx.heap.type_arguments(arguments),
            None => self.ctx.heap.null(),
        };
        self.asm().mov_ri(regs::ARGS_DESC, smi_imm(elements.len()) as i64);
        self.load_ref(Reg::Rbx, element_type);
        let target = self.ctx.runtime.stubs.allocate_array;
        self.generate_call(site.token_index, target, DescriptorKind::Other);

        // Fill the array in RAX, last element first.
        self.asm()
            .lea(Reg::Rcx, Address::field(regs::RESULT, layout::ARRAY_DATA_OFFSET));
        for (i, element) in elements.iter().enumerate().rev() {
            let slot = Address::new(Reg::Rcx, words(i));
            match element {
                Value::Temp(_) => self.asm().pop_m(slot),
                Value::Constant(_) => {
                    self.load_value(regs::OPERAND, *element);
                    self.asm().mov_mr(slot, regs::OPERAND);
                }
            }
        }
        Ok(())
    }

    /// Compare the class and length of the vector in RAX against a
    /// TypeArguments of `len` entries; flags are set by the length compare.
    /// Jumps to `mismatch` if the class differs.
    fn check_type_arguments_vector(&mut self, len: usize, mismatch: Label) {
        let class = self.ctx.runtime.classes.core().type_arguments;
        let class_object = self.ctx.runtime.classes.get(class).map(|class| class.raw);
        match class_object {
            Some(raw) => self.load_ref(Reg::Rcx, raw),
            None => self.load_object(Reg::Rcx, Object::Null),
        }
        let mut asm = self.asm();
        asm.cmp_rm(Reg::Rcx, Address::field(regs::RESULT, layout::CLASS_OFFSET));
        asm.jcc(Cond::Ne, mismatch, Distance::Near);
        asm.cmp_mi(
            Address::field(regs::RESULT, layout::TYPE_ARGUMENTS_LENGTH_OFFSET),
            smi_imm(len),
        );
    }

    /// Type arguments for an allocation, from the instantiator in RAX.
    ///
    /// A null instantiator leaves null (a raw type). An instantiator that
    /// already is the wanted vector is used as is. Otherwise a factory
    /// instantiates through the runtime while a constructor passes the
    /// uninstantiated vector on to the allocation stub.
    fn visit_extract_type_arguments(
        &mut self,
        site: Site,
        instantiator: Value,
        type_arguments: &TypeArguments,
        factory: bool,
    ) -> CompileResult {
        self.load_value(regs::RESULT, instantiator);
        let instantiated = self.buf.new_label();
        let uninstantiated = self.buf.new_label();
        self.compare_object(regs::RESULT, Object::Null);
        self.asm().jcc(Cond::E, instantiated, Distance::Near);

        if type_arguments.is_uninstantiated_identity() {
            self.check_type_arguments_vector(type_arguments.len(), uninstantiated);
            self.asm().jcc(Cond::E, instantiated, Distance::Near);
        }
        self.asm().bind(uninstantiated);
        let vector = self.ctx.heap.type_arguments(type_arguments);
        if factory {
            self.push_object(Object::Null); // result
            self.push_object(Object::Ref(vector));
            self.asm().push(regs::RESULT); // instantiator
            self.generate_call_runtime(site.node_id, site.token_index, RuntimeEntry::InstantiateTypeArguments);
            let mut asm = self.asm();
            asm.pop(regs::RESULT); // instantiator
            asm.pop(regs::RESULT); // uninstantiated type arguments
            asm.pop(regs::RESULT); // instantiated type arguments
        } else {
            self.load_ref(regs::RESULT, vector);
        }
        self.asm().bind(instantiated);
        Ok(())
    }

    /// Return: result in RAX, frame torn down, then patchable padding.
    pub(super) fn visit_return(&mut self, value: Value, token_index: usize) -> CompileResult {
        self.load_value(regs::RESULT, value);

        if self.ctx.config.verify_stack_height {
            let stack_ok = self.buf.new_label();
            let frame_size = self.frame_size();
            let mut asm = self.asm();
            asm.mov_rr(regs::ARGS_DESC, regs::FP);
            asm.sub_rr(regs::ARGS_DESC, regs::SP);
            asm.cmp_ri32(regs::ARGS_DESC, frame_size);
            asm.jcc(Cond::E, stack_ok, Distance::Near);
            self.stop("Exit stack size does not match the entry stack size.");
            self.asm().bind(stack_ok);
        }

        if self.ctx.config.trace_functions {
            self.trace_function_exit();
        }
        self.leave_frame();
        let mut asm = self.asm();
        asm.ret();
        // Room for a debugger to patch the return into a call.
        for _ in 0..8 {
            asm.nop();
        }
        self.add_descriptor(DescriptorKind::Return, None, token_index);
        Ok(())
    }
}
