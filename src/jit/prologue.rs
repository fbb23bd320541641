//! Function entry: frame setup, argument binding, local initialization and
//! the stack overflow check.
//!
//! On entry R10 holds the arguments descriptor. Its data words are the
//! total argument count and the positional argument count as Smis, then a
//! `(name, position)` pair per named argument sorted by name, then null.
//! Argument `i` of `argc` is at `fp[1 + argc - i]`; a copied parameter `i`
//! is stored at `fp[-1 - i]`.

use super::codebuf::Distance;
use super::compiler::{CompileResult, FlowGraphCompiler, frame_slot, regs, smi_imm, words};
use super::descriptors::DescriptorKind;
use super::x86_64::{Address, Cond, Reg, Scale};
use crate::runtime::{Object, RuntimeEntry, layout};
use tracing::info;

/// Descriptor word holding the total argument count.
const COUNT_OFFSET: i32 = layout::ARRAY_DATA_OFFSET;
/// Descriptor word holding the positional argument count.
const POSITIONAL_COUNT_OFFSET: i32 = layout::ARRAY_DATA_OFFSET + layout::WORD_SIZE;
/// First `(name, position)` pair of the descriptor.
const FIRST_NAMED_OFFSET: i32 = layout::ARRAY_DATA_OFFSET + 2 * layout::WORD_SIZE;

impl FlowGraphCompiler<'_, '_> {
    pub(super) fn generate_entry(&mut self) -> CompileResult {
        let function = self.function;
        self.enter_frame(self.frame_size());

        if !function.has_optional_parameters() {
            // Callers of a closure are not known statically, so their
            // argument count is always checked.
            if self.ctx.config.verify_arguments || function.is_closure {
                let argc_in_range = self.buf.new_label();
                let mut asm = self.asm();
                asm.mov_rm(regs::RESULT, Address::field(regs::ARGS_DESC, COUNT_OFFSET));
                asm.cmp_ri32(regs::RESULT, smi_imm(function.num_fixed_parameters()));
                asm.jcc(Cond::E, argc_in_range, Distance::Near);
                if function.is_closure {
                    self.generate_call_runtime(None, function.token_index, RuntimeEntry::ClosureArgumentMismatch);
                } else {
                    self.stop("Wrong number of arguments");
                }
                self.asm().bind(argc_in_range);
            }
        } else {
            self.copy_parameters()?;
        }

        if function.stack_local_count > 0 {
            self.load_object(regs::RESULT, Object::Null);
            let base = function.first_stack_local_index();
            for i in 0..function.stack_local_count as i32 {
                self.asm().mov_mr(frame_slot(base - i), regs::RESULT);
            }
        }

        let no_stack_overflow = self.buf.new_label();
        let stack_limit_address = self.ctx.runtime.stack_limit_address;
        let mut asm = self.asm();
        asm.mov_ri(regs::TMP, stack_limit_address as i64);
        asm.cmp_rm(regs::SP, Address::new(regs::TMP, 0));
        asm.jcc(Cond::A, no_stack_overflow, Distance::Near);
        self.generate_call_runtime(None, function.token_index, RuntimeEntry::StackOverflow);
        self.asm().bind(no_stack_overflow);

        if self.ctx.config.trace_functions {
            let function_object = self.ctx.heap.function(&function.name);
            self.load_ref(regs::CALL_TARGET, function_object);
            self.asm().push(regs::CALL_TARGET);
            self.generate_call_runtime(None, function.token_index, RuntimeEntry::TraceFunctionEntry);
            self.asm().pop(regs::RESULT);
        }

        if self.ctx.config.print_scopes {
            self.print_scopes();
        }
        Ok(())
    }

    /// Bind arguments of a function with optional parameters.
    fn copy_parameters(&mut self) -> CompileResult {
        let function = self.function;
        let num_fixed = function.num_fixed_parameters();
        let num_params = function.num_parameters();
        let max_positional = num_fixed + function.num_optional_positional_parameters();

        // Optional parameters in name order, with their formal position.
        let mut optional: Vec<(&str, usize, Object)> = function
            .optional_parameters
            .iter()
            .enumerate()
            .map(|(i, parameter)| (parameter.name.as_str(), num_fixed + i, parameter.default_value))
            .collect();
        optional.sort_by(|a, b| a.0.cmp(b.0));
        if let Some(pair) = optional.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(self.invalid(format!("duplicate optional parameter `{}`", pair[0].0)));
        }

        let wrong_num_arguments = self.buf.new_label();
        let loop_start = self.buf.new_label();
        let loop_condition = self.buf.new_label();
        let mut asm = self.asm();
        // fixed <= positional, positional <= fixed + optional positional,
        // and count <= fixed + optional.
        asm.mov_rm(Reg::Rbx, Address::field(regs::ARGS_DESC, COUNT_OFFSET));
        asm.cmp_ri32(Reg::Rbx, smi_imm(num_params));
        asm.jcc(Cond::G, wrong_num_arguments, Distance::Far);
        asm.mov_rm(Reg::Rcx, Address::field(regs::ARGS_DESC, POSITIONAL_COUNT_OFFSET));
        asm.cmp_ri32(Reg::Rcx, smi_imm(num_fixed));
        asm.jcc(Cond::L, wrong_num_arguments, Distance::Far);
        asm.cmp_ri32(Reg::Rcx, smi_imm(max_positional));
        asm.jcc(Cond::G, wrong_num_arguments, Distance::Far);

        // Copy positional arguments, last first. Both counts are Smis, so
        // scaling by 4 yields byte offsets.
        // RBX: last passed positional argument, fp[1 + argc - (positional - 1)].
        asm.sub_rr(Reg::Rbx, Reg::Rcx);
        asm.lea(Reg::Rbx, Address::indexed(regs::FP, Reg::Rbx, Scale::Times4, 2 * layout::WORD_SIZE));
        // RDI: last copied positional parameter, fp[-1 - (positional - 1)].
        asm.sar_ri(Reg::Rcx, layout::SMI_TAG_SIZE);
        asm.mov_rr(Reg::Rax, Reg::Rcx);
        asm.neg(Reg::Rax);
        asm.lea(Reg::Rdi, Address::indexed(regs::FP, Reg::Rax, Scale::Times8, 0));
        asm.jmp(loop_condition, Distance::Near);
        asm.bind(loop_start);
        asm.mov_rm(Reg::Rax, Address::indexed(Reg::Rbx, Reg::Rcx, Scale::Times8, 0));
        asm.mov_mr(Address::indexed(Reg::Rdi, Reg::Rcx, Scale::Times8, 0), Reg::Rax);
        asm.bind(loop_condition);
        asm.dec(Reg::Rcx);
        asm.jcc(Cond::Ns, loop_start, Distance::Near);

        // RCX: positional count, RBX: first passed argument fp[1 + argc],
        // RDI: cursor over the named argument pairs.
        asm.mov_rm(Reg::Rbx, Address::field(regs::ARGS_DESC, COUNT_OFFSET));
        asm.mov_rm(Reg::Rcx, Address::field(regs::ARGS_DESC, POSITIONAL_COUNT_OFFSET));
        asm.sar_ri(Reg::Rcx, layout::SMI_TAG_SIZE);
        asm.lea(Reg::Rbx, Address::indexed(regs::FP, Reg::Rbx, Scale::Times4, layout::WORD_SIZE));
        asm.lea(Reg::Rdi, Address::field(regs::ARGS_DESC, FIRST_NAMED_OFFSET));

        for (name, position, default_value) in optional {
            let load_default_value = self.buf.new_label();
            let assign_optional_parameter = self.buf.new_label();
            let next_parameter = self.buf.new_label();
            // Already copied if passed positionally.
            self.asm().cmp_ri32(Reg::Rcx, position as i32);
            self.asm().jcc(Cond::G, next_parameter, Distance::Near);
            self.asm().mov_rm(Reg::Rax, Address::new(Reg::Rdi, 0));
            let symbol = self.ctx.heap.symbol(name);
            self.compare_object(Reg::Rax, Object::Ref(symbol));
            self.asm().jcc(Cond::Ne, load_default_value, Distance::Near);
            // Passed by name: the argument is at fp[1 + argc - position].
            let mut asm = self.asm();
            asm.mov_rm(Reg::Rax, Address::new(Reg::Rdi, layout::WORD_SIZE));
            asm.add_ri32(Reg::Rdi, 2 * layout::WORD_SIZE);
            asm.neg(Reg::Rax);
            asm.mov_rm(Reg::Rax, Address::indexed(Reg::Rbx, Reg::Rax, Scale::Times4, 0));
            asm.jmp(assign_optional_parameter, Distance::Near);
            asm.bind(load_default_value);
            self.load_object(Reg::Rax, default_value);
            self.asm().bind(assign_optional_parameter);
            self.asm().mov_mr(frame_slot(-1 - position as i32), Reg::Rax);
            self.asm().bind(next_parameter);
        }

        // Every named argument must have matched a parameter.
        let all_arguments_processed = self.buf.new_label();
        self.load_object(regs::TMP, Object::Null);
        self.asm().cmp_mr(Address::new(Reg::Rdi, 0), regs::TMP);
        self.asm().jcc(Cond::E, all_arguments_processed, Distance::Near);

        self.asm().bind(wrong_num_arguments);
        if function.is_closure {
            self.generate_call_runtime(None, 0, RuntimeEntry::ClosureArgumentMismatch);
        } else {
            // noSuchMethod sees the original arguments: they are nulled
            // only once binding succeeded.
            let ic_data = self.ctx.heap.ic_data(&function.name, num_params, 1);
            self.load_ref(regs::IC_DATA, ic_data);
            let target = self.ctx.runtime.stubs.call_no_such_method_function;
            self.generate_call(function.token_index, target, DescriptorKind::IcCall);
        }
        if self.ctx.config.trace_functions {
            self.trace_function_exit();
        }
        self.leave_frame();
        self.asm().ret();

        self.asm().bind(all_arguments_processed);
        let null_args_loop = self.buf.new_label();
        let null_args_loop_condition = self.buf.new_label();
        let mut asm = self.asm();
        asm.mov_rm(Reg::Rcx, Address::field(regs::ARGS_DESC, COUNT_OFFSET));
        asm.sar_ri(Reg::Rcx, layout::SMI_TAG_SIZE);
        asm.jmp(null_args_loop_condition, Distance::Near);
        asm.bind(null_args_loop);
        self.load_object(regs::TMP, Object::Null);
        let mut asm = self.asm();
        asm.mov_mr(
            Address::indexed(regs::FP, Reg::Rcx, Scale::Times8, 2 * layout::WORD_SIZE),
            regs::TMP,
        );
        asm.bind(null_args_loop_condition);
        asm.dec(Reg::Rcx);
        asm.jcc(Cond::Ns, null_args_loop, Distance::Near);
        Ok(())
    }

    fn print_scopes(&self) {
        let function = self.function;
        info!(
            function = %function.name,
            fixed = function.num_fixed_parameters(),
            optional = function.num_optional_parameters(),
            copied = function.copied_parameter_count(),
            stack_locals = function.stack_local_count,
            "scope"
        );
        for variable in &function.variables {
            info!(
                name = %variable.name,
                index = variable.index,
                offset = words(1) * variable.index,
                captured = variable.is_captured,
                "  variable"
            );
        }
    }
}
