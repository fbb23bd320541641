//! Flow-graph compiler for x86-64.
//!
//! A [`FlowGraphCompiler`] compiles exactly one function. It emits the
//! prologue, then walks the blocks of the flow graph and emits one code
//! sequence per instruction, recording a PC descriptor for every call and
//! return. Values live on the machine stack; the few registers used are the
//! fixed scratch locations listed in [`regs`].

use super::codebuf::{CodeBuffer, Distance, Label};
use super::descriptors::{DescriptorKind, DescriptorList, PcDescriptor, PcDescriptors};
use super::error::CompileError;
use super::x86_64::{Address, Cond, Reg, X86_64Assembler};
use crate::il::{BlockId, Exit, FlowGraph, LocalVariable, ParsedFunction, Site, Value};
use crate::runtime::{CompilerContext, Object, ObjectRef, RuntimeEntry, layout, smi_raw};
use serde::Serialize;
use tracing::{debug, trace};

pub type CompileResult<T = ()> = Result<T, CompileError>;

/// Register conventions of generated code.
///
/// - RAX: result of a computation, first operand
/// - RDX: second operand
/// - RBX: IC data, static call target or runtime entry of a call
/// - R10: arguments descriptor, or argument count of a runtime call
/// - RCX, RDI: scratch
/// - R11: scratch for absolute addresses and wide immediates
/// - R15: current context
pub mod regs {
    use super::Reg;

    pub const RESULT: Reg = Reg::Rax;
    pub const OPERAND: Reg = Reg::Rdx;
    pub const IC_DATA: Reg = Reg::Rbx;
    pub const CALL_TARGET: Reg = Reg::Rbx;
    pub const ARGS_DESC: Reg = Reg::R10;
    pub const TMP: Reg = Reg::R11;
    pub const CTX: Reg = Reg::R15;
    pub const FP: Reg = Reg::Rbp;
    pub const SP: Reg = Reg::Rsp;
}

/// Entry of the exception handler table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionHandler {
    pub try_index: usize,
    pub handler_offset: usize,
}

/// Output of one compilation.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledFunction {
    pub name: String,
    pub code: Vec<u8>,
    /// Offsets are relative to the first byte of `code`.
    pub descriptors: PcDescriptors,
    pub variables: Vec<LocalVariable>,
    /// Exception regions are not compiled; always empty.
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Offsets of embedded 64-bit object references.
    pub object_offsets: Vec<usize>,
    /// Start of every emitted block, in emission order.
    pub block_offsets: Vec<(BlockId, usize)>,
    pub comments: Vec<(usize, String)>,
    /// Frame size in bytes below the frame pointer.
    pub frame_size: usize,
}

/// Compiled code copied into executable memory.
#[cfg(feature = "jit")]
#[derive(Debug)]
pub struct InstalledFunction {
    pub memory: super::memory::ExecutableMemory,
    /// Descriptors with absolute pcs.
    pub descriptors: PcDescriptors,
}

impl CompiledFunction {
    /// Target of the call ending at `descriptor`, decoded from the
    /// `mov r11, imm64; call r11` sequence every external call uses.
    pub fn call_target(&self, descriptor: &PcDescriptor) -> Option<u64> {
        const MOV_R11_IMM64: [u8; 2] = [0x49, 0xBB];
        const CALL_R11: [u8; 3] = [0x41, 0xFF, 0xD3];
        let end = descriptor.offset;
        let start = end.checked_sub(13)?;
        let sequence = self.code.get(start..end)?;
        if sequence[..2] != MOV_R11_IMM64 || sequence[10..] != CALL_R11 {
            return None;
        }
        let mut imm = [0u8; 8];
        imm.copy_from_slice(&sequence[2..10]);
        Some(u64::from_le_bytes(imm))
    }

    #[cfg(feature = "jit")]
    pub fn install(&self) -> Result<InstalledFunction, super::memory::MemoryError> {
        let memory = super::memory::ExecutableMemory::install(&self.code)?;
        let descriptors = self.descriptors.relocated(memory.entry_point());
        Ok(InstalledFunction { memory, descriptors })
    }
}

/// Compile `function` with body `graph`.
pub fn compile(
    ctx: &mut CompilerContext<'_>,
    function: &ParsedFunction,
    graph: &FlowGraph,
) -> CompileResult<CompiledFunction> {
    FlowGraphCompiler::new(ctx, function, graph)?.compile()
}

pub struct FlowGraphCompiler<'c, 'a> {
    pub(super) ctx: &'c mut CompilerContext<'a>,
    pub(super) function: &'c ParsedFunction,
    graph: &'c FlowGraph,
    /// Reachable blocks in postorder; emitted back to front.
    postorder: Vec<BlockId>,
    block_labels: Vec<Option<Label>>,
    /// Position in `postorder` of the block being emitted.
    current: usize,
    block_offsets: Vec<(BlockId, usize)>,
    pub(super) buf: CodeBuffer,
    descriptors: DescriptorList,
}

impl<'c, 'a> FlowGraphCompiler<'c, 'a> {
    pub fn new(
        ctx: &'c mut CompilerContext<'a>,
        function: &'c ParsedFunction,
        graph: &'c FlowGraph,
    ) -> CompileResult<Self> {
        graph.validate().map_err(|message| CompileError::InvalidGraph {
            function: function.name.clone(),
            message,
        })?;
        let postorder = graph.postorder();
        let mut buf = CodeBuffer::new();
        let mut block_labels = vec![None; graph.blocks.len()];
        for id in &postorder {
            block_labels[id.0] = Some(buf.new_label());
        }
        Ok(FlowGraphCompiler {
            ctx,
            function,
            graph,
            postorder,
            block_labels,
            current: 0,
            block_offsets: Vec::new(),
            buf,
            descriptors: DescriptorList::new(),
        })
    }

    pub fn compile(mut self) -> CompileResult<CompiledFunction> {
        self.generate_entry()?;
        self.visit_blocks()?;
        self.generate_trailer();
        self.finalize()
    }

    // ==================== Helpers ====================

    pub(super) fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    pub(super) fn bailout(&self, reason: impl Into<String>) -> CompileError {
        CompileError::Bailout {
            function: self.function.name.clone(),
            reason: reason.into(),
        }
    }

    pub(super) fn invalid(&self, message: impl Into<String>) -> CompileError {
        CompileError::InvalidGraph {
            function: self.function.name.clone(),
            message: message.into(),
        }
    }

    pub(super) fn comment(&mut self, text: impl Into<String>) {
        if self.ctx.config.code_comments {
            self.buf.comment(text);
        }
    }

    /// Frame size in bytes: locals, temps and copied parameters.
    pub(super) fn frame_size(&self) -> i32 {
        words(self.function.stack_size())
    }

    pub(super) fn load_ref(&mut self, dst: Reg, object: ObjectRef) {
        self.asm().mov_ri64(dst, object.raw());
        self.buf.record_object();
    }

    pub(super) fn load_object(&mut self, dst: Reg, object: Object) {
        match object {
            Object::Smi(value) => self.asm().mov_ri(dst, smi_raw(value)),
            _ => {
                let raw = self.ctx.heap.raw(object);
                self.asm().mov_ri64(dst, raw);
                self.buf.record_object();
            }
        }
    }

    pub(super) fn push_object(&mut self, object: Object) {
        if let Object::Smi(value) = object {
            if let Ok(imm) = i32::try_from(smi_raw(value)) {
                self.asm().push_i32(imm);
                return;
            }
        }
        self.load_object(regs::TMP, object);
        self.asm().push(regs::TMP);
    }

    pub(super) fn compare_object(&mut self, reg: Reg, object: Object) {
        self.load_object(regs::TMP, object);
        self.asm().cmp_rr(reg, regs::TMP);
    }

    /// Materialize `value` in `dst`; a temp is popped off the stack.
    pub(super) fn load_value(&mut self, dst: Reg, value: Value) {
        match value {
            Value::Constant(object) => self.load_object(dst, object),
            Value::Temp(_) => self.asm().pop(dst),
        }
    }

    /// Call an absolute address through TMP.
    fn call_external(&mut self, address: u64) {
        let mut asm = self.asm();
        asm.mov_ri64(regs::TMP, address as i64);
        asm.call_r(regs::TMP);
    }

    pub(super) fn add_descriptor(&mut self, kind: DescriptorKind, node_id: Option<usize>, token_index: usize) {
        self.descriptors.add(kind, self.buf.offset(), node_id, token_index);
    }

    pub(super) fn generate_call(&mut self, token_index: usize, address: u64, kind: DescriptorKind) {
        self.call_external(address);
        self.add_descriptor(kind, None, token_index);
    }

    pub(super) fn generate_call_runtime(&mut self, node_id: Option<usize>, token_index: usize, entry: RuntimeEntry) {
        let stubs = &self.ctx.runtime.stubs;
        let (entry_address, call_to_runtime) = (stubs.runtime_entry(entry), stubs.call_to_runtime);
        let mut asm = self.asm();
        asm.mov_ri64(regs::CALL_TARGET, entry_address as i64);
        asm.mov_ri(regs::ARGS_DESC, entry.argument_count() as i64);
        self.call_external(call_to_runtime);
        self.add_descriptor(DescriptorKind::Other, node_id, token_index);
    }

    /// Inline-cache call of `function_name`; the arguments are already
    /// pushed and are dropped after the call.
    pub(super) fn emit_instance_call(
        &mut self,
        site: Site,
        function_name: &str,
        argument_count: usize,
        argument_names: &[String],
        checked_argument_count: usize,
    ) -> CompileResult {
        let stubs = &self.ctx.runtime.stubs;
        let stub = match checked_argument_count {
            1 => stubs.one_arg_check_inline_cache,
            2 => stubs.two_args_check_inline_cache,
            n => return Err(self.bailout(format!("inline cache checking {n} arguments"))),
        };
        let ic_data = self.ctx.heap.ic_data(function_name, argument_count, checked_argument_count);
        let arguments_descriptor = self.ctx.heap.arguments_descriptor(argument_count, argument_names);
        self.load_ref(regs::IC_DATA, ic_data);
        self.load_ref(regs::ARGS_DESC, arguments_descriptor);
        self.call_external(stub);
        self.add_descriptor(DescriptorKind::IcCall, site.node_id, site.token_index);
        self.asm().add_ri32(regs::SP, words(argument_count));
        Ok(())
    }

    /// Trap with `message`; reached only if an internal check fails.
    pub(super) fn stop(&mut self, message: &str) {
        self.comment(format!("Stop: {message}"));
        self.asm().int3();
    }

    pub(super) fn enter_frame(&mut self, frame_size: i32) {
        let mut asm = self.asm();
        asm.push(regs::FP);
        asm.mov_rr(regs::FP, regs::SP);
        if frame_size != 0 {
            asm.sub_ri32(regs::SP, frame_size);
        }
    }

    pub(super) fn leave_frame(&mut self) {
        let mut asm = self.asm();
        asm.mov_rr(regs::SP, regs::FP);
        asm.pop(regs::FP);
    }

    /// Report function exit to the runtime, preserving RAX.
    pub(super) fn trace_function_exit(&mut self) {
        self.asm().push(regs::RESULT);
        let function = self.ctx.heap.function(&self.function.name);
        self.load_ref(regs::CALL_TARGET, function);
        self.asm().push(regs::CALL_TARGET);
        self.generate_call_runtime(None, 0, RuntimeEntry::TraceFunctionExit);
        self.asm().pop(regs::RESULT);
        self.asm().pop(regs::RESULT);
    }

    /// Call arguments must be consecutive temps so they can be dropped
    /// together after the call.
    pub(super) fn verify_call_arguments(&self, call: &str, arguments: &[Value]) -> CompileResult {
        let mut previous: Option<usize> = None;
        for argument in arguments {
            let Some(index) = argument.temp_index() else {
                return Err(self.invalid(format!("{call}: argument {argument:?} is not a temp")));
            };
            if let Some(previous) = previous {
                if index != previous + 1 {
                    return Err(self.invalid(format!(
                        "{call}: argument temps t{previous} and t{index} are not consecutive"
                    )));
                }
            }
            previous = Some(index);
        }
        Ok(())
    }

    /// `second` must sit right above `first` when both are temps.
    pub(super) fn verify_values(&self, call: &str, first: Value, second: Value) -> CompileResult {
        if let (Value::Temp(first), Value::Temp(second)) = (first, second) {
            if first + 1 != second {
                return Err(self.invalid(format!("{call}: operand t{second} is not right above t{first}")));
            }
        }
        Ok(())
    }

    // ==================== Block linearization ====================

    fn block_label(&self, id: BlockId) -> CompileResult<Label> {
        self.block_labels
            .get(id.0)
            .copied()
            .flatten()
            .ok_or_else(|| self.invalid(format!("block B{} is not reachable", id.0)))
    }

    /// Whether `id` is emitted right after the current block.
    fn is_next_block(&self, id: BlockId) -> bool {
        self.current > 0 && self.postorder[self.current - 1] == id
    }

    fn visit_blocks(&mut self) -> CompileResult {
        let graph = self.graph;
        for i in (0..self.postorder.len()).rev() {
            self.current = i;
            let id = self.postorder[i];
            let label = self.block_label(id)?;
            self.block_offsets.push((id, self.buf.offset()));
            self.asm().bind(label);
            self.comment(format!("B{}", id.0));
            trace!(block = id.0, offset = self.buf.offset(), "emit block");

            let block = &graph.blocks[id.0];
            for instruction in &block.instructions {
                self.visit_instruction(instruction)?;
            }
            match &block.exit {
                Exit::Goto { successor } => {
                    if !self.is_next_block(*successor) {
                        let target = self.block_label(*successor)?;
                        self.asm().jmp(target, Distance::Far);
                    }
                }
                Exit::Return { value, token_index } => self.visit_return(*value, *token_index)?,
                Exit::Branch {
                    value,
                    true_successor,
                    false_successor,
                } => self.visit_branch(*value, *true_successor, *false_successor)?,
            }
        }
        Ok(())
    }

    /// Jump on the canonical true object, falling through to whichever
    /// successor comes next.
    fn visit_branch(&mut self, value: Value, true_successor: BlockId, false_successor: BlockId) -> CompileResult {
        let true_label = self.block_label(true_successor)?;
        let false_label = self.block_label(false_successor)?;
        self.load_value(regs::RESULT, value);
        let true_object = self.ctx.heap.true_object();
        self.load_ref(regs::OPERAND, true_object);
        self.asm().cmp_rr(regs::RESULT, regs::OPERAND);

        if self.is_next_block(false_successor) {
            self.asm().jcc(Cond::E, true_label, Distance::Far);
        } else if self.is_next_block(true_successor) {
            self.asm().jcc(Cond::Ne, false_label, Distance::Far);
        } else {
            self.asm().jcc(Cond::Ne, false_label, Distance::Far);
            self.asm().jmp(true_label, Distance::Far);
        }
        Ok(())
    }

    // ==================== Finalization ====================

    /// Trap after the last block, then the patch point redirecting callers.
    fn generate_trailer(&mut self) {
        self.asm().int3();
        self.add_descriptor(DescriptorKind::PatchCode, None, 0);
        let target = self.ctx.runtime.stubs.fix_callers_target;
        let mut asm = self.asm();
        asm.mov_ri64(regs::TMP, target as i64);
        asm.jmp_r(regs::TMP);
    }

    fn finalize(self) -> CompileResult<CompiledFunction> {
        self.buf.verify().map_err(CompileError::Label)?;
        for id in &self.postorder {
            let bound = self.block_labels[id.0].is_some_and(|label| self.buf.is_bound(label));
            if !bound {
                return Err(CompileError::Label(format!("label of block B{} is not bound", id.0)));
            }
        }

        let frame_size = self.frame_size();
        let descriptors = self.descriptors.finalize(0);
        descriptors
            .verify(self.function.is_optimizable)
            .map_err(CompileError::Descriptors)?;

        debug!(
            function = %self.function.name,
            frame_size,
            blocks = self.postorder.len(),
            code_size = self.buf.len(),
            descriptors = descriptors.len(),
            "compiled function"
        );

        let object_offsets = self.buf.objects().to_vec();
        let comments = self.buf.comments().to_vec();
        Ok(CompiledFunction {
            name: self.function.name.clone(),
            frame_size: frame_size as usize,
            code: self.buf.into_code(),
            descriptors,
            variables: self.function.variables.clone(),
            exception_handlers: Vec::new(),
            object_offsets,
            block_offsets: self.block_offsets,
            comments,
        })
    }
}

/// Size in bytes of `count` words.
pub(super) fn words(count: usize) -> i32 {
    count as i32 * layout::WORD_SIZE
}

/// Immediate holding the Smi `value`.
pub(super) fn smi_imm(value: usize) -> i32 {
    smi_raw(value as i64) as i32
}

/// `[rbp + index * 8]`
pub(super) fn frame_slot(index: i32) -> Address {
    Address::new(regs::FP, index * layout::WORD_SIZE)
}
