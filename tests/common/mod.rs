//! A small x86-64 interpreter for exactly the instruction subset the
//! backend emits.
//!
//! Calls through a register to an address outside the compiled code are
//! not executed: they are recorded, an optional hook runs in their place,
//! and execution continues after the call. The stack is left untouched so
//! a hook sees the call's arguments at `[rsp]` and up.

#![allow(dead_code)]

use flowjit::jit::CompileResult;
use flowjit::runtime::{CompilerContext, Heap, ObjectRef, Runtime, RuntimeEntry};
use flowjit::{CompiledFunction, CompilerConfig, FlowGraph, ParsedFunction, compile};
use std::collections::HashMap;

pub const CODE_BASE: u64 = 0x5000_0000;
pub const STACK_TOP: u64 = 0x7000_0000;
const RETURN_SENTINEL: u64 = 0x0DEA_D000;
const CALLER_FRAME: u64 = 0x6FFF_FF00;
const STEP_LIMIT: usize = 100_000;

pub const RAX: usize = 0;
pub const RCX: usize = 1;
pub const RDX: usize = 2;
pub const RBX: usize = 3;
pub const RSP: usize = 4;
pub const RBP: usize = 5;
pub const RDI: usize = 7;
pub const R10: usize = 10;
pub const R11: usize = 11;
pub const R15: usize = 15;

/// Raw word of a Smi.
pub fn smi(value: i64) -> u64 {
    (value << 1) as u64
}

/// Runtime tables, heap and configuration for compiling test functions.
pub struct Harness {
    pub config: CompilerConfig,
    pub runtime: Runtime,
    pub heap: Heap,
}

impl Harness {
    pub fn new(config: CompilerConfig) -> Self {
        let (runtime, heap) = Runtime::bootstrap();
        Harness { config, runtime, heap }
    }

    pub fn release() -> Self {
        Self::new(CompilerConfig::release())
    }

    pub fn compile(&mut self, function: &ParsedFunction, graph: &FlowGraph) -> CompileResult<CompiledFunction> {
        let mut ctx = CompilerContext::new(&self.config, &self.runtime, &mut self.heap);
        compile(&mut ctx, function, graph)
    }

    /// A machine holding `compiled` and the current heap image.
    pub fn machine(&self, compiled: &CompiledFunction) -> Machine {
        Machine::new(compiled, &self.runtime, &self.heap)
    }

    pub fn raw(&self, object: flowjit::runtime::Object) -> u64 {
        self.heap.raw(object) as u64
    }

    /// Runtime calls made to `entry`.
    pub fn runtime_calls<'m>(&self, machine: &'m Machine, entry: RuntimeEntry) -> Vec<&'m CallRecord> {
        let call_to_runtime = self.runtime.stubs.call_to_runtime;
        let address = self.runtime.stubs.runtime_entry(entry);
        machine
            .calls
            .iter()
            .filter(|call| call.target == call_to_runtime && call.rbx == address)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Returned to the caller with RAX.
    Returned(u64),
    /// Hit `int3` at this code offset.
    Trap { offset: usize },
    /// Jumped out of the code through a register.
    Jumped(u64),
}

/// An external call, with the machine state at the call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub target: u64,
    /// Return address as an offset into the code.
    pub return_offset: usize,
    pub rax: u64,
    pub rbx: u64,
    pub r10: u64,
    pub rsp: u64,
    /// The eight words at `[rsp]` and up.
    pub stack: Vec<u64>,
}

pub type Hook = Box<dyn FnMut(&mut Machine)>;

pub struct Machine {
    pub regs: [u64; 16],
    zf: bool,
    sf: bool,
    cf: bool,
    of: bool,
    pc: u64,
    code: Vec<u8>,
    memory: HashMap<u64, u64>,
    hooks: HashMap<u64, Hook>,
    pub calls: Vec<CallRecord>,
}

enum Operand {
    Reg(usize),
    Mem(u64),
}

struct ModRm {
    /// Register field extended by REX.R.
    reg: usize,
    /// Raw register field, the opcode extension of group opcodes.
    ext: u8,
    rm: Operand,
}

impl Machine {
    pub fn new(compiled: &CompiledFunction, runtime: &Runtime, heap: &Heap) -> Self {
        let mut machine = Machine {
            regs: [0; 16],
            zf: false,
            sf: false,
            cf: false,
            of: false,
            pc: CODE_BASE,
            code: compiled.code.clone(),
            memory: HashMap::new(),
            hooks: HashMap::new(),
            calls: Vec::new(),
        };
        machine.load_heap(heap);
        // No stack limit.
        machine.write(runtime.stack_limit_address, 0);
        machine
    }

    pub fn load_heap(&mut self, heap: &Heap) {
        for (address, word) in heap.image() {
            self.write(address, word);
        }
    }

    pub fn on_call(&mut self, target: u64, hook: impl FnMut(&mut Machine) + 'static) {
        self.hooks.insert(target, Box::new(hook));
    }

    pub fn read(&self, address: u64) -> u64 {
        assert_eq!(address % 8, 0, "unaligned read at {address:#x}");
        self.memory.get(&address).copied().unwrap_or(0)
    }

    pub fn write(&mut self, address: u64, value: u64) {
        assert_eq!(address % 8, 0, "unaligned write at {address:#x}");
        self.memory.insert(address, value);
    }

    /// Word at untagged `offset` of the object tagged in `object`.
    pub fn field(&self, object: u64, offset: i32) -> u64 {
        self.read(object.wrapping_add_signed(offset as i64 - 1))
    }

    /// Word `index` slots above the stack pointer.
    pub fn stack(&self, index: usize) -> u64 {
        self.read(self.regs[RSP] + 8 * index as u64)
    }

    pub fn calls_to(&self, target: u64) -> Vec<&CallRecord> {
        self.calls.iter().filter(|call| call.target == target).collect()
    }

    /// Call the code with `arguments` pushed left to right and R10 holding
    /// `arguments_descriptor`.
    pub fn invoke(&mut self, arguments: &[u64], arguments_descriptor: ObjectRef) -> Exit {
        self.regs[RSP] = STACK_TOP;
        self.regs[RBP] = CALLER_FRAME;
        for argument in arguments {
            self.push(*argument);
        }
        self.push(RETURN_SENTINEL);
        self.regs[R10] = arguments_descriptor.0;
        self.pc = CODE_BASE;
        self.run()
    }

    /// Stack slot of argument `index` of an invocation.
    pub fn argument_address(index: usize) -> u64 {
        STACK_TOP - 8 * (index as u64 + 1)
    }

    pub fn run(&mut self) -> Exit {
        for _ in 0..STEP_LIMIT {
            if let Some(exit) = self.step() {
                return exit;
            }
        }
        panic!("no exit after {STEP_LIMIT} steps");
    }

    fn push(&mut self, value: u64) {
        self.regs[RSP] -= 8;
        self.write(self.regs[RSP], value);
    }

    fn pop(&mut self) -> u64 {
        let value = self.read(self.regs[RSP]);
        self.regs[RSP] += 8;
        value
    }

    fn offset(&self) -> usize {
        (self.pc - CODE_BASE) as usize
    }

    fn fetch8(&mut self) -> u8 {
        let offset = self.offset();
        let byte = *self
            .code
            .get(offset)
            .unwrap_or_else(|| panic!("pc {offset:#x} is outside the code"));
        self.pc += 1;
        byte
    }

    fn fetch32(&mut self) -> i32 {
        let mut bytes = [0u8; 4];
        for byte in &mut bytes {
            *byte = self.fetch8();
        }
        i32::from_le_bytes(bytes)
    }

    fn fetch64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        for byte in &mut bytes {
            *byte = self.fetch8();
        }
        u64::from_le_bytes(bytes)
    }

    fn modrm(&mut self, rex: u8) -> ModRm {
        let byte = self.fetch8();
        let mode = byte >> 6;
        let ext = (byte >> 3) & 7;
        let reg = ext as usize | (((rex >> 2) & 1) as usize) << 3;
        let rm = byte & 7;
        let rex_b = ((rex & 1) as usize) << 3;
        if mode == 0b11 {
            return ModRm {
                reg,
                ext,
                rm: Operand::Reg(rm as usize | rex_b),
            };
        }

        let mut address = if rm == 0b100 {
            let sib = self.fetch8();
            let scale = sib >> 6;
            let index = ((sib >> 3) & 7) as usize | (((rex >> 1) & 1) as usize) << 3;
            let base = (sib & 7) as usize | rex_b;
            assert!(!(mode == 0 && sib & 7 == 0b101), "absolute SIB addressing is not emitted");
            let mut address = self.regs[base];
            if index != RSP {
                address = address.wrapping_add(self.regs[index] << scale);
            }
            address
        } else {
            assert!(!(mode == 0 && rm == 0b101), "rip-relative addressing is not emitted");
            self.regs[rm as usize | rex_b]
        };
        match mode {
            0b01 => address = address.wrapping_add_signed(self.fetch8() as i8 as i64),
            0b10 => address = address.wrapping_add_signed(self.fetch32() as i64),
            _ => {}
        }
        ModRm {
            reg,
            ext,
            rm: Operand::Mem(address),
        }
    }

    fn load(&self, operand: &Operand) -> u64 {
        match operand {
            Operand::Reg(reg) => self.regs[*reg],
            Operand::Mem(address) => self.read(*address),
        }
    }

    fn store(&mut self, operand: &Operand, value: u64) {
        match operand {
            Operand::Reg(reg) => self.regs[*reg] = value,
            Operand::Mem(address) => self.write(*address, value),
        }
    }

    fn set_result_flags(&mut self, result: u64) {
        self.zf = result == 0;
        self.sf = (result as i64) < 0;
    }

    fn sub_flags(&mut self, left: u64, right: u64) -> u64 {
        let result = left.wrapping_sub(right);
        self.set_result_flags(result);
        self.cf = left < right;
        self.of = (left as i64).overflowing_sub(right as i64).1;
        result
    }

    fn add_flags(&mut self, left: u64, right: u64) -> u64 {
        let result = left.wrapping_add(right);
        self.set_result_flags(result);
        self.cf = result < left;
        self.of = (left as i64).overflowing_add(right as i64).1;
        result
    }

    fn condition(&self, code: u8) -> bool {
        match code {
            0x0 => self.of,
            0x1 => !self.of,
            0x2 => self.cf,
            0x3 => !self.cf,
            0x4 => self.zf,
            0x5 => !self.zf,
            0x6 => self.cf || self.zf,
            0x7 => !self.cf && !self.zf,
            0x8 => self.sf,
            0x9 => !self.sf,
            0xC => self.sf != self.of,
            0xD => self.sf == self.of,
            0xE => self.zf || self.sf != self.of,
            0xF => !self.zf && self.sf == self.of,
            _ => panic!("parity conditions are not emitted"),
        }
    }

    fn jump_relative(&mut self, displacement: i64) {
        self.pc = self.pc.wrapping_add_signed(displacement);
    }

    fn is_code(&self, address: u64) -> bool {
        (CODE_BASE..CODE_BASE + self.code.len() as u64).contains(&address)
    }

    fn call_external(&mut self, target: u64) {
        let stack = (0..8).map(|i| self.stack(i)).collect();
        self.calls.push(CallRecord {
            target,
            return_offset: self.offset(),
            rax: self.regs[RAX],
            rbx: self.regs[RBX],
            r10: self.regs[R10],
            rsp: self.regs[RSP],
            stack,
        });
        if let Some(mut hook) = self.hooks.remove(&target) {
            hook(self);
            self.hooks.insert(target, hook);
        }
    }

    fn step(&mut self) -> Option<Exit> {
        let start = self.offset();
        let mut rex = 0u8;
        let mut opcode = self.fetch8();
        if (0x40..=0x4F).contains(&opcode) {
            rex = opcode;
            opcode = self.fetch8();
        }
        let rex_w = rex & 0x08 != 0;
        let rex_b = ((rex & 1) as usize) << 3;

        match opcode {
            0x50..=0x57 => {
                let value = self.regs[(opcode - 0x50) as usize | rex_b];
                self.push(value);
            }
            0x58..=0x5F => {
                let value = self.pop();
                self.regs[(opcode - 0x58) as usize | rex_b] = value;
            }
            0x68 => {
                let imm = self.fetch32() as i64 as u64;
                self.push(imm);
            }
            0x89 => {
                let m = self.modrm(rex);
                let value = self.regs[m.reg];
                self.store(&m.rm, value);
            }
            0x8B => {
                let m = self.modrm(rex);
                self.regs[m.reg] = self.load(&m.rm);
            }
            0x8D => {
                let m = self.modrm(rex);
                let Operand::Mem(address) = m.rm else {
                    panic!("lea with a register operand at {start:#x}");
                };
                self.regs[m.reg] = address;
            }
            0xB8..=0xBF => {
                let reg = (opcode - 0xB8) as usize | rex_b;
                self.regs[reg] = if rex_w { self.fetch64() } else { self.fetch32() as u32 as u64 };
            }
            0xC7 => {
                let m = self.modrm(rex);
                assert_eq!(m.ext, 0);
                let imm = self.fetch32() as i64 as u64;
                self.store(&m.rm, imm);
            }
            0x81 | 0x83 => {
                let m = self.modrm(rex);
                let imm = if opcode == 0x83 {
                    self.fetch8() as i8 as i64 as u64
                } else {
                    self.fetch32() as i64 as u64
                };
                let left = self.load(&m.rm);
                match m.ext {
                    0 => {
                        let result = self.add_flags(left, imm);
                        self.store(&m.rm, result);
                    }
                    5 => {
                        let result = self.sub_flags(left, imm);
                        self.store(&m.rm, result);
                    }
                    7 => {
                        self.sub_flags(left, imm);
                    }
                    ext => panic!("group 1 /{ext} is not emitted"),
                }
            }
            0x29 => {
                let m = self.modrm(rex);
                let left = self.load(&m.rm);
                let result = self.sub_flags(left, self.regs[m.reg]);
                self.store(&m.rm, result);
            }
            0x39 => {
                let m = self.modrm(rex);
                let left = self.load(&m.rm);
                self.sub_flags(left, self.regs[m.reg]);
            }
            0x3B => {
                let m = self.modrm(rex);
                let right = self.load(&m.rm);
                self.sub_flags(self.regs[m.reg], right);
            }
            0xF7 => {
                let m = self.modrm(rex);
                let value = self.load(&m.rm);
                match m.ext {
                    0 => {
                        let imm = self.fetch32() as i64 as u64;
                        self.set_result_flags(value & imm);
                        self.cf = false;
                        self.of = false;
                    }
                    3 => {
                        let result = self.sub_flags(0, value);
                        self.store(&m.rm, result);
                    }
                    ext => panic!("F7 /{ext} is not emitted"),
                }
            }
            0xC1 => {
                let m = self.modrm(rex);
                assert_eq!(m.ext, 7, "only sar is emitted");
                let shift = self.fetch8() as u32;
                let result = ((self.load(&m.rm) as i64) >> shift) as u64;
                self.set_result_flags(result);
                self.store(&m.rm, result);
            }
            0x8F => {
                let m = self.modrm(rex);
                let value = self.pop();
                self.store(&m.rm, value);
            }
            0xFF => {
                let m = self.modrm(rex);
                match m.ext {
                    1 => {
                        let value = self.load(&m.rm);
                        let result = value.wrapping_sub(1);
                        self.set_result_flags(result);
                        self.of = value as i64 == i64::MIN;
                        self.store(&m.rm, result);
                    }
                    2 => {
                        let target = self.load(&m.rm);
                        if self.is_code(target) {
                            let return_address = self.pc;
                            self.push(return_address);
                            self.pc = target;
                        } else {
                            self.call_external(target);
                        }
                    }
                    4 => {
                        let target = self.load(&m.rm);
                        if !self.is_code(target) {
                            return Some(Exit::Jumped(target));
                        }
                        self.pc = target;
                    }
                    6 => {
                        let value = self.load(&m.rm);
                        self.push(value);
                    }
                    ext => panic!("FF /{ext} is not emitted"),
                }
            }
            0xEB => {
                let displacement = self.fetch8() as i8 as i64;
                self.jump_relative(displacement);
            }
            0xE9 => {
                let displacement = self.fetch32() as i64;
                self.jump_relative(displacement);
            }
            0x70..=0x7F => {
                let displacement = self.fetch8() as i8 as i64;
                if self.condition(opcode - 0x70) {
                    self.jump_relative(displacement);
                }
            }
            0x0F => {
                let second = self.fetch8();
                assert!((0x80..=0x8F).contains(&second), "0F {second:02x} is not emitted");
                let displacement = self.fetch32() as i64;
                if self.condition(second - 0x80) {
                    self.jump_relative(displacement);
                }
            }
            0xC3 => {
                let target = self.pop();
                if target == RETURN_SENTINEL {
                    return Some(Exit::Returned(self.regs[RAX]));
                }
                self.pc = target;
            }
            0x90 => {}
            0xCC => return Some(Exit::Trap { offset: start }),
            _ => panic!("opcode {opcode:#04x} at {start:#x} is not emitted by the backend"),
        }
        None
    }
}
