//! x86-64 instruction encoding for JIT compilation.
//!
//! Only the forms the backend emits are provided: 64-bit moves, loads and
//! stores through a general [`Address`], compares, stack operations and
//! label-based jumps.

use super::codebuf::{CodeBuffer, Distance, Label};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires a REX extension bit.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// x86-64 condition codes (for Jcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    /// Invert the condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// Index scale of a SIB address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scale {
    Times1 = 0,
    Times2 = 1,
    Times4 = 2,
    Times8 = 3,
}

/// A memory operand `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    base: Reg,
    index: Option<(Reg, Scale)>,
    disp: i32,
}

impl Address {
    pub fn new(base: Reg, disp: i32) -> Self {
        Address { base, index: None, disp }
    }

    /// `index` must not be RSP, which encodes "no index".
    pub fn indexed(base: Reg, index: Reg, scale: Scale, disp: i32) -> Self {
        debug_assert_ne!(index, Reg::Rsp);
        Address {
            base,
            index: Some((index, scale)),
            disp,
        }
    }

    /// Field at untagged byte `offset` of the heap object tagged in `base`.
    pub fn field(base: Reg, offset: i32) -> Self {
        Address::new(base, crate::runtime::layout::field_offset(offset))
    }

    pub fn base(&self) -> Reg {
        self.base
    }

    pub fn index(&self) -> Option<(Reg, Scale)> {
        self.index
    }

    pub fn disp(&self) -> i32 {
        self.disp
    }
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    // ==================== Encoding helpers ====================

    /// Encode ModR/M byte.
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// REX prefix for a register-direct operand.
    fn emit_rex_rr(&mut self, wide: bool, reg: u8, rm: Reg) {
        let mut rex = 0x40;
        if wide {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        if rm.needs_rex_ext() {
            rex |= 0x01;
        }
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    /// REX prefix for a memory operand.
    fn emit_rex_mem(&mut self, wide: bool, reg: u8, address: Address) {
        let mut rex = 0x40;
        if wide {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        if let Some((index, _)) = address.index {
            if index.needs_rex_ext() {
                rex |= 0x02;
            }
        }
        if address.base.needs_rex_ext() {
            rex |= 0x01;
        }
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    /// ModR/M, optional SIB and displacement of a memory operand.
    fn emit_operand(&mut self, reg: u8, address: Address) {
        let base = address.base.code();
        // RBP/R13 as base cannot use the no-displacement form.
        let mode = if address.disp == 0 && base != 0b101 {
            0b00
        } else if i8::try_from(address.disp).is_ok() {
            0b01
        } else {
            0b10
        };

        match address.index {
            Some((index, scale)) => {
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf.emit_u8(((scale as u8) << 6) | (index.code() << 3) | base);
            }
            // RSP/R12 as base need a SIB byte.
            None if base == 0b100 => {
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf.emit_u8(0x24);
            }
            None => self.buf.emit_u8(Self::modrm(mode, reg, base)),
        }

        match mode {
            0b01 => self.buf.emit_u8(address.disp as u8),
            0b10 => self.buf.emit_u32(address.disp as u32),
            _ => {}
        }
    }

    /// Group-1 arithmetic with an immediate (`/ext`), short form when it fits.
    fn emit_group1_ri(&mut self, ext: u8, dst: Reg, imm: i32) {
        self.emit_rex_rr(true, 0, dst);
        if let Ok(imm8) = i8::try_from(imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    // ==================== Labels ====================

    pub fn bind(&mut self, label: Label) {
        self.buf.bind(label);
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_rr(true, src as u8, dst);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.emit_rex_rr(true, 0, dst);
        self.buf.emit_u8(0xB8 + dst.code()); // MOV r64, imm64
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_rr(true, 0, dst);
        self.buf.emit_u8(0xC7); // MOV r/m64, imm32
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r64, imm using the shortest encoding.
    pub fn mov_ri(&mut self, dst: Reg, imm: i64) {
        match i32::try_from(imm) {
            Ok(imm32) => self.mov_ri32(dst, imm32),
            Err(_) => self.mov_ri64(dst, imm),
        }
    }

    /// MOV r64, [mem]
    pub fn mov_rm(&mut self, dst: Reg, src: Address) {
        self.emit_rex_mem(true, dst as u8, src);
        self.buf.emit_u8(0x8B); // MOV r64, r/m64
        self.emit_operand(dst.code(), src);
    }

    /// MOV [mem], r64
    pub fn mov_mr(&mut self, dst: Address, src: Reg) {
        self.emit_rex_mem(true, src as u8, dst);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.emit_operand(src.code(), dst);
    }

    /// LEA r64, [mem]
    pub fn lea(&mut self, dst: Reg, src: Address) {
        self.emit_rex_mem(true, dst as u8, src);
        self.buf.emit_u8(0x8D);
        self.emit_operand(dst.code(), src);
    }

    // ==================== Arithmetic Operations ====================

    /// ADD r64, imm32 (sign-extended)
    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_group1_ri(0, dst, imm);
    }

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_group1_ri(5, dst, imm);
    }

    /// SUB r64, r64
    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_rr(true, src as u8, dst);
        self.buf.emit_u8(0x29); // SUB r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// NEG r64
    pub fn neg(&mut self, dst: Reg) {
        self.emit_rex_rr(true, 0, dst);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 3, dst.code()));
    }

    /// DEC r64
    pub fn dec(&mut self, dst: Reg) {
        self.emit_rex_rr(true, 0, dst);
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 1, dst.code()));
    }

    /// SAR r64, imm8 (arithmetic right shift by immediate)
    pub fn sar_ri(&mut self, dst: Reg, imm: u8) {
        self.emit_rex_rr(true, 0, dst);
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
        self.buf.emit_u8(imm);
    }

    // ==================== Comparisons ====================

    /// CMP r64, r64
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_rr(true, src as u8, dst);
        self.buf.emit_u8(0x39); // CMP r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// CMP r64, imm32 (sign-extended)
    pub fn cmp_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_group1_ri(7, dst, imm);
    }

    /// CMP r64, [mem]
    pub fn cmp_rm(&mut self, left: Reg, right: Address) {
        self.emit_rex_mem(true, left as u8, right);
        self.buf.emit_u8(0x3B); // CMP r64, r/m64
        self.emit_operand(left.code(), right);
    }

    /// CMP [mem], r64
    pub fn cmp_mr(&mut self, left: Address, right: Reg) {
        self.emit_rex_mem(true, right as u8, left);
        self.buf.emit_u8(0x39); // CMP r/m64, r64
        self.emit_operand(right.code(), left);
    }

    /// CMP [mem], imm32 (sign-extended)
    pub fn cmp_mi(&mut self, left: Address, imm: i32) {
        self.emit_rex_mem(true, 0, left);
        if let Ok(imm8) = i8::try_from(imm) {
            self.buf.emit_u8(0x83);
            self.emit_operand(7, left);
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.emit_operand(7, left);
            self.buf.emit_u32(imm as u32);
        }
    }

    /// TEST r64, imm32 (sign-extended)
    pub fn test_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_rr(true, 0, dst);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// PUSH [mem]
    pub fn push_m(&mut self, src: Address) {
        self.emit_rex_mem(false, 0, src);
        self.buf.emit_u8(0xFF);
        self.emit_operand(6, src);
    }

    /// POP [mem]
    pub fn pop_m(&mut self, dst: Address) {
        self.emit_rex_mem(false, 0, dst);
        self.buf.emit_u8(0x8F);
        self.emit_operand(0, dst);
    }

    /// PUSH imm32 (sign-extended to 64 bits)
    pub fn push_i32(&mut self, imm: i32) {
        self.buf.emit_u8(0x68);
        self.buf.emit_u32(imm as u32);
    }

    // ==================== Control Flow ====================

    /// JMP to a label.
    pub fn jmp(&mut self, label: Label, distance: Distance) {
        match distance {
            Distance::Near => self.buf.emit_u8(0xEB),
            Distance::Far => self.buf.emit_u8(0xE9),
        }
        self.buf.emit_label_ref(label, distance);
    }

    /// Jcc to a label.
    pub fn jcc(&mut self, cond: Cond, label: Label, distance: Distance) {
        match distance {
            Distance::Near => self.buf.emit_u8(0x70 + cond as u8),
            Distance::Far => {
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(0x80 + cond as u8);
            }
        }
        self.buf.emit_label_ref(label, distance);
    }

    /// CALL r64 (indirect call through register)
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0xFF); // CALL r/m64
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// JMP r64 (indirect jump through register)
    pub fn jmp_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0xFF); // JMP r/m64
        self.buf.emit_u8(Self::modrm(0b11, 4, reg.code()));
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }

    pub fn int3(&mut self) {
        self.buf.emit_u8(0xCC);
    }
}
