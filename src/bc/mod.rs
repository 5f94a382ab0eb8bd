//! Instruction encoding shared by the writer (C6), reader (C7) and
//! interpreter (C8) — spec §4.8 "Instruction layout".

pub mod reader;
pub mod writer;

use num_enum::TryFromPrimitive;

/// The full opcode set of spec §4.8's per-opcode-family table.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum OpCode {
    Mov = 0,
    Not,
    Unm,
    Kstr,
    Knum,
    Kpri,
    Kshort,
    Kcdata,
    Knil,
    AddVV,
    SubVV,
    MulVV,
    DivVV,
    ModVV,
    AddVN,
    SubVN,
    MulVN,
    DivVN,
    ModVN,
    AddNV,
    SubNV,
    MulNV,
    DivNV,
    ModNV,
    Cat,
    ShlVV,
    ShrVV,
    Islt,
    Isge,
    Isle,
    Isgt,
    Iseqv,
    Isnev,
    Iseqs,
    Isnes,
    Iseqn,
    Isnen,
    Iseqp,
    Isnep,
    Istc,
    Isfc,
    Ist,
    Isf,
    Jmp,
    Call,
    Callm,
    Callt,
    Callmt,
    Ret0,
    Ret1,
    Ret,
    Retm,
    Uclo,
    Fnew,
    Tnew,
    Tdup,
    Gget,
    Gset,
    Ginc,
    TgetV,
    TgetS,
    TgetB,
    TgetR,
    TsetV,
    TsetS,
    TsetB,
    TsetR,
    TincV,
    TincS,
    TincB,
    Tsetm,
    Fori,
    Forl,
    Iforl,
    Jforl,
    Iterc,
    Itern,
    Iterl,
    Iiterl,
    Jiterl,
    Isnext,
    Loop,
    Iloop,
    Jloop,
    Varg,
    Vargn,
    Vargstr,
    Vprobename,
    Vpid,
    Vtid,
    Vuid,
    Vcpu,
    Vexecname,
    Gfunc,
    Funcf,
    Funcv,
    Ifuncf,
    Ifuncv,
    Jfuncf,
    Jfuncv,
    Funcc,
    Funccw,
    Uincn,
    Uincv,
    Uget,
    Usetv,
    /// Injected only by the teardown trampoline, never reachable from
    /// source (spec §4.8 "Dispatch loop").
    Exit,
}

impl OpCode {
    /// Opcodes encoded in `ABC` form (`[B:8][C:8][A:8][OP:8]`); everything
    /// else uses `AD` form (`[D:16][A:8][OP:8]`).
    #[must_use]
    pub fn is_abc_form(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            AddVV
                | SubVV
                | MulVV
                | DivVV
                | ModVV
                | AddVN
                | SubVN
                | MulVN
                | DivVN
                | ModVN
                | AddNV
                | SubNV
                | MulNV
                | DivNV
                | ModNV
                | Cat
                | ShlVV
                | ShrVV
                | Call
                | Callm
                | Varg
                | TgetV
                | TgetS
                | TgetB
                | TgetR
                | TsetV
                | TsetS
                | TsetB
                | TsetR
                | TincV
                | TincS
                | TincB
                | Iterc
                | Itern
        )
    }
}

/// A single 32-bit bytecode word. Bit layout (spec §4.8):
/// `op` in bits `0..8`, `a` in `8..16`, then either `c`/`b` in
/// `16..24`/`24..32` (ABC form) or `d` in `16..32` (AD form).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    #[must_use]
    pub fn op(self) -> OpCode {
        OpCode::try_from((self.0 & 0xff) as u8).expect("invalid opcode byte")
    }

    #[must_use]
    pub fn a(self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    #[must_use]
    pub fn b(self) -> u8 {
        ((self.0 >> 24) & 0xff) as u8
    }

    #[must_use]
    pub fn c(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    #[must_use]
    pub fn d(self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    /// Signed jump displacement: `J = D - 0x8000`.
    #[must_use]
    pub fn j(self) -> i32 {
        i32::from(self.d()) - 0x8000
    }

    #[must_use]
    pub fn encode_abc(op: OpCode, a: u8, b: u8, c: u8) -> Self {
        Instruction(u32::from(op as u8) | (u32::from(a) << 8) | (u32::from(c) << 16) | (u32::from(b) << 24))
    }

    #[must_use]
    pub fn encode_ad(op: OpCode, a: u8, d: u16) -> Self {
        Instruction(u32::from(op as u8) | (u32::from(a) << 8) | (u32::from(d) << 16))
    }

    #[must_use]
    pub fn encode_aj(op: OpCode, a: u8, j: i32) -> Self {
        let d = (j + 0x8000) as u16;
        Self::encode_ad(op, a, d)
    }

    #[must_use]
    pub fn with_d(self, d: u16) -> Self {
        Instruction((self.0 & 0xffff) | (u32::from(d) << 16))
    }

    #[must_use]
    pub fn with_a(self, a: u8) -> Self {
        Instruction((self.0 & 0xffff_00ff) | (u32::from(a) << 8))
    }

    #[must_use]
    pub fn with_op(self, op: OpCode) -> Self {
        Instruction((self.0 & !0xff) | u32::from(op as u8))
    }

    #[must_use]
    pub fn swap_bytes(self) -> Self {
        Instruction(self.0.swap_bytes())
    }
}

/// Jump target placeholder, patched later by the emitter's jump-list logic
/// (spec §4.5 "Jump lists").
pub const NO_JMP: i32 = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abc_roundtrips() {
        let i = Instruction::encode_abc(OpCode::AddVV, 3, 200, 45);
        assert_eq!(i.op(), OpCode::AddVV);
        assert_eq!(i.a(), 3);
        assert_eq!(i.b(), 200);
        assert_eq!(i.c(), 45);
    }

    #[test]
    fn ad_roundtrips() {
        let i = Instruction::encode_ad(OpCode::Kstr, 7, 4000);
        assert_eq!(i.op(), OpCode::Kstr);
        assert_eq!(i.a(), 7);
        assert_eq!(i.d(), 4000);
    }

    #[test]
    fn jump_displacement_is_centered_on_0x8000() {
        let i = Instruction::encode_aj(OpCode::Jmp, 0, 0x8000);
        assert_eq!(i.j(), 0x8000);
        let i = Instruction::encode_aj(OpCode::Jmp, 0, -5);
        assert_eq!(i.j(), -5);
    }
}
