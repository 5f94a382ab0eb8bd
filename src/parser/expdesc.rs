//! Expression descriptors and jump lists (spec §4.5 "Expression descriptors,
//! jump lists").
//!
//! A `ExpDesc` tracks where a half-emitted expression's value actually
//! lives (a constant that hasn't been emitted yet, a register, an upvalue,
//! a pending relational jump...) so the emitter can pick the cheapest
//! instruction once the surrounding syntax is known — e.g. `a < b` used as
//! a condition never needs to materialize a boolean.

use crate::proto::GConst;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kind {
    Void,
    Nil,
    True,
    False,
    /// Index into the function's numeric constant table.
    KNum(u32),
    /// Index into the function's GC constant table.
    KGc(u32),
    /// Already in a register, not a local (e.g. a call result).
    NonReloc(u8),
    /// Result of an instruction whose `A` operand hasn't been patched yet;
    /// `pc` is its index in `FuncState::code`.
    Relocable(usize),
    Local(u8),
    Upval(u8),
    Global(u32),
    /// Table index: `table` register/const, `key` register/const.
    Indexed { table: u8, key: IndexKey },
    /// Pending call; `pc` is the `CALL`/`CALLM` instruction.
    Call(usize),
    Vararg(usize),
    /// A boolean-valued jump chain with no materialized register yet
    /// (spec §4.5 "relational/logical operators keep deferring a register
    /// until the surrounding context forces one").
    Jump,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndexKey {
    Reg(u8),
    Str(u32),
    /// Small integer constant (`TGETB`/`TSETB`), per spec's short-index
    /// opcodes.
    Byte(u8),
}

/// `NO_JMP`-terminated list of instruction indices pending a jump target
/// patch (spec §4.5 "Jump lists"). We thread these as plain `Vec<usize>`
/// instead of linking them through each `JMP` instruction's own operand —
/// same information, no extra decode step.
pub type JumpList = Vec<usize>;

#[derive(Debug, Clone)]
pub struct ExpDesc {
    pub kind: Kind,
    /// Jumps to patch when this expression evaluates true.
    pub true_jumps: JumpList,
    /// Jumps to patch when this expression evaluates false.
    pub false_jumps: JumpList,
}

impl ExpDesc {
    #[must_use]
    pub fn void() -> Self {
        ExpDesc {
            kind: Kind::Void,
            true_jumps: Vec::new(),
            false_jumps: Vec::new(),
        }
    }

    #[must_use]
    pub fn new(kind: Kind) -> Self {
        ExpDesc {
            kind,
            true_jumps: Vec::new(),
            false_jumps: Vec::new(),
        }
    }

    #[must_use]
    pub fn has_jumps(&self) -> bool {
        !self.true_jumps.is_empty() || !self.false_jumps.is_empty()
    }

    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, Kind::Nil | Kind::True | Kind::False | Kind::KNum(_) | Kind::KGc(_))
    }

    /// Folds this expression's constant value, if it is a plain number
    /// (spec §4.5 "constant folding"); GC constants (strings, tables) never
    /// fold arithmetically.
    #[must_use]
    pub fn as_number(&self, consts_num: &[f64]) -> Option<f64> {
        match self.kind {
            Kind::KNum(idx) => consts_num.get(idx as usize).copied(),
            _ => None,
        }
    }
}

/// Looks a GC constant back up by value — used by the constant pool dedup
/// logic in `FuncState`.
#[must_use]
pub fn gconst_matches(a: &GConst, b: &GConst) -> bool {
    match (a, b) {
        (GConst::Str(x), GConst::Str(y)) => x == y,
        (GConst::Child(x), GConst::Child(y)) => x == y,
        (GConst::Table(_), GConst::Table(_)) => false,
        _ => false,
    }
}
