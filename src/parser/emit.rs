//! Code generation helpers: discharging expressions into registers,
//! constant folding and jump-list patching (spec §4.5 "Emitter").

use crate::bc::{Instruction, OpCode, NO_JMP};

use super::expdesc::{ExpDesc, IndexKey, Kind};
use super::funcstate::FuncState;
use super::Error;

/// Reserved global-function names rewritten straight to their dedicated
/// opcode instead of a `GGET`+`CALL` pair (spec §4.5 "peephole GFUNC
/// rewrite"): `pid()`, `tid()`, `uid()`, `cpu()`, `execname()`,
/// `probename()`, `arg(n)`, `argstr()`.
#[must_use]
pub fn intrinsic_opcode(name: &str) -> Option<OpCode> {
    Some(match name {
        "pid" => OpCode::Vpid,
        "tid" => OpCode::Vtid,
        "uid" => OpCode::Vuid,
        "cpu" => OpCode::Vcpu,
        "execname" => OpCode::Vexecname,
        "probename" => OpCode::Vprobename,
        "arg" => OpCode::Vargn,
        "argstr" => OpCode::Vargstr,
        _ => return None,
    })
}

/// Ensures `e` has a concrete value in *some* register, returning it.
/// Constants are materialized lazily — this is the single place a `KSTR`/
/// `KNUM`/`KPRI`/`KSHORT` is ever emitted.
pub fn discharge(fs: &mut FuncState, e: &ExpDesc, line: u32) -> Result<u8, Error> {
    match e.kind {
        Kind::Local(reg) | Kind::NonReloc(reg) => Ok(reg),
        Kind::Relocable(pc) => {
            let reg = fs.reserve_regs(1)?;
            fs.code[pc] = fs.code[pc].with_a(reg);
            Ok(reg)
        }
        Kind::Nil => {
            let reg = fs.reserve_regs(1)?;
            fs.emit(Instruction::encode_ad(OpCode::Knil, reg, 0), line);
            Ok(reg)
        }
        Kind::True | Kind::False => {
            let reg = fs.reserve_regs(1)?;
            let d = u16::from(matches!(e.kind, Kind::True));
            fs.emit(Instruction::encode_ad(OpCode::Kpri, reg, d), line);
            Ok(reg)
        }
        Kind::KNum(idx) => {
            let reg = fs.reserve_regs(1)?;
            fs.emit(Instruction::encode_ad(OpCode::Knum, reg, idx as u16), line);
            Ok(reg)
        }
        Kind::KGc(idx) => {
            let reg = fs.reserve_regs(1)?;
            fs.emit(Instruction::encode_ad(OpCode::Kstr, reg, idx as u16), line);
            Ok(reg)
        }
        Kind::Upval(idx) => {
            let reg = fs.reserve_regs(1)?;
            fs.emit(Instruction::encode_ad(OpCode::Uget, reg, u16::from(idx)), line);
            Ok(reg)
        }
        Kind::Global(idx) => {
            let reg = fs.reserve_regs(1)?;
            fs.emit(Instruction::encode_ad(OpCode::Gget, reg, idx as u16), line);
            Ok(reg)
        }
        Kind::Indexed { table, key } => {
            let reg = fs.reserve_regs(1)?;
            let ins = match key {
                IndexKey::Reg(k) => Instruction::encode_abc(OpCode::TgetV, reg, table, k),
                IndexKey::Str(s) => Instruction::encode_abc(OpCode::TgetS, reg, table, s as u8),
                IndexKey::Byte(b) => Instruction::encode_abc(OpCode::TgetB, reg, table, b),
            };
            fs.emit(ins, line);
            Ok(reg)
        }
        Kind::Call(pc) => {
            let reg = fs.reserve_regs(1)?;
            fs.code[pc] = fs.code[pc].with_a(reg);
            Ok(reg)
        }
        Kind::Vararg(pc) => {
            let reg = fs.reserve_regs(1)?;
            fs.code[pc] = fs.code[pc].with_a(reg);
            Ok(reg)
        }
        Kind::Void => {
            let reg = fs.reserve_regs(1)?;
            fs.emit(Instruction::encode_ad(OpCode::Knil, reg, 0), line);
            Ok(reg)
        }
        Kind::Jump => {
            // Boolean materialization: false-load, skip, true-load. Both
            // `true_jumps` and `false_jumps` are concrete, already-emitted
            // `JMP`s (see the two-jump test protocol below), never an
            // implicit fallthrough.
            let reg = fs.reserve_regs(1)?;
            patch_to_here(fs, &e.false_jumps);
            fs.emit(Instruction::encode_ad(OpCode::Kpri, reg, 0), line);
            let skip = emit_jump(fs, line);
            patch_to_here(fs, &e.true_jumps);
            fs.emit(Instruction::encode_ad(OpCode::Kpri, reg, 1), line);
            patch_to_here(fs, &[skip]);
            Ok(reg)
        }
    }
}

/// Folds `lhs OP rhs` at compile time when both sides are numeric
/// constants (spec §4.5 "constant folding", e.g. `2 + 3 * 4` emits a single
/// `KNUM 14`).
#[must_use]
pub fn fold_arith(op: Token2, lhs: f64, rhs: f64) -> Option<f64> {
    Some(match op {
        Token2::Add => lhs + rhs,
        Token2::Sub => lhs - rhs,
        Token2::Mul => lhs * rhs,
        Token2::Div => {
            if rhs == 0.0 {
                return None;
            }
            lhs / rhs
        }
        Token2::Mod => {
            if rhs == 0.0 {
                return None;
            }
            lhs - (lhs / rhs).floor() * rhs
        }
        Token2::Shl => ((lhs as i64) << ((rhs as i64) & 63)) as f64,
        Token2::Shr => (((lhs as i64) as u64) >> ((rhs as i64) & 63)) as f64,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token2 {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
}

/// Appends `pc` to a jump list, threading through the instruction's own `D`
/// slot is avoided (see `expdesc::JumpList`); list order doesn't matter
/// since every entry patches independently.
pub fn append_jump(list: &mut Vec<usize>, pc: usize) {
    list.push(pc);
}

/// Patches every jump in `list` to land at `target`.
pub fn patch_list(fs: &mut FuncState, list: &[usize], target: usize) {
    for &pc in list {
        let ins = fs.code[pc];
        let j = target as i32 - pc as i32 - 1;
        fs.code[pc] = ins.with_d(((j + 0x8000) as u16) & 0xffff);
    }
}

/// Patches every jump in `list` to the next instruction that will be
/// emitted (i.e. "here").
pub fn patch_to_here(fs: &mut FuncState, list: &[usize]) {
    let here = fs.code.len();
    patch_list(fs, list, here);
}

#[must_use]
pub fn emit_jump(fs: &mut FuncState, line: u32) -> usize {
    fs.emit(Instruction::encode_aj(OpCode::Jmp, 0, NO_JMP), line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_precedence_correctly() {
        // 2 + 3 * 4 is folded bottom-up by the parser: 3*4 -> 12, then 2+12.
        let mul = fold_arith(Token2::Mul, 3.0, 4.0).unwrap();
        assert_eq!(mul, 12.0);
        let add = fold_arith(Token2::Add, 2.0, mul).unwrap();
        assert_eq!(add, 14.0);
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        assert_eq!(fold_arith(Token2::Div, 1.0, 0.0), None);
    }
}
