//! Per-function compile-time state: register allocator, scope stack and
//! constant pool (spec §4.5 "FuncState").

use std::rc::Rc;

use crate::bc::{Instruction, OpCode};
use crate::proto::{DebugInfo, GConst, LocalVarInfo, ProbeDecl, Prototype, ProtoFlags, UpvalDesc};
use crate::strpool::StrId;

use super::expdesc::gconst_matches;

pub const KP_MAX_SLOTS: usize = 250;
pub const KP_MAX_LOCVAR: usize = 200;
pub const KP_MAX_UPVAL: usize = 60;

#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: StrId,
    pub reg: u8,
    pub start_pc: u32,
    /// Set once a nested function captures this local as an upvalue, so its
    /// enclosing scope knows to close it on exit.
    pub captured: bool,
}

/// A lexical scope. Loop scopes additionally collect pending `break` jumps
/// so `'break'` can patch to the loop's exit once it's emitted.
#[derive(Debug, Default)]
pub struct Scope {
    pub first_local: usize,
    pub is_loop: bool,
    pub break_jumps: Vec<usize>,
}

/// One function under construction. `children` accumulates nested function
/// prototypes as they finish, in source order, matching the order the
/// writer (C6) expects to find them in `Prototype::children`.
pub struct FuncState {
    pub numparams: u8,
    pub is_vararg: bool,
    pub code: Vec<Instruction>,
    pub lines: Vec<u32>,
    pub consts_num: Vec<f64>,
    pub consts_gc: Vec<GConst>,
    pub upvalues: Vec<UpvalDesc>,
    pub upvalue_names: Vec<StrId>,
    pub children: Vec<Rc<Prototype>>,
    pub probes: Vec<ProbeDecl>,
    pub locals: Vec<LocalVar>,
    pub locals_debug: Vec<LocalVarInfo>,
    pub scopes: Vec<Scope>,
    pub freereg: u8,
    pub max_reg: u8,
    pub firstline: u32,
}

impl FuncState {
    /// `code[0]` is reserved for the `GFUNC`/`FUNCF`/`FUNCV` frame-size
    /// header up front, so every jump target computed during compilation
    /// stays stable; `into_prototype` fills in its real opcode and
    /// framesize once `max_reg` is final.
    #[must_use]
    pub fn new(firstline: u32) -> Self {
        FuncState {
            numparams: 0,
            is_vararg: false,
            code: vec![Instruction::encode_ad(OpCode::Funcf, 0, 0)],
            lines: vec![firstline],
            consts_num: Vec::new(),
            consts_gc: Vec::new(),
            upvalues: Vec::new(),
            upvalue_names: Vec::new(),
            children: Vec::new(),
            probes: Vec::new(),
            locals: Vec::new(),
            locals_debug: Vec::new(),
            scopes: vec![Scope::default()],
            freereg: 0,
            max_reg: 0,
            firstline,
        }
    }

    pub fn enter_scope(&mut self, is_loop: bool) {
        self.scopes.push(Scope {
            first_local: self.locals.len(),
            is_loop,
            break_jumps: Vec::new(),
        });
    }

    /// Closes the innermost scope, returning any pending `break` jumps so
    /// the loop emitter can patch them to its exit label.
    pub fn leave_scope(&mut self, pc_end: u32) -> Vec<usize> {
        let scope = self.scopes.pop().expect("scope underflow");
        let closes_upvalue = self.locals[scope.first_local..].iter().any(|l| l.captured);
        let base_reg = self.locals.get(scope.first_local).map(|l| l.reg);
        for local in self.locals.drain(scope.first_local..) {
            self.locals_debug.push(LocalVarInfo {
                name: local.name,
                start_pc: local.start_pc,
                end_pc: pc_end,
            });
        }
        self.freereg = self.locals.len() as u8;
        if closes_upvalue {
            if let Some(reg) = base_reg {
                let line = *self.lines.last().unwrap_or(&self.firstline);
                self.emit(Instruction::encode_ad(OpCode::Uclo, reg, 0), line);
            }
        }
        scope.break_jumps
    }

    pub fn record_break(&mut self, pc: usize) {
        for scope in self.scopes.iter_mut().rev() {
            if scope.is_loop {
                scope.break_jumps.push(pc);
                return;
            }
        }
    }

    #[must_use]
    pub fn in_loop(&self) -> bool {
        self.scopes.iter().any(|s| s.is_loop)
    }

    pub fn new_local(&mut self, name: StrId) -> Result<u8, super::Error> {
        if self.locals.len() >= KP_MAX_LOCVAR {
            return Err(super::Error::new(self.firstline, "too many local variables"));
        }
        let reg = self.reserve_regs(1)?;
        self.locals.push(LocalVar {
            name,
            reg,
            start_pc: self.code.len() as u32,
            captured: false,
        });
        Ok(reg)
    }

    /// Binds `name` to a register already reserved by the caller (used for
    /// `var` declarations, where the RHS expressions are discharged into
    /// consecutive registers before the names are known).
    pub fn bind_local(&mut self, name: StrId, reg: u8) {
        self.locals.push(LocalVar {
            name,
            reg,
            start_pc: self.code.len() as u32,
            captured: false,
        });
    }

    /// Flags the most recently bound local occupying `reg` as captured by a
    /// nested function's upvalue, so [`Self::leave_scope`] knows to close it.
    pub fn mark_captured(&mut self, reg: u8) {
        if let Some(local) = self.locals.iter_mut().rev().find(|l| l.reg == reg) {
            local.captured = true;
        }
    }

    #[must_use]
    pub fn resolve_local(&self, name: StrId) -> Option<u8> {
        self.locals.iter().rev().find(|l| l.name == name).map(|l| l.reg)
    }

    pub fn reserve_regs(&mut self, n: u8) -> Result<u8, super::Error> {
        let base = self.freereg;
        let top = base as u32 + n as u32;
        if top as usize > KP_MAX_SLOTS {
            return Err(super::Error::new(self.firstline, "function uses too many registers"));
        }
        self.freereg = top as u8;
        if self.freereg > self.max_reg {
            self.max_reg = self.freereg;
        }
        Ok(base)
    }

    pub fn free_to(&mut self, reg: u8) {
        if reg < self.freereg {
            self.freereg = reg;
        }
    }

    pub fn emit(&mut self, ins: Instruction, line: u32) -> usize {
        self.code.push(ins);
        self.lines.push(line);
        self.code.len() - 1
    }

    pub fn numconst(&mut self, n: f64) -> Result<u32, super::Error> {
        if let Some(idx) = self.consts_num.iter().position(|&x| x.to_bits() == n.to_bits()) {
            return Ok(idx as u32);
        }
        self.consts_num.push(n);
        Ok((self.consts_num.len() - 1) as u32)
    }

    pub fn strconst(&mut self, id: StrId) -> Result<u32, super::Error> {
        let gc = GConst::Str(id);
        if let Some(idx) = self.consts_gc.iter().position(|c| gconst_matches(c, &gc)) {
            return Ok(idx as u32);
        }
        self.consts_gc.push(gc);
        Ok((self.consts_gc.len() - 1) as u32)
    }

    pub fn childconst(&mut self, child: Rc<Prototype>) -> u32 {
        let child_idx = self.children.len() as u32;
        self.children.push(child);
        let gc = GConst::Child(child_idx);
        self.consts_gc.push(gc);
        (self.consts_gc.len() - 1) as u32
    }

    pub fn tableconst(&mut self, table: crate::value::TableRef) -> u32 {
        self.consts_gc.push(GConst::Table(table));
        (self.consts_gc.len() - 1) as u32
    }

    /// Registers `child` without allocating a `GConst::Child` constant slot
    /// — used for probe handlers, which are reached only from
    /// `Prototype::probes`, never from an `FNEW` in this function's own
    /// bytecode.
    pub fn add_child(&mut self, child: Rc<Prototype>) -> u32 {
        let idx = self.children.len() as u32;
        self.children.push(child);
        idx
    }

    /// Rewrites `GGET A,idx` into `GFUNC A,registry_idx` wherever `idx`
    /// names a known built-in, so the interpreter loads a cached function
    /// reference instead of probing the globals table at runtime (spec
    /// §4.8 "GFUNC... peephole rewrite"). Runs once per function right
    /// before `into_prototype`, so it naturally applies bottom-up: a
    /// child's own `GGET`s are already rewritten by the time its parent
    /// finishes.
    pub fn rewrite_builtins(&mut self, lookup: impl Fn(StrId) -> Option<u32>) {
        for pc in 0..self.code.len() {
            let ins = self.code[pc];
            if ins.op() != OpCode::Gget {
                continue;
            }
            let GConst::Str(id) = &self.consts_gc[ins.d() as usize] else {
                continue;
            };
            if let Some(registry_idx) = lookup(*id) {
                self.code[pc] = Instruction::encode_ad(OpCode::Gfunc, ins.a(), registry_idx as u16);
            }
        }
    }

    #[must_use]
    pub fn into_prototype(mut self, flags_extra: ProtoFlags, chunkname: Option<StrId>) -> Prototype {
        let mut flags = flags_extra;
        if self.is_vararg {
            flags |= ProtoFlags::VARARG;
        }
        if !self.children.is_empty() {
            flags |= ProtoFlags::CHILD;
        }
        // GFUNC is the "load cached builtin" peephole opcode, not a header
        // (proto.rs: "first entry is the FUNCF/FUNCV frame-size header") —
        // the main chunk is a vararg function like any other.
        let header_op = if self.is_vararg { OpCode::Funcv } else { OpCode::Funcf };
        self.code[0] = Instruction::encode_ad(header_op, self.numparams, u16::from(self.max_reg));
        Prototype {
            numparams: self.numparams,
            framesize: self.max_reg,
            flags,
            bytecode: self.code,
            consts_gc: self.consts_gc,
            consts_num: self.consts_num,
            upvalues: self.upvalues,
            children: self.children,
            debug: DebugInfo {
                chunkname,
                firstline: self.firstline,
                lines: self.lines,
                upvalue_names: self.upvalue_names,
                locals: self.locals_debug,
            },
            closure_count: std::cell::Cell::new(0),
            probes: self.probes,
        }
    }
}
