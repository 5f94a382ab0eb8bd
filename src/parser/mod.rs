//! C5: single-pass recursive-descent parser/bytecode emitter (spec §4.5).
//!
//! Expressions lower through precedence-climbing into `ExpDesc`s; control
//! flow lowers through a two-jump test protocol ([`emit`]): a test opcode
//! (`IST`/`ISLT`/...) is always immediately followed by two `JMP`s, the
//! first taken when the condition holds, the second reached only by
//! fallthrough. `if`/`while`/`repeat`/`&&`/`||` all compose from the same
//! pair of jump lists.
//!
//! Calls and `...` always request exactly one result in this compiler —
//! there is no multi-value argument/return expansion, so `RETM`/`CALLM`/
//! `CALLT` are never emitted here (they stay in the opcode set for a more
//! capable future compiler or hand-assembled chunks).

mod emit;
mod expdesc;
mod funcstate;

use std::fmt;
use std::rc::Rc;

use crate::bc::{Instruction, OpCode};
use crate::lexer::{Keyword, Lexer, Token};
use crate::proto::{ProbeDecl, ProbeKind, ProtoFlags, Prototype, UpvalDesc};
use crate::strpool::{StrId, StrPool};

use expdesc::{ExpDesc, IndexKey, Kind};
use funcstate::{FuncState, KP_MAX_UPVAL};

#[derive(Debug, Clone)]
pub struct Error {
    pub line: u32,
    pub message: String,
}

impl Error {
    #[must_use]
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Error {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for Error {}

impl From<crate::lexer::Error> for Error {
    fn from(e: crate::lexer::Error) -> Self {
        Error::new(e.line, e.to_string())
    }
}

impl From<crate::strpool::Error> for Error {
    fn from(e: crate::strpool::Error) -> Self {
        Error::new(0, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Parses a complete chunk into its main prototype. The chunk itself is
/// always treated as accepting varargs (command-line `-e`/script arguments).
/// `registry` names the host's built-in functions in registration order —
/// a `GGET` of one of these names is rewritten to `GFUNC` (spec §4.8).
pub fn parse(src: &[u8], chunkname: &str, strpool: &mut StrPool, registry: &[&str]) -> Result<Prototype> {
    let lex = Lexer::new(chunkname, src);
    let mut builtins = Vec::with_capacity(registry.len());
    for (idx, name) in registry.iter().enumerate() {
        builtins.push((strpool.intern_str(name)?, idx as u32));
    }
    let mut parser = Parser {
        lex,
        strpool,
        funcs: vec![FuncState::new(1)],
        builtins,
    };
    parser.cur_fs().is_vararg = true;
    while parser.peek()? != Token::Eof {
        parser.statement()?;
    }
    let extra_flags = parser.emit_implicit_return();
    let fs = parser.funcs.pop().expect("main FuncState");
    let chunkname_id = parser.strpool.intern_str(chunkname)?;
    Ok(parser.finish(fs, extra_flags, Some(chunkname_id)))
}

struct Parser<'a, 'p> {
    lex: Lexer<'a>,
    strpool: &'p mut StrPool,
    funcs: Vec<FuncState>,
    builtins: Vec<(StrId, u32)>,
}

impl<'a, 'p> Parser<'a, 'p> {
    fn cur_fs(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("at least one FuncState")
    }

    /// Applies the `GGET`->`GFUNC` builtin peephole and finalizes `fs` into
    /// an immutable `Prototype`. The single place every `FuncState` must
    /// pass through before being wrapped in an `Rc`.
    fn finish(&self, mut fs: FuncState, extra_flags: ProtoFlags, chunkname: Option<StrId>) -> Prototype {
        let builtins = &self.builtins;
        fs.rewrite_builtins(|id| builtins.iter().find(|(n, _)| *n == id).map(|(_, idx)| *idx));
        fs.into_prototype(extra_flags, chunkname)
    }

    fn line_now(&self) -> u32 {
        self.lex.line()
    }

    fn err_here(&self, message: impl Into<String>) -> Error {
        Error::new(self.line_now(), message)
    }

    fn peek(&mut self) -> Result<Token> {
        Ok(self.lex.peek()?.clone())
    }

    fn bump(&mut self) -> Result<(Token, u32)> {
        Ok(self.lex.next()?)
    }

    fn expect(&mut self, tok: Token) -> Result<()> {
        let (t, l) = self.bump()?;
        if t != tok {
            return Err(Error::new(l, format!("'{}' expected near '{}'", tok.describe(), t.describe())));
        }
        Ok(())
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<u32> {
        let (t, l) = self.bump()?;
        match t {
            Token::Keyword(k) if k == kw => Ok(l),
            other => Err(Error::new(l, format!("keyword expected near '{}'", other.describe()))),
        }
    }

    fn expect_name(&mut self) -> Result<StrId> {
        let (t, l) = self.bump()?;
        match t {
            Token::Name(s) => Ok(self.strpool.intern_str(&s)?),
            other => Err(Error::new(l, format!("name expected near '{}'", other.describe()))),
        }
    }

    fn not_shadowed(&mut self, name: &str) -> bool {
        match self.strpool.lookup(name.as_bytes()) {
            Some(sid) => !self.funcs.iter().any(|fs| fs.resolve_local(sid).is_some()),
            None => true,
        }
    }

    // ---- blocks / statements -------------------------------------------

    fn block(&mut self) -> Result<()> {
        self.expect(Token::LBrace)?;
        loop {
            let t = self.peek()?;
            if t == Token::RBrace || t == Token::Eof {
                break;
            }
            self.statement()?;
        }
        self.expect(Token::RBrace)?;
        Ok(())
    }

    fn statement(&mut self) -> Result<()> {
        match self.peek()? {
            Token::Semi => {
                self.bump()?;
                Ok(())
            }
            Token::Keyword(Keyword::Var) => self.var_decl(),
            Token::Keyword(Keyword::If) => self.if_stmt(),
            Token::Keyword(Keyword::While) => self.while_stmt(),
            Token::Keyword(Keyword::Repeat) => self.repeat_stmt(),
            Token::Keyword(Keyword::For) => self.for_stmt(),
            Token::Keyword(Keyword::Function) => self.function_stmt(),
            Token::Keyword(Keyword::Return) => self.return_stmt(),
            Token::Keyword(Keyword::Break) => self.break_stmt(),
            Token::Keyword(Keyword::Trace) => self.probe_stmt(ProbeKind::Trace),
            Token::Keyword(Keyword::TraceEnd) => self.probe_stmt(ProbeKind::TraceEnd),
            Token::Keyword(Keyword::Profile) => self.probe_stmt(ProbeKind::Profile),
            Token::Keyword(Keyword::Tick) => self.probe_stmt(ProbeKind::Tick),
            Token::LBrace => {
                self.cur_fs().enter_scope(false);
                self.block()?;
                let end_pc = self.cur_fs().code.len() as u32;
                let _ = self.cur_fs().leave_scope(end_pc);
                Ok(())
            }
            _ => self.expr_stmt(),
        }
    }

    fn emit_implicit_return(&mut self) -> ProtoFlags {
        let fs = self.cur_fs();
        let has_explicit = matches!(
            fs.code.last().map(|i| i.op()),
            Some(OpCode::Ret0 | OpCode::Ret1 | OpCode::Ret | OpCode::Retm)
        );
        if has_explicit {
            ProtoFlags::HAS_RETURN
        } else {
            let line = fs.firstline;
            fs.emit(Instruction::encode_ad(OpCode::Ret0, 0, 0), line);
            ProtoFlags::FIXUP_RETURN
        }
    }

    fn var_decl(&mut self) -> Result<()> {
        let line = self.expect_keyword(Keyword::Var)?;
        let mut names = vec![self.expect_name()?];
        while self.peek()? == Token::Comma {
            self.bump()?;
            names.push(self.expect_name()?);
        }
        let mut regs: Vec<u8> = Vec::new();
        if self.peek()? == Token::Assign {
            self.bump()?;
            loop {
                let e = self.expr()?;
                let reg = {
                    let fs = self.cur_fs();
                    emit::discharge(fs, &e, line)?
                };
                regs.push(reg);
                if self.peek()? == Token::Comma {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        while regs.len() < names.len() {
            let fs = self.cur_fs();
            let reg = fs.reserve_regs(1)?;
            fs.emit(Instruction::encode_ad(OpCode::Knil, reg, 0), line);
            regs.push(reg);
        }
        let last_reg = regs[names.len() - 1];
        {
            let fs = self.cur_fs();
            for (name, reg) in names.iter().zip(regs.iter()) {
                fs.bind_local(*name, *reg);
            }
            fs.free_to(last_reg + 1);
        }
        if self.peek()? == Token::Semi {
            self.bump()?;
        }
        Ok(())
    }

    fn if_stmt(&mut self) -> Result<()> {
        let line = self.expect_keyword(Keyword::If)?;
        self.expect(Token::LParen)?;
        let cond = self.expr()?;
        self.expect(Token::RParen)?;
        let (true_jumps, mut pending_false) = self.cond_jumps(&cond, line)?;
        emit::patch_to_here(self.cur_fs(), &true_jumps);
        self.cur_fs().enter_scope(false);
        self.block()?;
        let end_pc = self.cur_fs().code.len() as u32;
        let _ = self.cur_fs().leave_scope(end_pc);

        let mut end_jumps = Vec::new();
        loop {
            match self.peek()? {
                Token::Keyword(Keyword::Elseif) => {
                    let eline = self.expect_keyword(Keyword::Elseif)?;
                    end_jumps.push(emit::emit_jump(self.cur_fs(), eline));
                    emit::patch_to_here(self.cur_fs(), &pending_false);
                    self.expect(Token::LParen)?;
                    let c2 = self.expr()?;
                    self.expect(Token::RParen)?;
                    let (t2, f2) = self.cond_jumps(&c2, eline)?;
                    emit::patch_to_here(self.cur_fs(), &t2);
                    self.cur_fs().enter_scope(false);
                    self.block()?;
                    let e2 = self.cur_fs().code.len() as u32;
                    let _ = self.cur_fs().leave_scope(e2);
                    pending_false = f2;
                }
                Token::Keyword(Keyword::Else) => {
                    self.expect_keyword(Keyword::Else)?;
                    end_jumps.push(emit::emit_jump(self.cur_fs(), line));
                    emit::patch_to_here(self.cur_fs(), &pending_false);
                    pending_false = Vec::new();
                    self.cur_fs().enter_scope(false);
                    self.block()?;
                    let e3 = self.cur_fs().code.len() as u32;
                    let _ = self.cur_fs().leave_scope(e3);
                    break;
                }
                _ => break,
            }
        }
        emit::patch_to_here(self.cur_fs(), &pending_false);
        emit::patch_to_here(self.cur_fs(), &end_jumps);
        Ok(())
    }

    fn while_stmt(&mut self) -> Result<()> {
        let line = self.expect_keyword(Keyword::While)?;
        let loop_start = self.cur_fs().code.len();
        self.expect(Token::LParen)?;
        let cond = self.expr()?;
        self.expect(Token::RParen)?;
        let (true_jumps, false_jumps) = self.cond_jumps(&cond, line)?;
        emit::patch_to_here(self.cur_fs(), &true_jumps);
        self.cur_fs().enter_scope(true);
        self.block()?;
        let end_pc = self.cur_fs().code.len() as u32;
        let breaks = self.cur_fs().leave_scope(end_pc);
        let back = emit::emit_jump(self.cur_fs(), line);
        emit::patch_list(self.cur_fs(), &[back], loop_start);
        emit::patch_to_here(self.cur_fs(), &false_jumps);
        emit::patch_to_here(self.cur_fs(), &breaks);
        Ok(())
    }

    fn repeat_stmt(&mut self) -> Result<()> {
        let line = self.expect_keyword(Keyword::Repeat)?;
        let loop_start = self.cur_fs().code.len();
        self.cur_fs().enter_scope(true);
        self.block()?;
        self.expect_keyword(Keyword::Until)?;
        self.expect(Token::LParen)?;
        let cond = self.expr()?;
        self.expect(Token::RParen)?;
        // Locals declared in the body stay live for the condition (matching
        // the scope, not the body's own closing brace).
        let (true_jumps, false_jumps) = self.cond_jumps(&cond, line)?;
        let end_pc = self.cur_fs().code.len() as u32;
        let breaks = self.cur_fs().leave_scope(end_pc);
        emit::patch_list(self.cur_fs(), &false_jumps, loop_start);
        emit::patch_to_here(self.cur_fs(), &true_jumps);
        emit::patch_to_here(self.cur_fs(), &breaks);
        Ok(())
    }

    fn for_stmt(&mut self) -> Result<()> {
        self.expect_keyword(Keyword::For)?;
        self.expect(Token::LParen)?;
        let first_name = self.expect_name()?;
        match self.peek()? {
            Token::Assign => self.numeric_for(first_name),
            Token::Comma | Token::Keyword(Keyword::In) => self.generic_for(first_name),
            other => Err(self.err_here(format!("'=' or 'in' expected near '{}'", other.describe()))),
        }
    }

    fn numeric_for(&mut self, name: StrId) -> Result<()> {
        let line = self.line_now();
        self.bump()?; // '='
        let start_e = self.expr()?;
        self.expect(Token::Comma)?;
        let stop_e = self.expr()?;
        let step_e = if self.peek()? == Token::Comma {
            self.bump()?;
            Some(self.expr()?)
        } else {
            None
        };
        self.expect(Token::RParen)?;

        let base = self.cur_fs().reserve_regs(4)?;
        {
            let r = {
                let fs = self.cur_fs();
                emit::discharge(fs, &start_e, line)?
            };
            let fs = self.cur_fs();
            if r != base {
                fs.emit(Instruction::encode_ad(OpCode::Mov, base, u16::from(r)), line);
            }
            fs.free_to(base + 1);
        }
        {
            let r = {
                let fs = self.cur_fs();
                emit::discharge(fs, &stop_e, line)?
            };
            let fs = self.cur_fs();
            if r != base + 1 {
                fs.emit(Instruction::encode_ad(OpCode::Mov, base + 1, u16::from(r)), line);
            }
            fs.free_to(base + 2);
        }
        match step_e {
            Some(e) => {
                let r = {
                    let fs = self.cur_fs();
                    emit::discharge(fs, &e, line)?
                };
                let fs = self.cur_fs();
                if r != base + 2 {
                    fs.emit(Instruction::encode_ad(OpCode::Mov, base + 2, u16::from(r)), line);
                }
            }
            None => {
                let fs = self.cur_fs();
                let idx = fs.numconst(1.0)?;
                fs.emit(Instruction::encode_ad(OpCode::Knum, base + 2, idx as u16), line);
            }
        }
        self.cur_fs().free_to(base + 3);

        let fori_pc = {
            let fs = self.cur_fs();
            fs.emit(Instruction::encode_ad(OpCode::Fori, base, 0), line)
        };
        let body_start = self.cur_fs().code.len();
        self.cur_fs().enter_scope(true);
        self.cur_fs().bind_local(name, base + 3);
        self.block()?;
        let end_pc = self.cur_fs().code.len() as u32;
        let breaks = self.cur_fs().leave_scope(end_pc);
        let forl_pc = {
            let fs = self.cur_fs();
            fs.emit(Instruction::encode_ad(OpCode::Forl, base, 0), line)
        };
        emit::patch_list(self.cur_fs(), &[forl_pc], body_start);
        let exit_pc = self.cur_fs().code.len();
        emit::patch_list(self.cur_fs(), &[fori_pc], exit_pc);
        emit::patch_to_here(self.cur_fs(), &breaks);
        Ok(())
    }

    fn generic_for(&mut self, first_name: StrId) -> Result<()> {
        let line = self.line_now();
        let mut second_name = None;
        if self.peek()? == Token::Comma {
            self.bump()?;
            second_name = Some(self.expect_name()?);
        }
        self.expect_keyword(Keyword::In)?;
        let iter_e = self.expr()?;
        self.expect(Token::RParen)?;

        // base: iterable table, base+1: control key, base+2: k, base+3: v.
        let base = self.cur_fs().reserve_regs(4)?;
        {
            let r = {
                let fs = self.cur_fs();
                emit::discharge(fs, &iter_e, line)?
            };
            let fs = self.cur_fs();
            if r != base {
                fs.emit(Instruction::encode_ad(OpCode::Mov, base, u16::from(r)), line);
            }
            fs.emit(Instruction::encode_ad(OpCode::Knil, base + 1, 0), line);
        }
        self.cur_fs().free_to(base + 4);

        let prep_jmp = emit::emit_jump(self.cur_fs(), line);
        let body_start = self.cur_fs().code.len();
        self.cur_fs().enter_scope(true);
        self.cur_fs().bind_local(first_name, base + 2);
        if let Some(v) = second_name {
            self.cur_fs().bind_local(v, base + 3);
        }
        self.block()?;
        let end_pc = self.cur_fs().code.len() as u32;
        let breaks = self.cur_fs().leave_scope(end_pc);

        emit::patch_to_here(self.cur_fs(), &[prep_jmp]);
        let iterl_pc = {
            let fs = self.cur_fs();
            fs.emit(Instruction::encode_abc(OpCode::Itern, base + 2, base, base + 1), line);
            fs.emit(Instruction::encode_ad(OpCode::Iterl, base + 2, 0), line)
        };
        emit::patch_list(self.cur_fs(), &[iterl_pc], body_start);
        emit::patch_to_here(self.cur_fs(), &breaks);
        Ok(())
    }

    fn function_body(&mut self, line: u32) -> Result<Rc<Prototype>> {
        self.expect(Token::LParen)?;
        self.funcs.push(FuncState::new(line));
        if self.peek()? != Token::RParen {
            loop {
                match self.peek()? {
                    Token::Dots => {
                        self.bump()?;
                        self.cur_fs().is_vararg = true;
                        break;
                    }
                    Token::Name(n) => {
                        self.bump()?;
                        let sid = self.strpool.intern_str(&n)?;
                        self.cur_fs().new_local(sid)?;
                        self.cur_fs().numparams += 1;
                    }
                    other => return Err(self.err_here(format!("parameter name expected near '{}'", other.describe()))),
                }
                if self.peek()? == Token::Comma {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        self.block()?;
        let extra_flags = self.emit_implicit_return();
        let fs = self.funcs.pop().expect("function FuncState");
        Ok(Rc::new(self.finish(fs, extra_flags, None)))
    }

    fn function_expr(&mut self) -> Result<ExpDesc> {
        let line = self.expect_keyword(Keyword::Function)?;
        let proto = self.function_body(line)?;
        let gidx = self.cur_fs().childconst(proto);
        let fs = self.cur_fs();
        let pc = fs.emit(Instruction::encode_ad(OpCode::Fnew, 0, gidx as u16), line);
        Ok(ExpDesc::new(Kind::Relocable(pc)))
    }

    fn function_stmt(&mut self) -> Result<()> {
        let line = self.expect_keyword(Keyword::Function)?;
        let name = self.expect_name()?;
        let proto = self.function_body(line)?;
        let gidx = self.cur_fs().childconst(proto);
        let fs = self.cur_fs();
        let pc = fs.emit(Instruction::encode_ad(OpCode::Fnew, 0, gidx as u16), line);
        let reg = emit::discharge(fs, &ExpDesc::new(Kind::Relocable(pc)), line)?;
        let sidx = fs.strconst(name)?;
        fs.emit(Instruction::encode_ad(OpCode::Gset, reg, sidx as u16), line);
        fs.free_to(reg);
        Ok(())
    }

    fn probe_stmt(&mut self, kind: ProbeKind) -> Result<()> {
        let (kw_line, spec_text) = match kind {
            ProbeKind::Trace => {
                let l = self.expect_keyword(Keyword::Trace)?;
                (l, Some(self.lex.read_raw_until(b'{')))
            }
            ProbeKind::TraceEnd => (self.expect_keyword(Keyword::TraceEnd)?, None),
            ProbeKind::Profile => {
                let l = self.expect_keyword(Keyword::Profile)?;
                (l, Some(self.lex.read_raw_until(b'{')))
            }
            ProbeKind::Tick => {
                let l = self.expect_keyword(Keyword::Tick)?;
                (l, Some(self.lex.read_raw_until(b'{')))
            }
        };
        self.funcs.push(FuncState::new(kw_line));
        self.block()?;
        let extra_flags = self.emit_implicit_return();
        let handler_fs = self.funcs.pop().expect("probe handler FuncState");
        let proto = Rc::new(self.finish(handler_fs, extra_flags, None));
        let spec = match spec_text {
            Some(s) => Some(self.strpool.intern_str(s.trim())?),
            None => None,
        };
        let fs = self.cur_fs();
        let handler = fs.add_child(proto);
        fs.probes.push(ProbeDecl { kind, spec, handler });
        Ok(())
    }

    fn return_stmt(&mut self) -> Result<()> {
        let line = self.expect_keyword(Keyword::Return)?;
        if matches!(self.peek()?, Token::RBrace | Token::Semi | Token::Eof) {
            if self.peek()? == Token::Semi {
                self.bump()?;
            }
            self.cur_fs().emit(Instruction::encode_ad(OpCode::Ret0, 0, 0), line);
            return Ok(());
        }
        let start = self.cur_fs().freereg;
        loop {
            let e = self.expr()?;
            let fs = self.cur_fs();
            emit::discharge(fs, &e, line)?;
            if self.peek()? == Token::Comma {
                self.bump()?;
            } else {
                break;
            }
        }
        let count = self.cur_fs().freereg - start;
        let fs = self.cur_fs();
        let tail_call = count == 1
            && fs
                .code
                .last()
                .is_some_and(|ins| ins.op() == OpCode::Call && ins.a() == start);
        if tail_call {
            let nargs_plus_one = fs.code.last().unwrap().b();
            let last = fs.code.len() - 1;
            fs.code[last] = Instruction::encode_ad(OpCode::Callt, start, u16::from(nargs_plus_one));
        } else if count == 1 {
            fs.emit(Instruction::encode_ad(OpCode::Ret1, start, 0), line);
        } else {
            fs.emit(Instruction::encode_ad(OpCode::Ret, start, u16::from(count)), line);
        }
        if self.peek()? == Token::Semi {
            self.bump()?;
        }
        Ok(())
    }

    fn break_stmt(&mut self) -> Result<()> {
        let line = self.expect_keyword(Keyword::Break)?;
        if !self.cur_fs().in_loop() {
            return Err(Error::new(line, "'break' outside a loop"));
        }
        let pc = emit::emit_jump(self.cur_fs(), line);
        self.cur_fs().record_break(pc);
        if self.peek()? == Token::Semi {
            self.bump()?;
        }
        Ok(())
    }

    fn expr_stmt(&mut self) -> Result<()> {
        let line = self.line_now();
        let lhs = self.suffixed_expr()?;
        match self.peek()? {
            Token::Assign => {
                self.bump()?;
                let rhs = self.expr()?;
                self.store(&lhs, &rhs, line)?;
            }
            Token::PlusEq => {
                self.bump()?;
                let rhs = self.expr()?;
                self.increment(&lhs, &rhs, line)?;
            }
            _ => {
                if !matches!(lhs.kind, Kind::NonReloc(_)) {
                    return Err(Error::new(line, "syntax error: expected assignment or call"));
                }
            }
        }
        if self.peek()? == Token::Semi {
            self.bump()?;
        }
        Ok(())
    }

    fn store(&mut self, target: &ExpDesc, rhs: &ExpDesc, line: u32) -> Result<()> {
        match target.kind {
            Kind::Local(reg) => {
                let vreg = {
                    let fs = self.cur_fs();
                    emit::discharge(fs, rhs, line)?
                };
                let fs = self.cur_fs();
                if vreg != reg {
                    fs.emit(Instruction::encode_ad(OpCode::Mov, reg, u16::from(vreg)), line);
                }
                fs.free_to(vreg.min(reg));
                Ok(())
            }
            Kind::Upval(idx) => {
                let vreg = {
                    let fs = self.cur_fs();
                    emit::discharge(fs, rhs, line)?
                };
                let fs = self.cur_fs();
                fs.emit(Instruction::encode_ad(OpCode::Usetv, idx, u16::from(vreg)), line);
                fs.free_to(vreg);
                Ok(())
            }
            Kind::Global(idx) => {
                let vreg = {
                    let fs = self.cur_fs();
                    emit::discharge(fs, rhs, line)?
                };
                let fs = self.cur_fs();
                fs.emit(Instruction::encode_ad(OpCode::Gset, vreg, idx as u16), line);
                fs.free_to(vreg);
                Ok(())
            }
            Kind::Indexed { table, key } => {
                let vreg = {
                    let fs = self.cur_fs();
                    emit::discharge(fs, rhs, line)?
                };
                let fs = self.cur_fs();
                let ins = match key {
                    IndexKey::Reg(k) => Instruction::encode_abc(OpCode::TsetV, vreg, table, k),
                    IndexKey::Str(s) => Instruction::encode_abc(OpCode::TsetS, vreg, table, s as u8),
                    IndexKey::Byte(b) => Instruction::encode_abc(OpCode::TsetB, vreg, table, b),
                };
                fs.emit(ins, line);
                fs.free_to(vreg.min(table));
                Ok(())
            }
            _ => Err(Error::new(line, "cannot assign to this expression")),
        }
    }

    fn increment(&mut self, target: &ExpDesc, rhs: &ExpDesc, line: u32) -> Result<()> {
        let vreg = {
            let fs = self.cur_fs();
            emit::discharge(fs, rhs, line)?
        };
        let fs = self.cur_fs();
        match target.kind {
            Kind::Local(reg) => {
                fs.emit(Instruction::encode_abc(OpCode::AddVV, reg, reg, vreg), line);
                fs.free_to(vreg);
            }
            Kind::Upval(idx) => {
                fs.emit(Instruction::encode_ad(OpCode::Uincv, idx, u16::from(vreg)), line);
                fs.free_to(vreg);
            }
            Kind::Global(idx) => {
                fs.emit(Instruction::encode_ad(OpCode::Ginc, vreg, idx as u16), line);
                fs.free_to(vreg);
            }
            Kind::Indexed { table, key } => {
                let ins = match key {
                    IndexKey::Reg(k) => Instruction::encode_abc(OpCode::TincV, vreg, table, k),
                    IndexKey::Str(s) => Instruction::encode_abc(OpCode::TincS, vreg, table, s as u8),
                    IndexKey::Byte(b) => Instruction::encode_abc(OpCode::TincB, vreg, table, b),
                };
                fs.emit(ins, line);
                fs.free_to(vreg.min(table));
            }
            _ => return Err(Error::new(line, "cannot increment this expression")),
        }
        Ok(())
    }

    // ---- expressions -----------------------------------------------------

    fn expr(&mut self) -> Result<ExpDesc> {
        self.or_expr()
    }

    fn cond_jumps(&mut self, e: &ExpDesc, line: u32) -> Result<(Vec<usize>, Vec<usize>)> {
        if matches!(e.kind, Kind::Jump) {
            return Ok((e.true_jumps.clone(), e.false_jumps.clone()));
        }
        let reg = {
            let fs = self.cur_fs();
            emit::discharge(fs, e, line)?
        };
        let fs = self.cur_fs();
        fs.free_to(reg);
        fs.emit(Instruction::encode_ad(OpCode::Ist, reg, 0), line);
        let jt = emit::emit_jump(fs, line);
        let jf = emit::emit_jump(fs, line);
        Ok((vec![jt], vec![jf]))
    }

    fn or_expr(&mut self) -> Result<ExpDesc> {
        let mut left = self.and_expr()?;
        while self.peek()? == Token::OrOr {
            let line = self.bump()?.1;
            let (lt, lf) = self.cond_jumps(&left, line)?;
            emit::patch_to_here(self.cur_fs(), &lf);
            let right = self.and_expr()?;
            let (rt, rf) = self.cond_jumps(&right, line)?;
            let mut true_jumps = lt;
            true_jumps.extend(rt);
            left = ExpDesc {
                kind: Kind::Jump,
                true_jumps,
                false_jumps: rf,
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<ExpDesc> {
        let mut left = self.cmp_expr()?;
        while self.peek()? == Token::AndAnd {
            let line = self.bump()?.1;
            let (lt, lf) = self.cond_jumps(&left, line)?;
            emit::patch_to_here(self.cur_fs(), &lt);
            let right = self.cmp_expr()?;
            let (rt, rf) = self.cond_jumps(&right, line)?;
            let mut false_jumps = lf;
            false_jumps.extend(rf);
            left = ExpDesc {
                kind: Kind::Jump,
                true_jumps: rt,
                false_jumps,
            };
        }
        Ok(left)
    }

    fn cmp_expr(&mut self) -> Result<ExpDesc> {
        let left = self.shift_expr()?;
        let op = match self.peek()? {
            Token::Lt => OpCode::Islt,
            Token::Gt => OpCode::Isgt,
            Token::Le => OpCode::Isle,
            Token::Ge => OpCode::Isge,
            Token::EqEq => OpCode::Iseqv,
            Token::NotEq => OpCode::Isnev,
            _ => return Ok(left),
        };
        let line = self.bump()?.1;
        let right = self.shift_expr()?;
        let areg = {
            let fs = self.cur_fs();
            emit::discharge(fs, &left, line)?
        };
        let breg = {
            let fs = self.cur_fs();
            emit::discharge(fs, &right, line)?
        };
        let fs = self.cur_fs();
        fs.free_to(areg.min(breg));
        fs.emit(Instruction::encode_ad(op, areg, u16::from(breg)), line);
        let jt = emit::emit_jump(fs, line);
        let jf = emit::emit_jump(fs, line);
        Ok(ExpDesc {
            kind: Kind::Jump,
            true_jumps: vec![jt],
            false_jumps: vec![jf],
        })
    }

    fn shift_expr(&mut self) -> Result<ExpDesc> {
        let mut left = self.add_expr()?;
        loop {
            let op = match self.peek()? {
                Token::Shl => emit::Token2::Shl,
                Token::Shr => emit::Token2::Shr,
                _ => break,
            };
            let line = self.bump()?.1;
            let right = self.add_expr()?;
            left = self.combine_arith(left, right, op, line)?;
        }
        Ok(left)
    }

    fn add_expr(&mut self) -> Result<ExpDesc> {
        let mut left = self.mul_expr()?;
        loop {
            let op = match self.peek()? {
                Token::Plus => emit::Token2::Add,
                Token::Minus => emit::Token2::Sub,
                _ => break,
            };
            let line = self.bump()?.1;
            let right = self.mul_expr()?;
            left = self.combine_arith(left, right, op, line)?;
        }
        Ok(left)
    }

    fn mul_expr(&mut self) -> Result<ExpDesc> {
        let mut left = self.unary_expr()?;
        loop {
            let op = match self.peek()? {
                Token::Star => emit::Token2::Mul,
                Token::Slash => emit::Token2::Div,
                Token::Percent => emit::Token2::Mod,
                _ => break,
            };
            let line = self.bump()?.1;
            let right = self.unary_expr()?;
            left = self.combine_arith(left, right, op, line)?;
        }
        Ok(left)
    }

    fn combine_arith(&mut self, left: ExpDesc, right: ExpDesc, op: emit::Token2, line: u32) -> Result<ExpDesc> {
        let consts = self.cur_fs().consts_num.clone();
        if let (Some(a), Some(b)) = (left.as_number(&consts), right.as_number(&consts)) {
            if let Some(folded) = emit::fold_arith(op, a, b) {
                let idx = self.cur_fs().numconst(folded)?;
                return Ok(ExpDesc::new(Kind::KNum(idx)));
            }
        }
        if !matches!(op, emit::Token2::Shl | emit::Token2::Shr) {
            if let Some(b) = right.as_number(&consts) {
                if !left.is_constant() {
                    let lreg = {
                        let fs = self.cur_fs();
                        emit::discharge(fs, &left, line)?
                    };
                    let bidx = self.cur_fs().numconst(b)?;
                    if bidx <= u32::from(u8::MAX) {
                        let fs = self.cur_fs();
                        fs.free_to(lreg);
                        let pc = fs.emit(Instruction::encode_abc(arith_vn(op), 0, lreg, bidx as u8), line);
                        return Ok(ExpDesc::new(Kind::Relocable(pc)));
                    }
                }
            }
            if let Some(a) = left.as_number(&consts) {
                if !right.is_constant() {
                    let rreg = {
                        let fs = self.cur_fs();
                        emit::discharge(fs, &right, line)?
                    };
                    let aidx = self.cur_fs().numconst(a)?;
                    if aidx <= u32::from(u8::MAX) {
                        let fs = self.cur_fs();
                        fs.free_to(rreg);
                        let pc = fs.emit(Instruction::encode_abc(arith_nv(op), 0, aidx as u8, rreg), line);
                        return Ok(ExpDesc::new(Kind::Relocable(pc)));
                    }
                }
            }
        }
        let lreg = {
            let fs = self.cur_fs();
            emit::discharge(fs, &left, line)?
        };
        let rreg = {
            let fs = self.cur_fs();
            emit::discharge(fs, &right, line)?
        };
        let fs = self.cur_fs();
        fs.free_to(lreg.min(rreg));
        let pc = fs.emit(Instruction::encode_abc(arith_vv(op), 0, lreg, rreg), line);
        Ok(ExpDesc::new(Kind::Relocable(pc)))
    }

    fn unary_expr(&mut self) -> Result<ExpDesc> {
        match self.peek()? {
            Token::Minus => {
                let line = self.bump()?.1;
                let e = self.unary_expr()?;
                let consts = self.cur_fs().consts_num.clone();
                if let Some(n) = e.as_number(&consts) {
                    let idx = self.cur_fs().numconst(-n)?;
                    return Ok(ExpDesc::new(Kind::KNum(idx)));
                }
                let reg = {
                    let fs = self.cur_fs();
                    emit::discharge(fs, &e, line)?
                };
                let fs = self.cur_fs();
                fs.free_to(reg);
                let pc = fs.emit(Instruction::encode_ad(OpCode::Unm, 0, u16::from(reg)), line);
                Ok(ExpDesc::new(Kind::Relocable(pc)))
            }
            Token::Not => {
                let line = self.bump()?.1;
                let e = self.unary_expr()?;
                let (t, f) = self.cond_jumps(&e, line)?;
                Ok(ExpDesc {
                    kind: Kind::Jump,
                    true_jumps: f,
                    false_jumps: t,
                })
            }
            _ => self.suffixed_expr(),
        }
    }

    fn suffixed_expr(&mut self) -> Result<ExpDesc> {
        let mut e = self.primary_expr()?;
        loop {
            match self.peek()? {
                Token::Dot => {
                    let line = self.bump()?.1;
                    let name = self.expect_name()?;
                    let table_reg = {
                        let fs = self.cur_fs();
                        emit::discharge(fs, &e, line)?
                    };
                    let str_idx = self.cur_fs().strconst(name)?;
                    e = ExpDesc::new(Kind::Indexed {
                        table: table_reg,
                        key: IndexKey::Str(str_idx),
                    });
                }
                Token::LBracket => {
                    let line = self.bump()?.1;
                    let key_e = self.expr()?;
                    self.expect(Token::RBracket)?;
                    let table_reg = {
                        let fs = self.cur_fs();
                        emit::discharge(fs, &e, line)?
                    };
                    let key_reg = {
                        let fs = self.cur_fs();
                        emit::discharge(fs, &key_e, line)?
                    };
                    e = ExpDesc::new(Kind::Indexed {
                        table: table_reg,
                        key: IndexKey::Reg(key_reg),
                    });
                }
                Token::LParen => {
                    let line = self.line_now();
                    let callee_reg = {
                        let fs = self.cur_fs();
                        emit::discharge(fs, &e, line)?
                    };
                    let nargs = self.call_args(line)?;
                    let fs = self.cur_fs();
                    fs.emit(Instruction::encode_abc(OpCode::Call, callee_reg, nargs + 1, 2), line);
                    fs.free_to(callee_reg + 1);
                    e = ExpDesc::new(Kind::NonReloc(callee_reg));
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn call_args(&mut self, line: u32) -> Result<u8> {
        self.expect(Token::LParen)?;
        let start = self.cur_fs().freereg;
        if self.peek()? != Token::RParen {
            loop {
                let e = self.expr()?;
                let fs = self.cur_fs();
                emit::discharge(fs, &e, line)?;
                if self.peek()? == Token::Comma {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        Ok(self.cur_fs().freereg - start)
    }

    fn intrinsic_call(&mut self, op: OpCode, name: &str, line: u32) -> Result<ExpDesc> {
        self.expect(Token::LParen)?;
        let d: u16 = if name == "arg" {
            let (t, l) = self.bump()?;
            match t {
                Token::Number(n) => n as u16,
                other => return Err(Error::new(l, format!("numeric argument index expected near '{}'", other.describe()))),
            }
        } else {
            0
        };
        self.expect(Token::RParen)?;
        let fs = self.cur_fs();
        let reg = fs.reserve_regs(1)?;
        fs.emit(Instruction::encode_ad(op, reg, d), line);
        Ok(ExpDesc::new(Kind::NonReloc(reg)))
    }

    fn table_constructor(&mut self) -> Result<ExpDesc> {
        let line = self.line_now();
        self.expect(Token::LBrace)?;
        let dest = {
            let fs = self.cur_fs();
            let d = fs.reserve_regs(1)?;
            fs.emit(Instruction::encode_ad(OpCode::Tnew, d, 0), line);
            d
        };
        let mut array_idx: u8 = 1;
        loop {
            let t = self.peek()?;
            if t == Token::RBrace {
                break;
            }
            if t == Token::LBracket {
                self.bump()?;
                let key_e = self.expr()?;
                self.expect(Token::RBracket)?;
                self.expect(Token::Assign)?;
                let val_e = self.expr()?;
                let kreg = {
                    let fs = self.cur_fs();
                    emit::discharge(fs, &key_e, line)?
                };
                let vreg = {
                    let fs = self.cur_fs();
                    emit::discharge(fs, &val_e, line)?
                };
                let fs = self.cur_fs();
                fs.emit(Instruction::encode_abc(OpCode::TsetV, vreg, dest, kreg), line);
                fs.free_to(kreg.min(vreg));
            } else {
                let val_e = self.expr()?;
                let vreg = {
                    let fs = self.cur_fs();
                    emit::discharge(fs, &val_e, line)?
                };
                let fs = self.cur_fs();
                fs.emit(Instruction::encode_abc(OpCode::TsetB, vreg, dest, array_idx), line);
                fs.free_to(vreg);
                array_idx = array_idx.saturating_add(1);
            }
            if matches!(self.peek()?, Token::Comma | Token::Semi) {
                self.bump()?;
            } else {
                break;
            }
        }
        self.expect(Token::RBrace)?;
        Ok(ExpDesc::new(Kind::NonReloc(dest)))
    }

    fn primary_expr(&mut self) -> Result<ExpDesc> {
        let line = self.line_now();
        match self.peek()? {
            Token::Number(n) => {
                self.bump()?;
                let idx = self.cur_fs().numconst(n)?;
                Ok(ExpDesc::new(Kind::KNum(idx)))
            }
            Token::Str(bytes) => {
                self.bump()?;
                let sid = self.strpool.intern(&bytes)?;
                let idx = self.cur_fs().strconst(sid)?;
                Ok(ExpDesc::new(Kind::KGc(idx)))
            }
            Token::Keyword(Keyword::Nil) => {
                self.bump()?;
                Ok(ExpDesc::new(Kind::Nil))
            }
            Token::Keyword(Keyword::True) => {
                self.bump()?;
                Ok(ExpDesc::new(Kind::True))
            }
            Token::Keyword(Keyword::False) => {
                self.bump()?;
                Ok(ExpDesc::new(Kind::False))
            }
            Token::Dots => {
                self.bump()?;
                let fs = self.cur_fs();
                let reg = fs.reserve_regs(1)?;
                fs.emit(Instruction::encode_abc(OpCode::Varg, reg, 0, 2), line);
                Ok(ExpDesc::new(Kind::NonReloc(reg)))
            }
            Token::LParen => {
                self.bump()?;
                let e = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(e)
            }
            Token::LBrace => self.table_constructor(),
            Token::Keyword(Keyword::Function) => self.function_expr(),
            Token::Name(name) => {
                self.bump()?;
                if let Some(op) = emit::intrinsic_opcode(&name) {
                    if self.peek()? == Token::LParen && self.not_shadowed(&name) {
                        return self.intrinsic_call(op, &name, line);
                    }
                }
                let sid = self.strpool.intern_str(&name)?;
                self.resolve_name(sid)
            }
            other => Err(self.err_here(format!("unexpected symbol near '{}'", other.describe()))),
        }
    }

    fn resolve_name(&mut self, sid: StrId) -> Result<ExpDesc> {
        let depth = self.funcs.len();
        for i in (0..depth).rev() {
            if let Some(reg) = self.funcs[i].resolve_local(sid) {
                if i == depth - 1 {
                    return Ok(ExpDesc::new(Kind::Local(reg)));
                }
                let uv = self.capture_chain(i, sid)?;
                return Ok(ExpDesc::new(Kind::Upval(uv)));
            }
        }
        let idx = self.cur_fs().strconst(sid)?;
        Ok(ExpDesc::new(Kind::Global(idx)))
    }

    /// Walks outward from `owner_level` (where the local actually lives) to
    /// the innermost function, registering (or reusing) an `UpvalDesc` at
    /// each intermediate level. Only ever touches one `FuncState` at a time
    /// to avoid borrowing two elements of `self.funcs` simultaneously.
    fn capture_chain(&mut self, owner_level: usize, name: StrId) -> Result<u8> {
        let mut index = self.funcs[owner_level].resolve_local(name).expect("caller already confirmed this");
        self.funcs[owner_level].mark_captured(index);
        let mut local = true;
        for lvl in (owner_level + 1)..self.funcs.len() {
            if let Some(existing) = self.funcs[lvl].upvalue_names.iter().position(|&n| n == name) {
                index = existing as u8;
                local = false;
                continue;
            }
            if self.funcs[lvl].upvalues.len() >= KP_MAX_UPVAL {
                return Err(self.err_here("too many upvalues"));
            }
            self.funcs[lvl].upvalues.push(UpvalDesc {
                local,
                immutable: false,
                index,
            });
            self.funcs[lvl].upvalue_names.push(name);
            index = (self.funcs[lvl].upvalues.len() - 1) as u8;
            local = false;
        }
        Ok(index)
    }
}

fn arith_vv(op: emit::Token2) -> OpCode {
    use emit::Token2::*;
    match op {
        Add => OpCode::AddVV,
        Sub => OpCode::SubVV,
        Mul => OpCode::MulVV,
        Div => OpCode::DivVV,
        Mod => OpCode::ModVV,
        Shl => OpCode::ShlVV,
        Shr => OpCode::ShrVV,
    }
}

fn arith_vn(op: emit::Token2) -> OpCode {
    use emit::Token2::*;
    match op {
        Add => OpCode::AddVN,
        Sub => OpCode::SubVN,
        Mul => OpCode::MulVN,
        Div => OpCode::DivVN,
        Mod => OpCode::ModVN,
        Shl | Shr => unreachable!("shifts never take the VN/NV peephole path"),
    }
}

fn arith_nv(op: emit::Token2) -> OpCode {
    use emit::Token2::*;
    match op {
        Add => OpCode::AddNV,
        Sub => OpCode::SubNV,
        Mul => OpCode::MulNV,
        Div => OpCode::DivNV,
        Mod => OpCode::ModNV,
        Shl | Shr => unreachable!("shifts never take the VN/NV peephole path"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Prototype {
        let mut pool = StrPool::new();
        parse(src.as_bytes(), "test", &mut pool, &[]).unwrap()
    }

    #[test]
    fn empty_chunk_has_implicit_return() {
        let proto = parse_ok("");
        assert!(proto.flags.contains(ProtoFlags::FIXUP_RETURN));
        assert_eq!(proto.bytecode.last().unwrap().op(), OpCode::Ret0);
    }

    #[test]
    fn var_decl_assigns_and_reads_back() {
        let proto = parse_ok("var x = 1; return x;");
        assert!(proto.bytecode.iter().any(|i| i.op() == OpCode::Ret1));
    }

    #[test]
    fn if_else_emits_jumps() {
        let proto = parse_ok("if (1 < 2) { var x = 1; } else { var x = 2; }");
        assert!(proto.bytecode.iter().any(|i| i.op() == OpCode::Islt));
        assert!(proto.bytecode.iter().any(|i| i.op() == OpCode::Jmp));
    }

    #[test]
    fn while_loop_jumps_backward() {
        let proto = parse_ok("var i = 0; while (i < 10) { i += 1; }");
        assert!(proto.bytecode.iter().any(|i| i.op() == OpCode::Ginc || i.op() == OpCode::AddVV));
    }

    #[test]
    fn numeric_for_uses_fori_forl() {
        let proto = parse_ok("for (i = 0, 10) { }");
        assert!(proto.bytecode.iter().any(|i| i.op() == OpCode::Fori));
        assert!(proto.bytecode.iter().any(|i| i.op() == OpCode::Forl));
    }

    #[test]
    fn intrinsic_call_rewrites_to_dedicated_opcode() {
        let proto = parse_ok("var p = pid();");
        assert!(proto.bytecode.iter().any(|i| i.op() == OpCode::Vpid));
        assert!(!proto.bytecode.iter().any(|i| i.op() == OpCode::Gget && false));
    }

    #[test]
    fn trace_block_becomes_a_probe_decl_not_bytecode() {
        let proto = parse_ok("trace syscalls:sys_enter_open { var x = 1; }");
        assert_eq!(proto.probes.len(), 1);
        assert_eq!(proto.probes[0].kind, ProbeKind::Trace);
        assert_eq!(proto.children.len(), 1);
    }

    #[test]
    fn function_literal_closes_over_outer_local() {
        let proto = parse_ok("var x = 1; function f() { return x; }");
        assert_eq!(proto.children.len(), 1);
        assert!(!proto.children[0].upvalues.is_empty());
    }

    #[test]
    fn constant_folding_collapses_arithmetic() {
        let proto = parse_ok("var x = 2 + 3 * 4;");
        assert_eq!(proto.consts_num, vec![4.0, 3.0, 2.0, 14.0]);
    }

    #[test]
    fn loop_var_captured_by_closure_emits_uclo() {
        let proto = parse_ok("var fns = {}; for (i = 1, 3) { fns[i] = function() { return i; }; }");
        assert!(proto.bytecode.iter().any(|i| i.op() == OpCode::Uclo));
    }

    #[test]
    fn plain_loop_without_capture_emits_no_uclo() {
        let proto = parse_ok("var sum = 0; for (i = 0, 5) { sum += i; }");
        assert!(!proto.bytecode.iter().any(|i| i.op() == OpCode::Uclo));
    }
}
