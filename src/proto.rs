//! Prototype tree (spec §3 "Prototype") shared by the parser/emitter (C5),
//! bytecode writer/reader (C6/C7) and the interpreter (C8).

use bitflags::bitflags;
use std::rc::Rc;

use crate::bc::Instruction;
use crate::strpool::StrId;
use crate::value::TableRef;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProtoFlags: u8 {
        const CHILD        = 0b0000_0001;
        const VARARG       = 0b0000_0010;
        const FFI          = 0b0000_0100;
        const NOJIT        = 0b0000_1000;
        const ILOOP        = 0b0001_0000;
        const HAS_RETURN   = 0b0010_0000;
        const FIXUP_RETURN = 0b0100_0000;
    }
}

/// GC constant slot (spec §3 "split constant array... GC constants at
/// negative indices"). Rather than literally addressing a shared array with
/// negative indices, each opcode's `D` operand indexes straight into
/// `consts_gc`/`consts_num` — the same information, simpler in Rust.
#[derive(Debug, Clone)]
pub enum GConst {
    Str(StrId),
    /// Index into `Prototype::children`.
    Child(u32),
    /// Rehydrated template table (spec §4.7 "Template tables... are
    /// rehydrated via `kp_tab_new`... populated via `kp_tab_set`").
    Table(TableRef),
}

#[derive(Debug, Clone, Copy)]
pub struct UpvalDesc {
    /// `true`: captures a local slot of the *immediately* enclosing
    /// function. `false`: inherits upvalue `index` of the parent.
    pub local: bool,
    pub immutable: bool,
    pub index: u8,
}

#[derive(Debug, Clone)]
pub struct LocalVarInfo {
    pub name: StrId,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Top-level probe declaration kind (spec §4.5 "`trace`/`trace_end`/
/// `profile`/`tick` blocks").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Trace,
    TraceEnd,
    Profile,
    Tick,
}

/// A `trace <spec> { ... }` (or `profile`/`tick`/`trace_end`) declaration.
/// These never emit bytecode of their own; the driver (C10) walks the main
/// chunk's `probes` after loading and registers `handler` with the matching
/// subsystem.
#[derive(Debug, Clone)]
pub struct ProbeDecl {
    pub kind: ProbeKind,
    /// Event-spec / interval text, verbatim; `None` for `trace_end`.
    pub spec: Option<StrId>,
    /// Index into `Prototype::children`.
    pub handler: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    pub chunkname: Option<StrId>,
    pub firstline: u32,
    /// Per-instruction line number, same length as `bytecode` (spec §4.6's
    /// `lineinfo`, decompressed rather than stored as deltas-with-width).
    pub lines: Vec<u32>,
    pub upvalue_names: Vec<StrId>,
    pub locals: Vec<LocalVarInfo>,
}

#[derive(Debug)]
pub struct Prototype {
    pub numparams: u8,
    pub framesize: u8,
    pub flags: ProtoFlags,
    /// First entry is the `FUNCF`/`FUNCV` frame-size header (spec §4.8).
    pub bytecode: Vec<Instruction>,
    pub consts_gc: Vec<GConst>,
    pub consts_num: Vec<f64>,
    pub upvalues: Vec<UpvalDesc>,
    pub children: Vec<Rc<Prototype>>,
    pub debug: DebugInfo,
    /// Saturating 3-bit "closures created" counter written by `FNEW` (spec
    /// §3, §9 "Open Questions" #3 — retained, read by nothing).
    pub closure_count: std::cell::Cell<u8>,
    /// Probe declarations collected while compiling this function's body.
    /// Only ever non-empty on the main chunk prototype.
    pub probes: Vec<ProbeDecl>,
}

impl Prototype {
    pub fn bump_closure_count(&self) {
        let n = self.closure_count.get();
        if n < 7 {
            self.closure_count.set(n + 1);
        }
    }

    #[must_use]
    pub fn is_vararg(&self) -> bool {
        self.flags.contains(ProtoFlags::VARARG)
    }
}
