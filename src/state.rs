//! C9: global interpreter state, per-execution-context thread state and the
//! per-CPU recursion-context bitmap (spec §4.9 "VM state & scheduling
//! hooks").

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::strpool::StrPool;
use crate::table::Table;
use crate::value::{TableRef, UpvalRef, Value};

/// Recursion contexts a per-CPU worker may be entered from (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rctx {
    Nmi = 0,
    Irq = 1,
    Sirq = 2,
    Task = 3,
}

pub const RCTX_COUNT: usize = 4;

/// 4-bit-per-CPU reentrancy guard: one bit per `Rctx`, set while that
/// context is executing on this CPU (spec §4.9 "recursion-context
/// bitmap"). A single `Cell<u8>` stands in for what the original keeps as a
/// per-CPU array — one `RecursionCtxBitmap` is meant to be instantiated per
/// CPU the host schedules onto.
#[derive(Debug, Default)]
pub struct RecursionCtxBitmap {
    mask: Cell<u8>,
}

impl RecursionCtxBitmap {
    /// Claims `rctx`, returning `None` if it (or a context that nests
    /// inside it) is already active on this CPU — the reentrancy the
    /// bitmap exists to reject.
    pub fn get_recursion_context(&self, rctx: Rctx) -> Option<u8> {
        let bit = 1u8 << (rctx as u8);
        let cur = self.mask.get();
        if cur & bit != 0 {
            return None;
        }
        self.mask.set(cur | bit);
        Some(rctx as u8)
    }

    pub fn put_recursion_context(&self, rctx: u8) {
        let bit = 1u8 << rctx;
        self.mask.set(self.mask.get() & !bit);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub chunkname: String,
    pub line: u32,
    pub message: String,
}

/// Per-execution-context state (spec §4.9): the main thread gets one, and
/// (conceptually) so does every `(cpu, rctx)` worker a probe fires on —
/// though per `SPEC_FULL.md`'s Non-goals, only the main thread is ever
/// actually driven by this crate; worker contexts are a host responsibility
/// this type is shaped to support.
pub struct ThreadState {
    pub stack: Vec<Value>,
    pub open_upvalues: Vec<UpvalRef>,
    pub stop: bool,
    pub rctx: u8,
}

impl ThreadState {
    #[must_use]
    pub fn new(rctx: u8) -> Self {
        ThreadState {
            stack: Vec::new(),
            open_upvalues: Vec::new(),
            stop: false,
            rctx,
        }
    }
}

/// Native function convention mirroring `kp_lib_base.c`'s
/// `static int kp_lib_print(ktap_state *ks)`: the callee reads its
/// arguments from `vm.native.args` and pushes results onto
/// `vm.native.results`, returning how many of those results count.
pub type NativeFn = fn(&mut crate::vm::Vm) -> crate::vm::Result<usize>;

pub struct NativeEntry {
    pub name: &'static str,
    pub func: NativeFn,
}

/// Global interpreter state shared by every execution context: the string
/// pool, the globals table, the native-function registry and teardown
/// bookkeeping (spec §4.9, §4.1 "`allgc`").
pub struct GlobalState {
    pub strpool: StrPool,
    pub globals: TableRef,
    pub natives: Vec<NativeEntry>,
    pub allgc: Vec<crate::value::GcObject>,
    pub run_state: RunState,
    pub stop: AtomicBool,
    pub recursion_ctx: RecursionCtxBitmap,
    pub diagnostics: Vec<Diagnostic>,
    pub instr_count: u64,
    /// Execution-counter yield check interval (spec §4.8 "every 100000
    /// instructions on the main thread").
    pub instr_check_interval: u64,
}

impl GlobalState {
    #[must_use]
    pub fn new(strpool: StrPool) -> Self {
        GlobalState {
            strpool,
            globals: Rc::new(std::cell::RefCell::new(Table::new(0, 3))),
            natives: Vec::new(),
            allgc: Vec::new(),
            run_state: RunState::Idle,
            stop: AtomicBool::new(false),
            recursion_ctx: RecursionCtxBitmap::default(),
            diagnostics: Vec::new(),
            instr_count: 0,
            instr_check_interval: 100_000,
        }
    }

    pub fn register_native(&mut self, name: &'static str, func: NativeFn) -> u32 {
        let idx = self.natives.len() as u32;
        self.natives.push(NativeEntry { name, func });
        idx
    }

    #[must_use]
    pub fn find_native(&self, name: &str) -> Option<u32> {
        self.natives.iter().position(|n| n.name == name).map(|i| i as u32)
    }

    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Requests every running worker stop at its next `LOOP`/counter-tick
    /// check (spec §5 "Concurrency & resource model").
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn record_error(&mut self, chunkname: impl Into<String>, line: u32, message: impl Into<String>) {
        self.run_state = RunState::Error;
        self.diagnostics.push(Diagnostic {
            chunkname: chunkname.into(),
            line,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursion_bitmap_rejects_reentry() {
        let bm = RecursionCtxBitmap::default();
        let slot = bm.get_recursion_context(Rctx::Irq).unwrap();
        assert!(bm.get_recursion_context(Rctx::Irq).is_none());
        bm.put_recursion_context(slot);
        assert!(bm.get_recursion_context(Rctx::Irq).is_some());
    }

    #[test]
    fn independent_contexts_can_nest() {
        let bm = RecursionCtxBitmap::default();
        let _nmi = bm.get_recursion_context(Rctx::Nmi).unwrap();
        assert!(bm.get_recursion_context(Rctx::Task).is_some());
    }
}
