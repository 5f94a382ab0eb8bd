//! Call frames (spec §4.8 `precall`/`poscall`; bit names grounded on
//! `kp_vm.c`'s `callstatus` bitset).

use bitflags::bitflags;

use crate::value::FuncRef;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallStatus: u8 {
        /// Interpreter should keep running in the caller's code once this
        /// frame returns, rather than unwinding out of `execute` entirely.
        const REENTRY = 0b0000_0001;
        /// Frame belongs to a ktap closure, as opposed to a native call.
        const KTAP = 0b0000_0010;
    }
}

#[derive(Debug)]
pub struct Frame {
    pub closure: FuncRef,
    pub base: usize,
    pub nresults_wanted: i32,
    pub status: CallStatus,
}

impl Frame {
    #[must_use]
    pub fn new(closure: FuncRef, base: usize, nresults_wanted: i32, status: CallStatus) -> Self {
        Frame { closure, base, nresults_wanted, status }
    }
}
