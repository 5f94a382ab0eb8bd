//! C11 (ambient): the base function library (spec §6 "Free functions are
//! installed directly into the globals table"; grounded on
//! `lib_base.c`'s `ktap_lib_*` table). Only the calling contract is in
//! scope (spec §1 Non-goal "Built-in library functions... only the calling
//! contract is part of the core") — this module implements a representative
//! slice of that contract rather than the full ~40-function library.

mod base;

use crate::state::GlobalState;

/// Registration order. Mirrored 1:1 into the `GlobalState::natives` index
/// space by [`register_all`], and handed to `parser::parse`'s `registry`
/// parameter so the `GGET`->`GFUNC` peephole resolves to the same indices.
pub const NAMES: &[&str] =
    &["print", "pairs", "next", "ipairs", "ipairs_aux", "len", "type", "tostring", "tonumber", "exit"];

/// Installs the base library's free functions into `global`'s native
/// registry and globals table (spec §6). Call once, before compiling or
/// running any chunk against this `GlobalState`.
pub fn register_all(global: &mut GlobalState) {
    let fns: [crate::state::NativeFn; 10] = [
        base::print,
        base::pairs,
        base::next,
        base::ipairs,
        base::ipairs_aux,
        base::len,
        base::lib_type,
        base::tostring,
        base::tonumber,
        base::exit,
    ];
    for (name, func) in NAMES.iter().zip(fns) {
        let idx = global.register_native(name, func);
        let key = global.strpool.intern_str(name).expect("builtin name interns");
        let _ = global
            .globals
            .borrow_mut()
            .set(crate::value::Value::Str(key), crate::value::Value::CFunc(idx));
    }
}
