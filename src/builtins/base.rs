//! Individual free functions (grounded on `lib_base.c`'s `ktap_lib_print`,
//! `ktap_lib_pairs`, `ktap_lib_next`, `ktap_lib_len`, `ktap_lib_tostring`).

use crate::value::Value;
use crate::vm::{Error, Vm};

/// `print(...)`: tab-separated, newline-terminated (`ktap_lib_print`).
pub fn print(vm: &mut Vm) -> crate::vm::Result<usize> {
    let mut line = String::new();
    for (i, arg) in vm.native.args.iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        line.push_str(&vm.display_value(arg));
    }
    println!("{line}");
    Ok(0)
}

/// `next(t, k)`: one step of a table's raw iteration order
/// (`ktap_lib_next`/`kp_table_next`).
pub fn next(vm: &mut Vm) -> crate::vm::Result<usize> {
    let table = match vm.native.args.first() {
        Some(Value::Table(t)) => t.clone(),
        _ => return Err(Error::BadArgument("next: argument 1 is not a table")),
    };
    let key = vm.native.args.get(1).filter(|v| **v != Value::Nil).cloned();
    match table.borrow().next(key.as_ref()) {
        Some((k, v)) => {
            vm.native.results.push(k);
            vm.native.results.push(v);
            Ok(2)
        }
        None => {
            vm.native.results.push(Value::Nil);
            Ok(1)
        }
    }
}

/// One step of `ipairs`' integer-indexed iteration: given `(t, i)` returns
/// `(i+1, t[i+1])`, or just `nil` once that slot is empty.
pub(crate) fn ipairs_aux(vm: &mut Vm) -> crate::vm::Result<usize> {
    let table = match vm.native.args.first() {
        Some(Value::Table(t)) => t.clone(),
        _ => return Err(Error::BadArgument("ipairs: argument 1 is not a table")),
    };
    let i = match vm.native.args.get(1).and_then(Value::as_number) {
        Some(n) => n,
        None => return Err(Error::BadArgument("ipairs: argument 2 is not a number")),
    };
    let next_i = i + 1.0;
    let v = table.borrow().get(&Value::Num(next_i));
    if v == Value::Nil {
        vm.native.results.push(Value::Nil);
        Ok(1)
    } else {
        vm.native.results.push(Value::Num(next_i));
        vm.native.results.push(v);
        Ok(2)
    }
}

/// `ipairs(t)`: returns `(iterator, t, 0)` walking `t[1], t[2], ...` in
/// order until the first absent index (`ktap_lib_ipairs`-equivalent; not in
/// `lib_base.c`'s own table but standard alongside `pairs`/`next`).
pub fn ipairs(vm: &mut Vm) -> crate::vm::Result<usize> {
    let table = match vm.native.args.first() {
        Some(Value::Table(t)) => t.clone(),
        _ => return Err(Error::BadArgument("ipairs: argument 1 is not a table")),
    };
    let aux_id = vm.global.find_native("ipairs_aux").expect("ipairs_aux is always registered");
    vm.native.results.push(Value::CFunc(aux_id));
    vm.native.results.push(Value::Table(table));
    vm.native.results.push(Value::Num(0.0));
    Ok(3)
}

/// `pairs(t)`: returns `(next, t, nil)` so a generic-for drives `next`
/// across the whole table (`ktap_lib_pairs`).
pub fn pairs(vm: &mut Vm) -> crate::vm::Result<usize> {
    let table = match vm.native.args.first() {
        Some(Value::Table(t)) => t.clone(),
        Some(Value::Nil) | None => return Err(Error::BadArgument("pairs: table is nil")),
        _ => return Err(Error::BadArgument("pairs: argument 1 is not a table")),
    };
    let next_id = vm.global.find_native("next").expect("next is always registered");
    vm.native.results.push(Value::CFunc(next_id));
    vm.native.results.push(Value::Table(table));
    vm.native.results.push(Value::Nil);
    Ok(3)
}

/// `len(v)`: table length or string byte length (`ktap_lib_len`/`kp_objlen`).
pub fn len(vm: &mut Vm) -> crate::vm::Result<usize> {
    let n = match vm.native.args.first() {
        Some(Value::Table(t)) => t.borrow().len() as f64,
        Some(Value::Str(id)) => vm.global.strpool.get(*id).bytes().len() as f64,
        Some(Value::EventStr(s)) => s.len() as f64,
        _ => return Err(Error::BadArgument("len: unsupported argument")),
    };
    vm.native.results.push(Value::Num(n));
    Ok(1)
}

/// `type(v)`: the value's type tag as a string.
pub fn lib_type(vm: &mut Vm) -> crate::vm::Result<usize> {
    let name = vm.native.args.first().map_or("nil", Value::type_name);
    let id = vm.global.strpool.intern_str(name)?;
    vm.native.results.push(Value::Str(id));
    Ok(1)
}

/// `tostring(v)`: renders any value through its display form.
pub fn tostring(vm: &mut Vm) -> crate::vm::Result<usize> {
    let rendered = vm.native.args.first().map(|v| vm.display_value(v)).unwrap_or_else(|| "nil".to_string());
    let id = vm.global.strpool.intern_str(&rendered)?;
    vm.native.results.push(Value::Str(id));
    Ok(1)
}

/// `tonumber(v)`: numbers pass through; strings parse as float; anything
/// else yields `nil`.
pub fn tonumber(vm: &mut Vm) -> crate::vm::Result<usize> {
    let v = match vm.native.args.first() {
        Some(Value::Num(n)) => Value::Num(*n),
        Some(Value::Str(id)) => {
            let text = vm.global.strpool.get(*id).as_str();
            text.trim().parse::<f64>().map(Value::Num).unwrap_or(Value::Nil)
        }
        _ => Value::Nil,
    };
    vm.native.results.push(v);
    Ok(1)
}

/// `exit()`: requests every worker stop at its next check
/// (`ktap_lib_exit`/`kp_exit`).
pub fn exit(vm: &mut Vm) -> crate::vm::Result<usize> {
    vm.global.request_stop();
    Ok(0)
}
