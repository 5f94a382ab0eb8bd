//! Open-upvalue list (spec §4.8 "open-upvalue list", §4.9 "ordered by
//! descending stack address").

use crate::value::{UpvalRef, Upvalue, UpvalState, Value};

/// Finds (or creates) the upvalue aliasing `stack_offset`, keeping `open`
/// sorted by descending stack offset the way `findupval` scans it in the
/// original implementation.
pub fn findupval(open: &mut Vec<UpvalRef>, rctx: u8, stack_offset: usize) -> UpvalRef {
    let mut idx = 0;
    while idx < open.len() {
        let so = match open[idx].borrow().state {
            UpvalState::Open { stack_offset: so, .. } => so,
            UpvalState::Closed(_) => unreachable!("open list never holds a closed upvalue"),
        };
        if so == stack_offset {
            return open[idx].clone();
        }
        if so < stack_offset {
            break;
        }
        idx += 1;
    }
    let fresh = Upvalue::new_open(rctx, stack_offset, false);
    open.insert(idx, fresh.clone());
    fresh
}

/// Closes every open upvalue aliasing a stack slot `>= level`, copying the
/// current value out of `stack` into the upvalue itself (spec §4.8
/// "`function_close`"). Called whenever a frame whose locals might be
/// captured goes out of scope.
pub fn function_close(open: &mut Vec<UpvalRef>, stack: &[Value], level: usize) {
    open.retain(|uv| {
        let offset = match uv.borrow().state {
            UpvalState::Open { stack_offset, .. } => Some(stack_offset),
            UpvalState::Closed(_) => None,
        };
        match offset {
            Some(offset) if offset >= level => {
                let value = stack[offset].clone();
                uv.borrow_mut().state = UpvalState::Closed(value);
                false
            }
            _ => true,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn findupval_reuses_same_slot() {
        let mut open = Vec::new();
        let a = findupval(&mut open, 0, 3);
        let b = findupval(&mut open, 0, 3);
        assert!(std::rc::Rc::ptr_eq(&a, &b));
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn function_close_freezes_value_and_unlinks() {
        let mut open = Vec::new();
        let uv = findupval(&mut open, 0, 1);
        let stack = vec![Value::Nil, Value::Num(42.0)];
        function_close(&mut open, &stack, 1);
        assert!(open.is_empty());
        match &uv.borrow().state {
            UpvalState::Closed(Value::Num(n)) => assert_eq!(*n, 42.0),
            other => panic!("expected closed 42.0, got {other:?}"),
        }
    }
}
