//! C3: table — array part + open-addressed hash part (spec §3, §4.3).

use std::rc::Rc;
use std::{error, fmt};

use crate::value::{StatData, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    NilKey,
    NanKey,
    /// "table overflow, please enlarge entries"
    Overflow,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NilKey => write!(f, "table index is nil"),
            Self::NanKey => write!(f, "table index is NaN"),
            Self::Overflow => write!(f, "table overflow, please enlarge entries"),
        }
    }
}

impl error::Error for Error {}

/// A node of the hash part. `next` chains collisions within the node array
/// itself (spec §3 "`next` chains collisions... in the node array itself").
#[derive(Debug, Clone)]
struct Node {
    key: Value,
    val: Value,
    next: Option<usize>,
}

impl Node {
    fn empty() -> Self {
        Node {
            key: Value::Nil,
            val: Value::Nil,
            next: None,
        }
    }

    fn is_free(&self) -> bool {
        matches!(self.key, Value::Nil)
    }
}

pub struct Table {
    array: Vec<Value>,
    hash: Vec<Node>,
    hmask: usize,
    /// One past the last free node considered by `find_free_node`,
    /// descending as in `newkey` (spec §4.3).
    freetop: usize,
}

fn key_basis(v: &Value) -> u64 {
    match v {
        Value::Num(n) => n.to_bits(),
        Value::Str(id) => u64::from(*id) ^ 0x9e37_79b9,
        Value::True => 1,
        Value::False => 0,
        Value::LightUserdata(p) => *p as u64,
        Value::Table(t) => Rc::as_ptr(t) as *const () as u64,
        Value::Func(f) => Rc::as_ptr(f) as *const () as u64,
        Value::Proto(p) => Rc::as_ptr(p) as *const () as u64,
        Value::Upval(u) => Rc::as_ptr(u) as *const () as u64,
        Value::Stat(s) => Rc::as_ptr(s) as *const () as u64,
        Value::EventStr(s) => Rc::as_ptr(s) as *const u8 as u64,
        Value::KStack { depth, skip } => (u64::from(*depth) << 32) | u64::from(*skip),
        Value::KIp(p) | Value::UIp(p) => *p as u64,
        Value::CData(_) | Value::Nil => 0,
    }
}

/// Integer index in `1..` if this key is exactly representable as one.
fn as_positive_integer(v: &Value) -> Option<i64> {
    match v {
        Value::Num(n) if n.fract() == 0.0 && n.is_finite() && *n >= 1.0 => Some(*n as i64),
        _ => None,
    }
}

fn is_valid_key(v: &Value) -> Result<(), Error> {
    match v {
        Value::Nil => Err(Error::NilKey),
        Value::Num(n) if n.is_nan() => Err(Error::NanKey),
        _ => Ok(()),
    }
}

impl Table {
    #[must_use]
    pub fn new(asize: usize, hbits: u32) -> Self {
        let hcap = if hbits == 0 { 0 } else { 1usize << hbits };
        Table {
            array: vec![Value::Nil; asize],
            hash: (0..hcap).map(|_| Node::empty()).collect(),
            hmask: hcap.saturating_sub(1),
            freetop: hcap,
        }
    }

    #[must_use]
    pub fn array_size(&self) -> usize {
        self.array.len()
    }

    fn main_position(&self, key: &Value) -> usize {
        if self.hash.is_empty() {
            0
        } else {
            (key_basis(key) as usize) & self.hmask
        }
    }

    /// Semantic length: number of non-nil entries across both parts (spec
    /// §4.1 — not an O(1) `#` operator).
    #[must_use]
    pub fn len(&self) -> usize {
        self.array.iter().filter(|v| **v != Value::Nil).count()
            + self.hash.iter().filter(|n| n.val != Value::Nil).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_node(&self, key: &Value) -> Option<usize> {
        if self.hash.is_empty() {
            return None;
        }
        let mut idx = self.main_position(key);
        loop {
            let node = &self.hash[idx];
            if node.is_free() {
                return None;
            }
            if &node.key == key {
                return Some(idx);
            }
            idx = node.next?;
        }
    }

    #[must_use]
    pub fn get(&self, key: &Value) -> Value {
        if let Some(i) = as_positive_integer(key) {
            if (i as usize) <= self.array.len() {
                return self.array[i as usize - 1].clone();
            }
        }
        if self.hash.is_empty() {
            return Value::Nil;
        }
        self.find_node(key).map_or(Value::Nil, |i| self.hash[i].val.clone())
    }

    fn find_free_node(&mut self) -> Option<usize> {
        while self.freetop > 0 {
            self.freetop -= 1;
            if self.hash[self.freetop].is_free() {
                return Some(self.freetop);
            }
        }
        None
    }

    /// `set(t, k, v)`; implements `newkey` (spec §4.3) when the key is
    /// absent: preserves an existing key's node position unless displaced by
    /// a colliding main-position reinsert.
    pub fn set(&mut self, key: Value, val: Value) -> Result<(), Error> {
        is_valid_key(&key)?;

        if let Some(i) = as_positive_integer(&key) {
            let idx = i as usize - 1;
            if idx < self.array.len() {
                self.array[idx] = val;
                return Ok(());
            }
        }

        if let Some(i) = self.find_node(&key) {
            self.hash[i].val = val;
            return Ok(());
        }

        if self.hash.is_empty() {
            // No hash part at all: grow a one-node part lazily so single
            // stray keys on a table sized for array-only use still work.
            self.hash = vec![Node::empty()];
            self.hmask = 0;
            self.freetop = 1;
        }

        let mp = self.main_position(&key);
        if self.hash[mp].is_free() {
            self.hash[mp] = Node { key, val, next: None };
            return Ok(());
        }

        // Occupied: does the occupant actually belong at its main position?
        let occupant_mp = self.main_position(&self.hash[mp].key.clone());
        let free = self.find_free_node().ok_or(Error::Overflow)?;
        if occupant_mp == mp {
            // Occupant is correctly placed; chain the new key off it.
            self.hash[free] = Node {
                key,
                val,
                next: self.hash[mp].next,
            };
            self.hash[mp].next = Some(free);
        } else {
            // Occupant collided into `mp` from elsewhere; evict it to the
            // free slot and fix up the previous link in its chain, then
            // claim `mp` for the new key.
            let mut prev = occupant_mp;
            while self.hash[prev].next != Some(mp) {
                prev = self.hash[prev].next.expect("chain must reach mp");
            }
            self.hash[free] = self.hash[mp].clone();
            self.hash[prev].next = Some(free);
            self.hash[mp] = Node { key, val, next: None };
        }
        Ok(())
    }

    /// Atomic (single-table-lock) increment used by `a[k] += n` (spec §4.3
    /// "Atomic increment"). Operates on a plain number or on a `Stat` cell.
    pub fn incr(&mut self, key: Value, delta: f64) -> Result<(), Error> {
        let current = self.get(&key);
        match current {
            Value::Nil => self.set(key, Value::Num(delta)),
            Value::Num(n) => self.set(key, Value::Num(n + delta)),
            Value::Stat(cell) => {
                cell.borrow_mut().add_sample(delta);
                Ok(())
            }
            _ => self.set(key, Value::Num(delta)),
        }
    }

    /// Merge `other`'s stat cells into `self`'s (spec §4.3 "merging two
    /// tables sums all four fields pairwise"), used to synthesize
    /// per-CPU `ptable` shards into one aggregate.
    pub fn merge_stats_from(&mut self, other: &Table) {
        for (idx, v) in other.array.iter().enumerate() {
            if let Value::Stat(src) = v {
                let key = Value::Num((idx + 1) as f64);
                match self.get(&key) {
                    Value::Stat(dst) => dst.borrow_mut().merge(&src.borrow()),
                    Value::Nil => {
                        let merged = Rc::new(std::cell::RefCell::new(*src.borrow()));
                        let _ = self.set(key, Value::Stat(merged));
                    }
                    _ => {}
                }
            }
        }
        for node in &other.hash {
            if let Value::Stat(src) = &node.val {
                match self.get(&node.key) {
                    Value::Stat(dst) => dst.borrow_mut().merge(&src.borrow()),
                    Value::Nil => {
                        let merged = Rc::new(std::cell::RefCell::new(*src.borrow()));
                        let _ = self.set(node.key.clone(), Value::Stat(merged));
                    }
                    _ => {}
                }
            }
        }
    }

    /// `next(k)`: array indices ascending, then hash nodes in storage order
    /// (spec §3 "Iteration order").
    pub fn next(&self, key: Option<&Value>) -> Option<(Value, Value)> {
        let mut array_start = 0usize;
        let mut hash_start = 0usize;
        match key {
            None => {}
            Some(k) => {
                if let Some(i) = as_positive_integer(k) {
                    if (i as usize) <= self.array.len() {
                        array_start = i as usize; // resume just after this array slot
                        return self.next_from(array_start, 0);
                    }
                }
                let idx = self.find_node(k)?;
                hash_start = idx + 1;
                return self.next_from(self.array.len(), hash_start);
            }
        }
        self.next_from(array_start, hash_start)
    }

    fn next_from(&self, array_from: usize, hash_from: usize) -> Option<(Value, Value)> {
        for i in array_from..self.array.len() {
            if self.array[i] != Value::Nil {
                return Some((Value::Num((i + 1) as f64), self.array[i].clone()));
            }
        }
        for i in hash_from..self.hash.len() {
            if self.hash[i].val != Value::Nil {
                return Some((self.hash[i].key.clone(), self.hash[i].val.clone()));
            }
        }
        None
    }

    /// Materialize all `(key, value)` pairs for sorted iteration (spec §4.3
    /// "Sorted iteration"). The caller supplies a comparator; `sort_next`
    /// then walks the resulting order via index.
    #[must_use]
    pub fn sorted_pairs<F>(&self, mut less: F) -> Vec<(Value, Value)>
    where
        F: FnMut(&(Value, Value), &(Value, Value)) -> bool,
    {
        let mut pairs = Vec::new();
        let mut key = None;
        while let Some((k, v)) = self.next(key.as_ref()) {
            pairs.push((k.clone(), v));
            key = Some(k);
        }
        pairs.sort_by(|a, b| {
            if less(a, b) {
                std::cmp::Ordering::Less
            } else if less(b, a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        pairs
    }

    /// Default comparator (spec §4.3): numbers descending, stat-data
    /// descending by `count`.
    #[must_use]
    pub fn default_less(a: &(Value, Value), b: &(Value, Value)) -> bool {
        match (&a.1, &b.1) {
            (Value::Num(x), Value::Num(y)) => x > y,
            (Value::Stat(x), Value::Stat(y)) => x.borrow().count > y.borrow().count,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_part_roundtrip() {
        let mut t = Table::new(4, 0);
        t.set(Value::Num(1.0), Value::Str(5)).unwrap();
        assert_eq!(t.get(&Value::Num(1.0)), Value::Str(5));
        t.set(Value::Num(1.0), Value::Nil).unwrap();
        assert_eq!(t.get(&Value::Num(1.0)), Value::Nil);
    }

    #[test]
    fn hash_part_collisions_preserve_main_position() {
        let mut t = Table::new(0, 1); // 2 hash nodes
        t.set(Value::Str(0), Value::Num(1.0)).unwrap();
        t.set(Value::Str(2), Value::Num(2.0)).unwrap();
        t.set(Value::Str(4), Value::Num(3.0)).unwrap();
        assert_eq!(t.get(&Value::Str(0)), Value::Num(1.0));
        assert_eq!(t.get(&Value::Str(2)), Value::Num(2.0));
        assert_eq!(t.get(&Value::Str(4)), Value::Num(3.0));
    }

    #[test]
    fn iteration_is_array_then_hash_order() {
        let mut t = Table::new(3, 2);
        t.set(Value::Num(3.0), Value::Str(2)).unwrap();
        t.set(Value::Num(1.0), Value::Str(0)).unwrap();
        t.set(Value::Num(2.0), Value::Str(1)).unwrap();
        let mut out = Vec::new();
        let mut key = None;
        while let Some((k, v)) = t.next(key.as_ref()) {
            out.push((k.clone(), v));
            key = Some(k);
        }
        assert_eq!(
            out,
            vec![
                (Value::Num(1.0), Value::Str(0)),
                (Value::Num(2.0), Value::Str(1)),
                (Value::Num(3.0), Value::Str(2)),
            ]
        );
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        let mut t = Table::new(0, 1);
        assert_eq!(t.set(Value::Nil, Value::Num(1.0)), Err(Error::NilKey));
        assert_eq!(t.set(Value::Num(f64::NAN), Value::Num(1.0)), Err(Error::NanKey));
    }

    #[test]
    fn clearing_a_hash_entry_drops_it_from_len_and_iteration() {
        let mut t = Table::new(0, 1);
        t.set(Value::Str(0), Value::Num(1.0)).unwrap();
        t.set(Value::Str(2), Value::Num(2.0)).unwrap();
        assert_eq!(t.len(), 2);
        t.set(Value::Str(0), Value::Nil).unwrap();
        assert_eq!(t.get(&Value::Str(0)), Value::Nil);
        assert_eq!(t.len(), 1);
        let mut out = Vec::new();
        let mut key = None;
        while let Some((k, v)) = t.next(key.as_ref()) {
            out.push((k.clone(), v));
            key = Some(k);
        }
        assert_eq!(out, vec![(Value::Str(2), Value::Num(2.0))]);
    }

    #[test]
    fn incr_accumulates_stat_cell() {
        let mut t = Table::new(0, 1);
        let cell = Rc::new(std::cell::RefCell::new(StatData::new()));
        t.set(Value::Str(0), Value::Stat(cell.clone())).unwrap();
        t.incr(Value::Str(0), 4.0).unwrap();
        t.incr(Value::Str(0), 6.0).unwrap();
        let s = cell.borrow();
        assert_eq!(s.count, 2);
        assert_eq!(s.sum, 10.0);
    }
}
