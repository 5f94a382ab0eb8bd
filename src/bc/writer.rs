//! C6: chunk writer — header, postorder prototype serialization and
//! template-table constant encoding (spec §4.6 "Bytecode writer").

use std::rc::Rc;

use crate::bits::Writer;
use crate::proto::{DebugInfo, GConst, ProbeDecl, ProbeKind, Prototype};
use crate::strpool::StrPool;
use crate::table::Table;
use crate::value::Value;

pub const KTAP_MAGIC: [u8; 4] = *b"KTAP";
pub const KTAP_VERSION: u8 = 1;

pub const VALUE_TAG_NIL: u8 = 0;
pub const VALUE_TAG_FALSE: u8 = 1;
pub const VALUE_TAG_TRUE: u8 = 2;
pub const VALUE_TAG_NUM: u8 = 3;
pub const VALUE_TAG_STR: u8 = 4;
pub const VALUE_TAG_TABLE: u8 = 5;

const GCONST_TAG_STR: u8 = 0;
const GCONST_TAG_CHILD: u8 = 1;
const GCONST_TAG_TABLE: u8 = 2;

fn host_order_byte() -> u8 {
    if cfg!(target_endian = "little") {
        0
    } else {
        1
    }
}

/// Serializes `main` (and everything it transitively owns) into a
/// self-contained chunk buffer. Prototypes are emitted in postorder — every
/// child is fully written before its parent — so the reader can rebuild the
/// tree with a single forward pass and plain index lookups.
#[must_use]
pub fn write_chunk(main: &Rc<Prototype>, chunkname: &str, strpool: &StrPool) -> Vec<u8> {
    let mut body = Writer::new();
    let mut count: u32 = 0;
    let main_idx = write_proto_postorder(main, &mut body, strpool, &mut count);

    let mut w = Writer::new();
    w.write_bytes(&KTAP_MAGIC);
    w.write_u8(KTAP_VERSION);
    w.write_u8(host_order_byte());
    w.write_uleb128(chunkname.len() as u64);
    w.write_bytes(chunkname.as_bytes());
    w.write_uleb128(u64::from(count));
    w.write_uleb128(u64::from(main_idx));
    w.write_bytes(&body.into_bytes());
    w.into_bytes()
}

fn write_proto_postorder(proto: &Rc<Prototype>, w: &mut Writer, strpool: &StrPool, counter: &mut u32) -> u32 {
    for child in &proto.children {
        write_proto_postorder(child, w, strpool, counter);
    }
    write_proto_body(proto, w, strpool);
    let idx = *counter;
    *counter += 1;
    idx
}

fn write_proto_body(proto: &Prototype, w: &mut Writer, strpool: &StrPool) {
    w.write_u8(proto.flags.bits());
    w.write_u8(proto.numparams);
    w.write_u8(proto.framesize);

    w.write_uleb128(proto.bytecode.len() as u64);
    for ins in &proto.bytecode {
        w.write_u32_ne(ins.0);
    }

    w.write_uleb128(proto.consts_num.len() as u64);
    for n in &proto.consts_num {
        w.write_f64_ne(*n);
    }

    w.write_uleb128(proto.consts_gc.len() as u64);
    for gc in &proto.consts_gc {
        write_gconst(gc, w, strpool);
    }

    w.write_uleb128(proto.upvalues.len() as u64);
    for uv in &proto.upvalues {
        w.write_u8(u8::from(uv.local));
        w.write_u8(u8::from(uv.immutable));
        w.write_u8(uv.index);
    }

    // Children were just written by the caller; we only need to record how
    // many there are and at which (already-assigned) indices they live,
    // working backwards from the running counter.
    w.write_uleb128(proto.children.len() as u64);
    let mut child_idx = *counter;
    child_idx -= proto.children.len() as u32;
    for _ in &proto.children {
        w.write_uleb128(u64::from(child_idx));
        child_idx += 1;
    }

    write_debug(&proto.debug, w, strpool);

    w.write_uleb128(proto.probes.len() as u64);
    for probe in &proto.probes {
        write_probe(probe, w, strpool);
    }
}

fn write_probe(probe: &ProbeDecl, w: &mut Writer, strpool: &StrPool) {
    w.write_u8(match probe.kind {
        ProbeKind::Trace => 0,
        ProbeKind::TraceEnd => 1,
        ProbeKind::Profile => 2,
        ProbeKind::Tick => 3,
    });
    match probe.spec {
        Some(id) => {
            w.write_u8(1);
            let bytes = strpool.get(id).bytes();
            w.write_uleb128(bytes.len() as u64);
            w.write_bytes(bytes);
        }
        None => w.write_u8(0),
    }
    w.write_uleb128(u64::from(probe.handler));
}

fn write_gconst(gc: &GConst, w: &mut Writer, strpool: &StrPool) {
    match gc {
        GConst::Str(id) => {
            w.write_u8(GCONST_TAG_STR);
            w.write_uleb128(u64::from(*id));
        }
        GConst::Child(idx) => {
            w.write_u8(GCONST_TAG_CHILD);
            w.write_uleb128(u64::from(*idx));
        }
        GConst::Table(t) => {
            w.write_u8(GCONST_TAG_TABLE);
            write_template_table(&t.borrow(), w, strpool);
        }
    }
}

fn write_template_table(table: &Table, w: &mut Writer, strpool: &StrPool) {
    let mut pairs = Vec::new();
    let mut cursor: Option<Value> = None;
    loop {
        let next = table.next(cursor.as_ref());
        match next {
            Some((k, v)) => {
                pairs.push((k.clone(), v));
                cursor = Some(k);
            }
            None => break,
        }
    }
    w.write_uleb128(pairs.len() as u64);
    for (k, v) in &pairs {
        write_value(k, w, strpool);
        write_value(v, w, strpool);
    }
}

/// Template tables hold only literal constants (spec §4.5 "Table
/// constructors with only literal fields are folded into a template
/// table"); anything else is a compiler invariant violation, not a
/// reachable I/O error.
fn write_value(v: &Value, w: &mut Writer, strpool: &StrPool) {
    match v {
        Value::Nil => w.write_u8(VALUE_TAG_NIL),
        Value::False => w.write_u8(VALUE_TAG_FALSE),
        Value::True => w.write_u8(VALUE_TAG_TRUE),
        Value::Num(n) => {
            w.write_u8(VALUE_TAG_NUM);
            w.write_f64_ne(*n);
        }
        Value::Str(id) => {
            w.write_u8(VALUE_TAG_STR);
            let bytes = strpool.get(*id).bytes();
            w.write_uleb128(bytes.len() as u64);
            w.write_bytes(bytes);
        }
        Value::Table(t) => {
            w.write_u8(VALUE_TAG_TABLE);
            write_template_table(&t.borrow(), w, strpool);
        }
        other => panic!("non-literal value in template table constant: {other:?}"),
    }
}

fn write_debug(debug: &DebugInfo, w: &mut Writer, strpool: &StrPool) {
    w.write_u32_ne(debug.firstline);
    match debug.chunkname {
        Some(id) => {
            w.write_u8(1);
            let bytes = strpool.get(id).bytes();
            w.write_uleb128(bytes.len() as u64);
            w.write_bytes(bytes);
        }
        None => w.write_u8(0),
    }

    w.write_uleb128(debug.lines.len() as u64);
    for line in &debug.lines {
        w.write_u32_ne(*line);
    }

    w.write_uleb128(debug.upvalue_names.len() as u64);
    for id in &debug.upvalue_names {
        let bytes = strpool.get(*id).bytes();
        w.write_uleb128(bytes.len() as u64);
        w.write_bytes(bytes);
    }

    w.write_uleb128(debug.locals.len() as u64);
    for loc in &debug.locals {
        let bytes = strpool.get(loc.name).bytes();
        w.write_uleb128(bytes.len() as u64);
        w.write_bytes(bytes);
        w.write_u32_ne(loc.start_pc);
        w.write_u32_ne(loc.end_pc);
    }
}
