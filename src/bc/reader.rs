//! C7: chunk reader — header/flag validation and postorder prototype
//! reconstruction (spec §4.7 "Bytecode loader").

use std::cell::RefCell;
use std::rc::Rc;
use std::{error, fmt};

use crate::bc::{Instruction, OpCode};
use crate::bits::{self, Cursor};
use crate::proto::{DebugInfo, GConst, LocalVarInfo, ProbeDecl, ProbeKind, Prototype, ProtoFlags, UpvalDesc};
use crate::strpool::{StrId, StrPool};
use crate::table::Table;
use crate::value::Value;

use super::writer::{KTAP_MAGIC, KTAP_VERSION, VALUE_TAG_FALSE, VALUE_TAG_NIL, VALUE_TAG_NUM, VALUE_TAG_STR, VALUE_TAG_TABLE, VALUE_TAG_TRUE};

#[derive(Debug)]
pub enum Error {
    BadMagic,
    UnsupportedVersion(u8),
    /// FFI chunk sections are rejected outright (Open Question #4).
    FfiUnsupported,
    BadConstantTag(u8),
    UnknownOpcode(u8),
    Bits(bits::Error),
    Str(crate::strpool::Error),
    Table(crate::table::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not a ktap chunk: bad magic"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported chunk version {v}"),
            Self::FfiUnsupported => write!(f, "chunk requires FFI support, not available"),
            Self::BadConstantTag(t) => write!(f, "corrupt chunk: bad constant tag {t}"),
            Self::UnknownOpcode(op) => write!(f, "corrupt chunk: unknown opcode {op}"),
            Self::Bits(e) => write!(f, "{e}"),
            Self::Str(e) => write!(f, "{e}"),
            Self::Table(e) => write!(f, "{e}"),
        }
    }
}

impl error::Error for Error {}

impl From<bits::Error> for Error {
    fn from(e: bits::Error) -> Self {
        Error::Bits(e)
    }
}

impl From<crate::strpool::Error> for Error {
    fn from(e: crate::strpool::Error) -> Self {
        Error::Str(e)
    }
}

impl From<crate::table::Error> for Error {
    fn from(e: crate::table::Error) -> Self {
        Error::Table(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Loaded chunk: the root prototype plus the chunk's declared name, used by
/// the driver (C10) to seed `DebugInfo::chunkname` attribution in error
/// messages.
pub struct LoadedChunk {
    pub chunkname: String,
    pub main: Rc<Prototype>,
}

pub fn read_chunk(bytes: &[u8], strpool: &mut StrPool) -> Result<LoadedChunk> {
    let mut cur = Cursor::new(bytes);
    let mut magic = [0u8; 4];
    magic.copy_from_slice(cur.read_bytes(4)?);
    if magic != KTAP_MAGIC {
        return Err(Error::BadMagic);
    }
    let version = cur.read_u8()?;
    if version != KTAP_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let native_order = cur.read_u8()?;
    let swap = native_order != host_order_byte();

    let name_len = cur.read_uleb128()? as usize;
    let chunkname = String::from_utf8_lossy(cur.read_bytes(name_len)?).into_owned();

    let count = cur.read_uleb128()? as usize;
    let main_idx = cur.read_uleb128()? as usize;

    let mut protos: Vec<Rc<Prototype>> = Vec::with_capacity(count);
    for _ in 0..count {
        let proto = read_proto(&mut cur, strpool, &protos, swap)?;
        protos.push(proto);
    }

    let main = protos
        .get(main_idx)
        .cloned()
        .unwrap_or_else(|| protos.last().expect("chunk with zero prototypes").clone());

    Ok(LoadedChunk { chunkname, main })
}

fn host_order_byte() -> u8 {
    if cfg!(target_endian = "little") {
        0
    } else {
        1
    }
}

fn swap_u16(v: u16, swap: bool) -> u16 {
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

fn swap_u32(v: u32, swap: bool) -> u32 {
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

fn swap_f64(v: f64, swap: bool) -> f64 {
    if swap {
        f64::from_bits(v.to_bits().swap_bytes())
    } else {
        v
    }
}

fn read_proto(
    cur: &mut Cursor,
    strpool: &mut StrPool,
    already_read: &[Rc<Prototype>],
    swap: bool,
) -> Result<Rc<Prototype>> {
    let flags = ProtoFlags::from_bits_truncate(cur.read_u8()?);
    if flags.contains(ProtoFlags::FFI) {
        return Err(Error::FfiUnsupported);
    }
    let numparams = cur.read_u8()?;
    let framesize = cur.read_u8()?;

    let bc_len = cur.read_uleb128()? as usize;
    let mut bytecode = Vec::with_capacity(bc_len);
    for _ in 0..bc_len {
        let raw = swap_u32(cur.read_u32_ne()?, swap);
        let word = OpCode::try_from((raw & 0xff) as u8).map_err(|_| Error::UnknownOpcode((raw & 0xff) as u8))?;
        let _ = word;
        bytecode.push(Instruction(raw));
    }

    let num_len = cur.read_uleb128()? as usize;
    let mut consts_num = Vec::with_capacity(num_len);
    for _ in 0..num_len {
        consts_num.push(swap_f64(cur.read_f64_ne()?, swap));
    }

    let gc_len = cur.read_uleb128()? as usize;
    let mut consts_gc = Vec::with_capacity(gc_len);
    for _ in 0..gc_len {
        consts_gc.push(read_gconst(cur, strpool, swap)?);
    }

    let uv_len = cur.read_uleb128()? as usize;
    let mut upvalues = Vec::with_capacity(uv_len);
    for _ in 0..uv_len {
        let local = cur.read_u8()? != 0;
        let immutable = cur.read_u8()? != 0;
        let index = cur.read_u8()?;
        upvalues.push(UpvalDesc { local, immutable, index });
    }

    let child_count = cur.read_uleb128()? as usize;
    let mut children = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        let idx = cur.read_uleb128()? as usize;
        children.push(already_read[idx].clone());
    }

    let debug = read_debug(cur, strpool, swap)?;

    let probe_count = cur.read_uleb128()? as usize;
    let mut probes = Vec::with_capacity(probe_count);
    for _ in 0..probe_count {
        probes.push(read_probe(cur, strpool)?);
    }

    Ok(Rc::new(Prototype {
        numparams,
        framesize,
        flags,
        bytecode,
        consts_gc,
        consts_num,
        upvalues,
        children,
        debug,
        closure_count: std::cell::Cell::new(0),
        probes,
    }))
}

fn read_probe(cur: &mut Cursor, strpool: &mut StrPool) -> Result<ProbeDecl> {
    let tag = cur.read_u8()?;
    let kind = match tag {
        0 => ProbeKind::Trace,
        1 => ProbeKind::TraceEnd,
        2 => ProbeKind::Profile,
        3 => ProbeKind::Tick,
        _ => return Err(Error::BadConstantTag(tag)),
    };
    let has_spec = cur.read_u8()? != 0;
    let spec = if has_spec {
        let len = cur.read_uleb128()? as usize;
        Some(strpool.intern(cur.read_bytes(len)?)?)
    } else {
        None
    };
    let handler = cur.read_uleb128()? as u32;
    Ok(ProbeDecl { kind, spec, handler })
}

fn read_gconst(cur: &mut Cursor, strpool: &mut StrPool, swap: bool) -> Result<GConst> {
    let tag = cur.read_u8()?;
    Ok(match tag {
        0 => GConst::Str(cur.read_uleb128()? as StrId),
        1 => GConst::Child(cur.read_uleb128()? as u32),
        2 => GConst::Table(Rc::new(RefCell::new(read_template_table(cur, strpool, swap)?))),
        _ => return Err(Error::BadConstantTag(tag)),
    })
}

fn read_template_table(cur: &mut Cursor, strpool: &mut StrPool, swap: bool) -> Result<Table> {
    let pair_count = cur.read_uleb128()? as usize;
    let mut table = Table::new(pair_count, 0);
    for _ in 0..pair_count {
        let key = read_value(cur, strpool, swap)?;
        let val = read_value(cur, strpool, swap)?;
        table.set(key, val)?;
    }
    Ok(table)
}

fn read_value(cur: &mut Cursor, strpool: &mut StrPool, swap: bool) -> Result<Value> {
    let tag = cur.read_u8()?;
    Ok(match tag {
        VALUE_TAG_NIL => Value::Nil,
        VALUE_TAG_FALSE => Value::False,
        VALUE_TAG_TRUE => Value::True,
        VALUE_TAG_NUM => Value::Num(swap_f64(cur.read_f64_ne()?, swap)),
        VALUE_TAG_STR => {
            let len = cur.read_uleb128()? as usize;
            let bytes = cur.read_bytes(len)?;
            Value::Str(strpool.intern(bytes)?)
        }
        VALUE_TAG_TABLE => Value::Table(Rc::new(RefCell::new(read_template_table(cur, strpool, swap)?))),
        _ => return Err(Error::BadConstantTag(tag)),
    })
}

fn read_debug(cur: &mut Cursor, strpool: &mut StrPool, swap: bool) -> Result<DebugInfo> {
    let firstline = swap_u32(cur.read_u32_ne()?, swap);
    let has_chunkname = cur.read_u8()? != 0;
    let chunkname = if has_chunkname {
        let len = cur.read_uleb128()? as usize;
        Some(strpool.intern(cur.read_bytes(len)?)?)
    } else {
        None
    };

    let line_count = cur.read_uleb128()? as usize;
    let mut lines = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        lines.push(swap_u32(cur.read_u32_ne()?, swap));
    }

    let upv_count = cur.read_uleb128()? as usize;
    let mut upvalue_names = Vec::with_capacity(upv_count);
    for _ in 0..upv_count {
        let len = cur.read_uleb128()? as usize;
        upvalue_names.push(strpool.intern(cur.read_bytes(len)?)?);
    }

    let loc_count = cur.read_uleb128()? as usize;
    let mut locals = Vec::with_capacity(loc_count);
    for _ in 0..loc_count {
        let len = cur.read_uleb128()? as usize;
        let name = strpool.intern(cur.read_bytes(len)?)?;
        let start_pc = swap_u32(cur.read_u32_ne()?, swap);
        let end_pc = swap_u32(cur.read_u32_ne()?, swap);
        locals.push(LocalVarInfo { name, start_pc, end_pc });
    }

    Ok(DebugInfo {
        chunkname,
        firstline,
        lines,
        upvalue_names,
        locals,
    })
}

#[cfg(test)]
mod tests {
    use super::super::writer::write_chunk;
    use super::*;
    use crate::proto::ProtoFlags;

    fn leaf_proto() -> Rc<Prototype> {
        Rc::new(Prototype {
            numparams: 0,
            framesize: 2,
            flags: ProtoFlags::HAS_RETURN,
            bytecode: vec![Instruction::encode_ad(OpCode::Knum, 0, 0), Instruction::encode_ad(OpCode::Ret1, 0, 0)],
            consts_gc: vec![],
            consts_num: vec![42.0],
            upvalues: vec![],
            children: vec![],
            debug: DebugInfo {
                firstline: 1,
                lines: vec![1, 1],
                ..Default::default()
            },
            closure_count: std::cell::Cell::new(0),
            probes: vec![],
        })
    }

    #[test]
    fn chunk_round_trips_through_writer_and_reader() {
        let mut strpool = StrPool::new();
        let proto = leaf_proto();
        let bytes = write_chunk(&proto, "test.kp", &strpool);
        let loaded = read_chunk(&bytes, &mut strpool).unwrap();
        assert_eq!(loaded.chunkname, "test.kp");
        assert_eq!(loaded.main.consts_num, vec![42.0]);
        assert_eq!(loaded.main.bytecode.len(), 2);
        assert_eq!(loaded.main.bytecode[0].op(), OpCode::Knum);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut strpool = StrPool::new();
        let err = read_chunk(&[0, 0, 0, 0], &mut strpool).unwrap_err();
        assert!(matches!(err, Error::BadMagic));
    }

    #[test]
    fn rejects_ffi_flagged_chunks() {
        let mut strpool = StrPool::new();
        let mut proto = leaf_proto();
        Rc::get_mut(&mut proto).unwrap().flags |= ProtoFlags::FFI;
        let bytes = write_chunk(&proto, "ffi.kp", &strpool);
        let err = read_chunk(&bytes, &mut strpool).unwrap_err();
        assert!(matches!(err, Error::FfiUnsupported));
    }
}
