//! End-to-end: source parses to bytecode, the chunk writer/reader pair
//! round-trips it losslessly, and the interpreter produces the same result
//! whether it runs the freshly parsed prototype or the one read back.

use std::rc::Rc;

use ktap::bc::{reader, writer};
use ktap::strpool::StrPool;
use ktap::value::Value;
use ktap::vm::{HostHooks, Vm};

struct NullHost;

impl HostHooks for NullHost {
    fn pid(&self) -> i64 {
        1
    }
    fn tid(&self) -> i64 {
        1
    }
    fn uid(&self) -> i64 {
        0
    }
    fn cpu(&self) -> i64 {
        0
    }
    fn execname(&self) -> String {
        "test".to_string()
    }
}

fn run(proto: Rc<ktap::proto::Prototype>, pool: StrPool) -> Vec<Value> {
    let mut vm = Vm::new(pool, Box::new(NullHost));
    vm.run_main(proto).unwrap()
}

#[test]
fn chunk_survives_a_write_read_cycle() {
    let src = b"function fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } return fib(10);";

    let mut pool = StrPool::new();
    let main = Rc::new(ktap::parser::parse(src, "fib.kp", &mut pool, ktap::builtins::NAMES).unwrap());
    let direct = run(main.clone(), pool);
    assert_eq!(direct, vec![Value::Num(55.0)]);

    let mut pool2 = StrPool::new();
    let main2 = Rc::new(ktap::parser::parse(src, "fib.kp", &mut pool2, ktap::builtins::NAMES).unwrap());
    let bytes = writer::write_chunk(&main2, "fib.kp", &pool2);

    let mut read_pool = StrPool::new();
    let loaded = reader::read_chunk(&bytes, &mut read_pool).unwrap();
    assert_eq!(loaded.chunkname, "fib.kp");

    let reread = run(loaded.main, read_pool);
    assert_eq!(reread, vec![Value::Num(55.0)]);
}

#[test]
fn rejects_chunks_with_a_bad_magic() {
    let mut pool = StrPool::new();
    let err = reader::read_chunk(b"not a chunk", &mut pool).unwrap_err();
    assert!(matches!(err, reader::Error::BadMagic));
}
