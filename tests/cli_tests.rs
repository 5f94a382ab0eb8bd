//! Exercises the driver the way the `ktap` binary does, but in-process
//! (constructing `Cli` directly instead of spawning a subprocess and
//! parsing argv).

use ktap::cli::Cli;
use ktap::driver::{self, LoggingSink};
use ktap::proto::{ProbeKind, Prototype};
use ktap::vm::HostHooks;
use std::cell::RefCell;
use std::rc::Rc;

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

#[derive(Default)]
struct RecordingSink {
    seen: RefCell<Vec<(ProbeKind, Option<String>)>>,
}

impl driver::ProbeSink for RecordingSink {
    fn on_probe(&mut self, kind: ProbeKind, spec: Option<&str>, _handler: Rc<Prototype>) {
        self.seen.borrow_mut().push((kind, spec.map(str::to_string)));
    }
}

#[test]
fn inline_source_runs_to_completion() {
    let cli = Cli {
        inline: Some("var x = 1 + 2; return x;".to_string()),
        ..Default::default()
    };
    let mut sink = LoggingSink;
    let code = driver::run(cli, Box::new(NullHost), &mut sink);
    assert_eq!(code, 0);
}

#[test]
fn a_compile_error_exits_nonzero() {
    let cli = Cli {
        inline: Some("var x = ;".to_string()),
        ..Default::default()
    };
    let mut sink = LoggingSink;
    let code = driver::run(cli, Box::new(NullHost), &mut sink);
    assert_ne!(code, 0);
}

#[test]
fn missing_script_exits_nonzero() {
    let cli = Cli::default();
    let mut sink = LoggingSink;
    let code = driver::run(cli, Box::new(NullHost), &mut sink);
    assert_ne!(code, 0);
}

#[test]
fn trace_blocks_register_with_the_probe_sink() {
    let cli = Cli {
        inline: Some("trace syscalls:sys_enter_open { var x = 1; }".to_string()),
        ..Default::default()
    };
    let mut sink = RecordingSink::default();
    let code = driver::run(cli, Box::new(NullHost), &mut sink);
    assert_eq!(code, 0);
    assert_eq!(sink.seen.borrow().len(), 1);
    assert_eq!(sink.seen.borrow()[0].0, ProbeKind::Trace);
}

#[test]
fn dry_run_compiles_without_executing() {
    let cli = Cli {
        inline: Some("print(1);".to_string()),
        dry_run: true,
        ..Default::default()
    };
    let mut sink = LoggingSink;
    let code = driver::run(cli, Box::new(NullHost), &mut sink);
    assert_eq!(code, 0);
}
