//! C10: chunk driver. Loads a chunk (source or precompiled), runs the main
//! prototype, then walks its top-level probe declarations and hands each
//! handler to a host (spec §4.10 "chunk/driver"; attaching those handlers to
//! real kernel tracepoints is a host responsibility per the Non-goals — this
//! module only implements the registration contract).

use std::fs;
use std::rc::Rc;

use crate::bc::{reader, writer};
use crate::builtins;
use crate::cli::Cli;
use crate::error::{KResult, KtapError};
use crate::proto::{ProbeKind, Prototype};
use crate::strpool::StrPool;
use crate::vm::{HostHooks, Vm};

/// What a host must do with a loaded chunk's declared probes (spec §4.9
/// "per-CPU scheduling hooks"). A CLI-only host (no live kernel) can no-op
/// every method and still drive `-d`/`-o` correctly.
pub trait ProbeSink {
    fn on_probe(&mut self, kind: ProbeKind, spec: Option<&str>, handler: Rc<Prototype>);
}

/// A sink that only logs registrations, for hosts with nothing to attach to.
#[derive(Default)]
pub struct LoggingSink;

impl ProbeSink for LoggingSink {
    fn on_probe(&mut self, kind: ProbeKind, spec: Option<&str>, _handler: Rc<Prototype>) {
        log::info!("registered probe {kind:?} {}", spec.unwrap_or(""));
    }
}

fn source_for(cli: &Cli) -> KResult<(String, Vec<u8>)> {
    if let Some(src) = &cli.inline {
        return Ok(("(-e)".to_string(), src.clone().into_bytes()));
    }
    if let Some(src) = &cli.expr {
        return Ok(("(-s)".to_string(), src.clone().into_bytes()));
    }
    let path = cli.file.as_deref().ok_or_else(|| KtapError::Other("no script given".to_string()))?;
    let bytes = fs::read(path)?;
    Ok((path.to_string(), bytes))
}

/// Loads and runs one chunk end to end, returning the process exit code
/// (spec §7 "non-zero process exit code on failure").
pub fn run(cli: Cli, host: Box<dyn HostHooks>, sink: &mut dyn ProbeSink) -> i32 {
    match run_inner(cli, host, sink) {
        Ok(()) => 0,
        Err(KtapError::Io(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("ktap: not permitted: {e}");
            1
        }
        Err(e) => {
            eprintln!("ktap: {e}");
            1
        }
    }
}

fn run_inner(cli: Cli, host: Box<dyn HostHooks>, sink: &mut dyn ProbeSink) -> KResult<()> {
    let options = cli.to_options();
    let mut strpool = StrPool::new();

    let (chunkname, main) = if cli.binary {
        let path = cli.file.as_deref().ok_or_else(|| KtapError::Other("no chunk file given".to_string()))?;
        let bytes = fs::read(path)?;
        let loaded = reader::read_chunk(&bytes, &mut strpool)?;
        (loaded.chunkname, loaded.main)
    } else {
        let (chunkname, src) = source_for(&cli)?;
        let main = Rc::new(crate::parser::parse(&src, &chunkname, &mut strpool, builtins::NAMES)?);
        (chunkname, main)
    };

    if let Some(out_path) = &options.output {
        let bytes = writer::write_chunk(&main, &chunkname, &strpool);
        fs::write(out_path, bytes)?;
        return Ok(());
    }

    if options.dry_run {
        println!("{chunkname}: {} instructions, {} children", main.bytecode.len(), main.children.len());
        return Ok(());
    }

    let mut vm = Vm::new(strpool, host);
    vm.run_main(main.clone()).map_err(KtapError::from)?;

    for probe in &main.probes {
        let spec = probe.spec.map(|id| vm.global.strpool.get(id).as_str().to_string());
        let handler = main.children[probe.handler as usize].clone();
        sink.on_probe(probe.kind, spec.as_deref(), handler);
    }

    for diag in &vm.global.diagnostics {
        eprintln!("{}:{}: {}", diag.chunkname, diag.line, diag.message);
    }
    if vm.global.run_state == crate::state::RunState::Error {
        return Err(KtapError::Other(format!("{chunkname}: compile or runtime error")));
    }
    Ok(())
}
