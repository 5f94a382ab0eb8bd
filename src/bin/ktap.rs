//! Binary entry point: parses argv, wires up a process-level [`HostHooks`]
//! and hands off to [`driver::run`].

use clap::Parser;
use ktap::cli::Cli;
use ktap::driver::{self, LoggingSink};
use ktap::vm::HostHooks;

/// `HostHooks` backed by the running process itself (spec §4.9 V-opcode
/// intrinsics `VPID`/`VTID`/`VUID`/`VCPU`/`VEXECNAME` outside of a real
/// tracepoint: this is what `-e`/`-s`/`-d` scripts see when run standalone).
struct ProcessHost;

impl HostHooks for ProcessHost {
    fn pid(&self) -> i64 {
        std::process::id() as i64
    }

    fn tid(&self) -> i64 {
        std::process::id() as i64
    }

    fn uid(&self) -> i64 {
        0
    }

    fn cpu(&self) -> i64 {
        0
    }

    fn execname(&self) -> String {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "ktap".to_string())
    }
}

fn main() {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    } else if cli.quiet {
        builder.filter_level(log::LevelFilter::Error);
    }
    builder.init();

    let mut sink = LoggingSink;
    let code = driver::run(cli, Box::new(ProcessHost), &mut sink);
    std::process::exit(code);
}
