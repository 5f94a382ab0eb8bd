//! Command-line surface (spec §6 "CLI surface"). A thin `clap` front end
//! that turns argv into a [`config::Options`] plus the handful of one-shot
//! flags the driver branches on directly rather than threading through
//! `Options`.

use clap::Parser;

use crate::config::Options;

/// `ktap [options] file [args] [-- workload cmd...]`
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ktap", version, about = "kernel tracing script compiler and VM")]
pub struct Cli {
    /// Write compiled bytecode to FILE instead of running it
    #[arg(short = 'o', long = "output")]
    pub output: Option<String>,

    /// Trace only events from PID
    #[arg(short = 'p', long = "pid")]
    pub pid: Option<i64>,

    /// Trace only on CPU
    #[arg(short = 'C', long = "cpu")]
    pub cpu: Option<i64>,

    /// Print a timestamp on every trace line
    #[arg(short = 'T')]
    pub timestamp: bool,

    /// Verbose diagnostics
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Suppress non-error output
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Compile and print bytecode without running
    #[arg(short = 'd', long = "dry-run")]
    pub dry_run: bool,

    /// Run SOURCE as a one-line probe expression instead of loading a file
    #[arg(short = 's')]
    pub expr: Option<String>,

    /// Run SOURCE verbatim instead of loading a file
    #[arg(short = 'e')]
    pub inline: Option<String>,

    /// Load `file` as a precompiled chunk rather than source
    #[arg(short = 'b', long = "binary")]
    pub binary: bool,

    /// List probe-capable events, optionally filtered by GLOB
    #[arg(long = "le")]
    pub list_events: Option<Option<String>>,

    /// List functions exported by DSO
    #[arg(long = "lf")]
    pub list_functions: Option<String>,

    /// List markers exported by DSO
    #[arg(long = "lm")]
    pub list_markers: Option<String>,

    /// Script file to load (absent when `-e`/`-s`/`--le`/`--lf`/`--lm` supply the chunk)
    pub file: Option<String>,

    /// Arguments passed through to the script as `...`
    pub args: Vec<String>,

    /// Workload to spawn and trace for the chunk's lifetime, after `--`
    #[arg(last = true)]
    pub workload: Vec<String>,
}

impl Cli {
    #[must_use]
    pub fn to_options(&self) -> Options {
        Options {
            output: self.output.clone(),
            trace_pid: self.pid,
            trace_cpu: self.cpu,
            print_timestamp: self.timestamp,
            verbose: self.verbose,
            quiet: self.quiet,
            dry_run: self.dry_run,
            workload: if self.workload.is_empty() { None } else { Some(self.workload.clone()) },
        }
    }
}
