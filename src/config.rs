//! Run options (spec §6 "CLI surface" / "Ioctl protocol" `option` struct).
//! [`cli::Cli`] parses argv into this; [`driver`] is the only consumer.

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub output: Option<String>,
    pub trace_pid: Option<i64>,
    pub trace_cpu: Option<i64>,
    pub print_timestamp: bool,
    pub verbose: bool,
    pub quiet: bool,
    pub dry_run: bool,
    pub workload: Option<Vec<String>>,
}
