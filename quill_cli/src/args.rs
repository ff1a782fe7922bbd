//! Command-line argument parser.
//!
//! Hand-rolled for zero-overhead startup; the surface is small enough
//! that a parser dependency would cost more than it saves.

use std::path::PathBuf;

/// What the driver should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Load an image and evaluate it: `quill run prog.qlb [args...]`
    Run { image: PathBuf, program_args: Vec<String>, trace: TraceFlag },
    /// Translate an image to C source: `quill cgen [--plain] prog.qlb out.c`
    Cgen { image: PathBuf, out: PathBuf, plain: bool },
    PrintVersion,
    PrintHelp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFlag {
    Off,
    On,
    Tail,
}

/// Usage error with the offending detail.
#[derive(Debug)]
pub struct UsageError(pub String);

pub const USAGE: &str = "usage:\n\
    \x20 quill run [--trace|--trace-tail] <prog.qlb> [args...]\n\
    \x20 quill cgen [--plain] <prog.qlb> <out.c>\n\
    \x20 quill -V | --version\n";

pub fn parse(args: &[String]) -> Result<ExecutionMode, UsageError> {
    let mut it = args.iter();
    let Some(cmd) = it.next() else {
        return Ok(ExecutionMode::PrintHelp);
    };
    match cmd.as_str() {
        "-V" | "--version" => Ok(ExecutionMode::PrintVersion),
        "-h" | "--help" => Ok(ExecutionMode::PrintHelp),
        "run" => {
            let mut trace = TraceFlag::Off;
            let mut image = None;
            let mut program_args = Vec::new();
            for a in it {
                match a.as_str() {
                    "--trace" if image.is_none() => trace = TraceFlag::On,
                    "--trace-tail" if image.is_none() => trace = TraceFlag::Tail,
                    _ if image.is_none() => image = Some(PathBuf::from(a)),
                    _ => program_args.push(a.clone()),
                }
            }
            let image = image.ok_or_else(|| UsageError("run: missing image path".to_owned()))?;
            Ok(ExecutionMode::Run { image, program_args, trace })
        }
        "cgen" => {
            let mut plain = false;
            let mut paths = Vec::new();
            for a in it {
                if a == "--plain" && paths.is_empty() {
                    plain = true;
                } else {
                    paths.push(PathBuf::from(a));
                }
            }
            match <[PathBuf; 2]>::try_from(paths) {
                Ok([image, out]) => Ok(ExecutionMode::Cgen { image, out, plain }),
                Err(_) => Err(UsageError("cgen: expected <prog.qlb> <out.c>".to_owned())),
            }
        }
        other => Err(UsageError(format!("unknown command: {other}"))),
    }
}
