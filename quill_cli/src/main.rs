//! Quill driver: evaluate a bytecode image, or translate it to C.

mod args;

use args::{ExecutionMode, TraceFlag, USAGE};
use quill_bytecode::BytecodeImage;
use quill_vm::{NativeRegistry, TraceMode, Vm, VmArgs};
use std::process::ExitCode;
use std::sync::Arc;

/// Successful evaluation.
const EXIT_SUCCESS: u8 = 0;
/// VM error (load or runtime).
const EXIT_ERROR: u8 = 1;
/// Command-line usage error.
const EXIT_USAGE_ERROR: u8 = 2;

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mode = match args::parse(&argv) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("quill: {}", e.0);
            eprint!("{USAGE}");
            return ExitCode::from(EXIT_USAGE_ERROR);
        }
    };
    match mode {
        ExecutionMode::PrintVersion => {
            println!("quill {}", quill_core::VERSION);
            ExitCode::from(EXIT_SUCCESS)
        }
        ExecutionMode::PrintHelp => {
            print!("{USAGE}");
            ExitCode::from(EXIT_SUCCESS)
        }
        ExecutionMode::Run { image, program_args, trace } => run(&image, program_args, trace),
        ExecutionMode::Cgen { image, out, plain } => cgen(&image, &out, plain),
    }
}

fn load(path: &std::path::Path) -> Result<Arc<BytecodeImage>, ExitCode> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("quill: cannot read {}: {e}", path.display());
            return Err(ExitCode::from(EXIT_ERROR));
        }
    };
    match BytecodeImage::load(&bytes) {
        Ok(img) => Ok(Arc::new(img)),
        Err(e) => {
            eprintln!("quill: {e}");
            Err(ExitCode::from(EXIT_ERROR))
        }
    }
}

fn run(path: &std::path::Path, program_args: Vec<String>, trace: TraceFlag) -> ExitCode {
    let image = match load(path) {
        Ok(i) => i,
        Err(c) => return c,
    };
    let vm_args = VmArgs {
        program_args,
        trace: match trace {
            TraceFlag::Off => TraceMode::Off,
            TraceFlag::On => TraceMode::On,
            TraceFlag::Tail => TraceMode::Tail,
        },
        ..VmArgs::default()
    };
    let mut vm = Vm::new(image, vm_args);
    let result = vm.eval_program();
    print!("{}", vm.output);
    for line in &vm.log {
        eprintln!("{line}");
    }
    match result {
        Ok(()) => {
            println!("{}", vm.evalret);
            ExitCode::from(EXIT_SUCCESS)
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn cgen(path: &std::path::Path, out: &std::path::Path, plain: bool) -> ExitCode {
    let image = match load(path) {
        Ok(i) => i,
        Err(c) => return c,
    };
    let natives = NativeRegistry::core();
    match quill_aot::to_c_source(&image, &natives, !plain) {
        Ok(src) => {
            if let Err(e) = std::fs::write(out, src) {
                eprintln!("quill: cannot write {}: {e}", out.display());
                return ExitCode::from(EXIT_ERROR);
            }
            ExitCode::from(EXIT_SUCCESS)
        }
        Err(e) => {
            eprintln!("quill: {e}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}
