//! `jstar [options] [script [args...]]`: reference script runner / REPL.

use std::fs;
use std::io::{self, Write as _};
use std::process::ExitCode;

use jstar::{Config, JStarError, Vm};
use jstar_cli::import::PathImportCallback;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Options {
    show_version: bool,
    skip_banner: bool,
    exec: Option<String>,
    interactive: bool,
    ignore_env: bool,
    no_colors: bool,
    no_hints: bool,
    script: Option<String>,
}

fn parse_args(argv: &[String]) -> Options {
    let mut opts = Options {
        show_version: false,
        skip_banner: false,
        exec: None,
        interactive: false,
        ignore_env: false,
        no_colors: false,
        no_hints: false,
        script: None,
    };
    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "-v" | "--version" => opts.show_version = true,
            "-V" | "--skip-version" => opts.skip_banner = true,
            "-e" | "--exec" => {
                i += 1;
                opts.exec = argv.get(i).cloned();
            }
            "-i" | "--interactive" => opts.interactive = true,
            "-E" | "--ignore-env" => opts.ignore_env = true,
            "-C" | "--no-colors" => opts.no_colors = true,
            "-H" | "--no-hints" => opts.no_hints = true,
            arg => {
                opts.script = Some(arg.to_owned());
                break;
            }
        }
        i += 1;
    }
    opts
}

fn print_diagnostics(err: &JStarError) {
    eprintln!("{err}");
}

fn make_vm(ignore_env: bool) -> Vm {
    let import_callback = Box::new(PathImportCallback::new(ignore_env));
    Vm::new(Config::new(), import_callback, Box::new(print_diagnostics))
}

/// Compiles and runs `code`/`path` in `vm`'s core module, reporting any failure the way the
/// embedding callback would, without requiring a host to install one first.
fn run_source(vm: &mut Vm, code: &str, path: &str) -> bool {
    let ast = match jstar::parser::Parser::new(code, path).parse_program() {
        Ok(ast) => ast,
        Err(diags) => {
            for d in &diags {
                eprintln!("{d}");
            }
            return false;
        }
    };
    let function = match jstar::compiler::compile(&ast, vm.heap_mut(), path, "main") {
        Ok(f) => f,
        Err(diags) => {
            for d in &diags {
                eprintln!("{d}");
            }
            return false;
        }
    };
    match vm.interpret_main(function) {
        Ok(_) => true,
        Err(exc) => {
            eprintln!("Unhandled exception: {}", vm.describe(exc));
            false
        }
    }
}

fn repl(vm: &mut Vm, opts: &Options) {
    if !opts.skip_banner {
        println!("jstar {VERSION}");
    }
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        let prompt = if opts.no_colors { ">>> " } else { "\x1b[36m>>>\x1b[0m " };
        print!("{prompt}");
        let _ = io::stdout().flush();
        line.clear();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        run_source(vm, trimmed, "<stdin>");
    }
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let opts = parse_args(&argv);

    if opts.show_version {
        println!("jstar {VERSION}");
        return ExitCode::SUCCESS;
    }

    let _ = opts.no_hints;

    let mut vm = make_vm(opts.ignore_env);
    let mut ok = true;

    if let Some(stmt) = &opts.exec {
        ok = run_source(&mut vm, stmt, "<exec>");
    }

    if let Some(script) = &opts.script {
        match fs::read_to_string(script) {
            Ok(code) => ok = run_source(&mut vm, &code, script) && ok,
            Err(e) => {
                eprintln!("error: cannot read '{script}': {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if opts.interactive || (opts.exec.is_none() && opts.script.is_none()) {
        repl(&mut vm, &opts);
    }

    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
