//! `jstarc [options] <path>`: ahead-of-time compiler / disassembler.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use jstar::heap::Heap;

struct Options {
    output: Option<PathBuf>,
    recurse: bool,
    list: bool,
    disassemble_input: bool,
    check_only: bool,
    path: Option<PathBuf>,
}

fn parse_args(argv: &[String]) -> Options {
    let mut opts = Options { output: None, recurse: false, list: false, disassemble_input: false, check_only: false, path: None };
    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "-o" => {
                i += 1;
                opts.output = argv.get(i).map(PathBuf::from);
            }
            "-r" => opts.recurse = true,
            "-l" => opts.list = true,
            "-d" => opts.disassemble_input = true,
            "-c" => opts.check_only = true,
            arg => opts.path = Some(PathBuf::from(arg)),
        }
        i += 1;
    }
    opts
}

fn collect_sources(path: &Path, recurse: bool, out: &mut Vec<PathBuf>) -> Result<(), String> {
    if path.is_dir() {
        if !recurse {
            return Err(format!("'{}' is a directory; pass -r to recurse", path.display()));
        }
        let entries = fs::read_dir(path).map_err(|e| e.to_string())?;
        for entry in entries {
            let entry = entry.map_err(|e| e.to_string())?;
            let child = entry.path();
            if child.is_dir() {
                collect_sources(&child, recurse, out)?;
            } else if child.extension().is_some_and(|e| e == "jsr") {
                out.push(child);
            }
        }
    } else {
        out.push(path.to_path_buf());
    }
    Ok(())
}

fn compile_one(path: &Path, opts: &Options) -> Result<(), String> {
    let code = fs::read_to_string(path).map_err(|e| format!("cannot read '{}': {e}", path.display()))?;
    let path_str = path.display().to_string();

    if opts.disassemble_input {
        let bytes = fs::read(path).map_err(|e| format!("cannot read '{}': {e}", path.display()))?;
        let mut heap = Heap::new(1 << 20, 2.0);
        let function = jstar::serialize::deserialize(&bytes, &mut heap).map_err(|e| e.to_string())?;
        println!("{}", jstar::bytecode::disassemble(&function, &heap));
        return Ok(());
    }

    let ast = jstar::parser::Parser::new(&code, &path_str).parse_program().map_err(|diags| {
        diags.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n")
    })?;

    if opts.check_only {
        let mut heap = Heap::new(1 << 20, 2.0);
        jstar::compiler::compile(&ast, &mut heap, &path_str, "main")
            .map(|_| ())
            .map_err(|diags| diags.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n"))?;
        return Ok(());
    }

    let mut heap = Heap::new(1 << 20, 2.0);
    let function = jstar::compiler::compile(&ast, &mut heap, &path_str, "main")
        .map_err(|diags| diags.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n"))?;

    if opts.list {
        println!("{}", jstar::bytecode::disassemble(&function, &heap));
        return Ok(());
    }

    let bytes = jstar::serialize::serialize(&function, &heap);
    let out_path = match &opts.output {
        Some(p) if p.is_dir() => p.join(path.with_extension("jsc").file_name().unwrap()),
        Some(p) => p.clone(),
        None => path.with_extension("jsc"),
    };
    fs::write(&out_path, bytes).map_err(|e| format!("cannot write '{}': {e}", out_path.display()))?;
    Ok(())
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let opts = parse_args(&argv);

    let Some(path) = opts.path.clone() else {
        eprintln!("usage: jstarc [options] <path>");
        return ExitCode::FAILURE;
    };

    let mut sources = Vec::new();
    if let Err(e) = collect_sources(&path, opts.recurse, &mut sources) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    let mut ok = true;
    for source in &sources {
        if let Err(e) = compile_one(source, &opts) {
            eprintln!("error: {e}");
            ok = false;
        }
    }

    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
