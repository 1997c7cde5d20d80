// ABOUTME: Command-line front-end: REPL, script runner and compiler driver

use clap::Parser;
use lilt::codegen::{self, BuildOptions};
use lilt::error::LispError;
use lilt::highlighter::LispHelper;
use lilt::value::print_value;
use lilt::Interp;
use rustyline::error::ReadlineError;
use rustyline::{Config, Editor};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Interpreter and ahead-of-time compiler for a small lexically-scoped Lisp
#[derive(Parser, Debug)]
#[command(name = "lilt")]
#[command(version)]
#[command(about = "A small lexically-scoped Lisp: interpreter and compiler")]
struct CliArgs {
    /// Source file to run or compile (omit for a REPL)
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Arguments passed to the program as *command-line-argument-list*
    #[arg(value_name = "ARGS", trailing_var_arg = true)]
    program_args: Vec<String>,

    /// Evaluate one expression and print its value
    #[arg(long = "eval", short = 'e', value_name = "EXPR")]
    eval: Option<String>,

    /// Emit generated host source instead of interpreting
    #[arg(long = "compile", short = 'c')]
    compile: bool,

    /// Additionally build an executable from the generated source
    #[arg(long = "build", requires = "compile")]
    build: bool,

    /// Output path for --compile (source) or --build (executable)
    #[arg(long = "out", short = 'o', value_name = "PATH")]
    out: Option<PathBuf>,

    /// Library directory consulted when resolving (load ...) paths
    /// (falls back to LILT_LIBDIR)
    #[arg(long = "libdir", value_name = "DIR")]
    libdir: Option<PathBuf>,

    /// Path to the compiled runtime rlib used by --build
    /// (falls back to LILT_RUNTIME)
    #[arg(long = "runtime", value_name = "RLIB")]
    runtime: Option<PathBuf>,

    /// Optimization level for primitive open-coding (0-3)
    #[arg(long = "speed", value_name = "N", default_value = "1")]
    speed: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();

    let mut interp = Interp::new();
    interp.libdir = args
        .libdir
        .clone()
        .or_else(|| std::env::var_os("LILT_LIBDIR").map(PathBuf::from));
    interp.speed = args.speed.min(3);
    interp.set_command_line_args(&args.program_args);

    if let Some(expr) = &args.eval {
        match interp.interpret_expression(expr) {
            Ok(value) => {
                println!("{}", print_value(&value, true));
                return Ok(());
            }
            Err(e) => return Err(annotate(e, expr).to_string().into()),
        }
    }

    let file = match &args.file {
        Some(file) => file,
        None => return repl(&mut interp),
    };

    if args.compile {
        return compile_file(&mut interp, file, &args);
    }

    match interp.load_file(&file.display().to_string()) {
        Ok(_) => Ok(()),
        Err(e) => Err(e.to_string().into()),
    }
}

/// Compile FILE to host source (and optionally to an executable).
fn compile_file(
    interp: &mut Interp,
    file: &PathBuf,
    args: &CliArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
    let unit_name = unit_name_for(file);
    let shown = file.display().to_string();
    let generated = codegen::generate_unit(interp, &source, Some(&shown), &unit_name)
        .map_err(|e| e.to_string())?;

    if args.build {
        let out = args
            .out
            .clone()
            .unwrap_or_else(|| file.with_extension(""));
        let opts = BuildOptions {
            optimize: true,
            runtime_rlib: args.runtime.clone(),
        };
        let artifact = codegen::build_executable(&generated, &out, &opts).map_err(|e| e.to_string())?;
        eprintln!("built {}", artifact.display());
        return Ok(());
    }

    match &args.out {
        Some(out) => std::fs::write(out, generated)
            .map_err(|e| format!("cannot write {}: {}", out.display(), e))?,
        None => print!("{}", generated),
    }
    Ok(())
}

/// A struct-shaped unit name from the source file's stem.
fn unit_name_for(file: &PathBuf) -> String {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unit".to_string());
    let mut name = String::new();
    let mut upper_next = true;
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() {
            if upper_next {
                name.extend(ch.to_uppercase());
                upper_next = false;
            } else {
                name.push(ch);
            }
        } else {
            upper_next = true;
        }
    }
    if name.is_empty() || name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert_str(0, "Unit");
    }
    name
}

/// Suffix the failing expression for the one-line error report.
fn annotate(e: LispError, source: &str) -> LispError {
    e.in_form(source.trim())
}

fn repl(interp: &mut Interp) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::builder().auto_add_history(true).build();
    let mut rl: Editor<LispHelper, rustyline::history::DefaultHistory> =
        Editor::with_config(config).map_err(|e| format!("cannot start REPL: {}", e))?;
    rl.set_helper(Some(LispHelper::new()));

    let history_file = ".lilt_history";
    let _ = rl.load_history(history_file);

    println!("lilt {}", env!("CARGO_PKG_VERSION"));
    println!("Type any expression, or (quit) to exit.");

    loop {
        match rl.readline("lilt> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match line.trim() {
                    "(quit)" | "(exit)" => break,
                    _ => {}
                }
                match interp.interpret_expression(&line) {
                    Ok(value) => println!("==> {}", print_value(&value, true)),
                    Err(e) => eprintln!("Error: {}", annotate(e, &line)),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }

    let _ = rl.save_history(history_file);
    Ok(())
}
