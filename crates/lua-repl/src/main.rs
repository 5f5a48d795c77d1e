use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use rustyline::{error::ReadlineError, DefaultEditor};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use lua_compiler::{compile, disassemble, dump};
use lua_vm::{LuaError, LuaTable, LuaValue, Vm, VmOptions};

const PROMPT: &str = "> ";
const CONTINUATION_PROMPT: &str = ">> ";

/// Command-line interpreter for the lua-rust runtime.
#[derive(Debug, Parser)]
#[command(name = "lua", version, about)]
struct Cli {
    /// Execute a chunk of code before the script.
    #[arg(short = 'e', value_name = "CHUNK")]
    exec: Vec<String>,

    /// Run `NAME.lua` and store its result in a global named after the file.
    #[arg(short = 'l', value_name = "NAME")]
    libs: Vec<String>,

    /// Enter interactive mode after running the script.
    #[arg(short = 'i')]
    interactive: bool,

    /// Compile the script to a binary chunk at PATH instead of running it.
    #[arg(short = 'o', value_name = "PATH")]
    output: Option<PathBuf>,

    /// Strip debug information from the binary chunk.
    #[arg(short = 's', requires = "output")]
    strip: bool,

    /// Print the script's bytecode listing instead of running it.
    #[arg(short = 'c', long = "list")]
    list: bool,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum depth of nested Lua calls.
    #[arg(long, value_name = "N")]
    max_call_depth: Option<usize>,

    /// Script to run; `-` reads it from standard input.
    script: Option<String>,

    /// Arguments passed to the script as `...` and in `arg`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── Chunks ────────────────────────────────────────────────────────────────────

fn read_script(path: &str) -> Result<(Vec<u8>, String)> {
    if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("cannot read standard input")?;
        return Ok((buf, "=stdin".to_string()));
    }
    let bytes = std::fs::read(path).with_context(|| format!("cannot open {path}"))?;
    Ok((bytes, format!("@{path}")))
}

/// The global `arg`: script name at 0, its arguments from 1, the
/// interpreter at -1.
fn arg_table(script: &str, args: &[String]) -> LuaTable {
    let mut t = LuaTable::new();
    t.set_int(-1, LuaValue::from("lua"));
    t.set_int(0, LuaValue::from(script));
    for (i, a) in args.iter().enumerate() {
        t.set_int(i as i64 + 1, LuaValue::from(a.as_str()));
    }
    t
}

/// Source that failed only because it ended too early.
fn is_incomplete(err: &LuaError) -> bool {
    matches!(err, LuaError::Load(_)) && err.to_string().ends_with("<eof>")
}

fn compile_to_file(script: &str, out: &Path, strip: bool) -> Result<()> {
    let (source, name) = read_script(script)?;
    let proto = compile(&source, &name)?;
    let bytes = dump(&proto, strip);
    std::fs::write(out, &bytes).with_context(|| format!("cannot write {}", out.display()))?;
    debug!(bytes = bytes.len(), path = %out.display(), "wrote binary chunk");
    Ok(())
}

fn list(script: &str) -> Result<()> {
    let (source, name) = read_script(script)?;
    let proto = compile(&source, &name)?;
    print!("{}", disassemble(&proto));
    Ok(())
}

fn run_chunk(vm: &mut Vm, source: &[u8], name: &str, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let f = vm.load(source, name, None)?;
    vm.call(&f, args)
}

fn load_lib(vm: &mut Vm, name: &str) -> Result<()> {
    let path = if name.ends_with(".lua") { name.to_string() } else { format!("{name}.lua") };
    let (source, chunk) = read_script(&path)?;
    let module = Path::new(&path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let module = module.as_str();
    let result = run_chunk(vm, &source, &chunk, vec![LuaValue::from(module)])
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let value = match result.into_iter().next() {
        Some(LuaValue::Nil) | None => LuaValue::Boolean(true),
        Some(v) => v,
    };
    vm.set_global(module, value);
    Ok(())
}

// ── Interactive loop ──────────────────────────────────────────────────────────

fn print_values(vm: &mut Vm, vals: &[LuaValue]) {
    if vals.is_empty() {
        return;
    }
    let parts: Result<Vec<String>, LuaError> = vals
        .iter()
        .map(|v| vm.tostring(v).map(|s| s.to_str_lossy().into_owned()))
        .collect();
    match parts {
        Ok(parts) => println!("{}", parts.join("\t")),
        Err(e) => eprintln!("{e}"),
    }
}

/// Outcome of feeding the pending input to the session.
enum Eval {
    Done,
    NeedMore,
}

fn eval_line(vm: &mut Vm, buf: &str) -> Eval {
    // An expression prints its values.
    let expr = format!("return {buf}");
    let f = match vm.load(expr.as_bytes(), "=stdin", None) {
        Ok(f) => Ok(f),
        Err(_) => vm.load(buf.as_bytes(), "=stdin", None),
    };
    match f {
        Ok(f) => {
            match vm.call(&f, Vec::new()) {
                Ok(vals) => print_values(vm, &vals),
                Err(e) => eprintln!("{e}"),
            }
            Eval::Done
        }
        Err(e) if is_incomplete(&e) => Eval::NeedMore,
        Err(e) => {
            eprintln!("{e}");
            Eval::Done
        }
    }
}

fn repl(vm: &mut Vm) -> Result<()> {
    println!("lua-rust {}  (Ctrl-D to quit)", env!("CARGO_PKG_VERSION"));
    let mut rl = DefaultEditor::new().context("cannot initialise line editor")?;
    let mut buf = String::new();
    loop {
        let prompt = if buf.is_empty() { PROMPT } else { CONTINUATION_PROMPT };
        match rl.readline(prompt) {
            Ok(line) => {
                if !buf.is_empty() {
                    buf.push('\n');
                }
                buf.push_str(&line);
                match eval_line(vm, &buf) {
                    Eval::NeedMore => continue,
                    Eval::Done => {
                        let _ = rl.add_history_entry(buf.as_str());
                        buf.clear();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => buf.clear(),
            Err(ReadlineError::Eof) => {
                println!();
                return Ok(());
            }
            Err(e) => return Err(e).context("read error"),
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn run(cli: Cli) -> Result<ExitCode> {
    if let Some(script) = &cli.script {
        if let Some(out) = &cli.output {
            compile_to_file(script, out, cli.strip)?;
            return Ok(ExitCode::SUCCESS);
        }
        if cli.list {
            list(script)?;
            return Ok(ExitCode::SUCCESS);
        }
    }

    let mut options = VmOptions::default();
    if let Some(depth) = cli.max_call_depth {
        options.max_call_depth = depth;
    }
    let mut vm = Vm::with_options(options);
    let script_name = cli.script.clone().unwrap_or_else(|| "lua".to_string());
    vm.set_global("arg", LuaValue::Table(arg_table(&script_name, &cli.args).into_ref()));

    for name in &cli.libs {
        if let Err(e) = load_lib(&mut vm, name) {
            eprintln!("lua: {e:#}");
            return Ok(ExitCode::FAILURE);
        }
    }
    for chunk in &cli.exec {
        if let Err(e) = run_chunk(&mut vm, chunk.as_bytes(), "=(command line)", Vec::new()) {
            eprintln!("lua: {e}");
            return Ok(ExitCode::FAILURE);
        }
    }

    if let Some(script) = &cli.script {
        let (source, name) = read_script(script)?;
        let args = cli.args.iter().map(|a| LuaValue::from(a.as_str())).collect();
        if let Err(e) = run_chunk(&mut vm, &source, &name, args) {
            eprintln!("lua: {e}");
            return Ok(ExitCode::FAILURE);
        }
    }

    let nothing_run = cli.script.is_none() && cli.exec.is_empty();
    if cli.interactive || (nothing_run && std::io::stdin().is_terminal()) {
        repl(&mut vm)?;
    } else if nothing_run {
        // Piped input without a script runs standard input.
        let (source, name) = read_script("-")?;
        if let Err(e) = run_chunk(&mut vm, &source, &name, Vec::new()) {
            eprintln!("lua: {e}");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("lua: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_flags_and_script_arguments() {
        let cli = Cli::parse_from(["lua", "-e", "x = 1", "-i", "--max-call-depth", "50", "main.lua", "a", "-b"]);
        assert_eq!(cli.exec, vec!["x = 1"]);
        assert!(cli.interactive);
        assert_eq!(cli.max_call_depth, Some(50));
        assert_eq!(cli.script.as_deref(), Some("main.lua"));
        assert_eq!(cli.args, vec!["a", "-b"]);
    }

    #[test]
    fn strip_requires_an_output_path() {
        assert!(Cli::try_parse_from(["lua", "-s", "main.lua"]).is_err());
    }

    #[test]
    fn arg_table_layout() {
        let mut vm = Vm::new();
        let t = arg_table("main.lua", &["x".to_string(), "y".to_string()]);
        vm.set_global("arg", LuaValue::Table(t.into_ref()));
        let out = vm.exec("return arg[-1], arg[0], arg[1], #arg", "=t").unwrap();
        assert_eq!(
            out,
            vec![LuaValue::from("lua"), LuaValue::from("main.lua"), LuaValue::from("x"), LuaValue::Integer(2)]
        );
    }

    #[test]
    fn incomplete_input_is_detected() {
        let mut vm = Vm::new();
        assert!(matches!(eval_line(&mut vm, "function f()"), Eval::NeedMore));
        assert!(matches!(eval_line(&mut vm, "x = [[open"), Eval::NeedMore));
        assert!(matches!(eval_line(&mut vm, "function f() return 1 end"), Eval::Done));
        assert!(matches!(eval_line(&mut vm, "x = = 1"), Eval::Done));
        assert_eq!(vm.exec("return f()", "=t").unwrap(), vec![LuaValue::Integer(1)]);
    }

    #[test]
    fn compiled_chunks_run_like_source() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("prog.lua");
        let out = dir.path().join("prog.luac");
        std::fs::write(&script, "local n = ... return n * 2").unwrap();
        compile_to_file(&script.display().to_string(), &out, true).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        let mut vm = Vm::new();
        let result = run_chunk(&mut vm, &bytes, "=bin", vec![LuaValue::Integer(21)]).unwrap();
        assert_eq!(result, vec![LuaValue::Integer(42)]);
    }

    #[test]
    fn libraries_become_globals() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("util.lua");
        std::fs::write(&lib, "return { twice = function(x) return x * 2 end }").unwrap();
        let mut vm = Vm::new();
        load_lib(&mut vm, &lib.display().to_string()).unwrap();
        assert!(vm.get_global("util").as_table().is_some());
        let out = vm.exec("return util.twice(21)", "=t").unwrap();
        assert_eq!(out, vec![LuaValue::Integer(42)]);
    }
}
