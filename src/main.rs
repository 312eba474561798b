use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use moonlet::diagnostic::{Diagnostic, Phase, ansi::AnsiRenderer, json};
use moonlet::{Program, Vm, compile};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Script to run
    #[arg(required_unless_present = "eval", conflicts_with = "eval")]
    file: Option<PathBuf>,

    /// Run CODE instead of a file
    #[arg(short = 'e', long, value_name = "CODE")]
    eval: Option<String>,

    /// Print the disassembled program instead of running it
    #[arg(long)]
    dump: bool,

    /// Print the compiled program in another format instead of running it
    #[arg(long, value_enum, conflicts_with = "dump")]
    emit: Option<Emit>,

    /// Report errors as one-line JSON on stderr
    #[arg(long)]
    json: bool,

    /// Never color error output
    #[arg(long)]
    no_color: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Emit {
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let source = match read_source(&cli) {
        Ok(s) => s,
        Err(d) => {
            report(&cli, d);
            return ExitCode::FAILURE;
        }
    };

    let program = match compile(&source) {
        Ok(p) => p,
        Err(e) => {
            report(&cli, Diagnostic::from(&e).with_source(source));
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, &program) {
        Ok(()) => ExitCode::SUCCESS,
        Err(d) => {
            report(&cli, d);
            ExitCode::FAILURE
        }
    }
}

fn read_source(cli: &Cli) -> Result<String, Diagnostic> {
    match (&cli.eval, &cli.file) {
        (Some(code), _) => Ok(code.clone()),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| Diagnostic::error(Phase::Io, format!("cannot read {}: {e}", path.display()))),
        (None, None) => Err(Diagnostic::error(Phase::Io, "no input: pass a FILE or --eval CODE")),
    }
}

fn run(cli: &Cli, program: &Program) -> Result<(), Diagnostic> {
    if cli.dump {
        print!("{program}");
        return Ok(());
    }
    if let Some(Emit::Json) = cli.emit {
        let text = serde_json::to_string_pretty(program)
            .map_err(|e| Diagnostic::error(Phase::Compile, format!("serialization failed: {e}")))?;
        println!("{text}");
        return Ok(());
    }
    Vm::new().execute(program).map(drop).map_err(|e| Diagnostic::from(&e))
}

fn report(cli: &Cli, d: Diagnostic) {
    if cli.json {
        eprintln!("{}", json::render(&d));
    } else {
        let use_color = !cli.no_color && std::io::stderr().is_terminal();
        eprint!("{}", AnsiRenderer { use_color }.render(&d));
    }
}
