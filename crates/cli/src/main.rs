//! Hymn CLI
//!
//! Command-line driver for the Hymn interpreter: run a script, optionally
//! dump its bytecode instead of executing it, and install the `tracing`
//! subscriber the VM and compiler emit events through.

use clap::{CommandFactory, Parser, ValueEnum};
use clap_complete::{Shell, generate};
use hymn_vm::{Compiler, Vm, VmConfig};
use std::io;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "hymn")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hymn scripting language interpreter", long_about = None)]
struct Cli {
    /// Script file to run (.hm)
    script: Option<PathBuf>,

    /// Print the compiled bytecode instead of running it
    #[arg(short = 'd', long)]
    disassemble: bool,

    /// Load VM tunables (stack/frame capacity, module search paths) from a TOML file
    #[arg(short = 'c', long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print shell completion script and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<ShellArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ShellArg {
    Bash,
    Zsh,
    Fish,
    Elvish,
    PowerShell,
}

impl From<ShellArg> for Shell {
    fn from(s: ShellArg) -> Shell {
        match s {
            ShellArg::Bash => Shell::Bash,
            ShellArg::Zsh => Shell::Zsh,
            ShellArg::Fish => Shell::Fish,
            ShellArg::Elvish => Shell::Elvish,
            ShellArg::PowerShell => Shell::PowerShell,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(Shell::from(shell), &mut cmd, "hymn", &mut io::stdout());
        return;
    }

    let Some(script) = cli.script else {
        eprintln!("Error: no script given");
        eprintln!();
        Cli::command().print_help().ok();
        process::exit(1);
    };

    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            process::exit(1);
        }
    };

    let source = match std::fs::read_to_string(&script) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {e}", script.display());
            process::exit(1);
        }
    };

    let script_name = script.to_string_lossy().to_string();

    if cli.disassemble {
        run_disassemble(&source, &script_name);
        return;
    }

    let mut vm = Vm::new(config);
    match vm.interpret(&source, &script_name) {
        Ok(_) => {}
        Err(message) => {
            eprintln!("{message}");
            process::exit(1);
        }
    }
}

fn run_disassemble(source: &str, script_name: &str) {
    let mut strings = hymn_core::StringTable::new();
    let compiler = Compiler::new(source, script_name, &mut strings);
    let (function, err) = compiler.compile();
    if let Some(err) = err {
        eprintln!("{err}");
        process::exit(1);
    }
    print!("{}", hymn_vm::disasm::disassemble(&function));
}

fn load_config(path: Option<&std::path::Path>) -> Result<VmConfig, String> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
            VmConfig::from_toml(&text).map_err(|e| e.to_string())
        }
        None => Ok(VmConfig::default()),
    }
}

fn install_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
