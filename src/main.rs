use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sandpit::config::Config;
use sandpit::config_loader;
use sandpit::domain::{ApplyResult, SandboxError};
use sandpit::exec::{Executor, LocalExecutor, ShellCommand, ShellRequest, ShellSettings};
use sandpit::mcp;
use sandpit::patch::{self, PatchApplier};
use sandpit::sandbox::SandboxRoot;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Sandpit - sandboxed patching and shell execution for software engineering agents",
    long_about = "Sandpit confines file edits and shell commands to a single root directory.\n\
                  Patches are applied file by file, and commands run with a timeout and bounded output capture."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP (Model Context Protocol) server over stdio
    ///
    /// Serves the apply_patch, shell, and file tools for the given root. Logs go to
    /// stderr; stdout carries the protocol.
    Stdio {
        /// Directory every tool is confined to
        root: PathBuf,
    },

    /// Apply a patch to a directory
    ///
    /// Reads the patch from --file or standard input and prints one line per file.
    /// Exits with status 1 if any change failed.
    Apply {
        /// Directory the patch applies to
        root: PathBuf,

        /// Read the patch from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Run a command inside a directory
    ///
    /// Arguments are executed directly unless --line is given, in which case they are
    /// joined with spaces and passed to the configured shell.
    Shell {
        /// Directory the command is confined to
        root: PathBuf,

        /// Working directory relative to the root
        #[arg(short, long, default_value = ".")]
        workdir: String,

        /// Timeout in seconds; 0 disables it
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Run the command through the shell
        #[arg(long)]
        line: bool,

        /// Command and arguments to execute
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Show where a path resolves inside a root
    Resolve {
        root: PathBuf,
        path: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Stdio { root } => handle_stdio(root).await,
        Commands::Apply { root, file } => handle_apply(root, file).await,
        Commands::Shell {
            root,
            workdir,
            timeout,
            line,
            command,
        } => handle_shell(root, workdir, timeout, line, command).await,
        Commands::Resolve { root, path } => handle_resolve(root, path),
    }
}

async fn handle_stdio(root: PathBuf) -> ExitCode {
    let (root, config) = match open(&root) {
        Ok(opened) => opened,
        Err(code) => return code,
    };
    log::debug!("Loaded configuration: {config:?}");

    if let Err(error) = mcp::run_stdio(root, config).await {
        return report_error("stdio", error);
    }
    ExitCode::from(0)
}

async fn handle_apply(root: PathBuf, file: Option<PathBuf>) -> ExitCode {
    let (root, _config) = match open(&root) {
        Ok(opened) => opened,
        Err(code) => return code,
    };

    let text = match file {
        Some(path) => std::fs::read_to_string(&path),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text).map(|_| text)
        }
    };
    let text = match text {
        Ok(text) => text,
        Err(error) => return report_error("apply", error),
    };

    let patch = match patch::parse(&text) {
        Ok(patch) => patch,
        Err(error) => return report_error("apply", error),
    };
    let results = match tokio::task::spawn_blocking(move || PatchApplier::new(root).apply(&patch)).await {
        Ok(results) => results,
        Err(error) => return report_error("apply", error),
    };

    for result in &results {
        println!("{result}");
    }

    if results.iter().any(ApplyResult::is_failed) {
        ExitCode::from(1)
    } else {
        ExitCode::from(0)
    }
}

async fn handle_shell(
    root: PathBuf,
    workdir: String,
    timeout: Option<u64>,
    line: bool,
    command: Vec<String>,
) -> ExitCode {
    let (root, config) = match open(&root) {
        Ok(opened) => opened,
        Err(code) => return code,
    };

    let timeout = match timeout.unwrap_or(config.shell.default_timeout_secs()) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let command = if line {
        ShellCommand::Line(command.join(" "))
    } else {
        ShellCommand::Argv(command)
    };
    let executor = LocalExecutor::new(root, ShellSettings::from_config(&config.shell));
    let request = ShellRequest {
        command,
        workdir,
        timeout,
    };

    let result = match executor.run(&request).await {
        Ok(result) => result,
        Err(error) => return report_error("shell", error),
    };

    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    if result.stdout_truncated || result.stderr_truncated {
        eprintln!("shell warning: output truncated");
    }
    if !result.success() {
        eprintln!("shell failed: {result}");
    }

    match result.exit_code {
        Some(0) if !result.timed_out => ExitCode::from(0),
        Some(code) => u8::try_from(code).map_or(ExitCode::from(1), ExitCode::from),
        None => ExitCode::from(1),
    }
}

fn handle_resolve(root: PathBuf, path: String) -> ExitCode {
    let root = match SandboxRoot::new(&root) {
        Ok(root) => root,
        Err(error) => return report_error("resolve", error),
    };
    match root.resolve(&path) {
        Ok(resolved) => {
            println!("{}", resolved.display());
            ExitCode::from(0)
        }
        Err(error) => report_error("resolve", error),
    }
}

fn open(root: &Path) -> Result<(SandboxRoot, Config), ExitCode> {
    let root = SandboxRoot::new(root).map_err(|error| report_error("open root", error))?;
    let config = config_loader::load_final()
        .map_err(SandboxError::from)
        .map_err(|error| report_error("load config", error))?;
    Ok((root, config))
}

fn report_error(action: &str, error: impl std::fmt::Display) -> ExitCode {
    eprintln!("{action} failed: {error}");
    ExitCode::from(1)
}
