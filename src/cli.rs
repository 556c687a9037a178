use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueHint, builder::NonEmptyStringValueParser};

/// The top-level command requested by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reconcile declared services until interrupted.
    Serve { config: Option<PathBuf> },

    /// Print how a source reference is understood.
    Parse { source: String, local: bool },

    /// Fetch, build and supervise one source in the foreground.
    Run(RunSpec),

    /// Declare a new service.
    Create(ServiceArgs),

    /// Replace the declaration of an existing service.
    Update(ServiceArgs),

    Delete {
        service: ServiceRef,
        config: Option<PathBuf>,
    },

    /// Print declared services, optionally only those named `name`.
    Status {
        name: Option<String>,
        config: Option<PathBuf>,
    },

    Logs {
        service: ServiceRef,
        lines: Option<usize>,
        config: Option<PathBuf>,
    },

    ShowVersion,
}

/// A declared service addressed by name and optional version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub name: String,

    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceArgs {
    pub service: ServiceRef,

    pub source: String,

    pub entrypoint: Option<String>,

    /// `KEY=VALUE` entries.
    pub env: Vec<String>,

    pub args: Vec<String>,

    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub source: String,

    pub restart: bool,

    pub update: bool,

    /// Passed to the built binary.
    pub args: Vec<String>,

    pub config: Option<PathBuf>,
}

/// Parse CLI arguments into a high-level command.
pub fn parse() -> Result<Command> {
    from_cli(Cli::parse())
}

/// Parse an explicit argument list; the first item is the program name.
pub fn parse_from<I, T>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    from_cli(Cli::try_parse_from(args)?)
}

fn split_args(raw: Option<String>) -> Result<Vec<String>> {
    match raw {
        Some(raw) => shell_words::split(&raw)
            .with_context(|| format!("could not split --args '{}'", raw)),
        None => Ok(Vec::new()),
    }
}

fn service_args(args: DeclareArgs) -> Result<ServiceArgs> {
    if let Some(entry) = args.env.iter().find(|e| !e.contains('=')) {
        bail!("--env '{}' is not KEY=VALUE", entry);
    }
    Ok(ServiceArgs {
        service: ServiceRef {
            name: args.name,
            version: args.version,
        },
        source: args.source,
        entrypoint: args.entrypoint,
        env: args.env,
        args: split_args(args.args)?,
        config: args.config,
    })
}

fn from_cli(cli: Cli) -> Result<Command> {
    if cli.version {
        return Ok(Command::ShowVersion);
    }

    match cli.command {
        Some(CliCommand::Serve { config }) => Ok(Command::Serve { config }),
        Some(CliCommand::Parse { source, local }) => Ok(Command::Parse { source, local }),
        Some(CliCommand::Run {
            source,
            restart,
            update,
            args,
            config,
        }) => Ok(Command::Run(RunSpec {
            source,
            restart,
            update,
            args: split_args(args)?,
            config,
        })),
        Some(CliCommand::Create(args)) => Ok(Command::Create(service_args(args)?)),
        Some(CliCommand::Update(args)) => Ok(Command::Update(service_args(args)?)),
        Some(CliCommand::Delete {
            name,
            version,
            config,
        }) => Ok(Command::Delete {
            service: ServiceRef { name, version },
            config,
        }),
        Some(CliCommand::Status { name, config }) => Ok(Command::Status { name, config }),
        Some(CliCommand::Logs {
            name,
            version,
            lines,
            config,
        }) => Ok(Command::Logs {
            service: ServiceRef { name, version },
            lines,
            config,
        }),
        Some(CliCommand::Version) => Ok(Command::ShowVersion),
        None => bail!("no command given; try `micro-run --help`"),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "micro-run",
    about = "Build services from source and keep them running",
    disable_help_subcommand = true,
    disable_version_flag = true
)]
struct Cli {
    /// Print version information and exit.
    #[arg(short = 'V', long = "version", action = clap::ArgAction::SetTrue)]
    version: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Run the reconciler until Ctrl-C.
    Serve {
        /// Configuration file; defaults to ./micro-run.toml when present.
        #[arg(short, long, value_name = "PATH", value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },

    /// Parse a source reference and print it as JSON.
    Parse {
        #[arg(value_name = "SOURCE", value_parser = NonEmptyStringValueParser::new())]
        source: String,

        /// Treat existing paths as local checkouts.
        #[arg(long, action = clap::ArgAction::SetTrue)]
        local: bool,
    },

    /// Build a source and supervise it in the foreground.
    Run {
        #[arg(value_name = "SOURCE", value_parser = NonEmptyStringValueParser::new())]
        source: String,

        /// Restart the process whenever it exits.
        #[arg(long, action = clap::ArgAction::SetTrue)]
        restart: bool,

        /// Fetch the source again even when a checkout is cached.
        #[arg(long, action = clap::ArgAction::SetTrue)]
        update: bool,

        /// Arguments for the built binary, split like a shell would.
        #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
        args: Option<String>,

        #[arg(short, long, value_name = "PATH", value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },

    /// Declare a service for the reconciler to run.
    Create(DeclareArgs),

    /// Change a declared service; it is rebuilt on the next tick.
    Update(DeclareArgs),

    /// Remove a declared service; its process is stopped on the next tick.
    Delete {
        #[arg(value_name = "NAME", value_parser = NonEmptyStringValueParser::new())]
        name: String,

        #[arg(long, value_name = "VERSION")]
        version: Option<String>,

        #[arg(short, long, value_name = "PATH", value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },

    /// Show declared services and their status as JSON.
    Status {
        #[arg(value_name = "NAME")]
        name: Option<String>,

        #[arg(short, long, value_name = "PATH", value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },

    /// Print the output of a declared service.
    Logs {
        #[arg(value_name = "NAME", value_parser = NonEmptyStringValueParser::new())]
        name: String,

        #[arg(long, value_name = "VERSION")]
        version: Option<String>,

        /// Only the last N lines.
        #[arg(short = 'n', long, value_name = "N")]
        lines: Option<usize>,

        #[arg(short, long, value_name = "PATH", value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },

    /// Print version information.
    Version,
}

#[derive(clap::Args, Debug)]
struct DeclareArgs {
    #[arg(value_name = "NAME", value_parser = NonEmptyStringValueParser::new())]
    name: String,

    #[arg(value_name = "SOURCE", value_parser = NonEmptyStringValueParser::new())]
    source: String,

    #[arg(long, value_name = "VERSION")]
    version: Option<String>,

    /// Directory inside the source to build.
    #[arg(long, value_name = "DIR")]
    entrypoint: Option<String>,

    /// Environment entry for the service; repeatable.
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Arguments for the service binary, split like a shell would.
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    args: Option<String>,

    #[arg(short, long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
}
