use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cancel::CancelToken;
use crate::cli::{Command, RunSpec, ServiceArgs, ServiceRef};
use crate::config::{Config, StoreKind};
use crate::error::Error;
use crate::platform::Platform;
use crate::reconciler::Reconciler;
use crate::service::{DEFAULT_VERSION, ReadFilter, ServiceKey, ServiceSpec, ServiceStatus};
use crate::source::SourceDescriptor;
use crate::supervisor::{LocalProcessRuntime, RunOptions, Supervisor};
use crate::version;

pub fn run(command: Command) -> Result<i32> {
    init_tracing();

    let outcome = match command {
        Command::ShowVersion => {
            println!("{}", version::describe());
            return Ok(0);
        }
        Command::Parse { source, local } => parse_source(&source, local),
        Command::Serve { config } => block_on(serve(config.as_deref())),
        Command::Run(spec) => block_on(run_foreground(spec)),
        Command::Create(args) => block_on(declare(args, false)),
        Command::Update(args) => block_on(declare(args, true)),
        Command::Delete { service, config } => block_on(delete(service, config.as_deref())),
        Command::Status { name, config } => block_on(status(name, config.as_deref())),
        Command::Logs {
            service,
            lines,
            config,
        } => block_on(logs(service, lines, config.as_deref())),
    };

    match outcome {
        Ok(code) => Ok(code),
        Err(err) => {
            eprintln!("error: {}", err);
            Ok(err.exit_code())
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

fn block_on<F>(fut: F) -> std::result::Result<i32, Error>
where
    F: std::future::Future<Output = std::result::Result<i32, Error>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(fut)
}

fn parse_source(source: &str, local: bool) -> std::result::Result<i32, Error> {
    let descriptor = if local {
        SourceDescriptor::resolve(&std::env::current_dir()?, source)?
    } else {
        SourceDescriptor::parse(source)?
    };
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(0)
}

fn load_platform(config: Option<&Path>) -> std::result::Result<Arc<Platform>, Error> {
    let config = Config::discover(config)?;
    Ok(Arc::new(Platform::from_config(config)?))
}

/// A reconciler over the file store, shared by `serve` and the commands that
/// change what it runs.
fn shared_reconciler(config: Option<&Path>) -> std::result::Result<Arc<Reconciler>, Error> {
    let config = Config::discover(config)?;
    if config.store.kind != StoreKind::File {
        return Err(Error::InvalidConfig {
            reason: "store.kind must be \"file\" to declare services from the command line"
                .to_string(),
        });
    }
    Ok(Reconciler::new(Arc::new(Platform::from_config(config)?)))
}

fn service_key(service: &ServiceRef) -> ServiceKey {
    ServiceKey::new(
        &service.name,
        service.version.as_deref().unwrap_or(DEFAULT_VERSION),
    )
}

async fn serve(config: Option<&Path>) -> std::result::Result<i32, Error> {
    let reconciler = shared_reconciler(config)?;
    reconciler.start()?;

    shutdown_signal().await;
    info!("shutting down");
    reconciler.stop().await;
    Ok(0)
}

async fn declare(args: ServiceArgs, update: bool) -> std::result::Result<i32, Error> {
    let reconciler = shared_reconciler(args.config.as_deref())?;
    let mut spec = ServiceSpec::new(&args.service.name, &args.source)
        .with_version(args.service.version.as_deref().unwrap_or_default());
    spec.entrypoint = args.entrypoint;
    spec.env = args.env;
    spec.args = args.args;

    let record = if update {
        reconciler.update(spec).await?
    } else {
        reconciler.create(spec).await?
    };
    println!(
        "{} {} (revision {})",
        if update { "updated" } else { "created" },
        record.key(),
        record.metadata.revision
    );
    Ok(0)
}

async fn delete(service: ServiceRef, config: Option<&Path>) -> std::result::Result<i32, Error> {
    let reconciler = shared_reconciler(config)?;
    let key = service_key(&service);
    reconciler.delete(&key).await?;
    println!("deleted {}", key);
    Ok(0)
}

async fn status(name: Option<String>, config: Option<&Path>) -> std::result::Result<i32, Error> {
    let reconciler = shared_reconciler(config)?;
    let filter = ReadFilter {
        name,
        ..Default::default()
    };
    let records = reconciler.read(&filter).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(0)
}

async fn logs(
    service: ServiceRef,
    lines: Option<usize>,
    config: Option<&Path>,
) -> std::result::Result<i32, Error> {
    let reconciler = shared_reconciler(config)?;
    for line in reconciler.logs(&service_key(&service), lines).await? {
        println!("{}", line);
    }
    Ok(0)
}

async fn run_foreground(spec: RunSpec) -> std::result::Result<i32, Error> {
    let platform = load_platform(spec.config.as_deref())?;
    let runtime = Arc::new(LocalProcessRuntime::new(platform.clone()).with_args(spec.args));
    let supervisor = Supervisor::new(runtime, &platform.config);
    let sweeper_stop = CancelToken::new();
    let sweeper = supervisor.start_sweeper(platform.config.sweep_interval(), sweeper_stop.clone());

    let options = RunOptions {
        restart: spec.restart,
        update: spec.update,
    };
    let source = spec.source.trim().to_string();
    supervisor.run(&source, options)?;

    let info = tokio::select! {
        info = supervisor.wait(&source) => info?,
        _ = shutdown_signal() => {
            info!(source = %source, "interrupted");
            supervisor.stop(&source)?;
            supervisor.wait(&source).await?
        }
    };
    sweeper_stop.cancel();
    if let Err(err) = sweeper.await {
        warn!(error = %err, "sweeper task failed");
    }

    match info.status {
        ServiceStatus::Error { message, .. } => {
            eprintln!("error: {}", message);
            Ok(1)
        }
        _ => Ok(0),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await.context("listening for Ctrl-C") {
        warn!(error = %err, "no signal handler, running until killed");
        std::future::pending::<()>().await;
    }
}
