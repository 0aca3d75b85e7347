use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshkit::{sync_handler, ServiceInstance, ServiceRegistry, ServiceSdk};
use meshkit_bootstrap::{AppConfig, CliArgs};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// MeshKit agent - keeps a local service registry and calls services through it
#[derive(Parser)]
#[command(name = "meshkit-agent")]
#[command(about = "MeshKit agent - service discovery and resilient inter-service calls")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register configured services and watch them until interrupted
    Run,
    /// Health-check configured services once and print their status
    Check,
    /// Call a configured service and print the response body
    Call {
        service: String,
        path: String,
        /// GET, POST, PUT or DELETE
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// JSON body for POST and PUT
        #[arg(short, long)]
        data: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // defaults -> YAML -> MESH__* env -> CLI
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&CliArgs {
        verbose: cli.verbose,
    });

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let logging = config.logging.clone().unwrap_or_default();
    meshkit_bootstrap::init_logging(&logging, &config.log_dir());

    tracing::info!(agent = %config.agent.name, "MeshKit agent starting");

    let sdk = Arc::new(ServiceSdk::from_parts(
        ServiceRegistry::new(config.registry.clone()),
        config.client.clone(),
    ));
    log_registry_events(&sdk);
    let registered = register_configured(&sdk, &config).await?;

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_agent(&sdk, &config, registered).await,
        Commands::Check => check_services(&sdk, &registered).await,
        Commands::Call {
            service,
            path,
            method,
            data,
        } => call_service(&sdk, &service, &method, &path, data.as_deref()).await,
    };

    sdk.shutdown().await;
    result
}

async fn register_configured(
    sdk: &ServiceSdk,
    config: &AppConfig,
) -> Result<Vec<Arc<ServiceInstance>>> {
    let mut registered = Vec::with_capacity(config.services.len());
    for def in config.services.iter().cloned() {
        let name = def.name.clone();
        let instance = def
            .into_instance()
            .with_context(|| format!("invalid service definition '{name}'"))?;
        registered.push(sdk.registry().register_service(instance, false).await);
    }
    Ok(registered)
}

fn log_registry_events(sdk: &ServiceSdk) {
    sdk.on_service_registered(sync_handler(|inst| {
        tracing::info!(service = %inst.name, endpoint = %inst.primary_endpoint(), "registered");
        Ok(())
    }));
    sdk.on_service_deregistered(sync_handler(|inst| {
        tracing::info!(service = %inst.name, endpoint = %inst.primary_endpoint(), "deregistered");
        Ok(())
    }));
    sdk.on_service_healthy(sync_handler(|inst| {
        tracing::info!(service = %inst.name, endpoint = %inst.primary_endpoint(), "healthy");
        Ok(())
    }));
    sdk.on_service_unhealthy(sync_handler(|inst| {
        tracing::warn!(service = %inst.name, endpoint = %inst.primary_endpoint(), "unhealthy");
        Ok(())
    }));
}

async fn run_agent(
    sdk: &Arc<ServiceSdk>,
    config: &AppConfig,
    registered: Vec<Arc<ServiceInstance>>,
) -> Result<()> {
    sdk.registry().start();

    // static services do not heartbeat themselves; keep them inside the TTL
    let heartbeat = config.agent.heartbeat_services.then(|| {
        let sdk = sdk.clone();
        let every = config.agent.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                for inst in &registered {
                    sdk.registry().heartbeat(&inst.name, inst.endpoints()).await;
                }
            }
        })
    });

    tracing::info!(services = config.services.len(), "agent running");
    let result = meshkit_bootstrap::wait_for_shutdown().await;

    if let Some(task) = heartbeat {
        task.abort();
    }
    result
}

async fn check_services(sdk: &ServiceSdk, registered: &[Arc<ServiceInstance>]) -> Result<()> {
    sdk.registry().run_health_checks().await;

    let mut names: Vec<&str> = registered.iter().map(|i| i.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();

    let reports: Vec<_> = names.iter().map(|name| sdk.get_service_status(name)).collect();
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn call_service(
    sdk: &ServiceSdk,
    service: &str,
    method: &str,
    path: &str,
    data: Option<&str>,
) -> Result<()> {
    let body = data
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--data must be valid JSON")?;

    let response = sdk
        .call_service(service, method, path, body)
        .await
        .with_context(|| format!("{method} {path} on '{service}' failed"))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
