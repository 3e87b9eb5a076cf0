use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::middleware;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use fnagent::{
    adapters::{
        ExecutorClient, FileConfigProvider, HttpClientAdapter, HttpResultStore,
        InMemoryResultStore, access_log_middleware, request_id_middleware,
    },
    config::{AgentConfig, AgentConfigValidator, ResultStoreConfig, load_config},
    core::{InvocationContext, MutableRouteTable, TriggerSet},
    metrics::{self, RecorderFunctionMetrics},
    ports::{
        address_resolver::AddressResolver, config_provider::ConfigProvider,
        http_client::HttpClient, result_store::ResultStore,
    },
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file used when no subcommand is given
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "fnagent.toml")]
        config: PathBuf,
    },
    /// Write a sample configuration file
    Init {
        /// Output path for the new config file
        #[clap(default_value = "fnagent.toml")]
        path: PathBuf,
    },
    /// Start the agent (default)
    Serve {
        /// Configuration file; environment variables alone are used when omitted
        #[clap(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { path }) => init_config_command(&path).await,
        Some(Commands::Serve { config }) => serve(config).await,
        None => serve(args.config).await,
    }
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let provider = match &config_path {
        Some(path) => Some(Arc::new(
            FileConfigProvider::new(path.clone()).context("Failed to create config provider")?,
        )),
        None => None,
    };
    let config = match &provider {
        Some(provider) => provider.load_config().await,
        None => load_config(None).await,
    }
    .context("Failed to load initial configuration")?;

    tracing_setup::init_tracing(tracing_setup::default_level(config.debug), !config.debug)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    AgentConfigValidator::validate(&config).context("Invalid configuration")?;
    metrics::init_metrics().context("Failed to initialize metrics")?;

    let shutdown = Arc::new(GracefulShutdown::new());

    let resolver: Arc<dyn AddressResolver> = Arc::new(
        ExecutorClient::new(&config.executor_url, config.address_cache.update_timeout)
            .context("Failed to create executor client")?,
    );
    let client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new(&config.round_trip));
    let results: Arc<dyn ResultStore> = match &config.result_store {
        ResultStoreConfig::Memory => Arc::new(InMemoryResultStore::new()),
        ResultStoreConfig::Http { url, timeout } => Arc::new(
            HttpResultStore::new(url, *timeout).context("Failed to create result store client")?,
        ),
    };

    let ctx = Arc::new(InvocationContext::new(
        &config,
        resolver,
        client,
        results,
        Arc::new(RecorderFunctionMetrics),
    ));
    let reaper = ctx.spawn_reaper(config.address_cache.reap_interval, shutdown.token().child_token());

    let table = Arc::new(MutableRouteTable::empty());
    let triggers = Arc::new(TriggerSet::new(Arc::clone(&ctx), Arc::clone(&table)));
    triggers
        .apply(&config.functions, &config.triggers)
        .context("Failed to build initial route table")?;

    if let Some(provider) = provider {
        spawn_config_watcher(
            provider,
            Arc::clone(&triggers),
            config.clone(),
            shutdown.token().child_token(),
        );
    }

    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!("Signal handler error: {}", e);
            }
        });
    }

    let mut app = table
        .service()
        .layer(middleware::from_fn(request_id_middleware));
    if config.display_access_log {
        app = app.layer(middleware::from_fn(access_log_middleware));
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        %addr,
        functions = config.functions.len(),
        triggers = config.triggers.len(),
        executor = %config.executor_url,
        "fnagent listening"
    );

    let token = shutdown.token();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await });
    let server = tokio::spawn(async move { server.await });

    shutdown.wait_for_shutdown_signal().await;
    tracing::info!("Draining in-flight requests");
    match shutdown.drain(server).await {
        ShutdownReason::Graceful => tracing::info!("Graceful shutdown completed"),
        ShutdownReason::Force => tracing::warn!("Shut down with requests still in flight"),
    }

    if let Err(e) = reaper.await {
        tracing::debug!("Cache reaper ended abnormally: {}", e);
    }
    Ok(())
}

/// Rebuilds the route table whenever the config file changes.
fn spawn_config_watcher(
    provider: Arc<FileConfigProvider>,
    triggers: Arc<TriggerSet>,
    running: AgentConfig,
    shutdown: CancellationToken,
) {
    let debounce_duration = Duration::from_secs(2);
    let mut notify_rx = provider.watch();

    tokio::spawn(async move {
        tracing::info!(path = %provider.path().display(), "Config watcher task started.");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = notify_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
            }

            // Editors emit bursts of events for a single save.
            tokio::time::sleep(debounce_duration).await;
            while notify_rx.try_recv().is_ok() {}

            match provider.load_config().await {
                Ok(new_config) => {
                    if running.tunables_differ(&new_config) {
                        tracing::warn!(
                            "Configuration tunables changed; only functions and triggers are reloaded, restart to apply the rest"
                        );
                    }
                    match triggers.apply(&new_config.functions, &new_config.triggers) {
                        Ok(summary) => tracing::info!(
                            functions = summary.functions,
                            triggers = summary.triggers,
                            "Configuration reloaded"
                        ),
                        Err(e) => tracing::error!(
                            "Rejected reloaded configuration: {}. Keeping the current route table.",
                            e
                        ),
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to reload configuration: {:#}. Keeping old configuration.",
                        e
                    );
                }
            }
        }
        tracing::info!("Config watcher task is shutting down.");
    });
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &Path) -> Result<()> {
    println!("🔍 Validating configuration file: {}", config_path.display());

    if !config_path.exists() {
        eprintln!(
            "❌ Error: Configuration file '{}' not found",
            config_path.display()
        );
        std::process::exit(1);
    }

    let config = match load_config(Some(config_path)).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match AgentConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Executor: {}", config.executor_url);
            println!("   • Functions: {}", config.functions.len());
            println!("   • Triggers: {}", config.triggers.len());
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Give each trigger exactly one of 'prefix' or 'relative_url'");
            println!("   • Make sure every referenced function is declared in the trigger's namespace");
            println!("   • Verify listen address format (e.g., '0.0.0.0:8888')");
            std::process::exit(1);
        }
    }
}

const SAMPLE_CONFIG: &str = r#"# fnagent configuration
# Every key can be overridden from the environment, e.g. FNAGENT_ROUND_TRIP__MAX_RETRIES=5

listen_addr = "0.0.0.0:8888"
executor_url = "http://executor.fission"
debug = false
display_access_log = false

[round_trip]
timeout = "50ms"
timeout_exponent = 2
keep_alive = "30s"
max_retries = 10
svc_address_max_retries = 5
function_timeout = "60s"

[address_cache]
ttl = "60s"
update_timeout = "30s"
untap_timeout = "1h"
reap_interval = "30s"

[invocation]
sync_wait = "10s"
max_body_bytes = 10485760
correlation_ttl = "1h"

[result_store]
type = "memory"

[[functions]]
name = "hello"
uid = "00000000-0000-0000-0000-000000000001"
strategy = "new_deploy"

[[triggers]]
name = "hello"
prefix = "/hello"
function = { type = "name", name = "hello" }
"#;

/// Write a sample configuration file
async fn init_config_command(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "❌ Error: Configuration file '{}' already exists",
            path.display()
        );
        std::process::exit(1);
    }

    tokio::fs::write(path, SAMPLE_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created sample configuration at: {}", path.display());
    println!(
        "   Run 'fnagent serve --config {}' to start the agent",
        path.display()
    );
    Ok(())
}
