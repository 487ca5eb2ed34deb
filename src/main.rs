use std::{future::IntoFuture, net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use turnstile::{
    AdmissionController,
    adapters::{AppState, router},
    config::{ServerConfig, ServerConfigValidator, load_config, load_config_or_default},
    metrics, tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file to use; defaults apply when it is missing
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config_or_default(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    ServerConfigValidator::validate(&config).map_err(|e| eyre!("{e}"))?;

    tracing_setup::init_tracing(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    let controller = AdmissionController::from_config(&config.admission)?;
    let shutdown = Arc::new(GracefulShutdown::with_timeout(config.shutdown_timeout()?));

    let signal_handler_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        "Starting turnstile on {} (max_concurrent: {}, acquire_timeout: {:?})",
        addr,
        controller.max_concurrent(),
        controller.default_timeout()
    );

    let app = router(AppState::new(controller.clone(), Arc::new(config)));

    let server_shutdown = shutdown.clone();
    let closing_controller = controller.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = server_shutdown.wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received: {:?}", reason);
        let rejected = closing_controller.close();
        tracing::info!(
            "Stopped admitting; rejected {} queued request(s), {} in flight",
            rejected,
            closing_controller.registry_len()
        );
    })
    .into_future();

    let drain_deadline = {
        let shutdown = shutdown.clone();
        async move {
            shutdown.token().cancelled().await;
            tokio::time::sleep(shutdown.shutdown_timeout()).await;
        }
    };

    tokio::select! {
        result = server => {
            result.context("Server error")?;
            tracing::info!("Graceful shutdown completed");
        }
        _ = drain_deadline => {
            tracing::warn!(
                "Shutdown timeout of {:?} elapsed with {} request(s) still in flight",
                shutdown.shutdown_timeout(),
                controller.registry_len()
            );
        }
    }

    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
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

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Max Concurrent: {}", config.admission.max_concurrent);
            println!("   • Acquire Timeout: {}", config.admission.acquire_timeout);
            println!("   • Shutdown Timeout: {}", config.shutdown_timeout);
            println!("   • Trust X-Forwarded-For: {}", config.trust_forwarded_for);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:5000')");
            println!("   • max_concurrent must be at least 1");
            println!("   • Durations use humantime units (e.g., '30s', '500ms')");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, default_config_toml())
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'turnstile serve --config {config_path}' to start the server");
    Ok(())
}

/// Render the default configuration as commented TOML.
fn default_config_toml() -> String {
    let config = ServerConfig::default();
    let admission = &config.admission;
    let logging = &config.logging;
    format!(
        "# turnstile configuration\n\
         # Every key can be overridden from the environment,\n\
         # e.g. TURNSTILE_ADMISSION__MAX_CONCURRENT=200\n\n\
         listen_addr = {listen:?}\n\
         trust_forwarded_for = {trust}\n\
         shutdown_timeout = {shutdown:?}\n\n\
         [admission]\n\
         max_concurrent = {max}\n\
         acquire_timeout = {timeout:?}\n\n\
         [logging]\n\
         level = {level:?}\n\
         json = {json}\n",
        listen = config.listen_addr,
        trust = config.trust_forwarded_for,
        shutdown = config.shutdown_timeout,
        max = admission.max_concurrent,
        timeout = admission.acquire_timeout,
        level = logging.level,
        json = logging.json,
    )
}
