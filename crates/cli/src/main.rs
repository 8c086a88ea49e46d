use anyhow::Context;
use clap::{Parser, Subcommand};

use libris_kernel::settings::{DatabaseBackend, Settings};

#[derive(Debug, Parser)]
#[command(name = "libris", version, about = "Library lending service")]
struct Cli {
    /// Environment overlay to load (overrides LIBRIS_ENV)
    #[arg(long, global = true)]
    env: Option<String>,

    /// Directory holding base.toml and the environment overlays
    #[arg(long, global = true)]
    config_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply migrations and serve the HTTP API
    Serve,
    /// Apply pending migrations and exit
    Migrate,
    /// Print the resolved configuration
    Config,
}

impl Cli {
    fn settings(&self) -> anyhow::Result<Settings> {
        Settings::load_with(self.env.as_deref(), self.config_dir.as_deref())
    }
}

fn print_config(settings: &Settings) {
    println!("environment      {:?}", settings.environment);
    println!(
        "server           {}:{} (timeout {} ms)",
        settings.server.host, settings.server.port, settings.server.request_timeout_ms
    );
    match settings.database.backend {
        DatabaseBackend::Postgres => println!(
            "storage          postgres (max {} connections)",
            settings.database.max_connections
        ),
        DatabaseBackend::Memory => println!("storage          memory"),
    }
    println!(
        "categories       {} (cache ttl {} s)",
        settings.categories.base_url, settings.categories.cache_ttl_secs
    );
    println!("page size        {}", settings.books.page_size);
    println!(
        "logging          {:?} ({})",
        settings.telemetry.log_format, settings.telemetry.filter
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli
        .settings()
        .with_context(|| "failed to load Libris settings")?;

    match cli.command {
        Command::Config => {
            print_config(&settings);
            Ok(())
        }
        Command::Migrate => {
            libris_telemetry::init(&settings.telemetry);
            let applied = libris_app::migrate(&settings).await?;
            tracing::info!(applied, "migrations complete");
            println!("applied {applied} migration(s)");
            Ok(())
        }
        Command::Serve => {
            libris_telemetry::init(&settings.telemetry);
            libris_app::serve(settings).await
        }
    }
}
