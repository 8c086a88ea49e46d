use anyhow::Context;
use libris_kernel::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load Libris settings")?;
    libris_telemetry::init(&settings.telemetry);

    tracing::info!(
        env = ?settings.environment,
        backend = ?settings.database.backend,
        "libris-app starting"
    );

    libris_app::serve(settings).await
}
