use tracing::{error, info};

use tracking_detection::app::App;
use tracking_detection::cli::parse_cli_args;
use tracking_detection::domain::settings::SettingsService;
use tracking_detection::infrastructure::logging;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let invocation = parse_cli_args(std::env::args())?;

    let settings_service = SettingsService::new()?;
    let _log_guard = logging::init_logger(&settings_service.get().log_settings)?;
    info!(
        settings = %settings_service.path().display(),
        "Starting {}",
        tracking_detection::cli::version_text()
    );

    let app = App::new(&settings_service, &invocation);
    let result = app.run(invocation.command).await;
    if let Err(e) = &result {
        // Log before the guard flushes the file writer
        error!("{:#}", e);
    }
    result
}
