use std::process::ExitCode;

use session_bridge::app;
use session_bridge::config::EnvConfig;
use session_bridge::logging;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let config = EnvConfig::from_env();
    if let Err(error) = logging::init(config.log_filter.as_deref()) {
        eprintln!("session_bridge: {error}");
    }

    match app::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "session bridge stopped");
            ExitCode::FAILURE
        }
    }
}
