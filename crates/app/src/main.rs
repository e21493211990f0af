mod app;
mod commands;
mod error;
mod settings;

use app::TerminalApp;
use settings::SettingsStore;

#[tokio::main]
async fn main() {
    // Replies stream to stdout, so diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let settings = SettingsStore::load();
    let result = match TerminalApp::start(settings).await {
        Ok((app, notices)) => app.run(notices).await,
        Err(error) => Err(error),
    };

    if let Err(error) = result {
        tracing::error!(error = %error, "psup stopped");
        std::process::exit(1);
    }
}
