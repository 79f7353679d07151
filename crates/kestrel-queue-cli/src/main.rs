use kestrel_queue_cli::{run_cli, CliError};
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        error!("CLI error: {}", e);
        eprintln!("{}", e);

        // Exit with appropriate code based on error type
        let exit_code = match e {
            CliError::Configuration(_) => 1,
            CliError::Queue(_) => 2,
            CliError::Logging { .. } => 3,
            CliError::Io(_) => 5,
        };

        std::process::exit(exit_code);
    }
}
