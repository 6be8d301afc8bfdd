use clap::Parser;
use tracing_subscriber::EnvFilter;

use runman::cli::{dispatch, Cli, EXIT_SETUP_ERROR};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "runman=warn",
        1 => "runman=debug",
        _ => "runman=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            EXIT_SETUP_ERROR
        }
    };
    std::process::exit(code);
}
