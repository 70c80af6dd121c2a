pub mod chat;
pub mod doctor;
pub mod ingest;
pub mod schema;

use std::path::Path;

use agentchat_session::ChatConfig;
use clap::ArgMatches;

/// Resolve configuration or exit with the reason.
pub fn load_config(matches: &ArgMatches) -> ChatConfig {
    let path = matches.get_one::<String>("config").map(Path::new);
    match ChatConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr so they never interleave with the transcript.
pub fn init_tracing(level: &str) {
    let directive = level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.into()),
        )
        .init();
}
