//! `agentchat ingest`: upload a document to the agent's retrieval store.

use agentchat_session::HttpAgentClient;
use clap::ArgMatches;
use tokio::io::AsyncReadExt;

pub async fn run(matches: &ArgMatches) {
    let config = super::load_config(matches);
    super::init_tracing(&config.logging.level);

    let document = match read_document(matches.get_one::<String>("file")).await {
        Ok(text) => text,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };
    if document.trim().is_empty() {
        eprintln!("✗ Document is empty, nothing to upload");
        std::process::exit(1);
    }

    let client = match HttpAgentClient::new(&config.agent) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    println!("Uploading {} bytes to {}...", document.len(), client.ingest_endpoint());
    match client.ingest(&document).await {
        Ok(()) => {
            println!("✓ Document uploaded successfully!");
            println!("  You can now ask questions about it: agentchat chat");
        }
        Err(e) => {
            // The server's explanation replaces the document on screen.
            println!("{}", e.user_message());
            std::process::exit(1);
        }
    }
}

async fn read_document(path: Option<&String>) -> std::io::Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path).await,
        None => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            Ok(text)
        }
    }
}
