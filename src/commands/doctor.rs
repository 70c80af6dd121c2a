use std::time::Duration;

use agentchat_providers::{resolve_chat_model, resolve_embedder, ProviderConfig};
use agentchat_session::{ChatConfig, HttpAgentClient};
use clap::ArgMatches;

pub async fn run(matches: &ArgMatches) {
    println!("🔍 Checking agentchat setup...\n");

    let mut all_ok = true;

    print!("• Checking session config... ");
    let path = matches.get_one::<String>("config").map(std::path::Path::new);
    let config = match ChatConfig::load(path) {
        Ok(config) => {
            println!("✓ Endpoint {}", config.agent.endpoint);
            Some(config)
        }
        Err(e) => {
            println!("✗ {}", e);
            all_ok = false;
            None
        }
    };

    if let Some(config) = &config {
        print!("• Checking ingest endpoint... ");
        match HttpAgentClient::new(&config.agent) {
            Ok(client) => println!("✓ {}", client.ingest_endpoint()),
            Err(e) => {
                println!("✗ {}", e);
                all_ok = false;
            }
        }

        print!("• Checking agent (optional)... ");
        if check_reachable(&config.agent.endpoint).await {
            println!("✓ Agent is reachable");
        } else {
            println!("○ Agent not reachable (start it before chatting)");
        }
    }

    print!("• Checking LLM provider... ");
    match ProviderConfig::from_env() {
        Ok(providers) => {
            println!("✓ {} / {}", providers.provider, providers.model);

            print!("• Checking chat model credentials... ");
            match resolve_chat_model(&providers) {
                Ok(_) => println!("✓ {} is set", providers.provider.api_key_var()),
                Err(e) => {
                    println!("✗ {}", e);
                    all_ok = false;
                }
            }

            print!("• Checking embeddings... ");
            match resolve_embedder(&providers) {
                Ok(embedder) => println!(
                    "✓ OpenAI {} ({} dimensions)",
                    embedder.model(),
                    embedder.dimension()
                ),
                Err(e) => {
                    println!("✗ {}", e);
                    println!("  Embeddings always use OpenAI, whatever LLM_PROVIDER is set to");
                    all_ok = false;
                }
            }
        }
        Err(e) => {
            println!("✗ {}", e);
            println!("  Set LLM_PROVIDER (openai, anthropic, google) and LLM_MODEL");
            all_ok = false;
        }
    }

    println!();
    if all_ok {
        println!("✅ All checks passed! You're ready to run: agentchat chat");
    } else {
        println!("⚠️  Some checks failed. Fix the issues above before chatting");
        std::process::exit(1);
    }
}

/// Any HTTP answer counts; only connection failures do not.
async fn check_reachable(endpoint: &str) -> bool {
    let Ok(client) = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
    else {
        return false;
    };
    client.get(endpoint).send().await.is_ok()
}
