use clap::{value_parser, Arg, ArgAction, Command};

mod commands;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("TOML configuration file (environment variables still override it)")
}

#[tokio::main]
async fn main() {
    let matches = Command::new("agentchat")
        .version(VERSION)
        .about("Terminal chat for tool-using retrieval agents")
        .subcommand(
            Command::new("chat")
                .about("Chat with the agent interactively")
                .arg(config_arg())
                .arg(
                    Arg::new("endpoint")
                        .short('e')
                        .long("endpoint")
                        .value_name("URL")
                        .help("Agent chat endpoint"),
                )
                .arg(
                    Arg::new("steps")
                        .long("steps")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("no-steps")
                        .help("Reveal intermediate steps (structured replies)"),
                )
                .arg(
                    Arg::new("no-steps")
                        .long("no-steps")
                        .action(ArgAction::SetTrue)
                        .help("Stream the answer without intermediate steps"),
                ),
        )
        .subcommand(
            Command::new("ingest")
                .about("Upload a document for retrieval")
                .arg(config_arg())
                .arg(
                    Arg::new("file")
                        .short('f')
                        .long("file")
                        .value_name("PATH")
                        .help("Document to upload (reads stdin when omitted)"),
                ),
        )
        .subcommand(
            Command::new("doctor")
                .about("Check configuration and connectivity")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("schema")
                .about("Print the SQL that provisions the vector store")
                .arg(
                    Arg::new("dimension")
                        .short('d')
                        .long("dimension")
                        .value_name("N")
                        .value_parser(value_parser!(u32).range(1..))
                        .default_value("1536")
                        .help("Embedding vector dimension"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("chat", sub_matches)) => commands::chat::run(sub_matches).await,
        Some(("ingest", sub_matches)) => commands::ingest::run(sub_matches).await,
        Some(("doctor", sub_matches)) => commands::doctor::run(sub_matches).await,
        Some(("schema", sub_matches)) => commands::schema::run(sub_matches),
        _ => {
            println!("agentchat v{}", VERSION);
            println!("Use --help for available commands");
        }
    }
}
