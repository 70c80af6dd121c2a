//! `agentchat chat`: interactive session over stdin.

use std::io::Write;
use std::sync::Arc;

use agentchat_session::{
    render_entry, ChatSession, EntryView, MessageId, Role, SessionEvent, SourceCitation,
    TurnOutcome,
};
use clap::ArgMatches;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const SOURCE_PREVIEW_CHARS: usize = 100;

pub async fn run(matches: &ArgMatches) {
    let mut config = super::load_config(matches);
    if let Some(endpoint) = matches.get_one::<String>("endpoint") {
        config.agent.endpoint = endpoint.clone();
        if let Err(e) = config.validate() {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    }
    if matches.get_flag("steps") {
        config.session.reveal_steps = true;
    } else if matches.get_flag("no-steps") {
        config.session.reveal_steps = false;
    }
    super::init_tracing(&config.logging.level);

    let session = match ChatSession::connect(config) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    println!("Connected to {}", session.config().agent.endpoint);
    println!(
        "Intermediate steps: {}. Commands: /steps on|off, /sources, /quit",
        on_off(session.reveal_steps())
    );

    let mut events = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("✗ reading stdin: {}", e);
                break;
            }
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/sources" => print_last_sources(&session),
            cmd if cmd.starts_with("/steps") => toggle_steps(&session, cmd),
            _ => {
                session.set_draft(line);
                run_turn(&session, &mut events).await;
            }
        }
    }

    let turns = session.turn_count().await;
    println!("Session ended after {} turn{}.", turns, if turns == 1 { "" } else { "s" });
}

async fn run_turn(session: &Arc<ChatSession>, events: &mut broadcast::Receiver<SessionEvent>) {
    let turn = session.submit_draft();
    tokio::pin!(turn);
    let mut sources = TurnSources::default();

    let result = loop {
        tokio::select! {
            result = &mut turn => break result,
            event = events.recv() => {
                if let Ok(event) = event {
                    render_event(session, &mut sources, event);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if !session.stop() {
                    println!("\n(only streamed answers can be stopped)");
                }
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        render_event(session, &mut sources, event);
    }

    if let Ok(TurnOutcome::Rejected(reason)) = result {
        tracing::debug!(?reason, "turn rejected");
    }
}

/// Tracks which message received citations during the current turn.
#[derive(Debug, Default)]
struct TurnSources {
    cited: Option<MessageId>,
}

impl TurnSources {
    /// Returns the cited message once the turn has finished.
    fn observe(&mut self, event: &SessionEvent) -> Option<MessageId> {
        match event {
            SessionEvent::CitationsAttached { id, .. } => {
                self.cited = Some(id.clone());
                None
            }
            SessionEvent::TurnFinished { .. } => self.cited.take(),
            SessionEvent::TurnFailed { .. } => {
                self.cited = None;
                None
            }
            _ => None,
        }
    }
}

fn render_event(session: &ChatSession, sources: &mut TurnSources, event: SessionEvent) {
    let cited = sources.observe(&event);
    match event {
        SessionEvent::EntryAppended { id } => {
            let Some(entry) = session.entry(&id) else {
                return;
            };
            match render_entry(&entry) {
                // Already on screen as typed.
                EntryView::User(_) => {}
                EntryView::Assistant(text) if text.is_empty() => print!("\n🤖 "),
                EntryView::Assistant(text) => println!("\n🤖 {}", text),
                EntryView::Step(step) => {
                    println!("\n🔧 {}", step.tool);
                    println!("{}", indent("input: ", &step.input));
                    println!("{}", indent("output: ", &step.output));
                }
                EntryView::Tool(text) => println!("\n🛠  {}", text),
                EntryView::Placeholder(text) => println!("\n{}", text),
            }
        }
        SessionEvent::TokenAppended { token, .. } => print!("{}", token),
        SessionEvent::CitationsAttached { .. } => {}
        SessionEvent::TurnFailed { message } => println!("\n✗ {}", message),
        SessionEvent::TurnFinished { outcome } => {
            if let TurnOutcome::Stopped { .. } = outcome {
                print!(" (stopped)");
            }
            println!();
            if let Some(citations) = cited.and_then(|id| session.citations_for(&id)) {
                print_sources(&citations);
            }
        }
    }
    let _ = std::io::stdout().flush();
}

fn toggle_steps(session: &ChatSession, cmd: &str) {
    let on = match cmd.trim_start_matches("/steps").trim() {
        "on" => true,
        "off" => false,
        "" => !session.reveal_steps(),
        other => {
            println!("Usage: /steps on|off (got '{}')", other);
            return;
        }
    };
    match session.set_reveal_steps(on) {
        Ok(()) => println!("Intermediate steps: {}", on_off(on)),
        Err(e) => println!("✗ {}", e),
    }
}

fn print_last_sources(session: &ChatSession) {
    match last_assistant(session).and_then(|id| session.citations_for(&id)) {
        Some(citations) => print_sources(&citations),
        None => println!("No sources for the last answer."),
    }
}

fn print_sources(citations: &[SourceCitation]) {
    println!("Sources:");
    for (i, citation) in citations.iter().enumerate() {
        println!(
            "  {}. \"{}...\"",
            i + 1,
            citation.preview(SOURCE_PREVIEW_CHARS).trim()
        );
    }
}

fn last_assistant(session: &ChatSession) -> Option<MessageId> {
    session.with_transcript(|t| {
        t.entries()
            .iter()
            .rev()
            .find(|e| e.role() == Role::Assistant)
            .map(|e| e.id.clone())
    })
}

fn indent(label: &str, text: &str) -> String {
    let pad = " ".repeat(3 + label.len());
    let mut lines = text.lines();
    let first = lines.next().unwrap_or_default();
    let mut out = format!("   {}{}", label, first);
    for line in lines {
        out.push('\n');
        out.push_str(&pad);
        out.push_str(line);
    }
    out
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}
