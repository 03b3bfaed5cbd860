use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use runsync_coach::{
    ActivitySelection, AutoTriggerGate, BatchReclassifier, MessageKey, SessionEngine,
    SessionEvent, SessionResult, SessionSnapshot, SettingsStore, Surface, TurnOutcome,
};
use runsync_transport::{
    ActivityClass, ActivityClassifier, ActivityId, CoachTransport, GoalId, Role, ThreadId,
    create_transport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

/// Terminal conversation with the running coach.
#[derive(Debug, Parser)]
#[command(name = "runsync-coach", version)]
struct Args {
    /// Goal whose coaching thread is opened.
    #[arg(long)]
    goal: i64,
    /// Use the compact widget surface, which shows complete replies only.
    #[arg(long)]
    widget: bool,
    /// Opening message sent once the thread is loaded.
    #[arg(long)]
    auto_message: Option<String>,
    /// Backend base URL, overriding the settings file.
    #[arg(long)]
    backend_url: Option<String>,
    /// Settings file to read instead of the per-user default.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let store = match &args.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let settings = store.settings();
    init_tracing(&settings.log_filter);

    let mut transport_config = settings.to_transport_config();
    if let Some(backend_url) = &args.backend_url {
        transport_config.base_url = backend_url.clone();
    }
    let http = create_transport(transport_config)?;
    tracing::info!(backend_url = %http.base_url(), "runsync coach starting");

    let transport: Arc<dyn CoachTransport> = http.clone();
    let classifier: Arc<dyn ActivityClassifier> = http;
    let reclassifier = BatchReclassifier::new(classifier, settings.training_load_policy());

    let surface = if args.widget {
        Surface::FloatingWidget
    } else {
        Surface::Panel
    };
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = SessionEngine::new(transport.clone(), surface, events_tx);
    let streamed = surface.streams_responses() && transport.supports_streaming();

    tokio::spawn(report_events(events_rx));
    if streamed {
        tokio::spawn(render_stream(engine.subscribe()));
    }

    let goal_id = GoalId::new(args.goal);
    if engine.bind_goal(goal_id).await.is_ok() {
        print_history(&engine);
    }

    if let Some(auto_message) = args.auto_message {
        let (gate_tx, mut gate_rx) = mpsc::unbounded_channel();
        let mut gate = AutoTriggerGate::new(gate_tx);
        gate.offer(goal_id, auto_message);
        if let Some(result) = gate.pump(&engine).await {
            report_turn(&engine, result, streamed);
        }
        while let Ok(SessionEvent::AutoMessageConsumed { token, .. }) = gate_rx.try_recv() {
            gate.acknowledge(token);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" => break,
            "/reload" => {
                if engine.reload().await.is_ok() {
                    print_history(&engine);
                }
            }
            "/archive" => match engine.archive_thread().await {
                Ok(Some(thread_id)) => {
                    println!("[thread {thread_id} archived; your next message starts a new one]")
                }
                Ok(None) => println!("[no thread to archive]"),
                Err(error) => eprintln!("! {error}"),
            },
            "/archived" => match engine.archived_threads().await {
                Ok(threads) if threads.is_empty() => println!("[no archived threads]"),
                Ok(threads) => {
                    for thread in threads {
                        let title = thread.title.as_deref().unwrap_or("untitled");
                        println!("[{}] {title} ({})", thread.id, thread.created_at.date_naive());
                    }
                }
                Err(error) => eprintln!("! {error}"),
            },
            command if command.starts_with("/restore ") => {
                match ThreadId::parse(&command["/restore ".len()..]) {
                    Ok(thread_id) => match engine.restore_thread(thread_id).await {
                        Ok(()) => print_history(&engine),
                        Err(error) => eprintln!("! {error}"),
                    },
                    Err(error) => eprintln!("! {error}"),
                }
            }
            command if command.starts_with("/goal ") => {
                match GoalId::parse(&command["/goal ".len()..]) {
                    Ok(goal_id) => {
                        if engine.bind_goal(goal_id).await.is_ok() {
                            print_history(&engine);
                        }
                    }
                    Err(error) => eprintln!("! {error}"),
                }
            }
            command if command.starts_with("/classify ") => {
                classify(&reclassifier, &command["/classify ".len()..]).await;
            }
            text => {
                engine.set_input(text);
                let result = engine.submit_input().await;
                report_turn(&engine, result, streamed);
            }
        }
        prompt();
    }

    engine.close();
    tracing::info!("runsync coach stopped");
    Ok(())
}

fn init_tracing(configured: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| configured.parse::<EnvFilter>())
        .unwrap_or_else(|error| {
            eprintln!("WARN: log filter '{configured}' is invalid ({error}); falling back to 'info'");
            EnvFilter::new("info")
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn prompt() {
    print!("you> ");
    let _ = std::io::stdout().flush();
}

fn print_history(engine: &SessionEngine) {
    for message in engine.messages() {
        match message.role {
            Role::User => println!("you> {}", message.content),
            Role::Assistant | Role::System => println!("coach> {}", message.content),
        }
    }
}

fn report_turn(engine: &SessionEngine, result: SessionResult<TurnOutcome>, streamed: bool) {
    match result {
        Ok(TurnOutcome::Completed { .. }) if streamed => {}
        Ok(TurnOutcome::Completed { .. }) | Ok(TurnOutcome::ThreadCreated { .. }) => {
            let reply = engine
                .messages()
                .into_iter()
                .rev()
                .find(|message| message.role == Role::Assistant);
            if let Some(reply) = reply {
                println!("coach> {}", reply.content);
            }
        }
        Ok(TurnOutcome::Discarded) => {}
        // Failed sends are reported by the event task; rejections are only echoed.
        Err(error) if error.is_rejection() => eprintln!("! {error}"),
        Err(_) => {}
    }
}

async fn report_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::PlanChanged => println!("[training plan updated]"),
            SessionEvent::ThreadCreated(thread) => {
                tracing::info!(thread_id = %thread.id, goal_id = %thread.goal_id, "thread created");
            }
            SessionEvent::SendFailed { kind, reason } => {
                eprintln!("! message not sent ({}): {reason}", kind.as_str());
            }
            SessionEvent::AutoMessageConsumed { .. } => {}
        }
    }
}

/// Prints streamed deltas of the in-flight reply as they are folded.
async fn render_stream(mut snapshots: watch::Receiver<SessionSnapshot>) {
    let mut current: Option<MessageKey> = None;
    let mut thinking_len = 0;
    let mut content_len = 0;

    while snapshots.changed().await.is_ok() {
        let streaming = snapshots
            .borrow_and_update()
            .messages
            .iter()
            .find(|message| message.streaming)
            .cloned();

        let mut stdout = std::io::stdout();
        match streaming {
            Some(message) => {
                if current != Some(message.id) {
                    current = Some(message.id);
                    thinking_len = 0;
                    content_len = 0;
                    let _ = write!(stdout, "coach> ");
                }
                if let Some(thinking) = &message.thinking
                    && thinking.len() > thinking_len
                {
                    let _ = write!(stdout, "\x1b[2m{}\x1b[0m", &thinking[thinking_len..]);
                    thinking_len = thinking.len();
                }
                if message.content.len() > content_len {
                    let _ = write!(stdout, "{}", &message.content[content_len..]);
                    content_len = message.content.len();
                }
            }
            None if current.is_some() => {
                current = None;
                let _ = writeln!(stdout);
            }
            None => {}
        }
        let _ = stdout.flush();
    }
}

async fn classify(reclassifier: &BatchReclassifier, arguments: &str) {
    let mut parts = arguments.split_whitespace();
    let Some(class) = parts.next().and_then(parse_activity_class) else {
        eprintln!("! usage: /classify <workout|commute|recovery|race> <id>[,<id>...]");
        return;
    };

    let ids = parts
        .flat_map(|part| part.split(','))
        .filter(|raw| !raw.trim().is_empty())
        .map(ActivityId::parse)
        .collect::<Result<Vec<_>, _>>();
    let ids = match ids {
        Ok(ids) => ids,
        Err(error) => {
            eprintln!("! {error}");
            return;
        }
    };

    let mut selection = ActivitySelection::new();
    selection.select_all(&ids);
    match reclassifier.reclassify(&mut selection, class).await {
        Ok(count) => println!("[{count} activities marked as {}]", class.as_str()),
        Err(error) => eprintln!("! {error}"),
    }
}

fn parse_activity_class(raw: &str) -> Option<ActivityClass> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "workout" => Some(ActivityClass::Workout),
        "commute" => Some(ActivityClass::Commute),
        "recovery" => Some(ActivityClass::Recovery),
        "race" => Some(ActivityClass::Race),
        _ => None,
    }
}
