use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use woodchat::{
    load_cli_state, message_block, report_outcome, save_cli_state, session_line, state_root,
    DraftPrinter,
};
use woodchat_core::stream::StreamOutcome;
use woodchat_core::{
    telemetry, AuthEvent, ClientSettings, CreateMessageRequest, ThinkType, WoodchatClient,
};

#[derive(Parser, Debug)]
#[command(name = "woodchat", version, about = "Chat with a Woodchat server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Directory for stored credentials and CLI state.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Read settings from this file instead of the usual locations.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in; the password is read from stdin when not given.
    Login {
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    Logout,
    /// Show the signed-in user.
    Whoami,
    /// List chat sessions, most recent first.
    Sessions,
    /// Print a session's messages.
    History { session: i64 },
    /// Send a message and stream the reply. Ctrl-C stops the reply.
    Ask {
        content: String,
        #[arg(long)]
        session: Option<i64>,
        /// Start a new session instead of continuing the last one.
        #[arg(long, conflicts_with = "session")]
        new: bool,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        think: Option<ThinkType>,
    },
}

fn main() -> Result<()> {
    telemetry::init_tracing(telemetry::env_filter())?;
    let cli = Cli::parse();
    let runtime = Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => ClientSettings::from_file(path),
        None => ClientSettings::load(),
    }
    .map_err(|err| anyhow::anyhow!(err.user_message()))?;
    let root = cli.data_dir.clone().unwrap_or_else(state_root);
    let (client, mut auth_events) = WoodchatClient::connect(&settings, Some(root.clone()))?;

    let result = dispatch(cli.command, &client, &settings, &root).await;
    report_auth_events(&mut auth_events);
    result
}

async fn dispatch(
    command: Command,
    client: &WoodchatClient,
    settings: &ClientSettings,
    root: &std::path::Path,
) -> Result<()> {
    match command {
        Command::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => prompt_password()?,
            };
            let login = client
                .users
                .login(&username, &password)
                .await
                .map_err(|err| anyhow::anyhow!(err.user_message()))?;
            println!("Signed in as {}.", login.user.display_name());
        }
        Command::Logout => {
            client.users.logout();
            let mut state = load_cli_state(root).await?;
            state.last_session = None;
            save_cli_state(root, &state).await?;
            println!("Signed out.");
        }
        Command::Whoami => {
            let user = client
                .users
                .current_user()
                .await
                .map_err(|err| anyhow::anyhow!(err.user_message()))?;
            println!("{} ({})", user.display_name(), user.username);
        }
        Command::Sessions => {
            let sessions = client
                .chat
                .sessions()
                .await
                .map_err(|err| anyhow::anyhow!(err.user_message()))?;
            if sessions.is_empty() {
                println!("No sessions yet.");
            }
            for session in &sessions {
                println!("{}", session_line(session));
            }
        }
        Command::History { session } => {
            let messages = client
                .chat
                .messages(session)
                .await
                .map_err(|err| anyhow::anyhow!(err.user_message()))?;
            for message in &messages {
                println!("{}\n", message_block(message));
            }
        }
        Command::Ask {
            content,
            session,
            new,
            model,
            think,
        } => {
            let mut state = load_cli_state(root).await?;
            let session = if new { None } else { session.or(state.last_session) };
            let model = model
                .or_else(|| state.model.clone())
                .unwrap_or_else(|| settings.default_model.clone());
            let request = CreateMessageRequest::new(content, model.clone())
                .in_session(session)
                .with_think_type(think.unwrap_or(settings.think_type));

            let outcome = ask(client, request).await?;
            state.last_session = client.state().active_session_id().or(session);
            state.model = Some(model);
            save_cli_state(root, &state).await?;
            report_outcome(&mut io::stderr(), &outcome)?;
        }
    }
    Ok(())
}

async fn ask(client: &WoodchatClient, request: CreateMessageRequest) -> Result<StreamOutcome> {
    let mut events = client.state().subscribe();
    let mut printer = DraftPrinter::new(io::stdout());

    let canceller = {
        let chat = client.chat.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt received, cancelling reply");
                chat.cancel_current();
            }
        })
    };

    let send = client.chat.send_message(request);
    tokio::pin!(send);
    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome,
            Some(event) = events.recv() => printer.handle(&event)?,
        }
    };
    canceller.abort();
    while let Ok(event) = events.try_recv() {
        printer.handle(&event)?;
    }
    outcome.map_err(|err| anyhow::anyhow!(err.user_message()))
}

fn prompt_password() -> Result<String> {
    eprint!("Password: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("password is required");
    }
    Ok(password)
}

fn report_auth_events(events: &mut UnboundedReceiver<AuthEvent>) {
    while let Ok(event) = events.try_recv() {
        if let AuthEvent::LoginRequired { reason } = &event {
            debug!(%reason, "login required");
            eprintln!("{} Run `woodchat login <username>`.", event.user_message());
        }
    }
}
