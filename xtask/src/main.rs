use anyhow::{ensure, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;
use woodchat_core::fake::{FakeBackend, DEMO_PASSWORD, DEMO_USERNAME};
use woodchat_core::stream::StreamOutcome;
use woodchat_core::{
    telemetry, CreateMessageRequest, CredentialStore, FileCredentialStorage, WoodchatClient,
};

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Woodchat")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in, chat, survive a credential expiry, and restart against an in-process server.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let backend = FakeBackend::new();
    let connect = || {
        let storage = Arc::new(FileCredentialStorage::new(temp_dir.path().to_path_buf()));
        WoodchatClient::with_parts(Arc::new(backend.clone()), CredentialStore::restore(storage))
    };

    let (client, _events) = connect();
    runtime.block_on(async {
        client.users.login(DEMO_USERNAME, DEMO_PASSWORD).await?;
        let outcome = client
            .chat
            .send_message(CreateMessageRequest::new("ping from xtask", "smoke"))
            .await?;
        ensure!(
            matches!(outcome, StreamOutcome::Finalized(_)),
            "reply was not finalized"
        );

        backend.expire_access_token();
        let sessions = client.chat.sessions().await?;
        ensure!(backend.refresh_calls() == 1, "expected exactly one refresh");
        info!("sessions" = sessions.len(), "recovered from expired credential");
        anyhow::Ok(())
    })?;

    let (restarted, _events) = connect();
    ensure!(
        restarted.credentials().is_authenticated(),
        "credentials were not persisted"
    );
    let session_id = client
        .state()
        .active_session_id()
        .ok_or_else(|| anyhow::anyhow!("no active session"))?;
    let history = runtime.block_on(restarted.chat.messages(session_id))?;
    info!("messages" = history.len(), "smoke test conversation reloaded");

    Ok(())
}
