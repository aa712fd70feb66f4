use std::sync::Arc;
use tempfile::TempDir;
use woodchat::{load_cli_state, save_cli_state, CliState};
use woodchat_core::fake::{FakeBackend, DEMO_PASSWORD, DEMO_USERNAME};
use woodchat_core::{CredentialStore, FileCredentialStorage, WoodchatClient};

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn client_at(backend: &FakeBackend, dir: &TempDir) -> WoodchatClient {
    let storage = Arc::new(FileCredentialStorage::new(dir.path().to_path_buf()));
    let (client, _events) =
        WoodchatClient::with_parts(Arc::new(backend.clone()), CredentialStore::restore(storage));
    client
}

#[test]
fn credentials_survive_a_restart() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let backend = FakeBackend::new();

    let first = client_at(&backend, &dir);
    runtime
        .block_on(first.users.login(DEMO_USERNAME, DEMO_PASSWORD))
        .expect("login");
    drop(first);

    let second = client_at(&backend, &dir);
    assert!(second.credentials().is_authenticated());
    let user = runtime
        .block_on(second.users.current_user())
        .expect("current user");
    assert_eq!(user.username, DEMO_USERNAME);
    assert_eq!(backend.refresh_calls(), 0);

    second.users.logout();
    let third = client_at(&backend, &dir);
    assert!(!third.credentials().is_authenticated());
}

#[test]
fn refreshed_pair_is_what_the_next_run_sees() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let backend = FakeBackend::new();

    let first = client_at(&backend, &dir);
    runtime
        .block_on(first.users.login(DEMO_USERNAME, DEMO_PASSWORD))
        .expect("login");
    backend.expire_access_token();
    runtime
        .block_on(first.chat.sessions())
        .expect("sessions after refresh");
    let rotated = first.credentials().access_token();

    let second = client_at(&backend, &dir);
    assert_eq!(second.credentials().access_token(), rotated);
    runtime
        .block_on(second.chat.sessions())
        .expect("sessions with rotated token");
    assert_eq!(backend.refresh_calls(), 1);
}

#[test]
fn cli_state_and_credentials_share_a_root() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let backend = FakeBackend::new();
    let client = client_at(&backend, &dir);
    runtime
        .block_on(client.users.login(DEMO_USERNAME, DEMO_PASSWORD))
        .expect("login");

    let state = CliState {
        last_session: Some(3),
        model: Some("doubao".into()),
    };
    runtime
        .block_on(save_cli_state(dir.path(), &state))
        .expect("save");

    assert_eq!(
        runtime.block_on(load_cli_state(dir.path())).expect("load"),
        state
    );
    assert!(client_at(&backend, &dir).credentials().is_authenticated());
}
