//! Host launching the real worker binary against a mock API.

#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pipecall::{
    CallOutcome, ChannelConfig, Frame, HostClient, HostConfig, HostSession, ProcessProbe,
    RotatingErrorLog, SupervisorConfig, WorkerSupervisor,
};
use pipecall_openai::{Credential, ImageSize, RequestBuilder, host_continuations};

/// Only the worker this test spawns counts as running.
struct OwnedOnly;

impl ProcessProbe for OwnedOnly {
    fn find(&self, _name: &str) -> Vec<u32> {
        Vec::new()
    }

    fn kill(&self, _pid: u32) -> bool {
        false
    }
}

/// Kills the spawned worker when the test ends, pass or fail.
struct Session(HostSession<OwnedOnly>);

impl Drop for Session {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

fn session(dir: &Path, tag: &str, api: &MockServer) -> Session {
    let channel = ChannelConfig::default()
        .with_socket_dir(dir.join("sock"))
        .with_endpoints(format!("{tag}-req"), format!("{tag}-resp"));
    let supervisor = SupervisorConfig::default()
        .with_worker("pipecall-worker", env!("CARGO_BIN_EXE_pipecall-worker"))
        .with_channel(channel)
        .with_ready_timeout(Duration::from_secs(10))
        .with_env("OPENAI_BASE_URL", api.uri())
        .with_env("PIPECALL_ERROR_LOG", dir.join("worker.log").to_string_lossy())
        .with_env("PIPECALL_LOG", "warn");
    let config = HostConfig::default()
        .with_supervisor(supervisor.clone())
        .with_call_timeout(Some(Duration::from_secs(10)))
        .with_error_log(RotatingErrorLog::new(dir.join("host.log"), "host"));
    Session(HostSession::new(
        HostClient::with_supervisor(config, WorkerSupervisor::with_probe(supervisor, OwnedOnly)),
        host_continuations(),
    ))
}

#[tokio::test]
async fn cold_launch_then_transcribe_and_generate() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/transcriptions"))
        .and(header("authorization", "Bearer sk-abc"))
        .and(header("openai-organization", "org-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "text": "hello\nworld"
        })))
        .expect(1)
        .mount(&api)
        .await;
    Mock::given(method("POST"))
        .and(path("/images/generations"))
        .and(body_partial_json(serde_json::json!({ "n": 10 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"url": "https://img/1"}, {"url": "https://img/2"}]
        })))
        .expect(1)
        .mount(&api)
        .await;

    let session = session(dir.path(), "proc-flow", &api);
    assert!(!session.0.client().supervisor().is_running());

    let audio = dir.path().join("dictation.wav");
    std::fs::write(&audio, b"RIFF").unwrap();
    let requests = RequestBuilder::new(Credential::new("sk-abc").with_organization("org-1"));

    // The first call after a cold launch must not be lost.
    let outcome = session
        .0
        .invoke(&requests.transcribe(&audio).await.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, CallOutcome::success("hello world"));
    assert!(session.0.client().supervisor().owned_pid().is_some());

    let outcome = session
        .0
        .invoke(&requests.generate("a cat", 10, ImageSize::S512).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, CallOutcome::success("https://img/1;https://img/2"));
}

#[tokio::test]
async fn worker_failure_is_flagged_and_logged_on_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockServer::start().await;
    let session = session(dir.path(), "proc-fail", &api);

    let missing = dir.path().join("gone.wav");
    let request = Frame::new([
        "transcribe".to_string(),
        "sk-abc".to_string(),
        missing.to_string_lossy().into_owned(),
    ])
    .unwrap();
    let outcome = session.0.invoke(&request).await.unwrap().unwrap();
    assert!(outcome.error);
    assert!(
        outcome
            .response
            .starts_with("Whisper Transcription Error: cannot read"),
        "{}",
        outcome.response
    );

    let host_log = std::fs::read_to_string(dir.path().join("host.log")).unwrap();
    let worker_log = std::fs::read_to_string(dir.path().join("worker.log")).unwrap();
    assert!(host_log.contains("Whisper Transcription Error"));
    assert!(worker_log.contains("Whisper Transcription Error"));
}
