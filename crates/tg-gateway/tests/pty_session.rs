//! PTY session tests against a real shell

use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tg_broker::{Token, TOKEN_LEN};
use tg_core::config::ChildConfig;
use tg_core::process::is_process_alive;
use tg_core::TerminalSize;
use tg_gateway::connection::AuthContext;
use tg_gateway::pty::{ExitDisposition, PtySession};
use tg_gateway::relay::{ChannelRelay, OutputPump, OutputStream, PumpEvent, StartOutcome};

fn shell(script: &str) -> ChildConfig {
    ChildConfig {
        program: PathBuf::from("/bin/sh"),
        // "sh" fills $0 so the token lands in $1
        args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        working_dir: None,
        env: vec![("TERM".to_string(), "xterm-256color".to_string())],
    }
}

fn token() -> Token {
    let bytes: Vec<u8> = (0..TOKEN_LEN).map(|i| b"0123456789abcdef"[i % 16]).collect();
    Token::from_response(&bytes).unwrap()
}

/// Read the master until the terminal goes away
fn read_all(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => output.extend_from_slice(&buf[..n]),
        }
    }
    output
}

fn wait_for_exit(pty: &mut PtySession) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pty.try_reap() {
        assert!(Instant::now() < deadline, "child did not exit");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_token_is_final_argument() {
    let mut pty = PtySession::open(TerminalSize::default()).unwrap();
    let pid = pty
        .spawn(&shell(r#"printf '%s:%s' "$#" "$1""#), &token())
        .unwrap();
    assert!(pid > 0);

    let output = read_all(pty.try_clone_reader().unwrap());
    let expected = format!("1:{}", String::from_utf8_lossy(token().as_bytes()));
    assert_eq!(String::from_utf8_lossy(&output), expected);

    wait_for_exit(&mut pty);
    assert_eq!(pty.finish(), ExitDisposition::Exited(0));
}

#[test]
fn test_exit_code_is_reported() {
    let mut pty = PtySession::open(TerminalSize::default()).unwrap();
    pty.spawn(&shell("exit 7"), &token()).unwrap();

    wait_for_exit(&mut pty);
    let disposition = pty.finish();
    assert_eq!(disposition, ExitDisposition::Exited(7));
    assert_eq!(disposition.exit_status(), Some(7));
}

#[test]
fn test_running_child_is_killed_on_finish() {
    let mut pty = PtySession::open(TerminalSize::default()).unwrap();
    let pid = pty.spawn(&shell("sleep 30"), &token()).unwrap();
    assert!(pty.is_alive());

    let disposition = pty.finish();
    assert_eq!(disposition, ExitDisposition::Killed);
    assert_eq!(disposition.exit_status(), None);
    assert!(!is_process_alive(pid));
}

#[test]
fn test_signal_death_is_abnormal() {
    let mut pty = PtySession::open(TerminalSize::default()).unwrap();
    pty.spawn(&shell("kill -9 $$"), &token()).unwrap();

    wait_for_exit(&mut pty);
    assert_eq!(pty.finish(), ExitDisposition::Abnormal);
}

#[test]
fn test_drop_kills_child() {
    let mut pty = PtySession::open(TerminalSize::default()).unwrap();
    let pid = pty.spawn(&shell("sleep 30"), &token()).unwrap();

    drop(pty);
    assert!(!is_process_alive(pid));
}

#[test]
fn test_second_spawn_is_refused() {
    let mut pty = PtySession::open(TerminalSize::default()).unwrap();
    pty.spawn(&shell("sleep 30"), &token()).unwrap();

    assert!(pty.spawn(&shell("true"), &token()).is_err());
    assert_eq!(pty.finish(), ExitDisposition::Killed);
}

#[test]
fn test_resize_reaches_child() {
    let mut pty = PtySession::open(TerminalSize::new(80, 24)).unwrap();
    pty.resize(TerminalSize::new(120, 40)).unwrap();

    let reported = pty.reported_size().unwrap();
    assert_eq!((reported.cols, reported.rows), (120, 40));
    assert_eq!(pty.size(), TerminalSize::new(120, 40));

    pty.spawn(&shell("stty size"), &token()).unwrap();
    let output = read_all(pty.try_clone_reader().unwrap());
    assert_eq!(String::from_utf8_lossy(&output).trim(), "40 120");

    wait_for_exit(&mut pty);
    assert_eq!(pty.finish(), ExitDisposition::Exited(0));
}

#[tokio::test]
async fn test_output_passes_through_relay_unchanged() {
    let mut relay = ChannelRelay::new(shell(r"printf 'A\001\033[1m\303\251\177Z'"), 1024);
    relay.allocate_pty(TerminalSize::new(80, 24)).unwrap();

    let mut auth = AuthContext::default();
    auth.grant("alice", token());

    let registration = match relay.start(&mut auth).unwrap() {
        StartOutcome::Spawned(registration) => registration,
        other => panic!("unexpected start outcome: {:?}", other),
    };
    assert!(!auth.has_token());

    let mut pump = OutputPump::start(registration, relay.read_buffer_size());
    let mut output = Vec::new();
    let collect = async {
        while let Some(event) = pump.next().await {
            match event {
                PumpEvent::Chunk(chunk) => {
                    assert_eq!(chunk.stream, OutputStream::Stdout);
                    output.extend_from_slice(&chunk.data);
                }
                PumpEvent::Closed(OutputStream::Stdout) => break,
                PumpEvent::Closed(OutputStream::Stderr) => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("output never closed");

    assert_eq!(output, b"A\x01\x1b[1m\xc3\xa9\x7fZ");
    assert!(pump.is_drained());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !relay.child_exited() {
        assert!(Instant::now() < deadline, "child did not exit");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.finish(), ExitDisposition::Exited(0));
}
