// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end engine tests that fork real children through the executor.

#![cfg(unix)]

use npserv_shell::parser::{PipeOut, Stage};
use npserv_shell::world::{LocalChat, PeerInfo, UserPipeError, UserPipeTx, World};
use npserv_shell::{executor, run_line, LineResult, Session, SessionId, PROMPT};
use std::os::fd::{AsRawFd, OwnedFd};

const TEST_PATH: &str = "/bin:/usr/bin";

/// World that records deliveries instead of writing to sockets.
#[derive(Default)]
struct Recorder {
    sent: Vec<(SessionId, String)>,
}

impl Recorder {
    fn prompts(&self) -> usize {
        self.sent.iter().filter(|(_, m)| m == PROMPT).count()
    }
}

impl World for Recorder {
    fn deliver(&mut self, id: SessionId, msg: &str) {
        self.sent.push((id, msg.to_string()));
    }
    fn broadcast(&mut self, msg: &str) {
        self.sent.push((0, msg.to_string()));
    }
    fn peer(&self, _id: SessionId) -> Option<PeerInfo> {
        None
    }
    fn peers(&self) -> Vec<PeerInfo> {
        Vec::new()
    }
    fn rename(&mut self, _id: SessionId, _new_name: &str) -> bool {
        false
    }
    fn user_pipe_send(
        &mut self,
        _src: SessionId,
        dst: SessionId,
        _line: &str,
    ) -> Result<UserPipeTx, UserPipeError> {
        Err(UserPipeError::NoSuchUser(dst))
    }
    fn user_pipe_recv(
        &mut self,
        src: SessionId,
        _dst: SessionId,
        _line: &str,
    ) -> Result<OwnedFd, UserPipeError> {
        Err(UserPipeError::NoSuchUser(src))
    }
    fn remove(&mut self, _id: SessionId) {}
}

/// A session whose children write to a capture pipe instead of a socket.
fn capture_session(id: SessionId) -> (Session, OwnedFd, OwnedFd) {
    let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
    let mut session = Session::with_client_fd(id, write.as_raw_fd());
    session
        .env
        .insert("PATH".to_string(), TEST_PATH.to_string());
    (session, read, write)
}

fn drain(read: OwnedFd) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = npserv_common::unix_utils::read_some(read.as_raw_fd(), &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(out).unwrap()
}

#[test]
fn test_ordinary_pipe_end_to_end() {
    let (mut session, read, write) = capture_session(1);
    let mut world = Recorder::default();

    let result = run_line(&mut session, &mut world, "echo hello |cat").unwrap();
    assert_eq!(result, LineResult::Continue);
    assert_eq!(world.prompts(), 1);
    assert!(session.pipes.is_empty());

    drop(write);
    assert_eq!(drain(read), "hello\n");
}

#[test]
fn test_numbered_pipe_joins_a_later_line() {
    let (mut session, read, write) = capture_session(1);
    let mut world = Recorder::default();

    run_line(&mut session, &mut world, "echo one |2").unwrap();
    assert!(session.pipes.contains(1));
    run_line(&mut session, &mut world, "echo two").unwrap();
    assert!(session.pipes.contains(0));
    run_line(&mut session, &mut world, "cat").unwrap();
    assert!(session.pipes.is_empty());
    assert_eq!(world.prompts(), 3);

    drop(write);
    assert_eq!(drain(read), "two\none\n");
}

#[test]
fn test_merged_stderr_through_pipe_into_redirect() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("out.txt");
    let (mut session, _read, _write) = capture_session(1);
    let mut world = Recorder::default();

    let stages = vec![
        Stage {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo out; echo err 1>&2".to_string(),
            ],
            pipe_out: PipeOut::Ordinary,
            merge_stderr: true,
            ..Stage::default()
        },
        Stage {
            argv: vec!["cat".to_string()],
            file_redirect: Some(out_path.to_string_lossy().into_owned()),
            ..Stage::default()
        },
    ];
    executor::run_stages(&mut session, &mut world, &stages, "echoerr ! cat > out.txt").unwrap();

    assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "out\nerr\n");
}

#[test]
fn test_file_redirect_truncates() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("redir.txt");
    std::fs::write(&out_path, "stale contents that must vanish").unwrap();

    let (mut session, _read, _write) = capture_session(1);
    let mut world = Recorder::default();
    let line = format!("echo fresh > {}", out_path.display());
    run_line(&mut session, &mut world, &line).unwrap();

    assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "fresh\n");
}

#[test]
fn test_unknown_command_reports_and_continues() {
    let (mut session, read, write) = capture_session(1);
    let mut world = Recorder::default();

    run_line(&mut session, &mut world, "no-such-cmd-xyz").unwrap();
    run_line(&mut session, &mut world, "echo still-alive").unwrap();
    assert_eq!(world.prompts(), 2);

    drop(write);
    let seen = drain(read);
    assert!(seen.contains("Unknown command: [no-such-cmd-xyz].\n"));
    assert!(seen.contains("still-alive\n"));
}

#[test]
fn test_user_pipe_between_sessions() {
    let (mut s1, r1, w1) = capture_session(1);
    let (mut s2, r2, w2) = capture_session(2);
    let mut chat = LocalChat::default();
    chat.join(1, w1.as_raw_fd(), "10.0.0.1".into(), 1111);
    chat.join(2, w2.as_raw_fd(), "10.0.0.2".into(), 2222);

    run_line(&mut s1, &mut chat, "echo ping >2").unwrap();
    run_line(&mut s2, &mut chat, "cat <1").unwrap();

    drop(w1);
    drop(w2);
    let seen1 = drain(r1);
    let seen2 = drain(r2);

    assert!(seen1.contains("*** (no name) (#1) just piped 'echo ping >2' to (no name) (#2) ***"));
    assert!(seen2.contains("ping\n"));
    assert!(seen2.contains("*** (no name) (#2) just received from (no name) (#1) by 'cat <1' ***"));
}

#[test]
fn test_user_pipe_to_missing_session_runs_to_devnull() {
    let (mut s1, r1, w1) = capture_session(1);
    let mut chat = LocalChat::default();
    chat.join(1, w1.as_raw_fd(), "10.0.0.1".into(), 1111);

    run_line(&mut s1, &mut chat, "echo gone >9").unwrap();

    drop(w1);
    let seen = drain(r1);
    assert!(seen.contains("*** Error: user #9 does not exist yet. ***\n"));
    // The command still ran; its stdout went to /dev/null.
    assert!(!seen.contains("gone"));
    assert_eq!(seen.matches(PROMPT).count(), 1);
}

#[test]
fn test_duplicate_user_pipe_edge_is_rejected() {
    let (mut s1, r1, w1) = capture_session(1);
    let (mut s2, _r2, w2) = capture_session(2);
    let mut chat = LocalChat::default();
    chat.join(1, w1.as_raw_fd(), "10.0.0.1".into(), 1111);
    chat.join(2, w2.as_raw_fd(), "10.0.0.2".into(), 2222);

    run_line(&mut s1, &mut chat, "echo a >2").unwrap();
    run_line(&mut s1, &mut chat, "echo b >2").unwrap();
    let _ = s2;

    drop(w1);
    drop(w2);
    assert!(drain(r1).contains("*** Error: the pipe #1->#2 already exists. ***\n"));
}

#[test]
fn test_empty_argv_stage_reports_unknown() {
    let (mut session, read, write) = capture_session(1);
    let mut world = Recorder::default();

    run_line(&mut session, &mut world, "| cat").unwrap();

    drop(write);
    assert!(drain(read).contains("Unknown command: [].\n"));
    assert_eq!(world.prompts(), 1);
}
