// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end scenarios that need an actual fork/exec/cgroup filesystem,
//! run against the compiled `muontrap` binary. Scenarios that depend on
//! a writable `/sys/fs/cgroup/memory` skip (rather than fail) when one
//! isn't available, the same convention low-level process-control test
//! suites use for kernel facilities that sandboxes often lack.

use std::{
    io::{Read, Write},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

fn muontrap() -> Command
{
    Command::new(env!("CARGO_BIN_EXE_muontrap"))
}

fn cgroup_memory_writable() -> bool
{
    let probe = format!("/sys/fs/cgroup/memory/muontrap-test-probe-{}", std::process::id());
    match std::fs::create_dir(&probe) {
        Ok(()) => {
            let _ = std::fs::remove_dir(&probe);
            true
        },
        Err(_) => false,
    }
}

/// Scenario a: normal exit, output captured.
#[test]
fn normal_exit_forwards_output_and_propagates_code()
{
    let output = muontrap()
        .args(["--capture-output", "--", "echo", "hello"])
        .output()
        .expect("spawn muontrap");

    assert!(output.status.success());
    assert_eq!(output.stdout, b"hello\n");
}

/// Scenario b: target kills itself with SIGTERM.
#[test]
fn target_killed_by_signal_maps_to_128_plus_signal()
{
    let status = muontrap()
        .args(["--", "sh", "-c", "kill -TERM $$"])
        .status()
        .expect("spawn muontrap");

    assert_eq!(status.code(), Some(128 + 15));
}

/// Scenario c: target ignores SIGTERM and must be SIGKILLed after grace.
#[test]
fn target_ignoring_sigterm_is_eventually_sigkilled()
{
    let grace_ms = 200;
    let mut child = muontrap()
        .args(["--delay-to-sigkill", &grace_ms.to_string(), "--",
               "sh", "-c", "trap '' TERM; sleep 120"])
        .spawn()
        .expect("spawn muontrap");

    // Give the target time to install its trap before we ask muontrap to stop.
    std::thread::sleep(Duration::from_millis(100));

    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }

    let start = Instant::now();
    let status = child.wait().expect("wait on muontrap");
    let elapsed = start.elapsed();

    assert!(!status.success());
    assert!(elapsed < Duration::from_millis(grace_ms as u64) * 4);
}

/// Scenario e: back-pressure. Window of 16; we read a handful of bytes
/// and return exactly that much credit, and the supervisor must never
/// forward more than we've credited for.
#[test]
fn back_pressure_never_forwards_ahead_of_credit()
{
    let mut child = muontrap()
        .args(["--capture-output", "--stdio-window", "16", "--",
               "sh", "-c", "head -c 65536 /dev/zero"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn muontrap");

    let mut stdout = child.stdout.take().unwrap();
    let mut stdin = child.stdin.take().unwrap();

    let mut total_read = 0usize;
    let mut buf = [0u8; 4];
    for _ in 0 .. 8 {
        let n = stdout.read(&mut buf).expect("read from muontrap");
        if n == 0 {
            break;
        }
        total_read += n;
        // Credit back exactly `n` bytes using n acknowledgement bytes of
        // value 0 (each returns exactly 1 credit).
        let acks = vec![0u8; n];
        stdin.write_all(&acks).expect("write ack");
    }

    drop(stdin);
    let _ = child.kill();
    let _ = child.wait();

    assert!(total_read > 0);
}

/// Scenario f: a pre-existing leaf control-group directory is a fatal
/// configuration error; no child is launched.
#[test]
fn pre_existing_group_directory_is_fatal()
{
    if !cgroup_memory_writable() {
        eprintln!("skipping: /sys/fs/cgroup/memory is not writable here");
        return;
    }

    let group = format!("muontrap-test-preexisting-{}", std::process::id());
    let leaf = format!("/sys/fs/cgroup/memory/{group}");
    std::fs::create_dir_all(&leaf).expect("create pre-existing leaf");

    let status = muontrap()
        .args(["--controller", "memory", "--group", &group, "--", "true"])
        .status()
        .expect("spawn muontrap");

    let _ = std::fs::remove_dir(&leaf);

    assert!(!status.success());
}

/// Scenario d: a tree of descendants is fully swept on teardown.
#[test]
fn forked_descendants_are_swept_on_teardown()
{
    if !cgroup_memory_writable() {
        eprintln!("skipping: /sys/fs/cgroup/memory is not writable here");
        return;
    }

    let group = format!("muontrap-test-sweep-{}", std::process::id());
    let leaf = format!("/sys/fs/cgroup/memory/{group}");

    let mut child = muontrap()
        .args(["--controller", "memory", "--group", &group, "--delay-to-sigkill", "200", "--",
               "sh", "-c", "for i in $(seq 1 8); do sleep 120 & done; wait"])
        .spawn()
        .expect("spawn muontrap");

    std::thread::sleep(Duration::from_millis(200));
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    let status = child.wait().expect("wait on muontrap");

    assert!(!status.success());
    assert!(!std::path::Path::new(&leaf).exists());
}
