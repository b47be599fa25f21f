mod common;

use common::{all_in_state, harness, wait_for};
use std::time::Duration;
use taskmaster::tm::instance::ProcessState;
use taskmaster::tm::signals;

#[tokio::test]
async fn graceful_stop_escalates_to_kill() {
    // the child shields itself from TERM, so the stoptime deadline must kill it
    let h = harness(
        r#"
programs:
  stubborn:
    cmd: "sh -c 'trap \"\" TERM; sleep 30'"
    starttime: 0
    stopsignal: TERM
    stoptime: 1
"#,
    );
    h.supervisor.start_program("stubborn").await.unwrap();
    let running = wait_for(&h.supervisor, Duration::from_secs(3), |s| {
        all_in_state(s, "stubborn", ProcessState::Running, 1)
    })
    .await;
    let pid = running["stubborn"][0].pid;
    assert!(signals::alive(pid));

    let stop_started = tokio::time::Instant::now();
    h.supervisor.stop_program("stubborn").await.unwrap();
    assert!(stop_started.elapsed() < Duration::from_secs(3));

    let snapshot = h.supervisor.get_status().await;
    assert!(all_in_state(&snapshot, "stubborn", ProcessState::Stopped, 1));

    // the monitor reaps the killed child; after that the pid must be gone
    wait_for(&h.supervisor, Duration::from_secs(3), |_| !signals::alive(pid)).await;
}

#[tokio::test]
async fn manual_stop_defeats_always_restart() {
    let h = harness(
        r#"
programs:
  p:
    cmd: "sleep 10"
    autorestart: always
    starttime: 0
"#,
    );
    h.supervisor.start_program("p").await.unwrap();
    wait_for(&h.supervisor, Duration::from_secs(3), |s| {
        all_in_state(s, "p", ProcessState::Running, 1)
    })
    .await;

    h.supervisor.stop_program("p").await.unwrap();
    let snapshot = h.supervisor.get_status().await;
    assert!(all_in_state(&snapshot, "p", ProcessState::Stopped, 1));

    // no respawn may happen afterwards, autorestart=always notwithstanding
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = h.supervisor.get_status().await;
        assert!(all_in_state(&snapshot, "p", ProcessState::Stopped, 1));
        assert_eq!(snapshot["p"][0].restart_count, 0);
    }
}

#[tokio::test]
async fn reload_with_identical_file_is_a_noop() {
    let h = harness(
        r#"
programs:
  a:
    cmd: "sleep 30"
    autostart: true
    starttime: 0
"#,
    );
    h.supervisor.start_autostart().await.unwrap();
    let before = wait_for(&h.supervisor, Duration::from_secs(3), |s| {
        all_in_state(s, "a", ProcessState::Running, 1)
    })
    .await;
    let pid = before["a"][0].pid;

    h.supervisor.reload_config(&h.config_path).await.unwrap();

    let after = h.supervisor.get_status().await;
    assert!(all_in_state(&after, "a", ProcessState::Running, 1));
    assert_eq!(after["a"][0].pid, pid);
    assert!(signals::alive(pid));

    h.supervisor.stop_all().await;
}

#[tokio::test]
async fn reload_adds_program_without_touching_others() {
    let h = harness(
        r#"
programs:
  a:
    cmd: "sleep 30"
    autostart: true
    starttime: 0
"#,
    );
    h.supervisor.start_autostart().await.unwrap();
    let before = wait_for(&h.supervisor, Duration::from_secs(3), |s| {
        all_in_state(s, "a", ProcessState::Running, 1)
    })
    .await;
    let pid_a = before["a"][0].pid;

    h.rewrite_config(
        r#"
programs:
  a:
    cmd: "sleep 30"
    autostart: true
    starttime: 0
  b:
    cmd: "sleep 30"
    numprocs: 2
    autostart: true
    starttime: 0
"#,
    );
    h.supervisor.reload_config(&h.config_path).await.unwrap();

    let after = wait_for(&h.supervisor, Duration::from_secs(3), |s| {
        all_in_state(s, "b", ProcessState::Running, 2)
    })
    .await;
    assert!(all_in_state(&after, "a", ProcessState::Running, 1));
    assert_eq!(after["a"][0].pid, pid_a);

    h.supervisor.stop_all().await;
}

#[tokio::test]
async fn reload_restarts_program_whose_cmd_changed() {
    let h = harness(
        r#"
programs:
  a:
    cmd: "sleep 30"
    autostart: true
    starttime: 0
"#,
    );
    h.supervisor.start_autostart().await.unwrap();
    let before = wait_for(&h.supervisor, Duration::from_secs(3), |s| {
        all_in_state(s, "a", ProcessState::Running, 1)
    })
    .await;
    let old_pid = before["a"][0].pid;

    h.rewrite_config(
        r#"
programs:
  a:
    cmd: "sleep 31"
    autostart: true
    starttime: 0
"#,
    );
    h.supervisor.reload_config(&h.config_path).await.unwrap();

    let after = wait_for(&h.supervisor, Duration::from_secs(3), |s| {
        all_in_state(s, "a", ProcessState::Running, 1) && s["a"][0].pid != old_pid
    })
    .await;
    assert_eq!(after["a"][0].restart_count, 0);
    wait_for(&h.supervisor, Duration::from_secs(3), |_| {
        !signals::alive(old_pid)
    })
    .await;

    h.supervisor.stop_all().await;
}

#[tokio::test]
async fn reload_stops_and_drops_removed_program() {
    let h = harness(
        r#"
programs:
  a:
    cmd: "sleep 30"
    autostart: true
    starttime: 0
  b:
    cmd: "sleep 30"
    autostart: true
    starttime: 0
"#,
    );
    h.supervisor.start_autostart().await.unwrap();
    let before = wait_for(&h.supervisor, Duration::from_secs(3), |s| {
        all_in_state(s, "a", ProcessState::Running, 1)
            && all_in_state(s, "b", ProcessState::Running, 1)
    })
    .await;
    let pid_a = before["a"][0].pid;
    let pid_b = before["b"][0].pid;

    h.rewrite_config(
        r#"
programs:
  a:
    cmd: "sleep 30"
    autostart: true
    starttime: 0
"#,
    );
    h.supervisor.reload_config(&h.config_path).await.unwrap();

    let after = h.supervisor.get_status().await;
    assert!(all_in_state(&after, "a", ProcessState::Running, 1));
    assert_eq!(after["a"][0].pid, pid_a);
    assert!(after.get("b").is_none());
    wait_for(&h.supervisor, Duration::from_secs(3), |_| {
        !signals::alive(pid_b)
    })
    .await;

    h.supervisor.stop_all().await;
}

#[tokio::test]
async fn reload_config_error_leaves_table_untouched() {
    let h = harness(
        r#"
programs:
  a:
    cmd: "sleep 30"
    autostart: true
    starttime: 0
"#,
    );
    h.supervisor.start_autostart().await.unwrap();
    let before = wait_for(&h.supervisor, Duration::from_secs(3), |s| {
        all_in_state(s, "a", ProcessState::Running, 1)
    })
    .await;
    let pid = before["a"][0].pid;

    h.rewrite_config("programs:\n  a:\n    cmd: \"\"\n");
    assert!(h.supervisor.reload_config(&h.config_path).await.is_err());

    let after = h.supervisor.get_status().await;
    assert!(all_in_state(&after, "a", ProcessState::Running, 1));
    assert_eq!(after["a"][0].pid, pid);

    h.supervisor.stop_all().await;
}

#[tokio::test]
async fn dead_instances_survive_until_cleared() {
    let h = harness(
        r#"
programs:
  oneshot:
    cmd: "sleep 0"
    autorestart: never
    starttime: 0
"#,
    );
    h.supervisor.start_program("oneshot").await.unwrap();
    wait_for(&h.supervisor, Duration::from_secs(2), |s| {
        all_in_state(s, "oneshot", ProcessState::Stopped, 1)
    })
    .await;

    // dead instances are kept for status visibility until an explicit clear
    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = h.supervisor.get_status().await;
    assert!(all_in_state(&snapshot, "oneshot", ProcessState::Stopped, 1));

    h.supervisor.cleanup().await;
    let snapshot = h.supervisor.get_status().await;
    assert!(snapshot.get("oneshot").is_none());
}

#[tokio::test]
async fn cleanup_program_only_touches_its_target() {
    let h = harness(
        r#"
programs:
  dead:
    cmd: "sleep 0"
    autorestart: never
    starttime: 0
  live:
    cmd: "sleep 30"
    starttime: 0
"#,
    );
    h.supervisor.start_program("dead").await.unwrap();
    h.supervisor.start_program("live").await.unwrap();
    wait_for(&h.supervisor, Duration::from_secs(2), |s| {
        all_in_state(s, "dead", ProcessState::Stopped, 1)
            && all_in_state(s, "live", ProcessState::Running, 1)
    })
    .await;

    h.supervisor.cleanup_program("dead").await;
    let snapshot = h.supervisor.get_status().await;
    assert!(snapshot.get("dead").is_none());
    assert!(all_in_state(&snapshot, "live", ProcessState::Running, 1));

    h.supervisor.stop_all().await;
}
