//! End-to-end check: a capped spin loop must burn far less CPU than a free
//! one would.

use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use cpucapper::{CpuLimit, Pid};

fn spawn_spin_loop() -> Option<Child> {
    Command::new("sh")
        .arg("-c")
        .arg("while :; do :; done")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .ok()
}

#[test]
fn caps_a_spin_loop_well_below_a_full_core() {
    // no shell, nothing to measure
    let Some(mut child) = spawn_spin_loop() else {
        return;
    };
    let pid = Pid::from(child.id());

    let limit = CpuLimit::new(pid, 20).expect("target just spawned");

    // let the controller settle before measuring
    thread::sleep(Duration::from_millis(500));

    let started = Instant::now();
    let cputime_before = pid.get_cputime();
    thread::sleep(Duration::from_secs(3));
    let consumed = pid.get_cputime() - cputime_before;
    let usage = consumed.as_secs_f64() / started.elapsed().as_secs_f64();

    limit.stop();
    // give the limiter a period to resume the loop before killing it
    thread::sleep(Duration::from_millis(200));
    child.kill().ok();
    child.wait().ok();

    // a free spin loop sits at ~1.0; generous margin over the 0.2 target
    // to keep slow machines honest
    assert!(usage < 0.6, "capped loop still used {usage:.2} of a core");
    assert!(usage > 0.0, "capped loop never ran at all");
}

#[test]
fn a_raised_limit_lets_the_target_run_more() {
    let Some(mut child) = spawn_spin_loop() else {
        return;
    };
    let pid = Pid::from(child.id());

    let limit = CpuLimit::new(pid, 5).expect("target just spawned");
    thread::sleep(Duration::from_millis(700));
    let throttled = limit.cpu_usage();

    limit.set_limit(100 * cpucapper::ncpu());
    thread::sleep(Duration::from_millis(700));
    let unleashed = limit.cpu_usage();

    limit.stop();
    thread::sleep(Duration::from_millis(200));
    child.kill().ok();
    child.wait().ok();

    let throttled = throttled.expect("sampled while throttled");
    let unleashed = unleashed.expect("sampled after raising the limit");
    assert!(
        unleashed > throttled,
        "usage did not rise after lifting the limit ({throttled:.3} -> {unleashed:.3})"
    );
}
