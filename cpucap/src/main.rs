//! Limit the CPU usage of a process.
//!
//! # Usage
//!
//! Limit process `4562` to 10%:
//!
//! ```console
//! cpucap --pid 4562 --limit 10
//! ```
//!
//! Run a build capped at 50% of the machine, children included:
//!
//! ```console
//! cpucap --limit 50 --include-children -- make -j4
//! ```
//!
//! While running, `SIGUSR1` raises the limit by one percent and `SIGUSR2`
//! lowers it. Run `cpucap --help` to list all the available options.

use std::ffi::OsString;
use std::process::{self, Command};
use std::thread;
use std::time::Duration;

use clap::Parser;
use parking_lot::RwLock;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cpucapper::{
    find_by_name, find_by_pid, ncpu, pid_max, run, Candidate, ChildrenMode, Controls, Error, Pid,
    ProcessGroup,
};

/// Interval between target searches when not in lazy mode.
const SEARCH_INTERVAL: Duration = Duration::from_secs(2);

/// The strongest nice value worth probing for.
const MAX_PRIORITY: libc::c_int = -20;

#[derive(Parser, Debug)]
#[command(version, about = "Limit the CPU usage of a process")]
struct Args {
    /// Percentage of CPU allowed, from 0 up to 100 times the CPU count
    #[arg(short, long, value_name = "N")]
    limit: u32,

    /// Show control statistics
    #[arg(short, long)]
    verbose: bool,

    /// Exit if there is no target process, or when it dies
    #[arg(short = 'z', long)]
    lazy: bool,

    /// Limit the children of the target process too
    #[arg(short, long)]
    include_children: bool,

    /// PID of the target process (implies --lazy)
    #[arg(short, long, value_name = "N")]
    pid: Option<u32>,

    /// Name or path of the executable program file
    #[arg(short, long, value_name = "FILE")]
    exe: Option<String>,

    /// Command to run and limit (implies --lazy)
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

/// Shared with the signal handlers, which only ever touch its atomics.
static CONTROLS: Controls = Controls::new();

extern "C" fn handle_signal(signal: libc::c_int) {
    match signal {
        libc::SIGINT | libc::SIGTERM => CONTROLS.request_stop(),
        libc::SIGUSR1 => CONTROLS.raise(),
        libc::SIGUSR2 => CONTROLS.lower(),
        _ => {}
    }
}

fn install_signal_handlers() {
    // SAFETY: the handler body is restricted to the async-signal-safe
    // Controls atomics; the zeroed sigaction is a valid representation.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGUSR1, libc::SIGUSR2] {
            libc::sigaction(signal, &action, std::ptr::null_mut());
        }
    }
}

/// Probes downwards from the strongest nice value until one sticks, so the
/// limiter keeps scheduling ahead of the processes it stops.
fn increase_priority() {
    // SAFETY: get/setpriority on our own process with in-range values.
    unsafe {
        let old_priority = libc::getpriority(libc::PRIO_PROCESS as _, 0);
        libc::setpriority(libc::PRIO_PROCESS as _, 0, MAX_PRIORITY);
        let mut priority = libc::getpriority(libc::PRIO_PROCESS as _, 0);
        while priority > MAX_PRIORITY
            && libc::setpriority(libc::PRIO_PROCESS as _, 0, priority - 1) == 0
        {
            priority -= 1;
        }

        if priority != old_priority {
            debug!(priority, "priority changed");
        } else if priority > MAX_PRIORITY {
            debug!("cannot raise priority, run as root or renice for best results");
        }
    }
}

/// Iteration setup failures are not recoverable: procfs unmounted, kvm
/// denied.
fn fatal_setup(err: Error) -> ! {
    eprintln!("{err}\nAborting");
    process::exit(2);
}

/// Builds the process group for `pid` and drives the control loop on it
/// until the group dies or a stop is requested.
fn limit_target(pid: Pid, include_children: bool) {
    let children_mode = if include_children {
        ChildrenMode::Include
    } else {
        ChildrenMode::Exclude
    };

    let group = match ProcessGroup::new(pid, children_mode) {
        Ok(group) => group,
        Err(Error::DeadTarget) => return,
        Err(err) => fatal_setup(err),
    };
    debug!(target_pid = %pid, members = group.len(), "process group built");

    let group = RwLock::new(group);
    if let Err(err) = run(&group, &CONTROLS) {
        fatal_setup(err);
    }
}

/// Spawns the command and limits it until it terminates, then forwards its
/// exit status.
fn run_command(command: &[OsString], include_children: bool) -> i32 {
    let (program, args) = command.split_first().expect("command checked non-empty");

    let mut child = match Command::new(program).args(args).spawn() {
        Ok(child) => child,
        Err(err) => {
            eprintln!("Error: couldn't run {}: {err}", program.to_string_lossy());
            return 2;
        }
    };
    let pid = Pid::from(child.id());
    debug!(%pid, "limiting spawned command");

    limit_target(pid, include_children);

    match child.wait() {
        Ok(status) => match status.code() {
            Some(code) => {
                debug!(%pid, code, "process terminated");
                code
            }
            None => {
                eprintln!("Process {pid} terminated abnormally");
                1
            }
        },
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}

/// The search loop of the PID and executable-name modes: find the target,
/// limit it, and in non-lazy mode keep looking for a reincarnation.
fn search_and_limit(args: &Args, lazy: bool) -> i32 {
    let own_pid = Pid::from(process::id());

    while !CONTROLS.should_stop() {
        let candidate = if let Some(pid) = args.pid {
            find_by_pid(Pid::from(pid))
        } else {
            let exe = args.exe.as_deref().expect("target checked");
            match find_by_name(exe) {
                Ok(candidate) => candidate,
                Err(err) => fatal_setup(err),
            }
        };

        match candidate {
            Candidate::Found(pid) if pid == own_pid => {
                eprintln!(
                    "Target process {pid} is cpucap itself! Aborting because it makes no sense"
                );
                return 1;
            }
            Candidate::Found(pid) => {
                println!("Process {pid} found");
                limit_target(pid, args.include_children);
            }
            Candidate::Forbidden(_) => {
                println!("Process found but you aren't allowed to control it");
            }
            Candidate::NotFound => println!("No process found"),
        }

        if lazy || CONTROLS.should_stop() {
            break;
        }
        thread::sleep(SEARCH_INTERVAL);
    }

    0
}

fn run_cli() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // clap would exit 2; argument errors here are exit 1
            let _ = err.print();
            return 1;
        }
    };

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let max_percent = 100 * ncpu();
    if args.limit > max_percent {
        eprintln!("Error: limit must be in the range 0-{max_percent}");
        return 1;
    }

    let command_mode = !args.command.is_empty();
    let targets =
        usize::from(args.pid.is_some()) + usize::from(args.exe.is_some()) + usize::from(command_mode);
    if targets == 0 {
        eprintln!("Error: You must specify one target process, either by name, pid, or command line");
        return 1;
    }
    if targets > 1 {
        eprintln!(
            "Error: You must specify exactly one target process, either by name, pid, or command line"
        );
        return 1;
    }

    if let Some(pid) = args.pid {
        if pid <= 1 || pid >= pid_max() {
            eprintln!("Error: Invalid value for argument PID");
            return 1;
        }
    }
    // a one-shot target leaves nothing to wait for once it dies
    let lazy = args.lazy || args.pid.is_some() || command_mode;

    CONTROLS.set_max_percent(max_percent as i32);
    CONTROLS.set_percent(args.limit as i32);
    install_signal_handlers();
    increase_priority();
    debug!(ncpu = ncpu(), limit = args.limit, "starting");

    if command_mode {
        return run_command(&args.command, args.include_children);
    }
    search_and_limit(&args, lazy)
}

fn main() {
    process::exit(run_cli());
}
