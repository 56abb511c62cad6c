//! CLI front end for `uxe`: a positional ELF path plus forwarded guest
//! `argv`, hand-rolled flag parsing (no argument-parsing crate pulled in
//! for a tool this small), and `env_logger`-backed category/level logging.

use std::process::ExitCode;

const USAGE: &str = "\
usage: uxe [options] <program> [args...]

options:
  -v<category>              enable trace logging for a category (asm, jit, jix, mem, sig, thr, sys)
  --log=<category>=<level>  set a category's log level explicitly
  -s, --statistics          print counters on exit
  -C, --chroot=<dir>        push an overlay root (chroot-like file redirection)
  -h, --help                print this message
  -V, --version             print the version
";

struct Config {
    program: String,
    program_args: Vec<String>,
    statistics: bool,
    overlays: Vec<String>,
    jitless: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Config, String> {
    let _argv0 = args.next();
    let mut overlays = Vec::new();
    let mut statistics = false;
    let mut jitless = false;
    let mut rest: Vec<String> = Vec::new();

    for arg in &mut args {
        if arg == "-h" || arg == "--help" {
            print!("{USAGE}");
            std::process::exit(0);
        } else if arg == "-V" || arg == "--version" {
            println!("uxe {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        } else if arg == "-s" || arg == "--statistics" {
            statistics = true;
        } else if arg == "--jitless" {
            jitless = true;
        } else if let Some(cat) = arg.strip_prefix("-v") {
            std::env::set_var("RUST_LOG", format!("{},uxe::{}=trace", std::env::var("RUST_LOG").unwrap_or_default(), cat));
        } else if let Some(spec) = arg.strip_prefix("--log=") {
            if let Some((cat, level)) = spec.split_once('=') {
                std::env::set_var("RUST_LOG", format!("{},uxe::{}={}", std::env::var("RUST_LOG").unwrap_or_default(), cat, level));
            }
        } else if let Some(dir) = arg.strip_prefix("--chroot=") {
            overlays.push(dir.to_string());
        } else if arg == "-C" {
            let dir = args.next().ok_or("-C requires a directory argument")?;
            overlays.push(dir);
        } else {
            rest.push(arg);
            rest.extend(args);
            break;
        }
    }

    if rest.is_empty() {
        return Err("missing <program>".to_string());
    }
    let program = rest.remove(0);
    Ok(Config { program, program_args: rest, statistics, overlays, jitless })
}

fn guest_argv(cfg: &Config) -> Vec<String> {
    let mut v = vec![cfg.program.clone()];
    v.extend(cfg.program_args.iter().cloned());
    v
}

fn guest_envp() -> Vec<String> {
    let overlay = std::env::var("UXE_OVERLAY").unwrap_or_else(|_| ":o".to_string());
    let mut envp: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    envp.push(format!("UXE_OVERLAY={overlay}"));
    envp
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cfg = match parse_args(std::env::args()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("uxe: {e}");
            eprint!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    for dir in &cfg.overlays {
        log::debug!("[cfg] overlay root pushed: {dir}");
    }

    let ctrlc_flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let flag = ctrlc_flag.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }) {
            log::warn!("[cfg] failed to install Ctrl-C handler: {e}");
        }
    }

    let argv = guest_argv(&cfg);
    let envp = guest_envp();

    match uxe::run_guest(&cfg.program, &argv, &envp, cfg.jitless, Some(ctrlc_flag)) {
        Ok((fault, system)) => {
            if cfg.statistics {
                eprint!("{}", system.stats.report());
            }
            match fault {
                uxe::GuestFault::Exit(code) => ExitCode::from((code & 0xff) as u8),
                uxe::GuestFault::Halt => ExitCode::SUCCESS,
                other => {
                    eprintln!("uxe: guest terminated: {other:?}");
                    ExitCode::from(1)
                }
            }
        }
        Err(e) => {
            eprintln!("uxe: {e}");
            ExitCode::from(1)
        }
    }
}
