//! tincd, the VPN daemon.
//!
//! Startup order matters: names are derived first, `--kill` short
//! circuits, the configuration and identity load while stderr still
//! reaches the invoking terminal, and only then does the process detach
//! and build its async runtime (forking after runtime threads exist is
//! not an option).

use clap::{ArgAction, Parser};
use std::io::Write;
use std::path::PathBuf;
use tincd::daemon::{level_filter, Daemon, DaemonState};
use tincd::dataplane::NullDataPlane;
use tincd::error::Error;
use tincd::keys::Keypair;
use tincd::{crash, pidfile, supervisor, Config, Names};

#[derive(Parser, Debug)]
#[command(name = "tincd", version)]
#[command(about = "Peer-to-peer VPN daemon")]
struct Cli {
    /// Read configuration options from FILE.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Don't fork and detach.
    #[arg(short = 'D', long = "no-detach")]
    no_detach: bool,

    /// Increase debug level.
    #[arg(short = 'd', action = ArgAction::Count)]
    debug: u8,

    /// Attempt to kill a running tincd and exit.
    #[arg(short = 'k', long = "kill")]
    kill: bool,

    /// Connect to net NETNAME.
    #[arg(short = 'n', long = "net", value_name = "NETNAME")]
    net: Option<String>,

    /// Seconds to wait before giving a timeout.
    #[arg(short = 't', long = "timeout", value_name = "SECONDS")]
    timeout: Option<u64>,
}

fn init_logging(identity: String, debug_level: u8) {
    // The builder is left wide open and the effective verbosity runs
    // through the global max level, so SET_DEBUG can change it at
    // runtime.
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"));
    builder.format(move |buf, record| {
        writeln!(buf, "{identity}[{}]: {}", record.level(), record.args())
    });
    builder.init();
    log::set_max_level(level_filter(debug_level));
}

fn main() {
    let cli = Cli::parse();
    let debug_level = cli.debug.min(5);

    let mut names = Names::for_net(cli.net.as_deref());
    if let Some(file) = &cli.config {
        names.override_config_file(file);
    }
    init_logging(names.identity.clone(), debug_level);

    if cli.kill {
        match pidfile::kill_other(&names.pid_file, names.netname.as_deref()) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }

    match run(cli, names, debug_level) {
        Ok(()) => {}
        Err(Error::AlreadyRunning(msg)) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("tincd: {e}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli, names: Names, debug_level: u8) -> tincd::Result<()> {
    let config = Config::load(&names.config_file)?;
    let keypair = Keypair::load_or_generate(&config.key_file_in(&names.config_base))?;
    let argv: Vec<String> = std::env::args().collect();

    // Returns only in the daemon process; the supervisor parent exits
    // through its signal handlers.
    let detached = !cli.no_detach;
    let (pid_file, supervisor_pid) =
        supervisor::detach(&names.pid_file, names.netname.as_deref(), detached)?;
    crash::install(&names.pid_file, &argv);

    log::info!(
        "tincd {} starting, debug level {debug_level}",
        env!("CARGO_PKG_VERSION")
    );

    let mut state = DaemonState::new(debug_level, detached, argv);
    state.supervisor_pid = supervisor_pid;
    let mut daemon = Daemon::new(
        config,
        keypair,
        names,
        Box::new(NullDataPlane::new()),
        state,
    )?;
    if let Some(seconds) = cli.timeout {
        daemon.set_timeout(seconds);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(daemon.run(pid_file))
}
