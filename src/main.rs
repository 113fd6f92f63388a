#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn, Level};

use rtkhdcp::error::Error;
use rtkhdcp::sim::{self, SimInner, SimState};
use rtkhdcp::utils::{is_valid_ksv, parse_ksv};
use rtkhdcp::worker::{self, Status};
use rtkhdcp::{ContentProtection, EngineConfig, HdcpListener, HdcpState, RevocationList, StateEvent, Timings};

#[derive(Parser)]
#[command(name = "rtkhdcp", version, disable_version_flag = true, about = "rtkhdcp CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Authenticate against a simulated sink, run link checks, then disable.
    Simulate {
        /// Sink answers on the HDCP 2.2 port.
        #[arg(long = "hdcp2", action = ArgAction::SetTrue)]
        hdcp2: bool,
        /// Sink is a repeater.
        #[arg(long = "repeater", action = ArgAction::SetTrue)]
        repeater: bool,
        /// Report an HDCP 1.4 device behind the repeater.
        #[arg(long = "hdcp1-downstream", action = ArgAction::SetTrue)]
        hdcp1_downstream: bool,
        /// Number of downstream devices behind the repeater.
        #[arg(long = "downstream", default_value = "2")]
        downstream: u8,
        /// Revocation list, one hex id per line.
        #[arg(long = "revoked")]
        revoked: Option<PathBuf>,
        #[arg(long = "support-level", default_value = "2")]
        support_level: u32,
        #[arg(long = "force-hdcp14", action = ArgAction::SetTrue)]
        force_hdcp14: bool,
        /// Link checks to observe before disabling.
        #[arg(long = "checks", default_value = "3")]
        checks: u32,
        /// Use millisecond timings instead of the protocol defaults.
        #[arg(long = "fast", action = ArgAction::SetTrue)]
        fast: bool,
    },
    /// Print the error code table.
    Codes,
    /// Validate a KSV or receiver id given as 10 hex digits.
    Ksv {
        ksv: String,
        #[arg(long = "revoked")]
        revoked: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    info!("rtkhdcp version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::Simulate {
            hdcp2,
            repeater,
            hdcp1_downstream,
            downstream,
            revoked,
            support_level,
            force_hdcp14,
            checks,
            fast,
        }) => {
            let mut sink = SimInner::default();
            sink.hdcp2 = hdcp2;
            sink.repeater = repeater;
            sink.hdcp1_downstream = hdcp1_downstream;
            sink.downstream = if repeater {
                (0..downstream).map(|i| [i, 0x11, 0x22, 0x33, 0x44]).collect()
            } else {
                Vec::new()
            };
            let config = EngineConfig {
                support_level,
                force_hdcp14,
                timings: if fast { Timings::fast() } else { Timings::default() },
            };
            run_simulate(sink, config, revoked.as_deref(), checks)
        }
        Some(Commands::Codes) => {
            run_codes();
            Ok(())
        }
        Some(Commands::Ksv { ksv, revoked }) => run_ksv(&ksv, revoked.as_deref()),
        None => Ok(()),
    }
}

fn load_revoked(path: Option<&Path>) -> anyhow::Result<RevocationList> {
    let Some(path) = path else {
        return Ok(RevocationList::new());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading revocation list {}", path.display()))?;
    let list: RevocationList = text
        .parse()
        .with_context(|| format!("parsing revocation list {}", path.display()))?;
    info!("loaded {} revoked ids from {}", list.len(), path.display());
    Ok(list)
}

/// Logs every state event in uevent form.
struct LogListener;

impl HdcpListener for LogListener {
    fn state_changed(&mut self, event: &StateEvent) {
        info!("uevent: {}", event.envp().join(" "));
    }

    fn content_protection_changed(&mut self, value: ContentProtection) {
        info!("content_protection: {value:?}");
    }
}

fn settled(status: &Status) -> bool {
    matches!(
        status.state,
        HdcpState::Hdcp1Success
            | HdcpState::Hdcp2Success
            | HdcpState::HdmiDisconnected
            | HdcpState::HdmiDisabled
    ) || (status.error.is_some() && status.value == ContentProtection::Desired)
}

fn run_simulate(
    sink: SimInner,
    config: EngineConfig,
    revoked: Option<&Path>,
    checks: u32,
) -> anyhow::Result<()> {
    let revoked = load_revoked(revoked)?;
    let state = SimState::new(sink);
    let check_period = if state.lock().hdcp2 {
        config.timings.hdcp2_check_period
    } else {
        config.timings.hdcp1_check_period
    };

    let mut engine = sim::engine(&state, config)
        .with_revocation_list(revoked)
        .with_listener(LogListener);
    engine.init().context("engine init")?;
    let handle = worker::spawn(engine).context("spawning worker")?;

    handle.commit_state(ContentProtection::Undesired, ContentProtection::Desired);

    let deadline = Instant::now() + Duration::from_secs(30);
    let status = loop {
        let Some(status) = handle.status() else {
            bail!("worker stopped");
        };
        if settled(&status) || Instant::now() > deadline {
            break status;
        }
        thread::sleep(Duration::from_millis(10));
    };

    match status.error {
        Some(e) => warn!("authentication ended in {} ({e})", status.state),
        None => info!("authentication ended in {}", status.state),
    }

    if matches!(status.state, HdcpState::Hdcp1Success | HdcpState::Hdcp2Success) {
        for n in 1..=checks {
            thread::sleep(check_period);
            match handle.check_link() {
                Ok(()) => info!("link check {n} of {checks} passed"),
                Err(e) => warn!("link check {n} of {checks} failed: {e}"),
            }
        }
    }

    if let Some(status) = handle.status() {
        print!("{}", status.hdcp_info);
        print!("{}", status.hdcp_state);
    }

    handle.disable();
    if let Some(status) = handle.status() {
        info!("after disable: {}", status.state);
    }

    let calls = state.lock().backend_calls.len();
    info!("{calls} secure back-end calls");
    drop(handle);
    Ok(())
}

fn run_codes() {
    println!("{:>4}  description", "code");
    for e in Error::ALL {
        println!("{:>4}  {e}", e.code());
    }
}

fn run_ksv(ksv: &str, revoked: Option<&Path>) -> anyhow::Result<()> {
    let revoked = load_revoked(revoked)?;
    let bytes = parse_ksv(ksv).with_context(|| format!("parsing KSV {ksv:?}"))?;
    let ones: u32 = bytes.iter().map(|b| b.count_ones()).sum();
    println!("ksv: {}", hex::encode(bytes));
    println!("ones: {ones}");
    println!("valid: {}", if is_valid_ksv(&bytes) { "yes" } else { "no" });
    println!("revoked: {}", if revoked.contains(&bytes) { "yes" } else { "no" });
    Ok(())
}
