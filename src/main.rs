//! emuctl
//!
//! Drives a running emulator through its JSON remote-control socket:
//! one-shot control commands, input injection, and scripted input
//! sequences for automated UI testing.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use emuctl::command::{decode_memory_dump, Command, RunState, DEFAULT_GAMEPAD_DEVICE};
use emuctl::config::{Endpoint, RetryPolicy};
use emuctl::sequencer::{Plan, RunReport, Sequencer, SequencerConfig};
use emuctl::session::Session;

#[derive(Parser, Debug)]
#[command(name = "emuctl")]
#[command(about = "Drive an emulator over its JSON remote-control socket")]
struct Args {
    /// Control endpoint host (default loopback, or EMUCTL_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Control endpoint port (default 4444, or EMUCTL_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Delay between connection attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    retry_delay_ms: u64,

    /// Bound each call's response wait, in milliseconds (unbounded if unset)
    #[arg(long)]
    call_timeout_ms: Option<u64>,

    /// Continue a sequence when a step fails instead of aborting
    #[arg(long)]
    keep_going: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Query whether the emulator is running or paused
    Status,

    /// Pause emulation
    Pause,

    /// Resume emulation
    Resume,

    /// Reset the virtual machine
    Reset,

    /// Capture a screenshot into the given path on the emulator side
    Screenshot { path: String },

    /// Inject a keyboard key press
    Key {
        /// Key symbol (qcode), e.g. "return" or "a"
        symbol: String,

        /// How long the key is held, in milliseconds
        #[arg(long, default_value_t = 250)]
        hold_ms: i64,
    },

    /// Tap a gamepad button (press, hold, release)
    Button {
        /// Button identifier the device understands
        button: String,

        /// Virtual input device name
        #[arg(long, default_value = DEFAULT_GAMEPAD_DEVICE)]
        device: String,

        /// How long the button is held, in milliseconds
        #[arg(long, default_value_t = 100)]
        hold_ms: u64,
    },

    /// Read guest memory and print it as hex bytes
    ReadMem {
        /// Start address (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_address)]
        addr: u64,

        /// Number of bytes to read
        len: u64,
    },

    /// Advance a boot menu: one start key, then repeated advance presses
    Menu {
        /// Seconds to wait for the emulator to reach the menu
        #[arg(long, default_value_t = 15)]
        boot_delay_secs: u64,

        /// Key that enters the menu
        #[arg(long, default_value = "return")]
        start_key: String,

        /// Key that advances through the menu
        #[arg(long, default_value = "a")]
        advance_key: String,

        /// Number of advance presses after the start key
        #[arg(long, default_value_t = 4)]
        presses: u32,

        /// Seconds between presses
        #[arg(long, default_value_t = 2)]
        step_delay_secs: u64,

        /// How long each key is held, in milliseconds
        #[arg(long, default_value_t = 250)]
        hold_ms: i64,
    },

    /// Alternate two gamepad buttons in a cyclic sequence
    Mash {
        /// First button of each cycle
        #[arg(long, default_value = "b")]
        first: String,

        /// Second button of each cycle
        #[arg(long, default_value = "a")]
        second: String,

        /// Virtual input device name
        #[arg(long, default_value = DEFAULT_GAMEPAD_DEVICE)]
        device: String,

        /// Seconds between the two buttons of a cycle
        #[arg(long, default_value_t = 1)]
        inner_delay_secs: u64,

        /// Seconds between cycles
        #[arg(long, default_value_t = 20)]
        interval_secs: u64,

        /// How long each button is held, in milliseconds
        #[arg(long, default_value_t = 100)]
        hold_ms: u64,

        /// Stop after this many cycles (runs until Ctrl-C if unset)
        #[arg(long)]
        cycles: Option<u64>,

        /// Seconds to wait for the start confirmation
        #[arg(long, default_value_t = 30)]
        confirm_timeout_secs: u64,

        /// Skip the start confirmation
        #[arg(long)]
        yes: bool,
    },
}

fn parse_address(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("invalid hex address: {e}"))
    } else {
        s.parse().map_err(|e| format!("invalid address: {e}"))
    }
}

/// Append a press-hold-release tap of one button to a plan.
fn tap(plan: Plan, device: &str, button: &str, hold: Duration) -> Result<Plan> {
    Ok(plan
        .then_call(Command::button_event(device, button, true)?)
        .then_wait(hold)
        .then_call(Command::button_event(device, button, false)?))
}

/// Fail the process when a continued-on-error run recorded failures.
fn check_report(report: &RunReport) -> Result<()> {
    if report.cancelled {
        info!("Sequence cancelled by operator");
        return Ok(());
    }
    if report.stopped {
        info!(executed = report.executed, "Sequence stopped");
    }
    if report.has_failures() {
        for failure in &report.failures {
            warn!(
                cycle = failure.cycle,
                step = failure.step,
                error = %failure.error,
                "Step failed"
            );
        }
        bail!(
            "{} step(s) failed across {} executed",
            report.failures.len(),
            report.executed
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for query results)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut endpoint = Endpoint::from_env();
    if let Some(host) = args.host.clone() {
        endpoint.host = host;
    }
    if let Some(port) = args.port {
        endpoint.port = port;
    }
    let retry = RetryPolicy::new(
        args.max_attempts,
        Duration::from_millis(args.retry_delay_ms),
    );

    let mut session = Session::connect(&endpoint, &retry)
        .await
        .with_context(|| format!("failed to reach the control endpoint at {endpoint}"))?;
    if let Some(ms) = args.call_timeout_ms {
        session.set_call_timeout(Some(Duration::from_millis(ms)));
    }

    let sequencer_config = SequencerConfig {
        abort_on_error: !args.keep_going,
        ..SequencerConfig::default()
    };

    let result = run_action(&args, &mut session, sequencer_config).await;
    session.close().await;
    result
}

async fn run_action(
    args: &Args,
    session: &mut Session,
    sequencer_config: SequencerConfig,
) -> Result<()> {
    match &args.action {
        Action::Status => {
            let value = session.call(&Command::status()).await?.into_result()?;
            let state = RunState::from_return(&value)?;
            match state {
                RunState::Running => println!("running"),
                RunState::Paused => println!("paused"),
                RunState::Other(s) => println!("{s}"),
            }
        }

        Action::Pause => {
            session.call(&Command::pause()).await?.into_result()?;
            info!("Emulation paused");
        }

        Action::Resume => {
            session.call(&Command::resume()).await?.into_result()?;
            info!("Emulation resumed");
        }

        Action::Reset => {
            session.call(&Command::reset()).await?.into_result()?;
            info!("Machine reset");
        }

        Action::Screenshot { path } => {
            session
                .call(&Command::screenshot(path)?)
                .await?
                .into_result()?;
            info!(path = %path, "Screenshot requested");
        }

        Action::Key { symbol, hold_ms } => {
            session
                .call(&Command::send_key(symbol, *hold_ms)?)
                .await?
                .into_result()?;
            info!(key = %symbol, hold_ms, "Key injected");
        }

        Action::Button {
            button,
            device,
            hold_ms,
        } => {
            let plan = tap(
                Plan::new("button-tap"),
                device,
                button,
                Duration::from_millis(*hold_ms),
            )?;
            let mut sequencer = Sequencer::new(sequencer_config);
            let report = sequencer.run(session, &plan).await?;
            check_report(&report)?;
            info!(button = %button, device = %device, "Button tapped");
        }

        Action::ReadMem { addr, len } => {
            let value = session
                .call(&Command::read_memory(*addr, *len)?)
                .await?
                .into_result()?;
            let text = value.as_str().with_context(|| {
                format!("memory dump reply is not text: {value}")
            })?;
            let bytes = decode_memory_dump(text)?;
            let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
            println!("{}", hex.join(" "));
        }

        Action::Menu {
            boot_delay_secs,
            start_key,
            advance_key,
            presses,
            step_delay_secs,
            hold_ms,
        } => {
            let mut plan = Plan::new("menu-advance")
                .then_wait(Duration::from_secs(*boot_delay_secs))
                .then_call(Command::send_key(start_key, *hold_ms)?);
            for _ in 0..*presses {
                plan = plan
                    .then_wait(Duration::from_secs(*step_delay_secs))
                    .then_call(Command::send_key(advance_key, *hold_ms)?);
            }

            let mut sequencer = Sequencer::new(sequencer_config);
            let report = sequencer.run(session, &plan).await?;
            check_report(&report)?;
            info!(presses, "Menu sequence finished");
        }

        Action::Mash {
            first,
            second,
            device,
            inner_delay_secs,
            interval_secs,
            hold_ms,
            cycles,
            confirm_timeout_secs,
            yes,
        } => {
            let hold = Duration::from_millis(*hold_ms);
            let mut cycle_plan = Plan::new("button-mash");
            cycle_plan = tap(cycle_plan, device, first, hold)?;
            cycle_plan = cycle_plan.then_wait(Duration::from_secs(*inner_delay_secs));
            cycle_plan = tap(cycle_plan, device, second, hold)?;
            cycle_plan = cycle_plan.then_wait(Duration::from_secs(*interval_secs));

            let mut sequencer = Sequencer::new(sequencer_config);

            // Ctrl-C requests a cooperative stop; the current step still
            // completes before the run ends.
            let stop = sequencer.stop_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Stop requested, finishing the current step");
                    stop.request_stop();
                }
            });

            if !yes {
                let gate = Plan::new("start-confirmation")
                    .then_confirm(Duration::from_secs(*confirm_timeout_secs));
                let report = sequencer.run(session, &gate).await?;
                if report.cancelled {
                    info!("Sequence cancelled by operator");
                    return Ok(());
                }
            }

            let report = sequencer.run_cycles(session, &cycle_plan, *cycles).await?;
            check_report(&report)?;
        }
    }

    Ok(())
}
