//! Time-driven automation sequencer.
//!
//! Executes an ordered plan of commands and waits against one session,
//! optionally gated by a timed interactive confirmation and optionally
//! repeated as a cyclic sequence. Stopping is cooperative: the stop flag
//! is checked between steps, never mid-step, so a running wait or call
//! always completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::session::Session;

/// One step of a sequence plan.
#[derive(Debug, Clone)]
pub enum Step {
    /// Issue a command and read its response.
    Call(Command),
    /// Block for a fixed duration.
    Wait(Duration),
    /// Ask the operator to proceed, auto-proceeding after the timeout.
    Confirm { timeout: Duration },
}

/// An ordered script of commands and waits, created once per run.
#[derive(Debug, Clone)]
pub struct Plan {
    name: String,
    steps: Vec<Step>,
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn then_call(mut self, command: Command) -> Self {
        self.steps.push(Step::Call(command));
        self
    }

    pub fn then_wait(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Wait(duration));
        self
    }

    pub fn then_confirm(mut self, timeout: Duration) -> Self {
        self.steps.push(Step::Confirm { timeout });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Sequencer behavior knobs.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Abort the plan on the first failed call instead of continuing.
    pub abort_on_error: bool,

    /// Log a per-second countdown during waits of two seconds or more.
    pub countdown: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            abort_on_error: true,
            countdown: true,
        }
    }
}

/// Cooperative stop signal, checked between steps and between cycles.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Outcome of one confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Proceed,
    Cancel,
}

/// Source of interactive confirmation replies.
///
/// The prompt resolves at most once per invocation; the sequencer races
/// it against the timeout, so implementations must not require polling.
#[async_trait]
pub trait ConfirmationSource: Send {
    /// Wait for one raw reply, or `None` if the input is closed.
    async fn read_reply(&mut self) -> Option<String>;
}

/// Reads confirmation replies from the process's stdin.
#[derive(Debug, Default)]
pub struct StdinConfirmation;

#[async_trait]
impl ConfirmationSource for StdinConfirmation {
    async fn read_reply(&mut self) -> Option<String> {
        // Stdin has no async handle; park the read on the blocking pool.
        // If the timeout wins the race, the orphaned read simply resolves
        // into a dropped channel, like the original's daemon input thread.
        tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line),
            }
        })
        .await
        .ok()
        .flatten()
    }
}

/// A recorded step failure.
#[derive(Debug)]
pub struct StepFailure {
    /// Cycle the failure happened in (0 for a single-pass run).
    pub cycle: u64,
    /// Zero-based step index within the plan.
    pub step: usize,
    pub error: Error,
}

/// What happened over one `run` or `run_cycles` invocation.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Steps that ran to completion (including failed calls in
    /// continue-on-error mode).
    pub executed: usize,
    pub failures: Vec<StepFailure>,
    /// The operator answered the confirmation prompt with a cancel.
    pub cancelled: bool,
    /// The cooperative stop flag ended the run early.
    pub stopped: bool,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Drives plans against a session, one step at a time.
pub struct Sequencer<C = StdinConfirmation> {
    config: SequencerConfig,
    confirm: C,
    stop: StopFlag,
}

impl Sequencer<StdinConfirmation> {
    pub fn new(config: SequencerConfig) -> Self {
        Self::with_confirmation(config, StdinConfirmation)
    }
}

impl<C: ConfirmationSource> Sequencer<C> {
    pub fn with_confirmation(config: SequencerConfig, confirm: C) -> Self {
        Self {
            config,
            confirm,
            stop: StopFlag::new(),
        }
    }

    /// Handle for requesting a cooperative stop from elsewhere (e.g. a
    /// Ctrl-C handler).
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Execute the plan once.
    ///
    /// A failed call is recorded; with `abort_on_error` the session is
    /// closed best-effort and the run surfaces [`Error::SequenceAborted`],
    /// otherwise execution continues with the next step.
    pub async fn run<S>(&mut self, session: &mut Session<S>, plan: &Plan) -> Result<RunReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut report = RunReport::default();
        info!(plan = plan.name(), steps = plan.len(), "Starting plan");
        self.run_once(session, plan, 0, &mut report).await?;
        Ok(report)
    }

    /// Execute the plan repeatedly, `limit` times or until stopped.
    ///
    /// Used for repeated input patterns (e.g. alternating two button
    /// presses with an inter-cycle delay). The stop flag is honored
    /// between steps and between cycles only.
    pub async fn run_cycles<S>(
        &mut self,
        session: &mut Session<S>,
        plan: &Plan,
        limit: Option<u64>,
    ) -> Result<RunReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut report = RunReport::default();
        let mut cycle = 0u64;
        loop {
            if let Some(limit) = limit {
                if cycle >= limit {
                    break;
                }
            }
            if self.stop.is_set() {
                report.stopped = true;
                break;
            }
            info!(plan = plan.name(), cycle, "Starting cycle");
            self.run_once(session, plan, cycle, &mut report).await?;
            if report.cancelled || report.stopped {
                break;
            }
            cycle += 1;
        }
        info!(
            plan = plan.name(),
            cycles = cycle,
            failures = report.failures.len(),
            "Cyclic sequence finished"
        );
        Ok(report)
    }

    async fn run_once<S>(
        &mut self,
        session: &mut Session<S>,
        plan: &Plan,
        cycle: u64,
        report: &mut RunReport,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for (index, step) in plan.steps.iter().enumerate() {
            if self.stop.is_set() {
                info!(plan = plan.name(), step = index, "Stop requested, ending run");
                report.stopped = true;
                return Ok(());
            }
            match step {
                Step::Call(command) => {
                    let outcome = session
                        .call(command)
                        .await
                        .and_then(crate::command::Response::into_result);
                    match outcome {
                        Ok(value) => {
                            debug!(step = index, command = command.name(), ?value, "Step ok");
                        }
                        Err(error) => {
                            warn!(
                                step = index,
                                command = command.name(),
                                error = %error,
                                "Step failed"
                            );
                            if self.config.abort_on_error {
                                report.executed += 1;
                                session.close().await;
                                return Err(Error::SequenceAborted {
                                    step: index,
                                    source: Box::new(error),
                                });
                            }
                            report.failures.push(StepFailure {
                                cycle,
                                step: index,
                                error,
                            });
                        }
                    }
                }
                Step::Wait(duration) => self.wait(*duration).await,
                Step::Confirm { timeout } => {
                    if self.await_confirmation(*timeout).await == Confirmation::Cancel {
                        info!(plan = plan.name(), step = index, "Cancelled by operator");
                        report.executed += 1;
                        report.cancelled = true;
                        return Ok(());
                    }
                }
            }
            report.executed += 1;
        }
        Ok(())
    }

    /// Block for the duration, logging a visible countdown for long waits.
    async fn wait(&self, duration: Duration) {
        if !self.config.countdown || duration < Duration::from_secs(2) {
            tokio::time::sleep(duration).await;
            return;
        }
        let mut remaining = duration;
        while remaining >= Duration::from_secs(1) {
            info!(remaining_secs = remaining.as_secs(), "Waiting");
            tokio::time::sleep(Duration::from_secs(1)).await;
            remaining -= Duration::from_secs(1);
        }
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
    }

    /// Ask for confirmation, racing the reply against the timeout.
    ///
    /// Exactly one outcome happens per invocation: an explicit proceed or
    /// cancel, or a timeout treated as implicit proceed. Unrecognized
    /// replies proceed with a warning rather than re-asking.
    async fn await_confirmation(&mut self, timeout: Duration) -> Confirmation {
        info!(
            timeout_secs = timeout.as_secs(),
            "Proceed? [y/n] (auto-proceeds on timeout)"
        );
        match tokio::time::timeout(timeout, self.confirm.read_reply()).await {
            Err(_) => {
                info!("No reply before timeout, proceeding");
                Confirmation::Proceed
            }
            Ok(None) => {
                warn!("Confirmation input closed, proceeding");
                Confirmation::Proceed
            }
            Ok(Some(reply)) => match reply.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => Confirmation::Proceed,
                "n" | "no" => Confirmation::Cancel,
                other => {
                    warn!(reply = other, "Unrecognized reply, proceeding");
                    Confirmation::Proceed
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::transport::FramedTransport;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const GREETING: &str =
        r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 7, "major": 2}}, "capabilities": []}}"#;

    /// Scripted peer: greeting, handshake, then one canned reply per
    /// received command.
    async fn scripted_session(replies: Vec<&'static str>) -> Session<DuplexStream> {
        let (client, peer) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(peer);
            let mut lines = BufReader::new(read_half).lines();
            write_half
                .write_all(format!("{GREETING}\n").as_bytes())
                .await
                .unwrap();
            let _ = lines.next_line().await.unwrap();
            write_half.write_all(b"{\"return\": {}}\n").await.unwrap();
            for reply in replies {
                if lines.next_line().await.unwrap().is_none() {
                    return;
                }
                write_half
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });
        Session::establish(FramedTransport::new(client), Endpoint::default())
            .await
            .unwrap()
    }

    /// Confirmation source that replies instantly from a script.
    struct ScriptedConfirmation(Option<&'static str>);

    #[async_trait]
    impl ConfirmationSource for ScriptedConfirmation {
        async fn read_reply(&mut self) -> Option<String> {
            match self.0 {
                Some(reply) => Some(reply.to_string()),
                // No reply ever: lets the timeout win the race.
                None => std::future::pending().await,
            }
        }
    }

    fn three_calls() -> Plan {
        Plan::new("test")
            .then_call(Command::pause())
            .then_call(Command::status())
            .then_call(Command::resume())
    }

    const OK: &str = r#"{"return": {}}"#;
    const FAIL: &str = r#"{"error": {"class": "GenericError", "desc": "nope"}}"#;

    #[tokio::test]
    async fn abort_on_error_stops_at_the_failing_step() {
        let mut session = scripted_session(vec![OK, FAIL, OK]).await;
        let mut sequencer = Sequencer::new(SequencerConfig::default());

        let err = sequencer
            .run(&mut session, &three_calls())
            .await
            .unwrap_err();
        match err {
            Error::SequenceAborted { step, source } => {
                assert_eq!(step, 1);
                assert!(matches!(*source, Error::CommandFailed { .. }));
            }
            other => panic!("expected SequenceAborted, got {other:?}"),
        }
        // Abort closed the session best-effort.
        assert_eq!(session.state(), crate::session::SessionState::Closed);
    }

    #[tokio::test]
    async fn continue_on_error_runs_all_steps() {
        let mut session = scripted_session(vec![OK, FAIL, OK]).await;
        let config = SequencerConfig {
            abort_on_error: false,
            ..SequencerConfig::default()
        };
        let mut sequencer = Sequencer::new(config);

        let report = sequencer.run(&mut session, &three_calls()).await.unwrap();
        assert_eq!(report.executed, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, 1);
        assert!(matches!(
            report.failures[0].error,
            Error::CommandFailed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_calls_complete() {
        let mut session = scripted_session(vec![OK, OK]).await;
        let plan = Plan::new("waits")
            .then_call(Command::pause())
            .then_wait(Duration::from_secs(5))
            .then_call(Command::resume());
        let mut sequencer = Sequencer::new(SequencerConfig::default());

        let report = sequencer.run(&mut session, &plan).await.unwrap();
        assert_eq!(report.executed, 3);
        assert!(!report.has_failures());
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_timeout_proceeds() {
        let mut session = scripted_session(vec![OK]).await;
        let plan = Plan::new("gated")
            .then_confirm(Duration::from_secs(30))
            .then_call(Command::pause());
        let mut sequencer = Sequencer::with_confirmation(
            SequencerConfig::default(),
            ScriptedConfirmation(None),
        );

        let report = sequencer.run(&mut session, &plan).await.unwrap();
        assert_eq!(report.executed, 2);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn explicit_cancel_skips_remaining_steps() {
        let mut session = scripted_session(vec![]).await;
        let plan = Plan::new("gated")
            .then_confirm(Duration::from_secs(30))
            .then_call(Command::pause());
        let mut sequencer = Sequencer::with_confirmation(
            SequencerConfig::default(),
            ScriptedConfirmation(Some("n")),
        );

        let report = sequencer.run(&mut session, &plan).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.executed, 1);
        assert!(!report.has_failures());
    }

    #[tokio::test]
    async fn unrecognized_reply_proceeds() {
        let mut session = scripted_session(vec![OK]).await;
        let plan = Plan::new("gated")
            .then_confirm(Duration::from_secs(30))
            .then_call(Command::pause());
        let mut sequencer = Sequencer::with_confirmation(
            SequencerConfig::default(),
            ScriptedConfirmation(Some("maybe?")),
        );

        let report = sequencer.run(&mut session, &plan).await.unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.executed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_cycles_run_the_plan_repeatedly() {
        let mut session = scripted_session(vec![OK, OK, OK, OK]).await;
        let plan = Plan::new("cycle")
            .then_call(Command::pause())
            .then_wait(Duration::from_secs(1))
            .then_call(Command::resume());
        let mut sequencer = Sequencer::new(SequencerConfig::default());

        let report = sequencer
            .run_cycles(&mut session, &plan, Some(2))
            .await
            .unwrap();
        assert_eq!(report.executed, 6);
        assert!(!report.has_failures());
    }

    #[tokio::test]
    async fn stop_flag_ends_the_run_between_steps() {
        let mut session = scripted_session(vec![]).await;
        let plan = three_calls();
        let mut sequencer = Sequencer::new(SequencerConfig::default());

        sequencer.stop_flag().request_stop();
        let report = sequencer.run(&mut session, &plan).await.unwrap();
        assert!(report.stopped);
        assert_eq!(report.executed, 0);

        let report = sequencer
            .run_cycles(&mut session, &plan, None)
            .await
            .unwrap();
        assert!(report.stopped);
        assert_eq!(report.executed, 0);
    }
}
