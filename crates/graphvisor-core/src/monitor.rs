//! Rule-driven interpretation of a supervised process's output.
//!
//! The monitor reads merged output one line at a time and checks every
//! non-empty line against an ordered rule table. The first rule whose
//! substring occurs in the line decides the outcome; later rules and later
//! output are never looked at. The optional idle timeout is measured from the
//! last non-empty line, so blank lines do not keep a silent process alive.

use crate::echo::EchoSink;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which terminal outcome a rule produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

/// The marker that fired and the line it fired on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub marker: String,
    pub line: String,
}

pub type SideEffect = Arc<dyn Fn(&RuleMatch) + Send + Sync>;

/// Substring-to-outcome mapping evaluated against each output line
#[derive(Clone)]
pub struct TriggerRule {
    substring: String,
    verdict: Verdict,
    kill: bool,
    side_effect: Option<SideEffect>,
}

impl fmt::Debug for TriggerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRule")
            .field("substring", &self.substring)
            .field("verdict", &self.verdict)
            .field("kill", &self.kill)
            .field("side_effect", &self.side_effect.is_some())
            .finish()
    }
}

impl TriggerRule {
    pub fn new(substring: impl Into<String>, verdict: Verdict) -> Self {
        Self {
            substring: substring.into(),
            verdict,
            kill: false,
            side_effect: None,
        }
    }

    pub fn success(substring: impl Into<String>) -> Self {
        Self::new(substring, Verdict::Success)
    }

    pub fn failure(substring: impl Into<String>) -> Self {
        Self::new(substring, Verdict::Failure)
    }

    /// Kill the process once this rule fires
    pub fn killing(mut self) -> Self {
        self.kill = true;
        self
    }

    pub fn with_side_effect(mut self, effect: impl Fn(&RuleMatch) + Send + Sync + 'static) -> Self {
        self.side_effect = Some(Arc::new(effect));
        self
    }

    pub fn substring(&self) -> &str {
        &self.substring
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn kills(&self) -> bool {
        self.kill
    }

    pub fn matches(&self, line: &str) -> bool {
        line.contains(self.substring.as_str())
    }
}

/// First rule, in list order, that matches the line
pub fn first_match<'a>(rules: &'a [TriggerRule], line: &str) -> Option<&'a TriggerRule> {
    rules.iter().find(|rule| rule.matches(line))
}

/// Terminal result of one monitoring run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(RuleMatch),
    Failure(RuleMatch),
    /// No non-empty line for the configured idle period; the process was killed
    TimedOut(Duration),
    /// Output closed before any rule fired; carries the exit code when known
    Exited(Option<i32>),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Why a non-successful outcome failed
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(m) => Some(FailureReason::Marker {
                marker: m.marker.clone(),
                line: m.line.clone(),
            }),
            Outcome::TimedOut(idle) => Some(FailureReason::TimedOut(*idle)),
            Outcome::Exited(code) => Some(FailureReason::Exited(*code)),
        }
    }
}

/// Diagnosis attached to build and start failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Marker { marker: String, line: String },
    TimedOut(Duration),
    Exited(Option<i32>),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Marker { marker, line } => {
                write!(f, "matched \"{marker}\" in \"{line}\"")
            }
            FailureReason::TimedOut(idle) => write!(f, "no output for {}s", idle.as_secs_f64()),
            FailureReason::Exited(Some(code)) => {
                write!(f, "process exited with code {code} without a matching marker")
            }
            FailureReason::Exited(None) => f.write_str("process exited without a matching marker"),
        }
    }
}

/// Output of a supervised process as seen by the monitor
#[async_trait]
pub trait MonitoredOutput: Send {
    /// Next line of merged output; `None` once the stream is closed
    async fn next_line(&mut self) -> Option<String>;

    /// Issue an immediate kill of the process
    async fn kill(&mut self) -> Result<()>;

    /// Exit code once the output has closed; `None` if unknown or killed by a signal
    async fn exit_code(&mut self) -> Option<i32> {
        None
    }
}

/// Runs a rule table against one process's output
#[derive(Debug, Clone)]
pub struct LogMonitor {
    rules: Vec<TriggerRule>,
    echo: Option<EchoSink>,
    idle_timeout: Option<Duration>,
    kill_grace: Duration,
}

impl LogMonitor {
    pub fn new(rules: Vec<TriggerRule>) -> Self {
        Self {
            rules,
            echo: None,
            idle_timeout: None,
            kill_grace: crate::config::DEFAULT_KILL_GRACE,
        }
    }

    pub fn echo(mut self, sink: Option<EchoSink>) -> Self {
        self.echo = sink;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    pub async fn run<P: MonitoredOutput + ?Sized>(&self, process: &mut P) -> Outcome {
        let mut last_activity = Instant::now();

        loop {
            let next = match self.idle_timeout {
                Some(idle) => {
                    match tokio::time::timeout_at(last_activity + idle, process.next_line()).await {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(
                                "Killing process; no stdout/stderr activity in last {}s",
                                idle.as_secs_f64()
                            );
                            if let Err(e) = process.kill().await {
                                warn!("Kill after idle timeout failed: {e:#}");
                            }
                            return Outcome::TimedOut(idle);
                        }
                    }
                }
                None => process.next_line().await,
            };

            let Some(raw) = next else {
                let code = process.exit_code().await;
                debug!(?code, "Output closed without a matching rule");
                return Outcome::Exited(code);
            };

            let line = raw.trim_end();
            if line.is_empty() {
                continue;
            }
            last_activity = Instant::now();

            if let Some(echo) = &self.echo {
                echo.line(line).await;
            }

            if let Some(rule) = first_match(&self.rules, line) {
                return self.fire(rule, line, process).await;
            }
        }
    }

    async fn fire<P: MonitoredOutput + ?Sized>(
        &self,
        rule: &TriggerRule,
        line: &str,
        process: &mut P,
    ) -> Outcome {
        let matched = RuleMatch {
            marker: rule.substring.clone(),
            line: line.to_string(),
        };
        info!(marker = %matched.marker, verdict = ?rule.verdict, kill = rule.kill, "Trigger rule fired");

        let outcome = match rule.verdict {
            Verdict::Success => Outcome::Success(matched.clone()),
            Verdict::Failure => Outcome::Failure(matched.clone()),
        };

        if let Some(effect) = &rule.side_effect {
            effect(&matched);
        }

        if rule.kill {
            tokio::time::sleep(self.kill_grace).await;
            if let Err(e) = process.kill().await {
                warn!("Kill after rule match failed: {e:#}");
            }
        }

        outcome
    }
}
