/*
 * Copyright 2026 Oxide Computer Company
 */

/*!
 * The step engine.  A pipeline is an ordered list of named steps, each of
 * which declares how safe it is to repeat and whether its failure should stop
 * the run.  Steps come in three phases: a strict prefix of prerequisites, a
 * fan-out of independent per-workload steps, and a suffix which tidies up.
 * Only prefix steps may be fatal.
 */

use serde::Serialize;

use super::state::{ProvisioningRun, RunState};
use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    StrictOnce,
    InstallIfAbsent,
    AlwaysSafeToRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fatality {
    Fatal,
    WarnAndContinue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Prefix,
    FanOut,
    Suffix,
}

/**
 * What a step reports when it did not fail outright.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Skipped(String),
    Warned(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepResult {
    NotReached,
    Ok,
    Skipped { reason: String },
    Warned { count: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: &'static str,
    pub idempotency: Idempotency,
    pub fatality: Fatality,
    pub outcome: StepResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub steps: Vec<StepRecord>,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed
    }
}

/**
 * Steps run against a context, which is told about progress after every state
 * change and every step so that it can keep a durable record.
 */
pub trait StepContext {
    fn checkpoint(&mut self, log: &Logger, report: &RunReport);
}

pub type StepFn<C> = fn(&mut C, &Logger) -> Result<StepOutcome>;

pub struct Step<C> {
    pub name: &'static str,
    pub phase: Phase,
    pub idempotency: Idempotency,
    pub fatality: Fatality,
    /**
     * State entered before the step runs.
     */
    pub enters: Option<RunState>,
    /**
     * State entered once the step has finished without a fatal error.
     */
    pub reaches: Option<RunState>,
    pub action: StepFn<C>,
}

pub struct Pipeline<C> {
    steps: Vec<Step<C>>,
}

impl<C: StepContext> Pipeline<C> {
    pub fn new(steps: Vec<Step<C>>) -> Result<Pipeline<C>> {
        let mut names = std::collections::BTreeSet::new();
        let mut phase = Phase::Prefix;
        let quiet = Logger::root(slog::Discard, o!());
        let mut run = ProvisioningRun::new();

        for s in &steps {
            if !names.insert(s.name) {
                bail!("step {:?} appears twice", s.name);
            }
            if s.phase < phase {
                bail!("step {:?} ({:?}) comes after a {:?} step", s.name, s.phase, phase);
            }
            phase = s.phase;
            if s.fatality == Fatality::Fatal && s.phase != Phase::Prefix {
                bail!("step {:?} is fatal but not part of the prefix", s.name);
            }
            for st in s.enters.iter().chain(s.reaches.iter()) {
                run.advance(&quiet, st.clone()).with_context(|| {
                    format!("step {:?} has an out of order state", s.name)
                })?;
            }
        }

        Ok(Pipeline { steps })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    pub fn run(&self, log: &Logger, ctx: &mut C) -> RunReport {
        let mut run = ProvisioningRun::new();
        let mut report = RunReport {
            state: run.state().clone(),
            steps: self
                .steps
                .iter()
                .map(|s| StepRecord {
                    name: s.name,
                    idempotency: s.idempotency,
                    fatality: s.fatality,
                    outcome: StepResult::NotReached,
                })
                .collect(),
            warnings: Vec::new(),
        };

        for (i, step) in self.steps.iter().enumerate() {
            let slog = log.new(o!("step" => step.name));

            if let Some(st) = &step.enters {
                move_to(&slog, &mut run, st);
                report.state = run.state().clone();
                ctx.checkpoint(log, &report);
            }

            info!(slog, "step {} starting", step.name;
                "idempotency" => ?step.idempotency,
                "fatality" => ?step.fatality);

            let outcome = match (step.action)(ctx, &slog) {
                Ok(StepOutcome::Done) => StepResult::Ok,
                Ok(StepOutcome::Warned(w)) if w.is_empty() => StepResult::Ok,
                Ok(StepOutcome::Skipped(reason)) => {
                    info!(slog, "step {} skipped: {}", step.name, reason);
                    StepResult::Skipped { reason }
                }
                Ok(StepOutcome::Warned(w)) => {
                    for msg in &w {
                        warn!(slog, "{}", msg);
                        report.warnings.push(format!("{}: {}", step.name, msg));
                    }
                    StepResult::Warned { count: w.len() }
                }
                Err(e) if step.fatality == Fatality::Fatal => {
                    let reason = format!("{:#}", e);
                    error!(slog, "step {} failed: {}", step.name, reason);
                    report.steps[i].outcome =
                        StepResult::Failed { reason: reason.clone() };
                    if let Err(e) = run.fail(&slog, step.name, &reason) {
                        error!(slog, "{:#}", e);
                    }
                    report.state = run.state().clone();
                    ctx.checkpoint(log, &report);
                    return report;
                }
                Err(e) => {
                    let msg = format!("{:#}", e);
                    warn!(slog, "step {} failed, continuing: {}", step.name, msg);
                    report.warnings.push(format!("{}: {}", step.name, msg));
                    StepResult::Warned { count: 1 }
                }
            };

            info!(slog, "step {} finished", step.name; "outcome" => ?outcome);
            report.steps[i].outcome = outcome;

            if let Some(st) = &step.reaches {
                move_to(&slog, &mut run, st);
            }
            report.state = run.state().clone();
            ctx.checkpoint(log, &report);
        }

        report
    }
}

/*
 * The ordering was checked when the pipeline was built, so a refusal here
 * means a bug rather than anything the device did.
 */
fn move_to(log: &Logger, run: &mut ProvisioningRun, st: &RunState) {
    if let Err(e) = run.advance(log, st.clone()) {
        error!(log, "state machine: {:#}", e);
    }
}
