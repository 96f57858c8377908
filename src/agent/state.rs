/*
 * Copyright 2026 Oxide Computer Company
 */

use serde::Serialize;

use crate::common::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    NetworkReady,
    RuntimeInstalled,
    SourceRetrieved,
    WorkloadsStarting,
    Completed,
    Failed { step: String, reason: String },
}

impl RunState {
    /*
     * Position in the forward chain.  Failed sits outside of it.
     */
    fn rank(&self) -> Option<u8> {
        Some(match self {
            RunState::NotStarted => 0,
            RunState::NetworkReady => 1,
            RunState::RuntimeInstalled => 2,
            RunState::SourceRetrieved => 3,
            RunState::WorkloadsStarting => 4,
            RunState::Completed => 5,
            RunState::Failed { .. } => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed { .. })
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::NotStarted => write!(f, "NOT_STARTED"),
            RunState::NetworkReady => write!(f, "NETWORK_READY"),
            RunState::RuntimeInstalled => write!(f, "RUNTIME_INSTALLED"),
            RunState::SourceRetrieved => write!(f, "SOURCE_RETRIEVED"),
            RunState::WorkloadsStarting => write!(f, "WORKLOADS_STARTING"),
            RunState::Completed => write!(f, "COMPLETED"),
            RunState::Failed { step, reason } => {
                write!(f, "FAILED({}: {})", step, reason)
            }
        }
    }
}

/**
 * Where a single provisioning run has got to.  States only ever move forward;
 * once a state has been passed it cannot be entered again in the same run.
 */
#[derive(Debug)]
pub struct ProvisioningRun {
    state: RunState,
}

impl Default for ProvisioningRun {
    fn default() -> Self {
        ProvisioningRun::new()
    }
}

impl ProvisioningRun {
    pub fn new() -> ProvisioningRun {
        ProvisioningRun { state: RunState::NotStarted }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn advance(&mut self, log: &Logger, next: RunState) -> Result<()> {
        if self.state.is_terminal() {
            bail!("run is already {}; cannot move to {}", self.state, next);
        }

        let from = self.state.rank();
        let to = match next.rank() {
            Some(r) => r,
            None => bail!("use fail() to record a failure"),
        };
        match from {
            Some(from) if to > from => (),
            _ => bail!("cannot move backwards from {} to {}", self.state, next),
        }

        info!(log, "state: {} -> {}", self.state, next;
            "from" => self.state.to_string(), "to" => next.to_string());
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self, log: &Logger, step: &str, reason: &str) -> Result<()> {
        if self.state.is_terminal() {
            bail!("run is already {}; cannot fail in step {}", self.state, step);
        }

        let next = RunState::Failed {
            step: step.to_string(),
            reason: reason.to_string(),
        };
        error!(log, "state: {} -> {}", self.state, next;
            "from" => self.state.to_string(), "step" => step);
        self.state = next;
        Ok(())
    }
}
