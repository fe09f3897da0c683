//! Multi-tier evaluation.
//!
//! An event passes through its tiers in the order the caller lists them. The run stays
//! [`TierState::Pending`] while tiers keep admitting and settles at the first denial or once
//! every tier has admitted. Tiers after a denial are never evaluated, so nothing is recorded
//! against them; records already made by earlier tiers are kept.
//!
//! ```text
//! Pending{passed: 0} --admit--> Pending{passed: 1} --admit--> ... --no tiers left--> Settled(admitted)
//!        |                              |
//!        +------------deny-------------+------------> Settled(denied at this tier)
//! ```
//!
//! The run itself does no I/O. [`TierRun::run`] drives it against one evaluator; the engine
//! drives it step by step so each tier can go to a different store.

use crate::config::{TierScope, TierTable, WindowConfig};
use crate::decision::{Decision, DenyReason};
use crate::error::BackendError;
use crate::evaluator::WindowEvaluator;
use crate::key::WindowKey;
use crate::window::{EventId, Timestamp};
use std::collections::VecDeque;

/// One resolved tier of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierStep {
    pub tier: String,
    pub key: WindowKey,
    pub config: WindowConfig,
}

impl TierStep {
    pub fn scope(&self) -> TierScope {
        self.config.scope()
    }
}

/// Where a run stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierState {
    /// `passed` tiers have admitted so far.
    Pending { passed: usize },
    Settled(Decision),
}

/// Evaluation of one event across an ordered list of tiers.
#[derive(Debug)]
pub struct TierRun {
    steps: VecDeque<Result<TierStep, String>>,
    state: TierState,
}

impl TierRun {
    /// Resolve `tiers` against `table` for an event of `subject` on `resource`.
    ///
    /// Unknown tiers are kept in place and deny when the run reaches them.
    pub fn plan<T: AsRef<str>>(table: &TierTable, subject: &str, resource: &str, tiers: &[T]) -> Self {
        let steps = tiers
            .iter()
            .map(|tier| {
                let tier = tier.as_ref();
                table
                    .resolve(tier, subject, resource)
                    .map(|(key, config)| TierStep { tier: tier.to_string(), key, config })
                    .map_err(|_| tier.to_string())
            })
            .collect();
        Self { steps, state: TierState::Pending { passed: 0 } }
    }

    pub fn state(&self) -> &TierState {
        &self.state
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.state, TierState::Settled(_))
    }

    /// Next tier to evaluate, or `None` once the run has settled.
    pub fn next_step(&mut self) -> Option<TierStep> {
        if self.is_settled() {
            return None;
        }
        match self.steps.pop_front() {
            None => {
                self.state = TierState::Settled(Decision::admitted());
                None
            }
            Some(Err(tier)) => {
                tracing::warn!(tier = %tier, "evaluation names an unconfigured tier");
                self.state = TierState::Settled(
                    Decision::denied(DenyReason::UnknownTier, None).for_tier(&tier),
                );
                None
            }
            Some(Ok(step)) => Some(step),
        }
    }

    /// Feed the outcome of `step`. A denial settles the run at that tier.
    pub fn record(&mut self, step: &TierStep, decision: Decision) {
        let TierState::Pending { passed } = self.state else {
            return;
        };
        if decision.admitted {
            self.state = TierState::Pending { passed: passed + 1 };
        } else {
            tracing::debug!(tier = %step.tier, passed, reason = ?decision.reason, "tier denied");
            self.state = TierState::Settled(decision.for_tier(&step.tier));
        }
    }

    /// Final decision. A run abandoned while pending has admitted every tier it evaluated.
    pub fn into_decision(self) -> Decision {
        match self.state {
            TierState::Settled(decision) => decision,
            TierState::Pending { .. } => Decision::admitted(),
        }
    }

    /// Drive the run to completion against a single evaluator.
    pub async fn run<E>(
        mut self,
        evaluator: &E,
        now: Timestamp,
        event: &EventId,
    ) -> Result<Decision, BackendError>
    where
        E: WindowEvaluator + ?Sized,
    {
        while let Some(step) = self.next_step() {
            let decision = evaluator.evaluate(&step.key, &step.config, now, event).await?;
            self.record(&step, decision);
        }
        Ok(self.into_decision())
    }
}
