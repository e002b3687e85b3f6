//! Heartbeat scheduler: the recurring pulse that keeps the goal tree
//! moving without anyone asking.
//!
//! Each cycle drains a bounded batch of work: pending atomic goals get
//! executed, childless composites get decomposed, progress rolls up, and
//! every Nth cycle the invariants auditor takes a pass. One goal's failure
//! is logged and skipped; the cycle never dies with it.

use serde::Serialize;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::decompose::DecompositionService;
use crate::error::Result;
use crate::execute::ExecutionService;
use crate::goal::GoalStatus;
use crate::invariants::InvariantAuditor;
use crate::progress::ProgressAggregator;
use crate::store::Store;

const ACTOR: &str = "scheduler";

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub executed: usize,
    pub decomposed: usize,
    pub progress_updates: usize,
    pub parents_completed: usize,
    pub audit_violations: Option<usize>,
}

pub struct Scheduler {
    store: Arc<Store>,
    execution: Arc<ExecutionService>,
    decomposition: Arc<DecompositionService>,
    config: SchedulerConfig,
    cycle: u64,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        execution: Arc<ExecutionService>,
        decomposition: Arc<DecompositionService>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            execution,
            decomposition,
            config,
            cycle: 0,
        }
    }

    /// Run until ctrl-c. A failed cycle is logged and the loop keeps
    /// ticking.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "scheduler started: heartbeat every {}s, audit every {} cycles",
            self.config.heartbeat_secs, self.config.audit_every_cycles
        );
        let mut ticker = interval(Duration::from_secs(self.config.heartbeat_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(summary) => info!(
                            "cycle {}: {} executed, {} decomposed, {} progress updates, {} parents completed",
                            summary.cycle,
                            summary.executed,
                            summary.decomposed,
                            summary.progress_updates,
                            summary.parents_completed
                        ),
                        Err(e) => error!("heartbeat cycle error: {e}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("scheduler shutting down after {} cycles", self.cycle);
                    return Ok(());
                }
            }
        }
    }

    /// One heartbeat. Public so the CLI can drive single cycles.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary> {
        self.cycle += 1;
        let mut summary = CycleSummary {
            cycle: self.cycle,
            ..CycleSummary::default()
        };

        summary.executed = self.execute_pending_atomics().await?;
        summary.decomposed = self.decompose_childless_composites().await?;

        let progress = self
            .store
            .with_uow(|uow| ProgressAggregator::aggregate(uow, ACTOR))?;
        summary.progress_updates = progress.updated.len();
        summary.parents_completed = progress.completed.len();

        if self.config.audit_every_cycles > 0 && self.cycle % self.config.audit_every_cycles == 0 {
            let report = self.store.with_uow(|uow| Ok(InvariantAuditor::audit(uow)))?;
            summary.audit_violations = Some(report.violations().count());
        }

        Ok(summary)
    }

    async fn execute_pending_atomics(&self) -> Result<usize> {
        let batch = self
            .store
            .with_uow(|uow| uow.pending_atomic_goals(self.config.execute_batch))?;
        let mut executed = 0;
        for goal in batch {
            match self.execution.execute(&self.store, &goal.id, ACTOR).await {
                Ok(outcome) => {
                    executed += 1;
                    info!("scheduler: executed {} -> {outcome:?}", goal.id);
                }
                Err(e) => warn!("scheduler: execution of {} failed: {e}", goal.id),
            }
        }
        Ok(executed)
    }

    async fn decompose_childless_composites(&self) -> Result<usize> {
        let mut batch = self
            .store
            .with_uow(|uow| uow.childless_composites(GoalStatus::Pending, self.config.decompose_batch))?;
        let active = self
            .store
            .with_uow(|uow| uow.childless_composites(GoalStatus::Active, self.config.decompose_batch))?;
        batch.extend(active);
        batch.truncate(self.config.decompose_batch);

        let mut decomposed = 0;
        for goal in batch {
            match self
                .decomposition
                .decompose(&self.store, &goal.id, ACTOR)
                .await
            {
                Ok(outcome) => {
                    decomposed += 1;
                    info!("scheduler: decomposed {} -> {outcome:?}", goal.id);
                }
                Err(e) => warn!("scheduler: decomposition of {} failed: {e}", goal.id),
            }
        }
        Ok(decomposed)
    }
}
