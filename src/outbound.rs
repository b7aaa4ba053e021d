//! Every call to the control plane and the repair store goes through here:
//! each one is retry-gated and its retry time lands in the pass ledger.

use std::fmt::Display;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, PolicyAgentChannel, RepairAction, StatusChange, StepResponse};
use crate::exit::ExitReason;
use crate::model::{RepairTask, Snapshot};
use crate::retry::{Attempted, RetryGate, Retryable};
use crate::store::{RepairStore, StoreError, TaskFilter};

/// Retry accounting for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassLedger {
    pub calls: u32,
    /// Calls that still failed transiently after the last attempt.
    pub exhausted_calls: u32,
    pub retry_time: Duration,
}

pub struct Outbound<'a, C, S> {
    channel: &'a C,
    store: &'a S,
    gate: &'a RetryGate,
    cancel: &'a CancellationToken,
    ledger: PassLedger,
}

impl<'a, C, S> Outbound<'a, C, S>
where
    C: PolicyAgentChannel,
    S: RepairStore,
{
    pub fn new(channel: &'a C, store: &'a S, gate: &'a RetryGate, cancel: &'a CancellationToken) -> Self {
        Self {
            channel,
            store,
            gate,
            cancel,
            ledger: PassLedger::default(),
        }
    }

    pub fn ledger(&self) -> PassLedger {
        self.ledger
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn settle<T, E: Retryable + Display>(&mut self, attempted: Attempted<T, E>) -> Result<T, E> {
        self.ledger.calls += 1;
        self.ledger.retry_time += attempted.retry_time;
        if attempted.attempts > 1 {
            tracing::debug!(
                attempts = attempted.attempts,
                retry_ms = attempted.retry_time.as_millis() as u64,
                ok = attempted.result.is_ok(),
                "call needed more than one attempt"
            );
        }
        if let Err(err) = &attempted.result
            && err.is_transient()
        {
            self.ledger.exhausted_calls += 1;
        }
        attempted.result
    }

    pub async fn fetch_snapshot(&mut self) -> Result<Snapshot, ChannelError> {
        let channel = self.channel;
        let attempted = self
            .gate
            .call("fetch_snapshot", self.cancel, || channel.fetch_snapshot())
            .await;
        self.settle(attempted)
    }

    pub async fn acknowledge(
        &mut self,
        job_id: &str,
        response: StepResponse,
        delete_step_if_present: bool,
    ) -> Result<(), ChannelError> {
        let channel = self.channel;
        let attempted = self
            .gate
            .call("acknowledge", self.cancel, || {
                channel.acknowledge(job_id, response.clone(), delete_step_if_present)
            })
            .await;
        self.settle(attempted)
    }

    pub async fn request_repair(
        &mut self,
        role_instance: &str,
        action: RepairAction,
        context_token: Option<&str>,
    ) -> Result<(), ChannelError> {
        let channel = self.channel;
        let attempted = self
            .gate
            .call("request_repair", self.cancel, || {
                channel.request_repair(role_instance, action, context_token)
            })
            .await;
        self.settle(attempted)
    }

    pub async fn request_status_change(
        &mut self,
        job_id: &str,
        change: StatusChange,
    ) -> Result<(), ChannelError> {
        let channel = self.channel;
        let attempted = self
            .gate
            .call("request_status_change", self.cancel, || {
                channel.request_status_change(job_id, change)
            })
            .await;
        self.settle(attempted)
    }

    pub async fn list_tasks(&mut self, filter: &TaskFilter) -> Result<Vec<RepairTask>, StoreError> {
        let store = self.store;
        let attempted = self
            .gate
            .call("list_tasks", self.cancel, || store.list(filter))
            .await;
        self.settle(attempted)
    }

    pub async fn create_task(&mut self, task: &RepairTask) -> Result<u64, StoreError> {
        let store = self.store;
        let attempted = self
            .gate
            .call("create_task", self.cancel, || store.create(task))
            .await;
        self.settle(attempted)
    }

    pub async fn update_task(&mut self, task: &RepairTask) -> Result<u64, StoreError> {
        let store = self.store;
        let attempted = self
            .gate
            .call("update_task", self.cancel, || store.update_execution_state(task))
            .await;
        self.settle(attempted)
    }

    pub async fn cancel_task(&mut self, task: &RepairTask) -> Result<u64, StoreError> {
        let store = self.store;
        let attempted = self
            .gate
            .call("cancel_task", self.cancel, || store.cancel(task))
            .await;
        self.settle(attempted)
    }
}

/// Cumulative retry time across passes that kept failing.
#[derive(Debug, Clone)]
pub struct FailureBudget {
    limit: Duration,
    spent: Duration,
}

impl FailureBudget {
    /// A zero `limit` never runs out.
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            spent: Duration::ZERO,
        }
    }

    /// Fold one pass into the budget. A pass in which every call eventually
    /// got through resets it.
    pub fn settle(&mut self, ledger: &PassLedger) -> Option<ExitReason> {
        if ledger.exhausted_calls == 0 {
            self.spent = Duration::ZERO;
            return None;
        }
        self.spent += ledger.retry_time;
        tracing::warn!(
            exhausted_calls = ledger.exhausted_calls,
            spent_ms = self.spent.as_millis() as u64,
            limit_ms = self.limit.as_millis() as u64,
            "outbound calls exhausted their retries"
        );
        if !self.limit.is_zero() && self.spent >= self.limit {
            return Some(ExitReason::RetryBudgetExhausted { spent: self.spent });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryChannel, InMemoryStore};
    use crate::retry::RetryPolicy;

    fn gate() -> RetryGate {
        RetryGate::new(RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(1),
        })
    }

    fn failing(retry_ms: u64) -> PassLedger {
        PassLedger {
            calls: 1,
            exhausted_calls: 1,
            retry_time: Duration::from_millis(retry_ms),
        }
    }

    #[tokio::test]
    async fn ledger_counts_exhausted_transient_calls() {
        let channel = InMemoryChannel::new();
        let store = InMemoryStore::new();
        let gate = gate();
        let cancel = CancellationToken::new();
        let mut out = Outbound::new(&channel, &store, &gate, &cancel);

        channel.fail_next_fetches(5);
        assert!(out.fetch_snapshot().await.is_err());
        store.fail_next_calls(1);
        assert!(out.list_tasks(&TaskFilter::default()).await.is_ok());

        let ledger = out.ledger();
        assert_eq!(ledger.calls, 2);
        assert_eq!(ledger.exhausted_calls, 1);
        assert!(ledger.retry_time > Duration::ZERO);
    }

    #[tokio::test]
    async fn permanent_failures_do_not_count_as_exhausted() {
        let channel = InMemoryChannel::new();
        let store = InMemoryStore::new();
        let gate = gate();
        let cancel = CancellationToken::new();
        let mut out = Outbound::new(&channel, &store, &gate, &cancel);

        let err = out
            .acknowledge("missing", StepResponse::Approve, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownJob(_)));
        assert_eq!(out.ledger().exhausted_calls, 0);
    }

    #[test]
    fn budget_exhausts_once_limit_is_reached() {
        let mut budget = FailureBudget::new(Duration::from_millis(100));
        assert!(budget.settle(&failing(60)).is_none());
        assert_eq!(
            budget.settle(&failing(40)),
            Some(ExitReason::RetryBudgetExhausted {
                spent: Duration::from_millis(100)
            })
        );
    }

    #[test]
    fn clean_pass_resets_budget() {
        let mut budget = FailureBudget::new(Duration::from_millis(100));
        budget.settle(&failing(90));
        assert!(budget.settle(&PassLedger::default()).is_none());
        assert_eq!(budget.spent, Duration::ZERO);
        assert!(budget.settle(&failing(90)).is_none());
    }

    #[test]
    fn zero_limit_never_exhausts() {
        let mut budget = FailureBudget::new(Duration::ZERO);
        for _ in 0..10 {
            assert!(budget.settle(&failing(1_000)).is_none());
        }
    }
}
