use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pipeline::ledger::{CreditLedger, GenerationStore, RecordId, StatusUpdate};

const OUTBOX_CAPACITY: usize = 256;

/// Writes the run does not wait for. They are applied in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    Debit {
        user_id: String,
        amount: i64,
        image_index: usize,
    },
    RecordStatus {
        record_id: RecordId,
        update: StatusUpdate,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffectFailure {
    pub effect: SideEffect,
    pub attempts: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxReport {
    pub applied: usize,
    pub failures: Vec<SideEffectFailure>,
}

#[derive(Debug, Clone, Copy)]
pub struct OutboxSettings {
    pub max_attempts: usize,
    pub retry_delay: Duration,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

enum OutboxMessage {
    Apply(SideEffect),
    Flush(oneshot::Sender<OutboxReport>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct OutboxHandle {
    sender: mpsc::Sender<OutboxMessage>,
}

impl OutboxHandle {
    pub async fn enqueue(&self, effect: SideEffect) {
        if let Err(err) = self.sender.send(OutboxMessage::Apply(effect)).await {
            if let OutboxMessage::Apply(effect) = err.0 {
                warn!("Outbox is closed, dropping side effect {:?}", effect);
            }
        }
    }

    /// Waits until everything enqueued before this call has been handled.
    pub async fn flush(&self) -> OutboxReport {
        let (reply, receiver) = oneshot::channel();
        if self.sender.send(OutboxMessage::Flush(reply)).await.is_err() {
            return OutboxReport::default();
        }
        receiver.await.unwrap_or_default()
    }
}

pub struct Outbox {
    handle: OutboxHandle,
    worker: JoinHandle<OutboxReport>,
}

impl Outbox {
    pub fn spawn(
        ledger: Arc<dyn CreditLedger>,
        records: Arc<dyn GenerationStore>,
        settings: OutboxSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(OUTBOX_CAPACITY);
        let worker = tokio::spawn(outbox_worker(ledger, records, settings, receiver));
        info!("Side-effect outbox started");
        Outbox {
            handle: OutboxHandle { sender },
            worker,
        }
    }

    pub fn handle(&self) -> OutboxHandle {
        self.handle.clone()
    }

    /// Drains pending effects, stops the worker and returns the final report.
    pub async fn finish(self) -> OutboxReport {
        let (done, done_receiver) = oneshot::channel();
        if self
            .handle
            .sender
            .send(OutboxMessage::Shutdown(done))
            .await
            .is_ok()
        {
            let _ = done_receiver.await;
        }
        match self.worker.await {
            Ok(report) => report,
            Err(err) => {
                warn!("Outbox worker ended abnormally: {err}");
                OutboxReport::default()
            }
        }
    }
}

enum Attempt {
    Applied,
    Rejected(String),
    Failed(String),
}

async fn apply_once(
    effect: &SideEffect,
    ledger: &dyn CreditLedger,
    records: &dyn GenerationStore,
) -> Attempt {
    match effect {
        SideEffect::Debit {
            user_id, amount, ..
        } => match ledger.debit(user_id, *amount).await {
            Ok(true) => Attempt::Applied,
            Ok(false) => Attempt::Rejected(format!(
                "ledger refused to debit {amount} credit(s) from {user_id}"
            )),
            Err(err) => Attempt::Failed(err.to_string()),
        },
        SideEffect::RecordStatus { record_id, update } => {
            match records.update_status(*record_id, update.clone()).await {
                Ok(()) => Attempt::Applied,
                Err(err) => Attempt::Failed(err.to_string()),
            }
        }
    }
}

async fn apply_with_retry(
    effect: SideEffect,
    ledger: &dyn CreditLedger,
    records: &dyn GenerationStore,
    settings: OutboxSettings,
    report: &mut OutboxReport,
) {
    let max_attempts = settings.max_attempts.max(1);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match apply_once(&effect, ledger, records).await {
            Attempt::Applied => {
                debug!("Applied side effect {:?} (attempt {})", effect, attempt);
                report.applied += 1;
                return;
            }
            Attempt::Rejected(error) => {
                warn!("Side effect {:?} rejected: {}", effect, error);
                report.failures.push(SideEffectFailure {
                    effect,
                    attempts: attempt,
                    error,
                });
                return;
            }
            Attempt::Failed(error) if attempt >= max_attempts => {
                warn!(
                    "Side effect {:?} failed after {} attempt(s): {}",
                    effect, attempt, error
                );
                report.failures.push(SideEffectFailure {
                    effect,
                    attempts: attempt,
                    error,
                });
                return;
            }
            Attempt::Failed(error) => {
                warn!(
                    "Side effect {:?} failed (attempt {}/{}), retrying: {}",
                    effect, attempt, max_attempts, error
                );
                tokio::time::sleep(settings.retry_delay.saturating_mul(attempt as u32)).await;
            }
        }
    }
}

async fn outbox_worker(
    ledger: Arc<dyn CreditLedger>,
    records: Arc<dyn GenerationStore>,
    settings: OutboxSettings,
    mut receiver: mpsc::Receiver<OutboxMessage>,
) -> OutboxReport {
    let mut report = OutboxReport::default();
    while let Some(message) = receiver.recv().await {
        match message {
            OutboxMessage::Apply(effect) => {
                apply_with_retry(effect, ledger.as_ref(), records.as_ref(), settings, &mut report)
                    .await;
            }
            OutboxMessage::Flush(reply) => {
                let _ = reply.send(report.clone());
            }
            OutboxMessage::Shutdown(done) => {
                let _ = done.send(());
                break;
            }
        }
    }

    info!(
        "Side-effect outbox stopped (applied={}, failed={})",
        report.applied,
        report.failures.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::pipeline::ledger::{NewGeneration, StoreError};
    use crate::pipeline::types::GenerationStatus;

    #[derive(Default)]
    struct FlakyLedger {
        failures_left: Mutex<usize>,
        debits: Mutex<Vec<(String, i64)>>,
        balance: Mutex<i64>,
    }

    #[async_trait]
    impl CreditLedger for FlakyLedger {
        async fn credits(&self, _user_id: &str) -> Result<i64, StoreError> {
            Ok(*self.balance.lock())
        }

        async fn debit(&self, user_id: &str, amount: i64) -> Result<bool, StoreError> {
            {
                let mut failures = self.failures_left.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(StoreError::UnknownUser(user_id.to_string()));
                }
            }
            let mut balance = self.balance.lock();
            if *balance < amount {
                return Ok(false);
            }
            *balance -= amount;
            self.debits.lock().push((user_id.to_string(), amount));
            Ok(true)
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        updates: Mutex<Vec<(RecordId, GenerationStatus)>>,
    }

    #[async_trait]
    impl GenerationStore for RecordingStore {
        async fn create(&self, _generation: NewGeneration<'_>) -> Result<RecordId, StoreError> {
            Ok(1)
        }

        async fn update_status(
            &self,
            id: RecordId,
            update: StatusUpdate,
        ) -> Result<(), StoreError> {
            self.updates.lock().push((id, update.status));
            Ok(())
        }
    }

    fn fast_settings() -> OutboxSettings {
        OutboxSettings {
            max_attempts: 3,
            retry_delay: Duration::ZERO,
        }
    }

    fn debit(index: usize) -> SideEffect {
        SideEffect::Debit {
            user_id: "alice".to_string(),
            amount: 1,
            image_index: index,
        }
    }

    #[tokio::test]
    async fn applies_effects_in_order_and_retries_transient_failures() {
        let ledger = Arc::new(FlakyLedger {
            failures_left: Mutex::new(2),
            balance: Mutex::new(5),
            ..FlakyLedger::default()
        });
        let store = Arc::new(RecordingStore::default());
        let outbox = Outbox::spawn(ledger.clone(), store.clone(), fast_settings());
        let handle = outbox.handle();

        handle
            .enqueue(SideEffect::RecordStatus {
                record_id: 7,
                update: StatusUpdate::new(GenerationStatus::Processing),
            })
            .await;
        handle.enqueue(debit(0)).await;
        handle.enqueue(debit(1)).await;

        let report = handle.flush().await;
        assert_eq!(report.applied, 3);
        assert!(report.failures.is_empty());
        assert_eq!(ledger.debits.lock().len(), 2);
        assert_eq!(*ledger.balance.lock(), 3);
        assert_eq!(
            store.updates.lock().as_slice(),
            &[(7, GenerationStatus::Processing)]
        );

        let final_report = outbox.finish().await;
        assert_eq!(final_report, report);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_and_reports_failure() {
        let ledger = Arc::new(FlakyLedger {
            failures_left: Mutex::new(10),
            balance: Mutex::new(5),
            ..FlakyLedger::default()
        });
        let outbox = Outbox::spawn(
            ledger.clone(),
            Arc::new(RecordingStore::default()),
            fast_settings(),
        );
        outbox.handle().enqueue(debit(0)).await;

        let report = outbox.finish().await;
        assert_eq!(report.applied, 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].attempts, 3);
        assert_eq!(*ledger.balance.lock(), 5);
    }

    #[tokio::test]
    async fn refused_debits_are_not_retried() {
        let ledger = Arc::new(FlakyLedger::default());
        let outbox = Outbox::spawn(
            ledger.clone(),
            Arc::new(RecordingStore::default()),
            fast_settings(),
        );
        outbox.handle().enqueue(debit(0)).await;

        let report = outbox.finish().await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].attempts, 1);
    }
}
