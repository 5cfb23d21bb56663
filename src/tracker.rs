//! Correlation of routed requests with their ECU responses.
//!
//! A request opens a [`Transaction`] keyed by its [`CorrelationKey`]. The
//! transaction leaves the tracker either when the matching response is
//! [completed](TransactionTracker::complete) or when its deadline passes and it
//! is [expired](TransactionTracker::expire). Whichever comes first notifies
//! the request waiting on the [`PendingTransaction`]. The deadline of a live
//! transaction may be [extended](TransactionTracker::extend).
//!
//! A second request with the key of a live transaction is rejected with
//! [`TransactionError::DuplicateTransaction`].

use std::collections::HashMap;
use std::fmt;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::message::{DiagnosticRequest, DiagnosticResponse, LogicalAddress};

/// Matches a response to the request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// ECU logical address.
    pub target_address: LogicalAddress,
    /// Request service.
    pub service_id: u8,
    /// Request identifier.
    pub identifier: u16,
}

impl From<&DiagnosticRequest> for CorrelationKey {
    fn from(request: &DiagnosticRequest) -> Self {
        CorrelationKey {
            target_address: request.target_address,
            service_id: request.service_id,
            identifier: request.identifier,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:04x}/0x{:02x}/0x{:04x}",
            self.target_address, self.service_id, self.identifier
        )
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Waiting for the ECU.
    Pending,
    /// The ECU answered.
    Resolved,
    /// The deadline passed first.
    TimedOut,
}

/// A routed request awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Correlation key.
    pub key: CorrelationKey,
    /// When the request was routed.
    pub created_at: Instant,
    /// When the request times out.
    pub deadline: Instant,
    /// Current state.
    pub state: TransactionState,
}

/// How a transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The ECU response.
    Resolved(DiagnosticResponse),
    /// No response before the deadline.
    TimedOut,
}

/// Transaction errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// A transaction with the same key is live.
    #[error("transaction {0} is already in flight")]
    DuplicateTransaction(CorrelationKey),
    /// No live transaction with this key.
    #[error("no transaction {0} in flight")]
    UnknownTransaction(CorrelationKey),
}

/// A live transaction, as seen by the request that opened it.
#[derive(Debug)]
pub struct PendingTransaction {
    /// The transaction at the time it was opened.
    pub transaction: Transaction,
    /// Receives the outcome once the transaction leaves the tracker.
    pub outcome: oneshot::Receiver<Outcome>,
}

struct Entry {
    transaction: Transaction,
    notify: oneshot::Sender<Outcome>,
}

/// The table of live transactions.
#[derive(Default)]
pub struct TransactionTracker {
    live: Mutex<HashMap<CorrelationKey, Entry>>,
}

impl TransactionTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction for `key`, due at `deadline`.
    ///
    /// Overdue transactions are expired first, so that a key whose previous
    /// transaction timed out can be reused.
    pub fn begin(
        &self,
        key: CorrelationKey,
        deadline: Instant,
    ) -> Result<PendingTransaction, TransactionError> {
        let now = Instant::now();
        let mut live = self.live.lock();
        expire_locked(&mut live, now);
        if live.contains_key(&key) {
            warn!(target: "tracker", "{}: rejected, already in flight", key);
            return Err(TransactionError::DuplicateTransaction(key));
        }
        let transaction = Transaction {
            key,
            created_at: now,
            deadline,
            state: TransactionState::Pending,
        };
        let (notify, outcome) = oneshot::channel();
        live.insert(
            key,
            Entry {
                transaction: transaction.clone(),
                notify,
            },
        );
        trace!(target: "tracker", "{}: opened, {} live", key, live.len());
        Ok(PendingTransaction {
            transaction,
            outcome,
        })
    }

    /// Resolve the transaction of `key` with `response`.
    pub fn complete(
        &self,
        key: &CorrelationKey,
        response: DiagnosticResponse,
    ) -> Result<Transaction, TransactionError> {
        let entry = self
            .live
            .lock()
            .remove(key)
            .ok_or(TransactionError::UnknownTransaction(*key))?;
        let mut transaction = entry.transaction;
        transaction.state = TransactionState::Resolved;
        if entry.notify.send(Outcome::Resolved(response)).is_err() {
            debug!(target: "tracker", "{}: resolved, requester gone", key);
        } else {
            trace!(target: "tracker", "{}: resolved", key);
        }
        Ok(transaction)
    }

    /// Push the deadline of the transaction of `key` back to `deadline`, for
    /// an ECU that asked for more time.
    pub fn extend(
        &self,
        key: &CorrelationKey,
        deadline: Instant,
    ) -> Result<Transaction, TransactionError> {
        let mut live = self.live.lock();
        let entry = live
            .get_mut(key)
            .ok_or(TransactionError::UnknownTransaction(*key))?;
        entry.transaction.deadline = deadline;
        debug!(target: "tracker", "{}: deadline extended", key);
        Ok(entry.transaction.clone())
    }

    /// Whether a transaction of `key` is live.
    pub fn is_live(&self, key: &CorrelationKey) -> bool {
        self.live.lock().contains_key(key)
    }

    /// Current deadline of the live transaction of `key`.
    pub fn deadline(&self, key: &CorrelationKey) -> Option<Instant> {
        self.live
            .lock()
            .get(key)
            .map(|entry| entry.transaction.deadline)
    }

    /// Time out every transaction whose deadline is not after `now`.
    pub fn expire(&self, now: Instant) -> Vec<Transaction> {
        expire_locked(&mut self.live.lock(), now)
    }

    /// Drop the transaction of `key` without notifying anyone.
    pub fn abandon(&self, key: &CorrelationKey) -> Option<Transaction> {
        self.live.lock().remove(key).map(|entry| entry.transaction)
    }

    /// Number of live transactions.
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Whether no transaction is live.
    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}

fn expire_locked(live: &mut HashMap<CorrelationKey, Entry>, now: Instant) -> Vec<Transaction> {
    let overdue: Vec<CorrelationKey> = live
        .iter()
        .filter(|(_, entry)| entry.transaction.deadline <= now)
        .map(|(key, _)| *key)
        .collect();
    overdue
        .into_iter()
        .filter_map(|key| live.remove(&key))
        .map(|entry| {
            let mut transaction = entry.transaction;
            transaction.state = TransactionState::TimedOut;
            debug!(target: "tracker", "{}: timed out", transaction.key);
            let _ = entry.notify.send(Outcome::TimedOut);
            transaction
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(identifier: u16) -> CorrelationKey {
        CorrelationKey {
            target_address: 0x0205,
            service_id: 0x22,
            identifier,
        }
    }

    fn response(identifier: u16, payload: &[u8]) -> DiagnosticResponse {
        DiagnosticResponse {
            source_address: 0x0205,
            target_address: 0,
            service_id: 0x22,
            identifier,
            payload: payload.to_vec(),
            nrc: None,
        }
    }

    fn in_one_second() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn complete_delivers_the_response() {
        let tracker = TransactionTracker::new();
        let pending = tracker.begin(key(0xf190), in_one_second()).unwrap();
        assert_eq!(pending.transaction.state, TransactionState::Pending);
        assert_eq!(tracker.len(), 1);

        let done = tracker.complete(&key(0xf190), response(0xf190, b"VIN")).unwrap();
        assert_eq!(done.state, TransactionState::Resolved);
        assert!(tracker.is_empty());
        assert_eq!(
            pending.outcome.await.unwrap(),
            Outcome::Resolved(response(0xf190, b"VIN"))
        );
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected_while_live() {
        let tracker = TransactionTracker::new();
        let _pending = tracker.begin(key(0xf190), in_one_second()).unwrap();
        assert_eq!(
            tracker.begin(key(0xf190), in_one_second()).unwrap_err(),
            TransactionError::DuplicateTransaction(key(0xf190))
        );
        // Another identifier is another key.
        assert!(tracker.begin(key(0xf18c), in_one_second()).is_ok());

        tracker.complete(&key(0xf190), response(0xf190, b"")).unwrap();
        assert!(tracker.begin(key(0xf190), in_one_second()).is_ok());
    }

    #[tokio::test]
    async fn unsolicited_response_is_unknown() {
        let tracker = TransactionTracker::new();
        assert_eq!(
            tracker.complete(&key(0xf190), response(0xf190, b"")),
            Err(TransactionError::UnknownTransaction(key(0xf190)))
        );
    }

    #[tokio::test]
    async fn expiry_times_out_and_removes() {
        let tracker = TransactionTracker::new();
        let now = Instant::now();
        let early = tracker.begin(key(1), now + Duration::from_millis(10)).unwrap();
        let _late = tracker.begin(key(2), now + Duration::from_secs(10)).unwrap();

        let expired = tracker.expire(now + Duration::from_millis(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, key(1));
        assert_eq!(expired[0].state, TransactionState::TimedOut);
        assert_eq!(early.outcome.await.unwrap(), Outcome::TimedOut);
        assert_eq!(tracker.len(), 1);

        // A late response for the expired key is not matched.
        assert_eq!(
            tracker.complete(&key(1), response(1, b"")),
            Err(TransactionError::UnknownTransaction(key(1)))
        );
    }

    #[tokio::test]
    async fn begin_reuses_an_overdue_key() {
        let tracker = TransactionTracker::new();
        let stale = tracker.begin(key(1), Instant::now()).unwrap();
        let fresh = tracker.begin(key(1), in_one_second()).unwrap();
        assert_eq!(stale.outcome.await.unwrap(), Outcome::TimedOut);
        assert_eq!(fresh.transaction.state, TransactionState::Pending);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn extended_transaction_outlives_its_first_deadline() {
        let tracker = TransactionTracker::new();
        let now = Instant::now();
        let pending = tracker.begin(key(1), now + Duration::from_millis(10)).unwrap();
        assert!(tracker.is_live(&key(1)));

        let later = now + Duration::from_secs(10);
        let extended = tracker.extend(&key(1), later).unwrap();
        assert_eq!(extended.deadline, later);
        assert_eq!(extended.state, TransactionState::Pending);
        assert_eq!(tracker.deadline(&key(1)), Some(later));

        assert!(tracker.expire(now + Duration::from_millis(10)).is_empty());
        tracker.complete(&key(1), response(1, b"late")).unwrap();
        assert_eq!(
            pending.outcome.await.unwrap(),
            Outcome::Resolved(response(1, b"late"))
        );
        assert!(!tracker.is_live(&key(1)));
        assert_eq!(tracker.deadline(&key(1)), None);
        assert_eq!(
            tracker.extend(&key(1), later),
            Err(TransactionError::UnknownTransaction(key(1)))
        );
    }

    #[tokio::test]
    async fn abandon_drops_silently() {
        let tracker = TransactionTracker::new();
        let pending = tracker.begin(key(1), in_one_second()).unwrap();
        assert_eq!(tracker.abandon(&key(1)).map(|t| t.key), Some(key(1)));
        assert!(tracker.is_empty());
        assert!(pending.outcome.await.is_err());
    }
}
