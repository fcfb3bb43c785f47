//! The two-phase atomic commit: prepare everywhere, persist the decision,
//! broadcast it, clear the decision record.

use futures::future::join_all;

use skerry_proto::v1::{AbortCommitRequest, CommitRequest, PrepareCommitRequest};
use skerry_storage::Engine;
use skerry_types::{RangeKey, SkerryError};

use crate::balancer::{Balancer, Inner};
use crate::keys::{DECISION_ABORT, DECISION_COMMIT};
use crate::rangeview::PartitionClient;

impl<E: Engine> Balancer<E> {
    /// Atomically apply `msg` on every replica of the range.
    ///
    /// The decision is durably recorded before either outcome is broadcast;
    /// failing to record it is surfaced as `DecisionNotSaved` and nothing is
    /// sent. Commit broadcast errors are fatal (`CommitAborted`); abort
    /// broadcast errors are logged and swallowed. The decision record is
    /// cleared whichever way the protocol ends.
    pub(crate) async fn atomic_message(
        &self,
        inner: &mut Inner,
        range_key: &RangeKey,
        msg: PrepareCommitRequest,
    ) -> Result<(), SkerryError> {
        let view = inner.views.get_mut(range_key).expect("resolved range has a view");
        if view.is_empty() {
            return Err(SkerryError::RangeNotYetCovered);
        }
        let members = view.members();

        let prepared = prepare_commit(&members, &msg).await;

        let outcome = if prepared.is_ok() { DECISION_COMMIT } else { DECISION_ABORT };
        if let Err(err) = self.engine.set(self.decision_key, outcome).await {
            return Err(SkerryError::DecisionNotSaved {
                decision: String::from_utf8_lossy(outcome).into_owned(),
                reason: err.to_string(),
            });
        }

        let result = match prepared {
            Ok(()) => {
                commit(&members).await?;
                view.lamport += 1;
                Ok(())
            }
            Err(err) => {
                abort_commit(&members).await;
                Err(err)
            }
        };

        if let Err(err) = self.engine.delete(self.decision_key).await {
            return Err(SkerryError::DecisionNotCleared(err.to_string()));
        }
        result
    }

    /// Crash recovery: a decision record on disk means the broadcast may not
    /// have gone out. Re-issue it to every known range view, then clear it.
    pub async fn recover_pending_decision(&self) -> Result<(), SkerryError> {
        let decision = match self.engine.get(self.decision_key).await {
            Ok(bytes) => bytes,
            Err(SkerryError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        tracing::warn!(
            decision = %String::from_utf8_lossy(&decision),
            "found an unfinished two-phase commit decision, replaying"
        );

        let members: Vec<(PartitionClient, String)> = {
            let inner = self.inner.lock().await;
            inner.views.values().flat_map(|v| v.members()).collect()
        };

        if decision == DECISION_COMMIT {
            if let Err(err) = commit(&members).await {
                // Replicas without a locked message refuse the commit; that
                // means they already finished before the crash.
                tracing::warn!(%err, "recovery commit not accepted everywhere");
            }
        } else {
            abort_commit(&members).await;
        }

        self.engine
            .delete(self.decision_key)
            .await
            .map_err(|e| SkerryError::DecisionNotCleared(e.to_string()))
    }
}

/// PREPARE on every replica in parallel. Any transport failure or negative
/// ack turns the outcome into ABORT.
async fn prepare_commit(
    members: &[(PartitionClient, String)],
    msg: &PrepareCommitRequest,
) -> Result<(), SkerryError> {
    let acks = join_all(members.iter().map(|(client, addr)| {
        let mut client = client.clone();
        let req = msg.clone();
        async move { (client.prepare_commit(req).await, addr.clone()) }
    }))
    .await;

    for (ack, addr) in acks {
        match ack {
            Err(status) => {
                tracing::warn!(%addr, err = %status, "prepare failed");
                return Err(SkerryError::PrepareAborted);
            }
            Ok(resp) if !resp.get_ref().ok => {
                tracing::warn!(%addr, "replica refused to prepare");
                return Err(SkerryError::PrepareAborted);
            }
            Ok(_) => {}
        }
    }
    Ok(())
}

/// COMMIT everywhere in parallel; any failure is fatal to the request.
async fn commit(members: &[(PartitionClient, String)]) -> Result<(), SkerryError> {
    let acks = join_all(members.iter().map(|(client, addr)| {
        let mut client = client.clone();
        async move { (client.commit(CommitRequest {}).await, addr.clone()) }
    }))
    .await;

    for (ack, addr) in acks {
        if let Err(status) = ack {
            return Err(SkerryError::CommitAborted(format!("{addr}: {status}")));
        }
    }
    Ok(())
}

/// ABORT everywhere in parallel; replica errors are logged and swallowed.
async fn abort_commit(members: &[(PartitionClient, String)]) {
    let acks = join_all(members.iter().map(|(client, addr)| {
        let mut client = client.clone();
        async move { (client.abort_commit(AbortCommitRequest {}).await, addr.clone()) }
    }))
    .await;

    for (ack, addr) in acks {
        if let Err(status) = ack {
            tracing::warn!(%addr, err = %status, "abort not acknowledged");
        }
    }
}
