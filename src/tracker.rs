use crate::config::AppConfig;
use chrono::{
    DateTime,
    Utc,
};
use ethers::{
    abi::Detokenize,
    contract::{
        ContractCall,
        ContractError,
    },
    providers::Middleware,
    types::{
        TransactionReceipt,
        TxHash,
        U64,
    },
};
use tokio::sync::watch;

/// A submitted, not-yet-final state-changing call. Published the moment the
/// hash exists so the UI can show a pending indicator and explorer link;
/// cleared once the transaction confirms or fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTx {
    pub hash: TxHash,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// The signer refused before anything reached the chain. No hash was
    /// produced; callers return to idle without an error banner.
    #[error("transaction rejected before submission")]
    Rejected,
    #[error("transaction reverted ({})", .reason.as_deref().unwrap_or("no reason given"))]
    Reverted { reason: Option<String> },
    #[error("transaction dropped from the pool without a receipt")]
    Dropped,
    #[error("rpc failure: {0}")]
    Rpc(String),
}

/// Submits state-changing calls and waits out the configured confirmation
/// depth. Holds no knowledge of what a transaction changed; the caller
/// refetches whatever state could have moved once `submit` returns. No
/// retries anywhere; every retry is a fresh user action.
pub struct TransactionTracker {
    confirmations: usize,
    pending: watch::Sender<Option<PendingTx>>,
}

impl TransactionTracker {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_confirmations(config.confirmations)
    }

    pub fn with_confirmations(confirmations: usize) -> Self {
        let (pending, _) = watch::channel(None);
        Self {
            confirmations,
            pending,
        }
    }

    /// Observe the in-flight transaction, if any.
    pub fn pending(&self) -> watch::Receiver<Option<PendingTx>> {
        self.pending.subscribe()
    }

    pub async fn submit<M, D>(
        &self,
        call: ContractCall<M, D>,
    ) -> Result<TransactionReceipt, TxError>
    where
        M: Middleware + 'static,
        D: Detokenize,
    {
        let pending_tx = match call.send().await {
            Ok(pending) => pending,
            Err(err) => return Err(classify_send_error(&err)),
        };

        let hash = *pending_tx;
        self.pending.send_replace(Some(PendingTx {
            hash,
            submitted_at: Utc::now(),
        }));
        tracing::info!(
            ?hash,
            confirmations = self.confirmations,
            "transaction submitted"
        );

        let result = pending_tx.confirmations(self.confirmations).await;
        self.pending.send_replace(None);

        match result {
            Ok(receipt) => classify_receipt(receipt),
            Err(err) => Err(TxError::Rpc(err.to_string())),
        }
    }
}

fn classify_send_error<M: Middleware>(err: &ContractError<M>) -> TxError {
    if err.is_revert() {
        return TxError::Reverted {
            reason: err.decode_revert::<String>(),
        };
    }
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("rejected") || lowered.contains("denied") {
        return TxError::Rejected;
    }
    TxError::Rpc(message)
}

fn classify_receipt(
    receipt: Option<TransactionReceipt>,
) -> Result<TransactionReceipt, TxError> {
    match receipt {
        None => Err(TxError::Dropped),
        Some(receipt) if receipt.status == Some(U64::zero()) => Err(TxError::Reverted {
            // Receipts carry no revert data; the reason would need a
            // re-execution against the included block.
            reason: None,
        }),
        Some(receipt) => Ok(receipt),
    }
}
