use crate::{
    bindings::{
        Erc20Contract,
        SignerHandle,
    },
    config::AppConfig,
    session::WalletSession,
    tracker::{
        TransactionTracker,
        TxError,
    },
};
use ethers::types::{
    Address,
    U256,
};

/// Allowance above which the grant counts as effectively unlimited. A 2^232
/// floor rather than a comparison against the literal maximum, so a prior
/// approval that has been partially spent still counts.
pub fn authorized_floor() -> U256 {
    U256::MAX >> 24
}

pub fn is_effectively_unlimited(allowance: U256) -> bool {
    allowance > authorized_floor()
}

#[derive(Debug, thiserror::Error)]
pub enum AllowanceError {
    #[error("approval rejected")]
    Rejected,
    #[error("approval reverted ({})", .reason.as_deref().unwrap_or("no reason given"))]
    Reverted { reason: Option<String> },
    #[error("rpc failure: {0}")]
    Rpc(String),
}

impl From<TxError> for AllowanceError {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Rejected => AllowanceError::Rejected,
            TxError::Reverted { reason } => AllowanceError::Reverted { reason },
            TxError::Dropped => {
                AllowanceError::Rpc("approval dropped without a receipt".to_string())
            }
            TxError::Rpc(message) => AllowanceError::Rpc(message),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authorization {
    /// No transaction was submitted; the existing grant already suffices.
    AlreadyAuthorized,
    Approved,
}

/// The slice of the ERC-20 surface the guard needs. Implemented by the
/// session's signer-connected token handle; tests substitute a fake.
pub trait TokenSurface {
    fn allowance(
        &self,
        owner: Address,
        spender: Address,
    ) -> impl Future<Output = Result<U256, AllowanceError>> + Send;

    /// Submit one `approve` for the maximal amount and wait until it is
    /// final.
    fn approve_max(
        &self,
        spender: Address,
    ) -> impl Future<Output = Result<(), AllowanceError>> + Send;
}

/// Gates the rest of the UI on the wager token allowance granted to the
/// betting contract. Approval is one-time per wallet; once authorized the
/// user is never re-prompted.
pub struct AllowanceGuard {
    spender: Address,
}

impl AllowanceGuard {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            spender: config.betting_contract,
        }
    }

    pub async fn is_authorized<T: TokenSurface>(
        &self,
        token: &T,
        owner: Address,
    ) -> Result<bool, AllowanceError> {
        let allowance = token.allowance(owner, self.spender).await?;
        Ok(is_effectively_unlimited(allowance))
    }

    /// Idempotent: re-checks the grant synchronously before submitting, so
    /// an already-authorized wallet never pays for a redundant approval.
    pub async fn authorize<T: TokenSurface>(
        &self,
        token: &T,
        owner: Address,
    ) -> Result<Authorization, AllowanceError> {
        if self.is_authorized(token, owner).await? {
            return Ok(Authorization::AlreadyAuthorized);
        }
        token.approve_max(self.spender).await?;
        Ok(Authorization::Approved)
    }
}

/// The live session's token surface: reads through the connected handle,
/// approvals through the tracker so the pending hash is surfaced and the
/// confirmation depth is respected.
pub struct SessionToken<'a> {
    contract: &'a Erc20Contract<SignerHandle>,
    tracker: &'a TransactionTracker,
}

impl<'a> SessionToken<'a> {
    pub fn new(session: &'a WalletSession, tracker: &'a TransactionTracker) -> Self {
        Self {
            contract: &session.token_connected,
            tracker,
        }
    }
}

impl TokenSurface for SessionToken<'_> {
    async fn allowance(
        &self,
        owner: Address,
        spender: Address,
    ) -> Result<U256, AllowanceError> {
        self.contract
            .allowance(owner, spender)
            .call()
            .await
            .map_err(|e| AllowanceError::Rpc(e.to_string()))
    }

    async fn approve_max(&self, spender: Address) -> Result<(), AllowanceError> {
        let receipt = self
            .tracker
            .submit(self.contract.approve(spender, U256::MAX))
            .await?;
        tracing::info!(tx = ?receipt.transaction_hash, "token allowance approved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use std::sync::{
        Mutex,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    };

    struct FakeToken {
        allowance: Mutex<U256>,
        approvals: AtomicUsize,
    }

    impl FakeToken {
        fn with_allowance(allowance: U256) -> Self {
            Self {
                allowance: Mutex::new(allowance),
                approvals: AtomicUsize::new(0),
            }
        }

        fn approvals(&self) -> usize {
            self.approvals.load(Ordering::SeqCst)
        }
    }

    impl TokenSurface for FakeToken {
        async fn allowance(
            &self,
            _owner: Address,
            _spender: Address,
        ) -> Result<U256, AllowanceError> {
            Ok(*self.allowance.lock().unwrap())
        }

        async fn approve_max(&self, _spender: Address) -> Result<(), AllowanceError> {
            self.approvals.fetch_add(1, Ordering::SeqCst);
            *self.allowance.lock().unwrap() = U256::MAX;
            Ok(())
        }
    }

    fn guard() -> AllowanceGuard {
        AllowanceGuard {
            spender: Address::from_low_u64_be(0xbe7),
        }
    }

    fn owner() -> Address {
        Address::from_low_u64_be(0xa11ce)
    }

    #[test]
    fn is_effectively_unlimited__strictly_exceeds_the_floor() {
        assert!(!is_effectively_unlimited(U256::zero()));
        assert!(!is_effectively_unlimited(U256::from(1_000u64)));
        assert!(!is_effectively_unlimited(authorized_floor()));
        assert!(is_effectively_unlimited(authorized_floor() + 1));
        assert!(is_effectively_unlimited(U256::MAX));
    }

    #[tokio::test]
    async fn authorize__zero_allowance_submits_one_approval() {
        // given
        let token = FakeToken::with_allowance(U256::zero());
        let guard = guard();
        assert!(!guard.is_authorized(&token, owner()).await.unwrap());

        // when
        let outcome = guard.authorize(&token, owner()).await.unwrap();

        // then
        assert_eq!(outcome, Authorization::Approved);
        assert_eq!(token.approvals(), 1);
        assert!(guard.is_authorized(&token, owner()).await.unwrap());
    }

    #[tokio::test]
    async fn authorize__is_idempotent() {
        // given
        let token = FakeToken::with_allowance(U256::zero());
        let guard = guard();

        // when
        let first = guard.authorize(&token, owner()).await.unwrap();
        let second = guard.authorize(&token, owner()).await.unwrap();

        // then: at most one on-chain approval across both calls
        assert_eq!(first, Authorization::Approved);
        assert_eq!(second, Authorization::AlreadyAuthorized);
        assert_eq!(token.approvals(), 1);
    }

    #[tokio::test]
    async fn authorize__partial_prior_approval_above_floor_is_a_no_op() {
        let token = FakeToken::with_allowance(authorized_floor() + 1);
        let guard = guard();

        let outcome = guard.authorize(&token, owner()).await.unwrap();

        assert_eq!(outcome, Authorization::AlreadyAuthorized);
        assert_eq!(token.approvals(), 0);
    }
}
