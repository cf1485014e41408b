use crate::{
    allowance,
    bindings::{
        self,
        BettingContract,
        Erc20Contract,
        ReadProvider,
        SignerHandle,
    },
    config::AppConfig,
    wallet::{
        WalletError,
        WalletEvent,
        WalletProvider,
    },
};
use ethers::{
    middleware::SignerMiddleware,
    providers::{
        Middleware,
        Provider,
        Ws,
    },
    signers::Signer,
    types::{
        Address,
        U256,
    },
};
use std::sync::{
    Arc,
    atomic::{
        AtomicU64,
        Ordering,
    },
};

#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no wallet found: {0}")]
    NoWalletFound(String),
    #[error("wallet granted no accounts")]
    NoAccountFound,
    #[error("wallet refused the connection: {0}")]
    Rejected(String),
    #[error("failed to reach {url}: {message}")]
    Endpoint { url: String, message: String },
    #[error("rpc failure: {0}")]
    Rpc(String),
}

impl From<WalletError> for SessionError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::NotFound { .. }
            | WalletError::Io { .. }
            | WalletError::UnsupportedKeyMaterial(_) => {
                SessionError::NoWalletFound(err.to_string())
            }
            WalletError::Prompt(_)
            | WalletError::BadPassword(_)
            | WalletError::UnknownAccount(_) => SessionError::Rejected(err.to_string()),
        }
    }
}

/// Why the session loop stopped. Either way the caller rebuilds everything
/// from scratch; nothing network-scoped survives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionReset {
    /// The wallet switched networks. Equivalent to a full reload: bindings,
    /// subscriptions and caches are all network-specific.
    ChainChanged,
    /// The wallet capability went away entirely.
    WalletClosed,
}

/// Monotonic session tag. A result computed against generation N must be
/// discarded once the manager has moved on to N+1; `is_live` is the check.
#[derive(Clone, Debug)]
pub struct Generation {
    live: Arc<AtomicU64>,
    mine: u64,
}

impl Generation {
    fn next(live: &Arc<AtomicU64>) -> Self {
        let mine = live.fetch_add(1, Ordering::SeqCst) + 1;
        Generation {
            live: live.clone(),
            mine,
        }
    }

    pub fn number(&self) -> u64 {
        self.mine
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) == self.mine
    }

    /// Passes a late-resolved value through only while this generation is
    /// still the live one.
    pub fn accept<T>(&self, value: T) -> Option<T> {
        self.is_live().then_some(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenDetails {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub icon: Option<String>,
}

/// One authenticated binding between a wallet account and the two
/// contracts. Immutable: an account or network change produces a brand-new
/// session, never a mutation of this one.
pub struct WalletSession {
    generation: Generation,
    pub account: Address,
    /// Chain the wallet is actually on; may differ from the target.
    pub wallet_chain: u64,
    pub betting: BettingContract<ReadProvider>,
    pub token: Erc20Contract<ReadProvider>,
    pub betting_connected: BettingContract<SignerHandle>,
    pub token_connected: Erc20Contract<SignerHandle>,
    pub token_details: TokenDetails,
    pub token_balance: U256,
    /// Allowance-sufficiency at connect time.
    pub authorized: bool,
    pub config: AppConfig,
    pub read_provider: Arc<ReadProvider>,
}

impl WalletSession {
    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn is_live(&self) -> bool {
        self.generation.is_live()
    }

    /// Discard-if-stale guard for results that resolved after a session
    /// replacement.
    pub fn accept<T>(&self, value: T) -> Option<T> {
        self.generation.accept(value)
    }

    pub fn network_mismatch(&self) -> bool {
        self.wallet_chain != self.config.chain_id
    }

    /// Degraded-state banner comparing the wallet's network against the
    /// contract deployment's, for the "please switch networks" prompt.
    pub fn mismatch_banner(&self) -> Option<String> {
        mismatch_banner(self.wallet_chain, &self.config)
    }
}

pub(crate) fn mismatch_banner(wallet_chain: u64, config: &AppConfig) -> Option<String> {
    (wallet_chain != config.chain_id).then(|| {
        format!(
            "wallet is on chain {wallet_chain}, but the contracts are deployed on {} (chain {})",
            config.network_name, config.chain_id
        )
    })
}

pub(crate) fn select_account(accounts: &[Address]) -> Result<Address, SessionError> {
    accounts.first().copied().ok_or(SessionError::NoAccountFound)
}

enum Directive {
    Reconnect,
    Restart(SessionReset),
}

fn directive_for(event: Option<WalletEvent>) -> Directive {
    match event {
        Some(WalletEvent::AccountsChanged(_)) => Directive::Reconnect,
        Some(WalletEvent::ChainChanged(_)) => {
            Directive::Restart(SessionReset::ChainChanged)
        }
        None => Directive::Restart(SessionReset::WalletClosed),
    }
}

/// Sole owner of session lifecycle: negotiates account access, verifies the
/// network, derives the contract handles and replaces the whole session on
/// wallet change notifications. Everything else treats the produced session
/// as read-only input.
pub struct SessionManager<W> {
    wallet: W,
    config: AppConfig,
    signer_provider: ReadProvider,
    read_provider: Arc<ReadProvider>,
    live: Arc<AtomicU64>,
}

impl<W: WalletProvider> SessionManager<W> {
    pub async fn new(wallet: W, config: AppConfig) -> Result<Self, SessionError> {
        let signer_provider = connect_endpoint(&config.ws_url).await?;
        let read_provider = match config.read_url.as_deref() {
            Some(url) => Arc::new(connect_endpoint(url).await?),
            None => Arc::new(signer_provider.clone()),
        };
        Ok(Self {
            wallet,
            config,
            signer_provider,
            read_provider,
            live: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Build a fresh session. Bumping the generation here is what retires
    /// the previous session: any of its still-running calls fail the
    /// `is_live` check from now on.
    pub async fn connect(&self) -> Result<Arc<WalletSession>, SessionError> {
        let accounts = self.wallet.request_accounts().await?;
        let account = select_account(&accounts)?;

        let provider_chain = self
            .signer_provider
            .get_chainid()
            .await
            .map_err(|e| SessionError::Rpc(e.to_string()))?
            .as_u64();
        let wallet_chain = self
            .wallet
            .active_chain()
            .await?
            .unwrap_or(provider_chain);

        let signer = self.wallet.signer(account)?.with_chain_id(wallet_chain);
        let client = Arc::new(SignerMiddleware::new(self.signer_provider.clone(), signer));

        let (betting, token) = bindings::read_only(self.read_provider.clone(), &self.config);
        let (betting_connected, token_connected) =
            bindings::connected(client, &self.config);

        let rpc = |e: ethers::contract::ContractError<ReadProvider>| {
            SessionError::Rpc(e.to_string())
        };
        let (name, symbol, decimals) = tokio::try_join!(
            async { token.name().call().await.map_err(rpc) },
            async { token.symbol().call().await.map_err(rpc) },
            async { token.decimals().call().await.map_err(rpc) },
        )?;
        let (token_balance, current_allowance) = tokio::try_join!(
            async { token.balance_of(account).call().await.map_err(rpc) },
            async {
                token
                    .allowance(account, self.config.betting_contract)
                    .call()
                    .await
                    .map_err(rpc)
            },
        )?;
        let authorized = allowance::is_effectively_unlimited(current_allowance);

        let generation = Generation::next(&self.live);
        let session = WalletSession {
            generation,
            account,
            wallet_chain,
            betting,
            token,
            betting_connected,
            token_connected,
            token_details: TokenDetails {
                name,
                symbol,
                decimals,
                icon: self.config.token_icon.clone(),
            },
            token_balance,
            authorized,
            config: self.config.clone(),
            read_provider: self.read_provider.clone(),
        };

        tracing::info!(
            account = ?session.account,
            chain = session.wallet_chain,
            token = %session.token_details.symbol,
            generation = session.generation.number(),
            authorized = session.authorized,
            "session established"
        );
        if let Some(banner) = session.mismatch_banner() {
            tracing::warn!("{banner}");
        }

        Ok(Arc::new(session))
    }

    /// Connect, hand the session out, and keep it replaced on wallet
    /// changes until a reset condition. Exactly one change subscription is
    /// live at any time; the previous one is cancelled before the next
    /// session's is installed.
    pub async fn run<F>(&self, mut on_session: F) -> Result<SessionReset, SessionError>
    where
        F: FnMut(Arc<WalletSession>),
    {
        loop {
            // Subscribe before connecting so a change racing the connect is
            // not lost.
            let mut changes = self.wallet.subscribe_changes();
            let session = self.connect().await?;
            on_session(session);

            let directive = directive_for(changes.next_event().await);
            changes.cancel();
            match directive {
                Directive::Reconnect => {
                    tracing::info!("wallet accounts changed; rebuilding session");
                    continue;
                }
                Directive::Restart(reset) => return Ok(reset),
            }
        }
    }
}

async fn connect_endpoint(url: &str) -> Result<ReadProvider, SessionError> {
    Provider::<Ws>::connect(url)
        .await
        .map_err(|e| SessionError::Endpoint {
            url: url.to_string(),
            message: e.to_string(),
        })
}
