use crate::config::AppConfig;
use ethers::{
    middleware::SignerMiddleware,
    providers::{
        Provider,
        Ws,
    },
    signers::LocalWallet,
};
use std::sync::Arc;

/// Provider used for reads and log subscriptions. May be backed by a
/// different endpoint than the signer's; both observe the same contract
/// state modulo propagation delay.
pub type ReadProvider = Provider<Ws>;

/// Signer-bound middleware required for state-changing calls. Only ever
/// constructed from the live session's wallet.
pub type SignerHandle = SignerMiddleware<ReadProvider, LocalWallet>;

pub mod betting_abi {
    use ethers::contract::abigen;

    abigen!(
        BettingContract,
        r#"[
            event BetCreated(uint256 indexed bet_id, string bet_text, address indexed initiator, address indexed target, uint256 bet_amount)
            event BetStarted(uint256 indexed bet_id)
            event BetRejected(uint256 indexed bet_id)
            event BetResolved(uint256 indexed bet_id, address winner)
            event BetVoted(uint256 indexed bet_id, address voter, uint8 vote)
            event BetRefunded(uint256 indexed bet_id)
            function make_bet(string bet_text, uint256 bet_amount, address target)
            function accept_bet(uint256 bet_id)
            function reject_bet(uint256 bet_id)
            function vote(uint256 bet_id, uint8 vote_choice)
            function get_bet_details(uint256 bet_id) view returns (uint8, string, uint256, address, address, bool, bool, uint8, uint8)
            function isRefundWhitelisted(address addr) view returns (bool)
        ]"#
    );
}

pub mod erc20_abi {
    use ethers::contract::abigen;

    abigen!(
        Erc20Contract,
        r#"[
            event Transfer(address indexed from, address indexed to, uint256 value)
            event Approval(address indexed owner, address indexed spender, uint256 value)
            function name() view returns (string)
            function symbol() view returns (string)
            function decimals() view returns (uint8)
            function totalSupply() view returns (uint256)
            function balanceOf(address account) view returns (uint256)
            function allowance(address owner, address spender) view returns (uint256)
            function approve(address spender, uint256 amount) returns (bool)
        ]"#
    );
}

pub use betting_abi::{
    BetCreatedFilter,
    BetRefundedFilter,
    BetRejectedFilter,
    BetResolvedFilter,
    BetVotedFilter,
    BettingContract,
};
pub use erc20_abi::Erc20Contract;

/// Read-only handles for both contracts, bound to the configured addresses.
/// These can never submit a transaction; state-changing calls require the
/// handles from [`connected`].
pub fn read_only(
    provider: Arc<ReadProvider>,
    config: &AppConfig,
) -> (
    BettingContract<ReadProvider>,
    Erc20Contract<ReadProvider>,
) {
    let betting = BettingContract::new(config.betting_contract, provider.clone());
    let token = Erc20Contract::new(config.token_contract, provider);
    (betting, token)
}

/// Signer-connected handles for both contracts. Valid only for the session
/// whose wallet produced the middleware.
pub fn connected(
    client: Arc<SignerHandle>,
    config: &AppConfig,
) -> (
    BettingContract<SignerHandle>,
    Erc20Contract<SignerHandle>,
) {
    let betting = BettingContract::new(config.betting_contract, client.clone());
    let token = Erc20Contract::new(config.token_contract, client);
    (betting, token)
}
