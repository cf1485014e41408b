use crate::{
    bindings::BetCreatedFilter,
    session::WalletSession,
    sync::SyncError,
    tracker::{
        TransactionTracker,
        TxError,
    },
};
use ethers::{
    contract::LogMeta,
    types::{
        Address,
        TransactionReceipt,
        TxHash,
        U256,
    },
};
use std::fmt;

/// Lifecycle state of a bet, exactly as the contract reports it. Never
/// inferred locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BetState {
    NotCreated,
    Created,
    Started,
    ResolvedInitiatorWins,
    ResolvedParticipantWins,
    Canceled,
    Refunded,
    Burned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BetVote {
    None,
    Cancel,
    AdmitDefeat,
    Burn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BetRole {
    Initiator,
    Participant,
}

/// Off-chain mirror of one bet's authoritative snapshot. Replaced wholesale
/// on every refetch, never patched from event payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BetRecord {
    pub state: BetState,
    pub name: String,
    pub amount: U256,
    pub initiator: Address,
    pub participant: Address,
    pub initiator_paid: bool,
    pub participant_paid: bool,
    pub initiator_vote: BetVote,
    pub participant_vote: BetVote,
}

/// One historical `BetCreated` log with its metadata. Immutable once
/// fetched; the involved set is a deduplicated union of these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BetCreation {
    pub bet_id: U256,
    pub text: String,
    pub initiator: Address,
    pub target: Address,
    pub amount: U256,
    pub tx_hash: TxHash,
    pub block_number: u64,
}

impl BetCreation {
    pub fn from_event(event: BetCreatedFilter, meta: LogMeta) -> Self {
        BetCreation {
            bet_id: event.bet_id,
            text: event.bet_text,
            initiator: event.initiator,
            target: event.target,
            amount: event.bet_amount,
            tx_hash: meta.transaction_hash,
            block_number: meta.block_number.as_u64(),
        }
    }

    /// Whether the given account is a party to this bet.
    pub fn involves(&self, account: Address) -> bool {
        self.initiator == account || self.target == account
    }
}

impl TryFrom<u8> for BetState {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BetState::NotCreated),
            1 => Ok(BetState::Created),
            2 => Ok(BetState::Started),
            3 => Ok(BetState::ResolvedInitiatorWins),
            4 => Ok(BetState::ResolvedParticipantWins),
            5 => Ok(BetState::Canceled),
            6 => Ok(BetState::Refunded),
            7 => Ok(BetState::Burned),
            other => Err(SyncError::UnknownBetState(other)),
        }
    }
}

impl TryFrom<u8> for BetVote {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BetVote::None),
            1 => Ok(BetVote::Cancel),
            2 => Ok(BetVote::AdmitDefeat),
            3 => Ok(BetVote::Burn),
            other => Err(SyncError::UnknownBetVote(other)),
        }
    }
}

impl From<BetVote> for u8 {
    fn from(vote: BetVote) -> Self {
        match vote {
            BetVote::None => 0,
            BetVote::Cancel => 1,
            BetVote::AdmitDefeat => 2,
            BetVote::Burn => 3,
        }
    }
}

impl fmt::Display for BetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BetState::NotCreated => "smart contract execution is pending",
            BetState::Created => "waiting for party to accept",
            BetState::Started => "the bet is in progress",
            BetState::ResolvedInitiatorWins => "resolved in the initiator's favor",
            BetState::ResolvedParticipantWins => "resolved in the participant's favor",
            BetState::Canceled => "the bet has been canceled",
            BetState::Refunded => "the bet has been refunded",
            BetState::Burned => "the bet has been burned",
        };
        write!(f, "{text}")
    }
}

/// Raw `get_bet_details` return value.
pub(crate) type BetDetailsRaw =
    (u8, String, U256, Address, Address, bool, bool, u8, u8);

impl TryFrom<BetDetailsRaw> for BetRecord {
    type Error = SyncError;

    fn try_from(raw: BetDetailsRaw) -> Result<Self, Self::Error> {
        let (
            state,
            name,
            amount,
            initiator,
            participant,
            initiator_paid,
            participant_paid,
            initiator_vote,
            participant_vote,
        ) = raw;
        Ok(BetRecord {
            state: BetState::try_from(state)?,
            name,
            amount,
            initiator,
            participant,
            initiator_paid,
            participant_paid,
            initiator_vote: BetVote::try_from(initiator_vote)?,
            participant_vote: BetVote::try_from(participant_vote)?,
        })
    }
}

impl BetRecord {
    pub fn role_of(&self, account: Address) -> Option<BetRole> {
        if account == self.initiator {
            Some(BetRole::Initiator)
        } else if account == self.participant {
            Some(BetRole::Participant)
        } else {
            None
        }
    }

    /// The account's own vote and its opponent's, in that order.
    pub fn votes_seen_by(&self, account: Address) -> Option<(BetVote, BetVote)> {
        match self.role_of(account)? {
            BetRole::Initiator => Some((self.initiator_vote, self.participant_vote)),
            BetRole::Participant => Some((self.participant_vote, self.initiator_vote)),
        }
    }

    pub fn vote_tally(&self, vote: BetVote) -> usize {
        usize::from(self.initiator_vote == vote)
            + usize::from(self.participant_vote == vote)
    }
}

/// Authoritative snapshot refetch via the read-only handle.
pub async fn fetch_bet(
    session: &WalletSession,
    bet_id: U256,
) -> Result<BetRecord, SyncError> {
    let raw = session
        .betting
        .get_bet_details(bet_id)
        .call()
        .await
        .map_err(|e| SyncError::Query(e.to_string()))?;
    BetRecord::try_from(raw)
}

pub async fn is_refund_whitelisted(
    session: &WalletSession,
    account: Address,
) -> Result<bool, SyncError> {
    session
        .betting
        .is_refund_whitelisted(account)
        .call()
        .await
        .map_err(|e| SyncError::Query(e.to_string()))
}

pub async fn make_bet(
    session: &WalletSession,
    tracker: &TransactionTracker,
    text: impl Into<String>,
    amount: U256,
    target: Address,
) -> Result<TransactionReceipt, TxError> {
    let call = session
        .betting_connected
        .make_bet(text.into(), amount, target);
    tracker.submit(call).await
}

pub async fn accept_bet(
    session: &WalletSession,
    tracker: &TransactionTracker,
    bet_id: U256,
) -> Result<TransactionReceipt, TxError> {
    tracker
        .submit(session.betting_connected.accept_bet(bet_id))
        .await
}

pub async fn reject_bet(
    session: &WalletSession,
    tracker: &TransactionTracker,
    bet_id: U256,
) -> Result<TransactionReceipt, TxError> {
    tracker
        .submit(session.betting_connected.reject_bet(bet_id))
        .await
}

pub async fn cast_vote(
    session: &WalletSession,
    tracker: &TransactionTracker,
    bet_id: U256,
    vote: BetVote,
) -> Result<TransactionReceipt, TxError> {
    tracker
        .submit(session.betting_connected.vote(bet_id, vote.into()))
        .await
}

/// `0x1234…abcd` shortening for addresses and hashes.
pub fn trim_hex(full: &str) -> String {
    if full.len() <= 10 {
        return full.to_string();
    }
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}

pub fn trim_address(address: &Address) -> String {
    trim_hex(&format!("{address:?}"))
}

/// Integer smallest-unit amount rendered with the token's decimal point,
/// trailing zeros trimmed down to one decimal place.
pub fn format_token_amount(amount: U256, decimals: u8) -> String {
    let Ok(text) = ethers::utils::format_units(amount, u32::from(decimals)) else {
        return amount.to_string();
    };
    match text.split_once('.') {
        None => text,
        Some((whole, frac)) => {
            let frac = frac.trim_end_matches('0');
            if frac.is_empty() {
                format!("{whole}.0")
            } else {
                format!("{whole}.{frac}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    fn raw_details() -> BetDetailsRaw {
        (
            2,
            "first to the summit".to_string(),
            U256::from(1_500u64),
            Address::from_low_u64_be(1),
            Address::from_low_u64_be(2),
            true,
            true,
            0,
            3,
        )
    }

    #[test]
    fn bet_record__maps_raw_details() {
        let record = BetRecord::try_from(raw_details()).unwrap();

        assert_eq!(record.state, BetState::Started);
        assert_eq!(record.name, "first to the summit");
        assert_eq!(record.amount, U256::from(1_500u64));
        assert_eq!(record.initiator_vote, BetVote::None);
        assert_eq!(record.participant_vote, BetVote::Burn);
    }

    #[test]
    fn bet_record__unknown_state_discriminant_is_an_error() {
        let mut raw = raw_details();
        raw.0 = 8;
        let err = BetRecord::try_from(raw).unwrap_err();
        assert!(matches!(err, SyncError::UnknownBetState(8)));
    }

    #[test]
    fn bet_record__unknown_vote_discriminant_is_an_error() {
        let mut raw = raw_details();
        raw.8 = 9;
        let err = BetRecord::try_from(raw).unwrap_err();
        assert!(matches!(err, SyncError::UnknownBetVote(9)));
    }

    #[test]
    fn bet_vote__round_trips_through_u8() {
        for vote in [
            BetVote::None,
            BetVote::Cancel,
            BetVote::AdmitDefeat,
            BetVote::Burn,
        ] {
            assert_eq!(BetVote::try_from(u8::from(vote)).unwrap(), vote);
        }
    }

    #[test]
    fn votes_seen_by__orders_own_vote_first() {
        let record = BetRecord::try_from(raw_details()).unwrap();
        let initiator = Address::from_low_u64_be(1);
        let participant = Address::from_low_u64_be(2);
        let outsider = Address::from_low_u64_be(3);

        assert_eq!(
            record.votes_seen_by(initiator),
            Some((BetVote::None, BetVote::Burn))
        );
        assert_eq!(
            record.votes_seen_by(participant),
            Some((BetVote::Burn, BetVote::None))
        );
        assert_eq!(record.votes_seen_by(outsider), None);
    }

    #[test]
    fn vote_tally__counts_both_parties() {
        let mut record = BetRecord::try_from(raw_details()).unwrap();
        record.initiator_vote = BetVote::Burn;
        assert_eq!(record.vote_tally(BetVote::Burn), 2);
        assert_eq!(record.vote_tally(BetVote::Cancel), 0);
    }

    #[test]
    fn trim_hex__shortens_long_values_only() {
        assert_eq!(
            trim_hex("0x8A953CfE442c5E8855cc6c61b1293FA648BAE472"),
            "0x8A95...E472"
        );
        assert_eq!(trim_hex("0xabcd"), "0xabcd");
    }

    #[test]
    fn format_token_amount__trims_trailing_zeros() {
        assert_eq!(
            format_token_amount(U256::exp10(18), 18),
            "1.0"
        );
        assert_eq!(
            format_token_amount(U256::from(1_500_000u64), 6),
            "1.5"
        );
        assert_eq!(format_token_amount(U256::from(42u64), 0), "42.0");
        assert_eq!(format_token_amount(U256::zero(), 18), "0.0");
    }
}
