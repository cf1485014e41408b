use crate::{
    bet::BetCreation,
    bindings::{
        BetCreatedFilter,
        ReadProvider,
    },
    session::WalletSession,
};
use ethers::{
    contract::LogMeta,
    providers::Middleware,
    types::{
        Address,
        Filter,
        H256,
        U256,
    },
};
use futures::{
    Stream,
    StreamExt,
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};


#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("historical log query failed: {0}")]
    Query(String),
    #[error("contract reported an unknown bet state discriminant {0}")]
    UnknownBetState(u8),
    #[error("contract reported an unknown bet vote discriminant {0}")]
    UnknownBetVote(u8),
}

/// Payload-free notification that a watched entity changed. Consumers
/// refetch the authoritative snapshot; the triggering log is never
/// interpreted, since delivery order across event kinds is not guaranteed.
#[derive(Clone, Copy, Debug)]
pub struct ChangeSignal;

/// The set of bets the session's account is a party to, newest first.
/// Finite and not restartable; call again to re-scan.
///
/// Two historical queries (account as initiator, account as target) run
/// concurrently from the contract's deployment block and are merged by
/// [`merge_creations`].
pub async fn list_involved_bets(
    session: &WalletSession,
) -> Result<Vec<BetCreation>, SyncError> {
    let account_topic = address_topic(session.account);
    let deployed = session.config.deployment_block;

    let mut as_initiator = session.betting.bet_created_filter().from_block(deployed);
    as_initiator.filter = as_initiator.filter.clone().topic2(account_topic);
    let mut as_target = session.betting.bet_created_filter().from_block(deployed);
    as_target.filter = as_target.filter.clone().topic3(account_topic);

    let (initiated, targeted) = tokio::try_join!(
        async {
            as_initiator
                .query_with_meta()
                .await
                .map_err(|e| SyncError::Query(e.to_string()))
        },
        async {
            as_target
                .query_with_meta()
                .await
                .map_err(|e| SyncError::Query(e.to_string()))
        },
    )?;

    let decode = |entries: Vec<(BetCreatedFilter, LogMeta)>| -> Vec<BetCreation> {
        entries
            .into_iter()
            .map(|(event, meta)| BetCreation::from_event(event, meta))
            .collect()
    };
    Ok(merge_creations(decode(initiated), decode(targeted)))
}

/// Concatenate the two scan ranges, order descending by bet id and drop
/// duplicate ids. The ranges are disjoint under the current contract design
/// (an account cannot be both parties of one bet), but that is an
/// assumption, not a guarantee; a contract version allowing self-bets would
/// make them overlap. First occurrence wins, and the record content is
/// identical either way.
pub fn merge_creations(
    initiated: Vec<BetCreation>,
    targeted: Vec<BetCreation>,
) -> Vec<BetCreation> {
    let mut merged = initiated;
    merged.extend(targeted);
    merged.sort_by(|a, b| b.bet_id.cmp(&a.bet_id));
    merged.dedup_by(|a, b| a.bet_id == b.bet_id);
    merged
}

/// Watch one bet for any state change. Four change filters (refund,
/// rejection, resolution, vote) scoped to the id feed a single signal
/// stream; which one fired is deliberately not distinguishable.
pub fn watch_bet(session: &WalletSession, bet_id: U256) -> BetWatch {
    spawn_watch(
        session.read_provider.clone(),
        change_filters(session, bet_id),
    )
}

/// Watch for new bet creations. The contract offers no live "initiator OR
/// target" filter, so this subscribes unfiltered and signals on every
/// creation; callers re-run [`list_involved_bets`] rather than filtering
/// client-side.
pub fn watch_involved_creations(session: &WalletSession) -> BetWatch {
    let filter = session.betting.bet_created_filter().filter;
    spawn_watch(session.read_provider.clone(), vec![filter])
}

fn change_filters(session: &WalletSession, bet_id: U256) -> Vec<Filter> {
    let id = uint_topic(bet_id);
    let betting = &session.betting;
    vec![
        betting.bet_refunded_filter().filter.topic1(id),
        betting.bet_rejected_filter().filter.topic1(id),
        betting.bet_resolved_filter().filter.topic1(id),
        betting.bet_voted_filter().filter.topic1(id),
    ]
}

fn uint_topic(value: U256) -> H256 {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    H256::from(buf)
}

fn address_topic(address: Address) -> H256 {
    let mut topic = H256::zero();
    topic.0[12..].copy_from_slice(address.as_bytes());
    topic
}

/// A live change watch: a signal receiver plus the handle that tears the
/// underlying subscriptions down. Not cancelling (or dropping) a watch
/// leaks its subscriptions for the session's lifetime.
pub struct BetWatch {
    signals: mpsc::Receiver<ChangeSignal>,
    handle: WatchHandle,
}

impl BetWatch {
    /// The next change signal. `None` once the watch is torn down.
    pub async fn changed(&mut self) -> Option<ChangeSignal> {
        self.signals.recv().await
    }

    /// Unregister every underlying subscription. Also happens on drop.
    pub fn cancel(self) {
        self.handle.cancel();
    }
}

pub struct WatchHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn cancel(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn spawn_watch(provider: Arc<ReadProvider>, filters: Vec<Filter>) -> BetWatch {
    let (tx, signals) = mpsc::channel(16);
    let mut tasks = Vec::with_capacity(filters.len());
    for filter in filters {
        let provider = provider.clone();
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            match provider.subscribe_logs(&filter).await {
                Ok(stream) => pump_signals(stream, tx).await,
                Err(err) => tracing::warn!(
                    %err,
                    "log subscription failed; changes will not be observed"
                ),
            }
        }));
    }
    BetWatch {
        signals,
        handle: WatchHandle { tasks },
    }
}

/// Forward every item of a log stream as one payload-free signal, until the
/// stream ends or the consumer goes away.
async fn pump_signals<S>(mut stream: S, signals: mpsc::Sender<ChangeSignal>)
where
    S: Stream + Unpin,
{
    while stream.next().await.is_some() {
        if signals.send(ChangeSignal).await.is_err() {
            break;
        }
    }
}
