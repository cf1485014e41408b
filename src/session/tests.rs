#![allow(non_snake_case)]

use super::*;
use crate::wallet::WalletSubscription;
use ethers::signers::LocalWallet;
use std::sync::{
    Mutex,
    atomic::AtomicUsize,
};
use tokio::sync::mpsc;

struct FakeWallet {
    accounts: Vec<Address>,
    chain: Option<u64>,
    listeners: Arc<AtomicUsize>,
    sender: Mutex<Option<mpsc::Sender<WalletEvent>>>,
}

impl FakeWallet {
    fn with_accounts(accounts: Vec<Address>) -> Self {
        Self {
            accounts,
            chain: Some(80_001),
            listeners: Arc::new(AtomicUsize::new(0)),
            sender: Mutex::new(None),
        }
    }

    fn listeners(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: WalletEvent) {
        let sender = self
            .sender
            .lock()
            .unwrap()
            .clone()
            .expect("no active subscription");
        sender.send(event).await.expect("subscription gone");
    }
}

impl WalletProvider for FakeWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        Ok(self.accounts.clone())
    }

    async fn active_chain(&self) -> Result<Option<u64>, WalletError> {
        Ok(self.chain)
    }

    fn signer(&self, _account: Address) -> Result<LocalWallet, WalletError> {
        Ok(LocalWallet::from_bytes(&[0x01; 32]).expect("static test key"))
    }

    fn subscribe_changes(&self) -> WalletSubscription {
        let (tx, rx) = mpsc::channel(8);
        *self.sender.lock().unwrap() = Some(tx);
        self.listeners.fetch_add(1, Ordering::SeqCst);
        WalletSubscription::new(rx, Some(self.listeners.clone()))
    }
}

fn account(tag: u64) -> Address {
    Address::from_low_u64_be(tag)
}

#[test]
fn select_account__two_granted_accounts_binds_the_first() {
    let granted = vec![account(1), account(2)];
    assert_eq!(select_account(&granted).unwrap(), account(1));
}

#[test]
fn select_account__zero_granted_accounts_is_an_error() {
    let err = select_account(&[]).unwrap_err();
    assert!(matches!(err, SessionError::NoAccountFound));
}

#[test]
fn generation__replacement_retires_in_flight_results() {
    // given: a call starts against generation 1
    let live = Arc::new(AtomicU64::new(0));
    let first = Generation::next(&live);
    assert!(first.is_live());
    assert_eq!(first.accept("balance"), Some("balance"));

    // when: the session is replaced
    let second = Generation::next(&live);

    // then: the late result from generation 1 is dropped, not applied
    assert!(!first.is_live());
    assert_eq!(first.accept("balance"), None);
    assert_eq!(second.accept("balance"), Some("balance"));
}

#[test]
fn mismatch_banner__names_both_networks() {
    let config = AppConfig::mumbai();

    let banner = mismatch_banner(5, &config).unwrap();
    assert!(banner.contains("chain 5"));
    assert!(banner.contains("maticmum"));
    assert!(banner.contains("80001"));

    assert!(mismatch_banner(config.chain_id, &config).is_none());
}

#[test]
fn directive_for__accounts_change_reconnects() {
    let directive = directive_for(Some(WalletEvent::AccountsChanged(vec![account(2)])));
    assert!(matches!(directive, Directive::Reconnect));
}

#[test]
fn directive_for__chain_change_restarts_from_scratch() {
    let directive = directive_for(Some(WalletEvent::ChainChanged(1)));
    assert!(matches!(
        directive,
        Directive::Restart(SessionReset::ChainChanged)
    ));
}

#[test]
fn directive_for__wallet_gone_stops_the_loop() {
    assert!(matches!(
        directive_for(None),
        Directive::Restart(SessionReset::WalletClosed)
    ));
}

#[test]
fn wallet_errors__fold_into_the_session_taxonomy() {
    let missing = WalletError::NotFound {
        name: "alice".to_string(),
        dir: "/keys".to_string(),
    };
    assert!(matches!(
        SessionError::from(missing),
        SessionError::NoWalletFound(_)
    ));

    let refused = WalletError::BadPassword("alice".to_string());
    assert!(matches!(
        SessionError::from(refused),
        SessionError::Rejected(_)
    ));
}

#[tokio::test]
async fn change_subscription__teardown_precedes_the_next_install() {
    // given
    let wallet = FakeWallet::with_accounts(vec![account(1)]);
    assert_eq!(wallet.listeners(), 0);

    // when: the session loop installs its listener pair
    let mut changes = wallet.subscribe_changes();
    assert_eq!(wallet.listeners(), 1);

    wallet
        .emit(WalletEvent::AccountsChanged(vec![account(2)]))
        .await;
    assert_eq!(
        changes.next_event().await,
        Some(WalletEvent::AccountsChanged(vec![account(2)]))
    );

    // then: cancelling returns the registration count to zero before the
    // replacement session subscribes
    changes.cancel();
    assert_eq!(wallet.listeners(), 0);

    let replacement = wallet.subscribe_changes();
    assert_eq!(wallet.listeners(), 1);
    replacement.cancel();
    assert_eq!(wallet.listeners(), 0);
}

#[tokio::test]
async fn change_subscription__drop_also_unregisters_exactly_once() {
    let wallet = FakeWallet::with_accounts(vec![account(1)]);
    {
        let _changes = wallet.subscribe_changes();
        assert_eq!(wallet.listeners(), 1);
    }
    assert_eq!(wallet.listeners(), 0);
}
