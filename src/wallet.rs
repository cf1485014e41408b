use eth_keystore::decrypt_key;
use ethers::{
    signers::{
        LocalWallet,
        MnemonicBuilder,
        Signer,
        coins_bip39::English,
    },
    types::Address,
};
use rpassword::prompt_password;
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    },
};
use tokio::sync::mpsc;

/// Notification from the wallet capability. Delivery order across the two
/// kinds is not guaranteed; consumers rebuild the session rather than
/// interpret the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("no wallet named '{name}' found in {dir}")]
    NotFound { name: String, dir: String },
    #[error("failed to read wallet directory {dir}: {source}")]
    Io {
        dir: String,
        source: std::io::Error,
    },
    #[error("failed to read wallet password: {0}")]
    Prompt(String),
    #[error("invalid password for wallet '{0}'")]
    BadPassword(String),
    #[error("wallet '{0}' contained unsupported key material")]
    UnsupportedKeyMaterial(String),
    #[error("wallet holds no signer for account {0:?}")]
    UnknownAccount(Address),
}

/// The injected-wallet capability the session layer consumes: account
/// access, the wallet's own network opinion, a signer per granted account,
/// and a change subscription with symmetric teardown.
pub trait WalletProvider {
    fn request_accounts(
        &self,
    ) -> impl Future<Output = Result<Vec<Address>, WalletError>> + Send;

    /// The network the wallet considers active. `None` means the wallet has
    /// no opinion of its own and follows whatever endpoint it signs against.
    fn active_chain(&self)
    -> impl Future<Output = Result<Option<u64>, WalletError>> + Send;

    fn signer(&self, account: Address) -> Result<LocalWallet, WalletError>;

    /// Install the one account-change/network-change listener pair. The
    /// returned subscription owns the registration; dropping or cancelling
    /// it removes the listeners. Callers install at most one at a time.
    fn subscribe_changes(&self) -> WalletSubscription;
}

/// Owned change-listener registration. Replaces the attach-and-forget
/// listener pattern: teardown happens exactly once, on cancel or drop.
pub struct WalletSubscription {
    events: mpsc::Receiver<WalletEvent>,
    registered: Option<Arc<AtomicUsize>>,
    // Keeps a dormant subscription's channel open so `next_event` pends
    // instead of reporting a closed wallet.
    _keepalive: Option<mpsc::Sender<WalletEvent>>,
}

impl WalletSubscription {
    pub fn new(
        events: mpsc::Receiver<WalletEvent>,
        registered: Option<Arc<AtomicUsize>>,
    ) -> Self {
        Self {
            events,
            registered,
            _keepalive: None,
        }
    }

    /// A subscription that never fires, for wallets that cannot change
    /// account or network behind the process's back.
    pub fn dormant() -> Self {
        let (sender, events) = mpsc::channel(1);
        Self {
            events,
            registered: None,
            _keepalive: Some(sender),
        }
    }

    /// `None` means the wallet went away entirely.
    pub async fn next_event(&mut self) -> Option<WalletEvent> {
        self.events.recv().await
    }

    pub fn cancel(self) {}
}

impl Drop for WalletSubscription {
    fn drop(&mut self) {
        if let Some(counter) = self.registered.take() {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Clone, Debug)]
pub struct WalletDescriptor {
    pub name: String,
    pub path: PathBuf,
}

impl WalletDescriptor {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }
}

pub fn default_wallet_dir() -> Result<PathBuf, WalletError> {
    let home = std::env::var("HOME").map_err(|_| WalletError::Io {
        dir: "$HOME".to_string(),
        source: std::io::Error::other("HOME environment variable not set"),
    })?;
    Ok(PathBuf::from(home).join(".ethereum").join("keystore"))
}

pub fn resolve_wallet_dir(dir: Option<&str>) -> Result<PathBuf, WalletError> {
    match dir {
        Some(raw) => {
            let expanded = shellexpand::tilde(raw);
            Ok(PathBuf::from(expanded.into_owned()))
        }
        None => default_wallet_dir(),
    }
}

pub fn list_wallets(dir: &Path) -> Result<Vec<WalletDescriptor>, WalletError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let io = |source| WalletError::Io {
        dir: dir.display().to_string(),
        source,
    };
    let mut wallets = Vec::new();
    for entry in fs::read_dir(dir).map_err(io)? {
        let entry = entry.map_err(io)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let name = name.to_string();
        wallets.push(WalletDescriptor::new(name, path));
    }
    wallets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(wallets)
}

pub fn find_wallet(dir: &Path, name: &str) -> Result<WalletDescriptor, WalletError> {
    let wallets = list_wallets(dir)?;
    wallets
        .into_iter()
        .find(|w| w.name == name)
        .ok_or_else(|| WalletError::NotFound {
            name: name.to_string(),
            dir: dir.display().to_string(),
        })
}

/// Keystore-file wallet: decrypts a local key file on first account request
/// and signs with it for the rest of the process lifetime. It has no network
/// opinion and never emits change events.
pub struct KeystoreWallet {
    descriptor: WalletDescriptor,
    unlocked: Mutex<Option<LocalWallet>>,
}

impl KeystoreWallet {
    pub fn open(dir: &Path, name: &str) -> Result<Self, WalletError> {
        let descriptor = find_wallet(dir, name)?;
        Ok(Self {
            descriptor,
            unlocked: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn unlock(&self) -> Result<LocalWallet, WalletError> {
        if let Some(wallet) = self.unlocked.lock().expect("wallet lock").clone() {
            return Ok(wallet);
        }

        let prompt = format!("Enter password for wallet '{}': ", self.descriptor.name);
        let password =
            prompt_password(prompt).map_err(|e| WalletError::Prompt(e.to_string()))?;

        let secret = decrypt_key(&self.descriptor.path, password.as_bytes())
            .map_err(|_| WalletError::BadPassword(self.descriptor.name.clone()))?;

        let wallet = signer_from_key_material(&secret).ok_or_else(|| {
            WalletError::UnsupportedKeyMaterial(self.descriptor.name.clone())
        })?;

        *self.unlocked.lock().expect("wallet lock") = Some(wallet.clone());
        Ok(wallet)
    }
}

fn signer_from_key_material(secret: &[u8]) -> Option<LocalWallet> {
    if let Ok(wallet) = LocalWallet::from_bytes(secret) {
        return Some(wallet);
    }

    // Some keystores wrap a mnemonic phrase instead of a raw key.
    if let Ok(mnemonic) = std::str::from_utf8(secret) {
        let word_count = mnemonic.split_whitespace().count();
        if word_count >= 12
            && let Ok(wallet) = MnemonicBuilder::<English>::default()
                .phrase(mnemonic.trim())
                .build()
        {
            return Some(wallet);
        }
    }

    None
}

impl WalletProvider for KeystoreWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        let wallet = self.unlock()?;
        Ok(vec![wallet.address()])
    }

    async fn active_chain(&self) -> Result<Option<u64>, WalletError> {
        Ok(None)
    }

    fn signer(&self, account: Address) -> Result<LocalWallet, WalletError> {
        let unlocked = self.unlocked.lock().expect("wallet lock").clone();
        match unlocked {
            Some(wallet) if wallet.address() == account => Ok(wallet),
            _ => Err(WalletError::UnknownAccount(account)),
        }
    }

    fn subscribe_changes(&self) -> WalletSubscription {
        WalletSubscription::dormant()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("parlay-wallets-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn list_wallets__returns_sorted_descriptors() {
        let dir = scratch_dir("list");
        fs::write(dir.join("carol"), b"{}").unwrap();
        fs::write(dir.join("alice"), b"{}").unwrap();
        fs::write(dir.join(".hidden"), b"{}").unwrap();

        let wallets = list_wallets(&dir).unwrap();

        let names: Vec<_> = wallets.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "carol"]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn find_wallet__unknown_name_reports_not_found() {
        let dir = scratch_dir("find");
        let err = find_wallet(&dir, "nobody").unwrap_err();
        assert!(matches!(err, WalletError::NotFound { .. }));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn list_wallets__missing_dir_is_empty() {
        let dir = std::env::temp_dir().join("parlay-wallets-absent");
        assert!(list_wallets(&dir).unwrap().is_empty());
    }

    #[tokio::test]
    async fn dormant_subscription__does_not_report_closed_wallet() {
        let mut sub = WalletSubscription::dormant();
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            sub.next_event(),
        )
        .await;
        // Timeout, not None: the wallet is idle, not gone.
        assert!(waited.is_err());
    }
}
