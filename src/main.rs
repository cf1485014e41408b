use color_eyre::eyre::{
    Result,
    eyre,
};
use ethers::types::{
    Address,
    U256,
};
use parlay::{
    AppConfig,
    SessionManager,
    SessionReset,
    WalletSession,
    allowance::{
        AllowanceGuard,
        SessionToken,
    },
    bet::{
        self,
        BetCreation,
        BetVote,
        format_token_amount,
        trim_address,
    },
    sync,
    tracker::{
        TransactionTracker,
        TxError,
    },
    wallet::{
        self,
        KeystoreWallet,
    },
};
use std::{
    io::BufRead,
    sync::Arc,
};
use tokio::{
    sync::{
        Mutex,
        mpsc,
    },
    task::JoinHandle,
};
use tracing_subscriber::EnvFilter;

const COMMAND_HELP: &str = "Commands:\n\
  make <target> <amount> <reason...>  challenge an address (amount in smallest units)\n\
  accept <id>                         accept a bet you were challenged to\n\
  reject <id>                         reject (or cancel) a bet\n\
  vote <id> burn|refund|defeat        vote on a started bet\n\
  whitelisted                         check the refund whitelist for your account\n\
  help                                show this list";

fn print_usage_and_exit() -> ! {
    println!(
        "Usage: parlay --wallet <name> [--wallet-dir <path>] [--config <path>]\n\
         [--ws-url <url>] [--read-url <url>]\n\
         \n\
         Flags:\n\
           --wallet <name>     Keystore file to sign with\n\
           --wallet-dir <path> Keystore directory (defaults to ~/.ethereum/keystore)\n\
           --config <path>     JSON deployment profile (defaults to the Mumbai deployment)\n\
           --ws-url <url>      Override the signer WebSocket endpoint\n\
           --read-url <url>    Separate endpoint for reads and log subscriptions"
    );
    std::process::exit(0);
}

struct CliOptions {
    wallet: String,
    wallet_dir: Option<String>,
    config: Option<String>,
    ws_url: Option<String>,
    read_url: Option<String>,
}

fn parse_cli_args() -> Result<CliOptions> {
    let mut args = std::env::args().skip(1);
    let mut wallet = None;
    let mut wallet_dir = None;
    let mut config = None;
    let mut ws_url = None;
    let mut read_url = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--wallet" => {
                let name = args
                    .next()
                    .ok_or_else(|| eyre!("--wallet requires a wallet name"))?;
                if wallet.is_some() {
                    return Err(eyre!("--wallet may only be specified once"));
                }
                wallet = Some(name);
            }
            "--wallet-dir" => {
                let dir = args
                    .next()
                    .ok_or_else(|| eyre!("--wallet-dir requires a path argument"))?;
                if wallet_dir.is_some() {
                    return Err(eyre!("--wallet-dir may only be specified once"));
                }
                wallet_dir = Some(dir);
            }
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| eyre!("--config requires a path argument"))?;
                if config.is_some() {
                    return Err(eyre!("--config may only be specified once"));
                }
                config = Some(path);
            }
            "--ws-url" => {
                let url = args
                    .next()
                    .ok_or_else(|| eyre!("--ws-url requires a URL argument"))?;
                if ws_url.is_some() {
                    return Err(eyre!("--ws-url may only be specified once"));
                }
                ws_url = Some(url);
            }
            "--read-url" => {
                let url = args
                    .next()
                    .ok_or_else(|| eyre!("--read-url requires a URL argument"))?;
                if read_url.is_some() {
                    return Err(eyre!("--read-url may only be specified once"));
                }
                read_url = Some(url);
            }
            "--help" | "-h" => print_usage_and_exit(),
            other => return Err(eyre!("Unknown argument: {other}")),
        }
    }

    let wallet =
        wallet.ok_or_else(|| eyre!("Specify --wallet <name> to select a keystore"))?;

    Ok(CliOptions {
        wallet,
        wallet_dir,
        config,
        ws_url,
        read_url,
    })
}

type CommandFeed = Arc<Mutex<mpsc::UnboundedReceiver<Command>>>;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let opts = parse_cli_args()?;
    let commands: CommandFeed = Arc::new(Mutex::new(spawn_command_reader()));
    loop {
        match run_client(&opts, &commands).await? {
            SessionReset::ChainChanged => {
                // Nothing network-scoped survives a chain switch; rebuild
                // providers, bindings and caches from zero.
                tracing::warn!("wallet network changed; restarting from a clean state");
                continue;
            }
            SessionReset::WalletClosed => break,
        }
    }
    Ok(())
}

async fn run_client(opts: &CliOptions, commands: &CommandFeed) -> Result<SessionReset> {
    let mut config = match opts.config.as_deref() {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::mumbai(),
    };
    if let Some(url) = &opts.ws_url {
        config.ws_url = url.clone();
    }
    if let Some(url) = &opts.read_url {
        config.read_url = Some(url.clone());
    }

    let dir = wallet::resolve_wallet_dir(opts.wallet_dir.as_deref())?;
    let keystore = KeystoreWallet::open(&dir, &opts.wallet)?;
    let manager = SessionManager::new(keystore, config).await?;

    // Sessions flow from the manager to a serving task; a replacement
    // session aborts whatever the previous one was doing.
    let (sessions, mut incoming) = mpsc::unbounded_channel::<Arc<WalletSession>>();
    let server = tokio::spawn({
        let commands = commands.clone();
        async move {
            let mut active: Option<AbortOnDrop> = None;
            while let Some(session) = incoming.recv().await {
                active = Some(AbortOnDrop(tokio::spawn(serve_session(
                    session,
                    commands.clone(),
                ))));
            }
            drop(active);
        }
    });

    let reset = manager
        .run(move |session| {
            let _ = sessions.send(session);
        })
        .await?;
    let _ = server.await;
    Ok(reset)
}

async fn serve_session(session: Arc<WalletSession>, commands: CommandFeed) {
    if let Err(err) = drive_session(&session, &commands).await {
        tracing::error!(%err, "session serving failed");
    }
}

async fn drive_session(
    session: &Arc<WalletSession>,
    commands: &CommandFeed,
) -> Result<()> {
    report_session(session);

    let tracker = TransactionTracker::new(&session.config);
    let _pending_logger = spawn_pending_logger(session, &tracker);

    if !session.authorized {
        let guard = AllowanceGuard::new(&session.config);
        let token = SessionToken::new(session, &tracker);
        match guard.authorize(&token, session.account).await {
            Ok(outcome) => tracing::info!(?outcome, "token allowance settled"),
            // Inline, retryable failure; the session itself stays up.
            Err(err) => tracing::error!(%err, "token authorization failed"),
        }
    }

    let mut creations = sync::watch_involved_creations(session);
    let (bet_events, mut bet_changes) = mpsc::unbounded_channel::<U256>();

    let mut involved = load_involved(session).await;
    // Held for teardown: dropping the handles unsubscribes the watches.
    let mut _bet_watches = install_bet_watches(session, &involved, &bet_events);

    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = creations.changed() => {
                if signal.is_none() {
                    return Ok(());
                }
                // Any creation anywhere signals; re-scan the involved set
                // instead of filtering client-side.
                involved = load_involved(session).await;
                _bet_watches = install_bet_watches(session, &involved, &bet_events);
            }
            Some(bet_id) = bet_changes.recv() => {
                refresh_bet(session, bet_id).await;
            }
            command = async { commands.lock().await.recv().await }, if stdin_open => {
                match command {
                    Some(command) => execute_command(session, &tracker, command).await,
                    None => stdin_open = false,
                }
            }
        }
    }
}

fn report_session(session: &WalletSession) {
    let token = &session.token_details;
    tracing::info!(
        account = %trim_address(&session.account),
        balance = %format_token_amount(session.token_balance, token.decimals),
        token = %token.symbol,
        "connected"
    );
    if let Some(banner) = session.mismatch_banner() {
        // Degraded, not fatal: prompt the user to switch networks.
        tracing::warn!("{banner}");
    }
}

async fn load_involved(session: &WalletSession) -> Vec<BetCreation> {
    match sync::list_involved_bets(session).await {
        Ok(bets) => {
            tracing::info!(count = bets.len(), "involved bets");
            for entry in &bets {
                tracing::info!(
                    id = %entry.bet_id,
                    amount = %format_token_amount(entry.amount, session.token_details.decimals),
                    "{} challenged {}: {}",
                    trim_address(&entry.initiator),
                    trim_address(&entry.target),
                    entry.text,
                );
            }
            bets
        }
        Err(err) => {
            // Scoped failure: the list is unavailable, the session is fine.
            tracing::error!(%err, "failed to list involved bets");
            Vec::new()
        }
    }
}

async fn refresh_bet(session: &WalletSession, bet_id: U256) {
    match bet::fetch_bet(session, bet_id).await {
        Ok(record) => match session.accept(record) {
            Some(record) => tracing::info!(
                id = %bet_id,
                votes_to_burn = record.vote_tally(BetVote::Burn),
                "bet changed: {}",
                record.state,
            ),
            None => tracing::debug!(id = %bet_id, "dropped refetch for a replaced session"),
        },
        Err(err) => tracing::warn!(id = %bet_id, %err, "bet refetch failed"),
    }
}

fn install_bet_watches(
    session: &Arc<WalletSession>,
    involved: &[BetCreation],
    events: &mpsc::UnboundedSender<U256>,
) -> Vec<AbortOnDrop> {
    involved
        .iter()
        .map(|entry| {
            let mut watch = sync::watch_bet(session, entry.bet_id);
            let events = events.clone();
            let bet_id = entry.bet_id;
            AbortOnDrop(tokio::spawn(async move {
                while watch.changed().await.is_some() {
                    if events.send(bet_id).is_err() {
                        break;
                    }
                }
            }))
        })
        .collect()
}

fn spawn_pending_logger(
    session: &WalletSession,
    tracker: &TransactionTracker,
) -> AbortOnDrop {
    let mut pending = tracker.pending();
    let config = session.config.clone();
    AbortOnDrop(tokio::spawn(async move {
        while pending.changed().await.is_ok() {
            let current = pending.borrow_and_update().clone();
            if let Some(tx) = current {
                match config.explorer_tx_url(&tx.hash) {
                    Some(url) => tracing::info!(%url, "transaction pending"),
                    None => tracing::info!(hash = ?tx.hash, "transaction pending"),
                }
            }
        }
    }))
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Command {
    Make {
        target: Address,
        amount: U256,
        text: String,
    },
    Accept(U256),
    Reject(U256),
    Vote(U256, BetVote),
    Whitelisted,
    Help,
}

fn spawn_command_reader() -> mpsc::UnboundedReceiver<Command> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_command(trimmed) {
                Ok(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!("{err}"),
            }
        }
    });
    rx
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let head = parts.next().ok_or_else(|| "empty command".to_string())?;
    match head {
        "make" => {
            let target = parts
                .next()
                .ok_or_else(|| "usage: make <target> <amount> <reason...>".to_string())?
                .parse::<Address>()
                .map_err(|_| "invalid target address".to_string())?;
            let amount = parse_amount(parts.next())?;
            let text = parts.collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                return Err("usage: make <target> <amount> <reason...>".to_string());
            }
            Ok(Command::Make {
                target,
                amount,
                text,
            })
        }
        "accept" => Ok(Command::Accept(parse_bet_id(parts.next())?)),
        "reject" => Ok(Command::Reject(parse_bet_id(parts.next())?)),
        "vote" => {
            let id = parse_bet_id(parts.next())?;
            let vote = match parts.next() {
                Some("burn") => BetVote::Burn,
                Some("refund") | Some("cancel") => BetVote::Cancel,
                Some("defeat") | Some("concede") => BetVote::AdmitDefeat,
                _ => return Err("usage: vote <id> burn|refund|defeat".to_string()),
            };
            Ok(Command::Vote(id, vote))
        }
        "whitelisted" => Ok(Command::Whitelisted),
        "help" => Ok(Command::Help),
        other => Err(format!("unknown command '{other}'; try 'help'")),
    }
}

fn parse_bet_id(raw: Option<&str>) -> Result<U256, String> {
    let raw = raw.ok_or_else(|| "missing bet id".to_string())?;
    U256::from_dec_str(raw).map_err(|_| format!("invalid bet id '{raw}'"))
}

fn parse_amount(raw: Option<&str>) -> Result<U256, String> {
    let raw = raw.ok_or_else(|| "missing amount".to_string())?;
    U256::from_dec_str(raw).map_err(|_| format!("invalid amount '{raw}'"))
}

async fn execute_command(
    session: &WalletSession,
    tracker: &TransactionTracker,
    command: Command,
) {
    // Which bet snapshot to refetch once the call confirms; a new creation
    // is picked up by the creation watch instead.
    let result = match command {
        Command::Help => {
            println!("{COMMAND_HELP}");
            return;
        }
        Command::Whitelisted => {
            match bet::is_refund_whitelisted(session, session.account).await {
                Ok(listed) => tracing::info!(listed, "refund whitelist status"),
                Err(err) => tracing::warn!(%err, "whitelist check failed"),
            }
            return;
        }
        Command::Make {
            target,
            amount,
            text,
        } => bet::make_bet(session, tracker, text, amount, target)
            .await
            .map(|_| None),
        Command::Accept(id) => bet::accept_bet(session, tracker, id)
            .await
            .map(|_| Some(id)),
        Command::Reject(id) => bet::reject_bet(session, tracker, id)
            .await
            .map(|_| Some(id)),
        Command::Vote(id, vote) => bet::cast_vote(session, tracker, id, vote)
            .await
            .map(|_| Some(id)),
    };

    match result {
        Ok(changed) => {
            tracing::info!("transaction confirmed");
            if let Some(id) = changed {
                refresh_bet(session, id).await;
            }
        }
        // No hash was produced; return to idle without an error banner.
        Err(TxError::Rejected) => tracing::debug!("submission rejected; back to idle"),
        Err(err) => tracing::error!(%err, "transaction failed"),
    }
}

/// Child tasks must die with the task that spawned them; a bare
/// `JoinHandle` detaches on drop instead.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    #[test]
    fn parse_command__make_collects_the_reason_text() {
        let command =
            parse_command("make 0x8A953CfE442c5E8855cc6c61b1293FA648BAE472 500 first to the summit")
                .unwrap();
        match command {
            Command::Make {
                amount, ref text, ..
            } => {
                assert_eq!(amount, U256::from(500u64));
                assert_eq!(text, "first to the summit");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parse_command__vote_accepts_the_three_choices() {
        assert_eq!(
            parse_command("vote 7 burn").unwrap(),
            Command::Vote(U256::from(7u64), BetVote::Burn)
        );
        assert_eq!(
            parse_command("vote 7 refund").unwrap(),
            Command::Vote(U256::from(7u64), BetVote::Cancel)
        );
        assert_eq!(
            parse_command("vote 7 defeat").unwrap(),
            Command::Vote(U256::from(7u64), BetVote::AdmitDefeat)
        );
    }

    #[test]
    fn parse_command__unknown_commands_are_rejected() {
        assert!(parse_command("explode 1").is_err());
        assert!(parse_command("vote 7 maybe").is_err());
        assert!(parse_command("make 0xnotanaddress 5 x").is_err());
    }
}
