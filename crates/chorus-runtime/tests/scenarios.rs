//! End-to-end host scenarios over the in-memory client and store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;

use chorus_core::{ChatClient, ConnectionState, Jid, MemoryChatClient, RawMessage};
use chorus_framework::wallet::CreditOptions;
use chorus_framework::{
    CHORUS_PLUGIN_API_VERSION, HandlerResult, HostClock, InlineSource, Manifest,
    ManifestOverrides, Plugin, PluginContext, PluginDescriptor, PluginFile, TaskSpec,
    TransactionKind, WalletError,
};
use chorus_runtime::{ChorusConfig, Host};

const HOST: &str = "2348000000000";
const OWNER: &str = "2348099999999";
const ALICE: &str = "2348011111111";
const BOB: &str = "2348022222222";

// ─── Plugins ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PingConfig {
    reply: String,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            reply: "pong".into(),
        }
    }
}

struct Ping;

#[async_trait]
impl Plugin for Ping {
    fn manifest(&self) -> Manifest {
        Manifest::new("ping", "1.0.0").commands(["ping"])
    }

    async fn handle(&self, ctx: &PluginContext) -> HandlerResult {
        let config: PingConfig = ctx.config()?;
        ctx.reply(config.reply).await?;
        Ok(())
    }
}

static PING: PluginDescriptor = PluginDescriptor {
    api_version: CHORUS_PLUGIN_API_VERSION,
    kind: "ping",
    description: "",
    create: || Arc::new(Ping),
};

/// `.send @<number> <amount>`
struct Pay;

#[async_trait]
impl Plugin for Pay {
    fn manifest(&self) -> Manifest {
        Manifest::new("pay", "1.0.0").commands(["send"])
    }

    async fn handle(&self, ctx: &PluginContext) -> HandlerResult {
        let sender = ctx.sender().ok_or("no sender")?.bare_number().to_string();
        let [target, amount] = ctx.args() else {
            ctx.reply("usage: send @user amount").await?;
            return Ok(());
        };
        let to = Jid::parse(target.trim_start_matches('@'))?;
        let amount: i64 = amount.parse()?;
        match ctx
            .wallet()
            .transfer(&sender, to.bare_number(), amount, "send")
            .await
        {
            Ok(_) => ctx.reply("sent").await?,
            Err(WalletError::InsufficientFunds { .. }) => ctx.reply("insufficient").await?,
            Err(e) => return Err(e.into()),
        };
        Ok(())
    }
}

static PAY: PluginDescriptor = PluginDescriptor {
    api_version: CHORUS_PLUGIN_API_VERSION,
    kind: "pay",
    description: "",
    create: || Arc::new(Pay),
};

/// Fails on everything it sees.
struct Broken;

#[async_trait]
impl Plugin for Broken {
    fn manifest(&self) -> Manifest {
        Manifest::new("broken", "1.0.0").passive()
    }

    async fn handle(&self, _ctx: &PluginContext) -> HandlerResult {
        Err("always broken".into())
    }
}

static BROKEN: PluginDescriptor = PluginDescriptor {
    api_version: CHORUS_PLUGIN_API_VERSION,
    kind: "broken",
    description: "",
    create: || Arc::new(Broken),
};

static DAILY_RUNS: AtomicUsize = AtomicUsize::new(0);

struct Daily;

#[async_trait]
impl Plugin for Daily {
    fn manifest(&self) -> Manifest {
        Manifest::new("daily", "1.0.0").task(TaskSpec::new("morning", "0 8 * * *"))
    }

    async fn handle(&self, _ctx: &PluginContext) -> HandlerResult {
        Ok(())
    }

    async fn on_task(&self, _task: &str, _ctx: &PluginContext) -> HandlerResult {
        DAILY_RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

static DAILY: PluginDescriptor = PluginDescriptor {
    api_version: CHORUS_PLUGIN_API_VERSION,
    kind: "daily",
    description: "",
    create: || Arc::new(Daily),
};

// ─── Harness ─────────────────────────────────────────────────────────────────

fn config() -> ChorusConfig {
    let mut config = ChorusConfig::default();
    config.host.owner_number = Some(OWNER.into());
    config.host.timezone = "UTC".into();
    config
}

async fn start(
    files: Vec<PluginFile>,
    config: ChorusConfig,
    clock: HostClock,
) -> (Host, Arc<MemoryChatClient>, Arc<InlineSource>) {
    let client = Arc::new(MemoryChatClient::new(Jid::parse(HOST).unwrap()));
    let source = Arc::new(InlineSource::new(files));
    let host = Host::builder(config, client.clone())
        .plugin(&PING)
        .plugin(&PAY)
        .plugin(&BROKEN)
        .plugin(&DAILY)
        .source(source.clone())
        .clock(clock)
        .start()
        .await
        .unwrap();
    (host, client, source)
}

fn text(id: &str, from: &str, body: &str) -> RawMessage {
    serde_json::from_value(json!({
        "key": { "remoteJid": from, "id": id, "fromMe": false },
        "messageTimestamp": 1_700_000_000,
        "message": { "conversation": body },
    }))
    .unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn chat(number: &str) -> Jid {
    Jid::parse(number).unwrap()
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_echo_with_cooldown() {
    let ping = PluginFile::new("ping.toml", "ping").with_overrides(ManifestOverrides {
        cooldown_ms: Some(3000),
        ..ManifestOverrides::default()
    });
    let (host, client, _) = start(vec![ping], config(), HostClock::system()).await;

    client.inject(text("p1", OWNER, ".ping")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.inject(text("p2", OWNER, ".ping")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    client.inject(text("p3", OWNER, ".ping")).await.unwrap();
    settle().await;

    assert_eq!(
        client.sent_texts(&chat(OWNER)),
        vec!["pong", "⏳ try again in 2 s", "pong"]
    );
    host.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transfer_moves_money_and_writes_two_entries() {
    let (host, client, _) = start(
        vec![PluginFile::new("pay.toml", "pay")],
        config(),
        HostClock::system(),
    )
    .await;
    let wallet = Arc::clone(&host.services().wallet);
    wallet
        .add_money(ALICE, 1000, "seed", CreditOptions::default())
        .await
        .unwrap();
    wallet.init_user(BOB).await.unwrap();

    client
        .inject(text("t1", ALICE, &format!(".send @{BOB} 400")))
        .await
        .unwrap();
    settle().await;

    assert_eq!(client.sent_texts(&chat(ALICE)), vec!["sent"]);
    let alice = wallet.get_balance(ALICE).await.unwrap();
    let bob = wallet.get_balance(BOB).await.unwrap();
    assert_eq!(alice.wallet, 600);
    assert_eq!(bob.wallet, 400);
    assert_eq!(alice.wallet + bob.wallet, 1000);

    wallet.flush_ledger().await.unwrap();
    let sends = |entries: Vec<chorus_framework::wallet::TransactionEntry>| {
        entries.into_iter().filter(|e| e.reason == "send").collect::<Vec<_>>()
    };
    let alice_entries = sends(wallet.history(ALICE, 10).await.unwrap());
    let bob_entries = sends(wallet.history(BOB, 10).await.unwrap());
    assert_eq!(alice_entries.len(), 1);
    assert_eq!(alice_entries[0].kind, TransactionKind::Debit);
    assert_eq!(bob_entries.len(), 1);
    assert_eq!(bob_entries[0].kind, TransactionKind::Credit);
    host.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_funds_changes_nothing() {
    let (host, client, _) = start(
        vec![PluginFile::new("pay.toml", "pay")],
        config(),
        HostClock::system(),
    )
    .await;
    let wallet = Arc::clone(&host.services().wallet);
    wallet
        .add_money(ALICE, 100, "seed", CreditOptions::default())
        .await
        .unwrap();

    client
        .inject(text("t1", ALICE, &format!(".send @{BOB} 500")))
        .await
        .unwrap();
    settle().await;

    assert_eq!(client.sent_texts(&chat(ALICE)), vec!["insufficient"]);
    assert_eq!(wallet.get_balance(ALICE).await.unwrap().wallet, 100);
    assert_eq!(wallet.get_balance(BOB).await.unwrap().wallet, 0);
    wallet.flush_ledger().await.unwrap();
    for user in [ALICE, BOB] {
        let history = wallet.history(user, 10).await.unwrap();
        assert!(history.iter().all(|e| e.reason != "send"));
    }
    host.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_plugin_failure_is_isolated() {
    let (host, client, _) = start(
        vec![
            PluginFile::new("a-broken.toml", "broken"),
            PluginFile::new("b-ping.toml", "ping"),
        ],
        config(),
        HostClock::system(),
    )
    .await;

    client.inject(text("m1", ALICE, "hi")).await.unwrap();
    client.inject(text("m2", ALICE, ".ping")).await.unwrap();
    settle().await;
    client.inject(text("m3", ALICE, ".ping")).await.unwrap();
    settle().await;

    assert_eq!(client.sent_texts(&chat(ALICE)), vec!["pong", "pong"]);
    assert_eq!(host.registry().stats("broken").errors, 1);
    assert_eq!(host.registry().stats("ping").errors, 0);
    assert_eq!(host.registry().stats("ping").executions, 2);
    host.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reload_is_atomic_for_inflight_commands() {
    let (host, client, source) = start(
        vec![
            PluginFile::new("admin.toml", "admin"),
            PluginFile::new("ping.toml", "ping"),
        ],
        config(),
        HostClock::system(),
    )
    .await;

    source.set(vec![
        PluginFile::new("admin.toml", "admin"),
        PluginFile::new("ping.toml", "ping").with_config(json!({ "reply": "pong v2" })),
    ]);

    let pings = 40;
    for i in 0..pings {
        if i == pings / 2 {
            client.inject(text("reload", OWNER, ".reload")).await.unwrap();
        }
        client
            .inject(text(&format!("p{i}"), ALICE, ".ping"))
            .await
            .unwrap();
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let replies = client.sent_texts(&chat(ALICE));
    assert_eq!(replies.len(), pings);
    assert!(replies.iter().all(|r| r == "pong" || r == "pong v2"));

    client.inject(text("after", ALICE, ".ping")).await.unwrap();
    settle().await;
    assert_eq!(
        client.sent_texts(&chat(ALICE)).last().map(String::as_str),
        Some("pong v2")
    );

    let admin = client.sent_texts(&chat(OWNER));
    assert_eq!(admin.len(), 1);
    assert!(admin[0].contains("1 changed"));
    host.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_task_is_suppressed_while_disconnected() {
    DAILY_RUNS.store(0, Ordering::SeqCst);
    let start_at = Utc.with_ymd_and_hms(2024, 3, 1, 7, 58, 0).unwrap();
    let (host, client, _) = start(
        vec![PluginFile::new("daily.toml", "daily")],
        config(),
        HostClock::starting_at(start_at),
    )
    .await;
    let scheduler = host.services().scheduler.clone();

    // 07:59 the session drops.
    tokio::time::sleep(Duration::from_secs(60)).await;
    client
        .set_connection_state(ConnectionState::Disconnected)
        .await
        .unwrap();

    // 08:00 passes.
    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    let stats = scheduler.task_stats("daily", "morning").unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.fired, 0);

    // Back at 08:05, nothing fires retroactively.
    tokio::time::sleep(Duration::from_secs(4 * 60)).await;
    client
        .set_connection_state(ConnectionState::Connected)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(DAILY_RUNS.load(Ordering::SeqCst), 0);

    // 08:00 the next day.
    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
    let stats = scheduler.task_stats("daily", "morning").unwrap();
    assert_eq!(stats.fired, 1);
    assert_eq!(DAILY_RUNS.load(Ordering::SeqCst), 1);
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_host_starts_from_a_plugin_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ping.toml"), "kind = \"ping\"\n").unwrap();
    let mut config = config();
    config.host.plugin_dir = dir.path().to_path_buf();

    let client = Arc::new(MemoryChatClient::new(Jid::parse(HOST).unwrap()));
    let host = Host::builder(config, client.clone())
        .plugin(&PING)
        .start()
        .await
        .unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(host.registry().resolve("ping").is_some());
    host.shutdown().await.unwrap();
}
