//! Economy plugin for Chorus.
//!
//! Exposes the shared wallet as chat commands:
//!
//! | Command | Effect |
//! |---------|--------|
//! | `balance` (`bal`) | Shows wallet, bank and vault |
//! | `send @user <amount>` | Moves money from your wallet to theirs |
//! | `deposit <amount\|all>` | Wallet to bank |
//! | `withdraw <amount\|all>` | Bank to wallet |
//!
//! Enable it with a plugin file:
//!
//! ```toml
//! kind = "economy"
//!
//! [config]
//! currency = "🪙"
//! ```

use chorus::prelude::*;
use serde::Deserialize;
use tracing::debug;

/// Descriptor of the `economy` kind.
pub static ECONOMY: PluginDescriptor = PluginDescriptor {
    api_version: CHORUS_PLUGIN_API_VERSION,
    kind: "economy",
    description: "Wallet commands: balance, send, deposit, withdraw",
    create: || Arc::new(Economy),
};

/// Plugin configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    /// Symbol printed before amounts.
    pub currency: String,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            currency: "🪙".into(),
        }
    }
}

/// The economy plugin.
pub struct Economy;

#[async_trait]
impl Plugin for Economy {
    fn manifest(&self) -> Manifest {
        Manifest::new("economy", env!("CARGO_PKG_VERSION"))
            .category("economy")
            .description("Wallet commands")
            .commands(["balance", "send", "deposit", "withdraw"])
            .aliases(["bal"])
            .cooldown(Duration::from_secs(2))
    }

    async fn handle(&self, ctx: &PluginContext) -> HandlerResult {
        let config: EconomyConfig = ctx.config()?;
        let user = ctx.sender().ok_or("message without a sender")?.bare_number().to_string();
        let prefix = ctx.settings().prefix;

        let reply = match ctx.command().unwrap_or_default() {
            "balance" | "bal" => {
                let balance = ctx.wallet().get_balance(&user).await?;
                format!(
                    "💰 Wallet: {c}{}\n🏦 Bank: {c}{}\n🔒 Vault: {c}{}",
                    balance.wallet,
                    balance.bank,
                    balance.vault,
                    c = config.currency
                )
            }
            "send" => match parse_send(ctx) {
                Some((to, amount)) => {
                    match ctx.wallet().transfer(&user, to.bare_number(), amount, "send").await {
                        Ok(receipt) => format!(
                            "✅ Sent {c}{amount} to @{}. Wallet: {c}{}",
                            to.bare_number(),
                            receipt.from_wallet,
                            c = config.currency
                        ),
                        Err(e) => refusal(&e, &config)?,
                    }
                }
                None => format!("Usage: {prefix}send @user <amount>"),
            },
            command @ ("deposit" | "withdraw") => {
                let balance = ctx.wallet().get_balance(&user).await?;
                let available = if command == "deposit" {
                    balance.wallet
                } else {
                    balance.bank
                };
                match ctx.args().first().and_then(|a| parse_amount(a, available)) {
                    Some(amount) => {
                        let result = if command == "deposit" {
                            ctx.wallet().deposit(&user, amount).await
                        } else {
                            ctx.wallet().withdraw(&user, amount).await
                        };
                        match result {
                            Ok(after) => format!(
                                "✅ {} {c}{amount}. Wallet: {c}{} Bank: {c}{}",
                                if command == "deposit" { "Deposited" } else { "Withdrew" },
                                after.wallet,
                                after.bank,
                                c = config.currency
                            ),
                            Err(e) => refusal(&e, &config)?,
                        }
                    }
                    None => format!("Usage: {prefix}{command} <amount|all>"),
                }
            }
            other => {
                debug!(command = other, "Unhandled economy command");
                return Ok(());
            }
        };

        ctx.reply(reply).await?;
        Ok(())
    }
}

/// Recipient from the first mention, else from the first argument.
fn parse_send(ctx: &PluginContext) -> Option<(Jid, i64)> {
    let args = ctx.args();
    let mentioned = ctx.message().and_then(|m| m.mentions.first().cloned());
    let (to, amount) = match (mentioned, args) {
        (Some(jid), [.., amount]) => (jid, amount),
        (None, [to, amount, ..]) => (Jid::parse(to.trim_start_matches('@')).ok()?, amount),
        _ => return None,
    };
    let amount = amount.replace(',', "").parse::<i64>().ok()?;
    (amount > 0).then_some((to, amount))
}

fn parse_amount(arg: &str, available: i64) -> Option<i64> {
    if arg.eq_ignore_ascii_case("all") {
        return (available > 0).then_some(available);
    }
    arg.replace(',', "").parse().ok().filter(|a: &i64| *a > 0)
}

/// User-facing text for refusals; other errors propagate to the host.
fn refusal(error: &WalletError, config: &EconomyConfig) -> Result<String, BoxError> {
    let text = match error {
        WalletError::InsufficientFunds { available, .. } => {
            format!("❌ Insufficient funds: you have {}{available}", config.currency)
        }
        WalletError::SelfTransfer => "❌ You cannot send money to yourself".into(),
        WalletError::RecipientFull => "❌ Their wallet is full".into(),
        WalletError::BankFull => "❌ Your bank is full".into(),
        WalletError::WalletFull => "❌ Your wallet is full".into(),
        WalletError::InvalidAmount(_) => "❌ Amount must be at least 1".into(),
        other => return Err(other.to_string().into()),
    };
    Ok(text)
}
