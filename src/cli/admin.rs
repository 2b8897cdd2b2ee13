// src/cli/admin.rs — Operator commands: sweep, estimate, grant, users, rules

use chrono::{DateTime, NaiveDate, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::entitlement::effective_tier;
use crate::core::ledger::CreditLedger;
use crate::core::pricing::QuantityParams;
use crate::core::reaper::ZombieReaper;
use crate::core::types::{CapabilityRef, Tier};
use crate::infra::config::Config;
use crate::infra::daemon::{build_rules, open_store};
use crate::infra::errors::GenTaskError;
use crate::rules::file::RuleSet;
use crate::store::{StoreHandle, UserDirectory};

fn ledger(config: &Config, store: &StoreHandle) -> Result<CreditLedger, GenTaskError> {
    let handle = Arc::new(store.clone());
    Ok(CreditLedger::new(
        handle.clone(),
        handle,
        build_rules(config, store)?,
    ))
}

/// One reaper pass, outside the daemon and without the lease.
pub async fn run_sweep(config: &Config, threshold_secs: Option<u64>) -> anyhow::Result<()> {
    let threshold = threshold_secs.unwrap_or(config.reaper.threshold_secs);
    let (store, _) = open_store(config)?;
    let reaper = ZombieReaper::new(Arc::new(store), config.reaper.batch_size);
    let report = reaper.sweep(Duration::from_secs(threshold)).await?;

    println!(
        "Examined {} stale task(s): {} failed, {} refunded ({} credits).",
        report.examined, report.failed, report.refunded, report.credits_refunded
    );
    Ok(())
}

/// Parse `model:<binding>`, `node:<type>` or `module:<kind>`. A bare value is
/// taken as a model binding.
pub fn capability_from_key(key: &str) -> Result<CapabilityRef, GenTaskError> {
    let (prefix, value) = key.split_once(':').unwrap_or(("model", key));
    if value.is_empty() {
        return Err(GenTaskError::Validation(format!(
            "capability '{key}' has no value"
        )));
    }
    let mut cap = CapabilityRef::default();
    match prefix {
        "model" => cap.model = Some(value.to_string()),
        "node" => cap.node_type = Some(value.to_string()),
        "module" => cap.module = Some(value.to_string()),
        other => {
            return Err(GenTaskError::Validation(format!(
                "unknown capability prefix '{other}' (expected model, node or module)"
            )))
        }
    }
    Ok(cap)
}

pub async fn run_estimate(
    config: &Config,
    capability: &str,
    quantity: QuantityParams,
) -> anyhow::Result<()> {
    let cap = capability_from_key(capability)?;
    let (store, _) = open_store(config)?;
    let credits = ledger(config, &store)?.estimate(&cap, &quantity).await?;
    println!("{cap}: {credits} credits");
    Ok(())
}

pub async fn run_grant(
    config: &Config,
    user_id: &str,
    amount: i64,
    description: &str,
) -> anyhow::Result<()> {
    let (store, _) = open_store(config)?;
    let balance = ledger(config, &store)?
        .grant(user_id, amount, description)
        .await?;
    println!("Granted {amount} credits to {user_id}. Balance: {balance}");
    Ok(())
}

/// RFC 3339, or a bare date meaning the last second of that day (UTC).
pub fn parse_expiry(value: &str) -> Result<DateTime<Utc>, GenTaskError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| GenTaskError::Validation(format!("invalid expiry '{value}'")))
}

pub async fn run_user_add(
    config: &Config,
    user_id: &str,
    tier: &str,
    expires: Option<&str>,
) -> anyhow::Result<()> {
    let tier: Tier = tier.parse()?;
    let expires = expires.map(parse_expiry).transpose()?;
    if expires.is_some() && !tier.is_membership() {
        println!("Note: expiry only applies to vip and svip memberships.");
    }

    let (store, _) = open_store(config)?;
    let account = store.upsert_user(user_id, tier, expires).await?;
    println!(
        "User {} is {} (balance {})",
        account.id, account.tier, account.balance
    );
    Ok(())
}

pub async fn run_user_show(config: &Config, user_id: &str, limit: u32) -> anyhow::Result<()> {
    let (store, _) = open_store(config)?;
    let Some(account) = store.account(user_id).await? else {
        println!("No user '{user_id}'.");
        return Ok(());
    };

    let effective = effective_tier(&account, Utc::now());
    println!("User:    {}", account.id);
    match account.membership_expires_at {
        Some(exp) => println!("Tier:    {} (effective {effective}, expires {exp})", account.tier),
        None => println!("Tier:    {}", account.tier),
    }
    println!("Balance: {}", account.balance);

    let transactions = ledger(config, &store)?.transactions(user_id, limit).await?;
    if !transactions.is_empty() {
        println!();
        for t in transactions {
            println!(
                "  {}  {:>8}  {:>8}  {:<8} {}",
                t.created_at.format("%Y-%m-%d %H:%M"),
                t.amount,
                t.balance_after,
                t.kind.as_str(),
                t.description
            );
        }
    }
    Ok(())
}

pub async fn run_rules_import(config: &Config, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)?;
    let set: RuleSet = toml::from_str(&content)
        .map_err(|e| GenTaskError::Config(format!("invalid rules file: {e}")))?;
    let (store, _) = open_store(config)?;
    let imported = store.import_rules(set).await?;
    println!("Imported {imported} rule(s) from {}", file.display());
    if config.rules.file.is_some() {
        println!("Note: [rules].file is set, so `serve` reads that file instead of the database.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_keys() {
        let cap = capability_from_key("model:openai/dall-e-3").unwrap();
        assert_eq!(cap.usage_key(), "model:openai/dall-e-3");
        let cap = capability_from_key("module:video").unwrap();
        assert_eq!(cap.lookup_keys(), vec!["module:video"]);
        let cap = capability_from_key("kling/v2").unwrap();
        assert_eq!(cap.model.as_deref(), Some("kling/v2"));
        assert!(capability_from_key("node:").is_err());
        assert!(capability_from_key("tier:vip").is_err());
    }

    #[test]
    fn test_parse_expiry() {
        let end_of_day = parse_expiry("2026-12-31").unwrap();
        assert_eq!(end_of_day.to_rfc3339(), "2026-12-31T23:59:59+00:00");
        let exact = parse_expiry("2026-12-31T08:00:00+02:00").unwrap();
        assert_eq!(exact.to_rfc3339(), "2026-12-31T06:00:00+00:00");
        assert!(parse_expiry("next week").is_err());
    }
}
