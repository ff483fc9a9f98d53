//! Configuration validation utilities.

use std::net::SocketAddr;

use chorus_core::Jid;
use chorus_framework::scheduler::parse_timezone;
use chrono_tz::Tz;

use super::error::{ConfigError, ConfigResult};
use super::schema::{ChorusConfig, DispatchSection, HostConfig, StoreConfig};

/// Typed values extracted while validating.
#[derive(Debug, Clone)]
pub struct ValidatedHost {
    /// Command prefix.
    pub prefix: char,
    /// Scheduler timezone.
    pub timezone: Tz,
    /// Owner, if configured.
    pub owner: Option<Jid>,
    /// Host admins.
    pub admins: Vec<Jid>,
    /// Health endpoint address, when enabled.
    pub health_bind: Option<SocketAddr>,
}

/// Validates the entire configuration.
pub fn validate_config(config: &ChorusConfig) -> ConfigResult<ValidatedHost> {
    let (prefix, timezone, owner, admins) = validate_host(&config.host)?;
    validate_store(&config.store)?;
    validate_dispatch(&config.dispatch)?;

    if config.rate_limit.capacity == 0 {
        return Err(ConfigError::validation("rate_limit.capacity must be greater than 0"));
    }
    if config.rate_limit.sweep_interval_ms == 0 {
        return Err(ConfigError::validation(
            "rate_limit.sweep_interval_ms must be greater than 0",
        ));
    }
    if config.wallet.max_wallet <= 0 || config.wallet.max_bank <= 0 {
        return Err(ConfigError::validation("wallet limits must be positive"));
    }
    if config.wallet.max_cas_retries == 0 {
        return Err(ConfigError::validation(
            "wallet.max_cas_retries must be greater than 0",
        ));
    }
    if config.scheduler.shutdown_timeout_ms == 0 {
        return Err(ConfigError::validation(
            "scheduler.shutdown_timeout_ms must be greater than 0",
        ));
    }

    let health_bind = if config.health.enabled {
        Some(config.health.bind.parse().map_err(|_| {
            ConfigError::validation(format!(
                "health.bind '{}' is not a socket address",
                config.health.bind
            ))
        })?)
    } else {
        None
    };

    Ok(ValidatedHost {
        prefix,
        timezone,
        owner,
        admins,
        health_bind,
    })
}

fn validate_host(host: &HostConfig) -> ConfigResult<(char, Tz, Option<Jid>, Vec<Jid>)> {
    let prefix = host.prefix_char().ok_or_else(|| {
        ConfigError::validation(format!(
            "prefix must be exactly one character, got '{}'",
            host.prefix
        ))
    })?;
    if prefix.is_whitespace() || prefix.is_alphanumeric() {
        return Err(ConfigError::validation(format!(
            "prefix '{prefix}' must be a symbol"
        )));
    }

    let timezone = parse_timezone(&host.timezone)
        .map_err(|_| ConfigError::UnknownTimezone(host.timezone.clone()))?;

    let owner = host
        .owner_number
        .as_deref()
        .map(|n| parse_number("owner_number", n))
        .transpose()?;
    let admins = host
        .admin_numbers
        .iter()
        .map(|n| parse_number("admin_numbers", n))
        .collect::<ConfigResult<Vec<_>>>()?;

    if host.outbound_buffer == 0 {
        return Err(ConfigError::validation(
            "host.outbound_buffer must be greater than 0",
        ));
    }
    if host.metadata_ttl_ms == 0 {
        return Err(ConfigError::validation(
            "host.metadata_ttl_ms must be greater than 0",
        ));
    }

    Ok((prefix, timezone, owner, admins))
}

fn parse_number(field: &'static str, value: &str) -> ConfigResult<Jid> {
    Jid::parse(value).map_err(|_| ConfigError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn validate_store(store: &StoreConfig) -> ConfigResult<()> {
    let known = ["memory://", "file://"];
    if !known.iter().any(|s| store.uri.starts_with(s)) {
        return Err(ConfigError::validation(format!(
            "store.uri '{}' must start with one of: {known:?}",
            store.uri
        )));
    }
    if store.uri == "file://" {
        return Err(ConfigError::validation("store.uri file:// needs a directory"));
    }

    if store.op_timeout_ms == 0 {
        return Err(ConfigError::validation("store.op_timeout_ms must be greater than 0"));
    }
    if store.max_attempts == 0 {
        return Err(ConfigError::validation("store.max_attempts must be at least 1"));
    }
    if store.base_delay_ms == 0 {
        return Err(ConfigError::validation(
            "store.base_delay_ms must be greater than 0",
        ));
    }
    if store.max_delay_ms < store.base_delay_ms {
        return Err(ConfigError::validation(
            "store.max_delay_ms must be greater than or equal to store.base_delay_ms",
        ));
    }
    if store.breaker_threshold == 0 {
        return Err(ConfigError::validation(
            "store.breaker_threshold must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_dispatch(dispatch: &DispatchSection) -> ConfigResult<()> {
    for (name, value) in [
        ("handler_timeout_ms", dispatch.handler_timeout_ms),
        ("init_timeout_ms", dispatch.init_timeout_ms),
        ("drain_timeout_ms", dispatch.drain_timeout_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::validation(format!(
                "dispatch.{name} must be greater than 0"
            )));
        }
    }
    if let Some(spam) = &dispatch.anti_spam
        && (spam.limit == 0 || spam.window_ms == 0)
    {
        return Err(ConfigError::validation(
            "dispatch.anti_spam needs a positive limit and window",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let validated = validate_config(&ChorusConfig::default()).unwrap();
        assert_eq!(validated.prefix, '.');
        assert_eq!(validated.timezone, chrono_tz::Africa::Lagos);
        assert!(validated.owner.is_none());
        assert!(validated.health_bind.is_none());
    }

    #[test]
    fn test_multi_character_prefix_is_rejected() {
        let mut config = ChorusConfig::default();
        config.host.prefix = "!!".into();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_unknown_timezone_is_rejected() {
        let mut config = ChorusConfig::default();
        config.host.timezone = "Mars/Olympus".into();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::UnknownTimezone(tz)) if tz == "Mars/Olympus"
        ));
    }

    #[test]
    fn test_bad_numbers_are_rejected() {
        let mut config = ChorusConfig::default();
        config.host.admin_numbers = vec!["2348011111111".into(), "not-a-number".into()];
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidNumber { field: "admin_numbers", .. })
        ));
    }

    #[test]
    fn test_owner_and_admins_are_parsed() {
        let mut config = ChorusConfig::default();
        config.host.owner_number = Some("2348099999999".into());
        config.host.admin_numbers = vec!["2348011111111".into()];
        let validated = validate_config(&config).unwrap();
        assert_eq!(validated.owner.unwrap().bare_number(), "2348099999999");
        assert_eq!(validated.admins.len(), 1);
    }

    #[test]
    fn test_zero_timeouts_and_bad_retries_are_rejected() {
        let mut config = ChorusConfig::default();
        config.dispatch.handler_timeout_ms = 0;
        assert!(validate_config(&config).is_err());

        let mut config = ChorusConfig::default();
        config.store.max_delay_ms = 1;
        config.store.base_delay_ms = 100;
        assert!(validate_config(&config).is_err());

        let mut config = ChorusConfig::default();
        config.store.uri = "mongodb://localhost".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_health_bind_is_parsed_when_enabled() {
        let mut config = ChorusConfig::default();
        config.health.enabled = true;
        config.health.bind = "0.0.0.0:9000".into();
        assert_eq!(
            validate_config(&config).unwrap().health_bind.unwrap().port(),
            9000
        );
        config.health.bind = "nowhere".into();
        assert!(validate_config(&config).is_err());
    }
}
