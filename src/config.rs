use std::env;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::FixedOffset;

use crate::queue::CoordinatorOptions;
use crate::queue::policy::{AgingConfig, HeldPlacement, Policy, SchedulingConfig};

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub default_policy: Policy,
    pub held_placement: HeldPlacement,
    pub ticket_start_number: i32,
    pub registry_ttl: Duration,
    pub change_debounce: Duration,
    pub notify_ahead: usize,
    pub utc_offset: FixedOffset,
}

fn var_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn parse_aging(raw: &str) -> anyhow::Result<AgingConfig> {
    let step_minutes = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().with_context(|| format!("bad aging step '{s}'")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let aging = AgingConfig { step_minutes };
    aging.validate().map_err(|e| anyhow!(e))?;
    Ok(aging)
}

pub fn parse_offset(hours: i32) -> anyhow::Result<FixedOffset> {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| anyhow!("bad timezone offset {hours}h"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let aging = match env::var("QUEUE_AGING_STEP_MINUTES") {
            Ok(raw) => parse_aging(&raw)?,
            Err(_) => AgingConfig::default(),
        };
        let policy_name = env::var("QUEUE_DEFAULT_POLICY").unwrap_or_else(|_| "FIFO".to_string());
        let default_policy = Policy::from_name(&policy_name, aging)
            .ok_or_else(|| anyhow!("unknown QUEUE_DEFAULT_POLICY '{policy_name}'"))?;

        let held_name = env::var("QUEUE_HELD_PLACEMENT").unwrap_or_else(|_| "keep".to_string());
        let held_placement = HeldPlacement::from_name(&held_name)
            .ok_or_else(|| anyhow!("unknown QUEUE_HELD_PLACEMENT '{held_name}'"))?;

        let ticket_start_number = var_or("TICKET_START_NUMBER", 1i32).max(1);
        let registry_ttl = Duration::from_secs(var_or("REGISTRY_TTL_SECS", 30u64));
        let change_debounce = Duration::from_millis(var_or("CHANGE_DEBOUNCE_MS", 300u64));
        let notify_ahead = var_or("NOTIFY_AHEAD", 3usize);
        let utc_offset = parse_offset(var_or("QUEUE_TIMEZONE_OFFSET_HOURS", 7i32))?;

        Ok(Self {
            database_url,
            bind_addr,
            default_policy,
            held_placement,
            ticket_start_number,
            registry_ttl,
            change_debounce,
            notify_ahead,
            utc_offset,
        })
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            default_scheduling: SchedulingConfig {
                policy: self.default_policy.clone(),
                held: self.held_placement,
                ..SchedulingConfig::default()
            },
            start_number: self.ticket_start_number,
            notify_ahead: self.notify_ahead,
            utc_offset: self.utc_offset,
        }
    }
}
