//! Usage quota tracking and enforcement
//!
//! This module provides the per-account usage ledger: plan tiers and
//! their allotments, the optimistic pre-flight check, the monotonic
//! post-exchange commit, and the daily period rollover.
//!
//! The check is advisory, not a reservation: concurrent requests from
//! one account can briefly overshoot the nominal quota. The system
//! favors availability over exact enforcement at the margin.

use crate::error::{ColloquyError, Result};
use crate::storage::{Profile, SqliteStorage};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Hours between quota resets, identical across plans
const RESET_PERIOD_HOURS: i64 = 24;

/// Subscription plan tiers, ordered by capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Starter,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "starter" => Some(PlanTier::Starter),
            "pro" => Some(PlanTier::Pro),
            "enterprise" => Some(PlanTier::Enterprise),
            _ => None,
        }
    }

    /// Whether this plan may talk to an agent gated at `required`
    pub fn allows(&self, required: PlanTier) -> bool {
        *self >= required
    }
}

/// Per-period allotment for one account, in usage units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Input (prompt) unit allotment
    pub input: u64,
    /// Output (completion) unit allotment
    pub output: u64,
    /// Cached-input unit allotment
    pub cached: u64,
}

/// Consumed units within the current period
///
/// Counters are non-decreasing inside a period; only a period rollover
/// resets them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_used: u64,
    pub output_used: u64,
    pub cached_used: u64,
}

/// The allotment granted to each plan per 24h period
pub fn plan_quota(tier: PlanTier) -> Quota {
    match tier {
        PlanTier::Starter => Quota {
            input: 100_000,
            output: 25_000,
            cached: 50_000,
        },
        PlanTier::Pro => Quota {
            input: 500_000,
            output: 125_000,
            cached: 250_000,
        },
        PlanTier::Enterprise => Quota {
            input: 2_000_000,
            output: 500_000,
            cached: 1_000_000,
        },
    }
}

/// Estimate usage units for a piece of text
///
/// Simple heuristic: characters / 4 (approximates tokenization).
/// Provider-reported counts are preferred when the stream supplies them;
/// this estimate covers the pre-flight check and the fallback path.
pub fn estimate_units(text: &str) -> u64 {
    text.chars().count().div_ceil(4) as u64
}

/// Whether a ledger is due for its period rollover
pub fn should_reset(last_reset: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_reset {
        None => true,
        Some(last) => now - last >= Duration::hours(RESET_PERIOD_HOURS),
    }
}

/// Units remaining in each dimension
pub fn remaining(profile: &Profile) -> Quota {
    Quota {
        input: profile.quota.input.saturating_sub(profile.usage.input_used),
        output: profile.quota.output.saturating_sub(profile.usage.output_used),
        cached: profile.quota.cached.saturating_sub(profile.usage.cached_used),
    }
}

/// DB-backed usage ledger
///
/// Wraps the profile store with the check/commit/reset operations.
/// Cloneable handle; all clones share the same storage.
#[derive(Clone)]
pub struct UsageLedger {
    storage: Arc<SqliteStorage>,
}

impl UsageLedger {
    pub fn new(storage: Arc<SqliteStorage>) -> Self {
        Self { storage }
    }

    /// Roll the ledger over if its period has lapsed
    ///
    /// Returns the profile with a fresh allotment and zeroed usage when
    /// a reset was due, or unchanged otherwise. Inactive accounts are
    /// never reset.
    pub fn check_and_reset(&self, profile: Profile) -> Result<Profile> {
        if !profile.is_active {
            return Ok(profile);
        }
        let now = Utc::now();
        if !should_reset(profile.quota_last_reset, now) {
            return Ok(profile);
        }

        let quota = plan_quota(profile.plan);
        let usage = Usage::default();
        self.storage
            .reset_profile_ledger(&profile.id, &quota, &usage, now)?;
        tracing::info!(account = %profile.id, plan = profile.plan.as_str(), "Quota reset");

        Ok(Profile {
            quota,
            usage,
            quota_last_reset: Some(now),
            ..profile
        })
    }

    /// Pre-flight quota check with a cheap estimate
    ///
    /// Fails closed with the consumed/limit figures when the projected
    /// usage would exceed any tracked dimension. Called before any
    /// external call is made.
    pub fn check_quota(
        &self,
        profile: &Profile,
        estimated_input: u64,
        estimated_output: u64,
    ) -> Result<()> {
        let projections = [
            ("input", profile.usage.input_used, estimated_input, profile.quota.input),
            ("output", profile.usage.output_used, estimated_output, profile.quota.output),
            ("cached", profile.usage.cached_used, 0, profile.quota.cached),
        ];

        for (dimension, used, estimate, limit) in projections {
            let projected = used.saturating_add(estimate);
            if projected > limit {
                return Err(ColloquyError::QuotaExceeded {
                    dimension: dimension.to_string(),
                    used: projected,
                    limit,
                }
                .into());
            }
        }

        Ok(())
    }

    /// Add actual usage after a successful exchange
    ///
    /// Counters only ever grow; nothing is committed for incomplete or
    /// undelivered responses.
    pub fn commit_usage(
        &self,
        account_id: &str,
        actual_input: u64,
        actual_output: u64,
    ) -> Result<()> {
        let profile = self
            .storage
            .get_profile(account_id)?
            .ok_or_else(|| ColloquyError::NotFound(format!("profile {}", account_id)))?;

        let usage = Usage {
            input_used: profile.usage.input_used.saturating_add(actual_input),
            output_used: profile.usage.output_used.saturating_add(actual_output),
            cached_used: profile.usage.cached_used,
        };
        self.storage.update_profile_usage(account_id, &usage)?;

        metrics::counter!("usage_units_committed_total", actual_input + actual_output);
        Ok(())
    }

    /// Sweep every profile and roll over any lapsed ledgers
    ///
    /// Returns how many ledgers were reset. Per-profile failures are
    /// logged and skipped so one bad row never stalls the sweep.
    pub fn sweep_resets(&self) -> Result<usize> {
        let mut reset_count = 0;
        for id in self.storage.list_profile_ids()? {
            let Some(profile) = self.storage.get_profile(&id)? else {
                continue;
            };
            let was_due = profile.is_active && should_reset(profile.quota_last_reset, Utc::now());
            match self.check_and_reset(profile) {
                Ok(_) if was_due => reset_count += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(account = %id, error = %e, "Quota sweep failed for account"),
            }
        }
        Ok(reset_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger_with_profile(quota: Quota, usage: Usage) -> (TempDir, UsageLedger, Profile) {
        let dir = TempDir::new().unwrap();
        let storage =
            Arc::new(SqliteStorage::new_with_path(dir.path().join("test.db")).unwrap());
        let profile = Profile {
            id: "acct1".to_string(),
            api_token: "tok_1".to_string(),
            plan: PlanTier::Starter,
            is_active: true,
            quota,
            usage,
            quota_last_reset: Some(Utc::now()),
        };
        storage.insert_profile(&profile).unwrap();
        (dir, UsageLedger::new(storage), profile)
    }

    #[test]
    fn test_plan_tier_ordering() {
        assert!(PlanTier::Enterprise.allows(PlanTier::Starter));
        assert!(PlanTier::Pro.allows(PlanTier::Pro));
        assert!(!PlanTier::Starter.allows(PlanTier::Pro));
    }

    #[test]
    fn test_plan_tier_parse() {
        assert_eq!(PlanTier::parse("PRO"), Some(PlanTier::Pro));
        assert_eq!(PlanTier::parse("none"), None);
    }

    #[test]
    fn test_estimate_units_rounds_up() {
        assert_eq!(estimate_units(""), 0);
        assert_eq!(estimate_units("abcd"), 1);
        assert_eq!(estimate_units("abcde"), 2);
    }

    #[test]
    fn test_check_quota_passes_within_limits() {
        let quota = Quota { input: 100, output: 50, cached: 10 };
        let (_dir, ledger, profile) = ledger_with_profile(quota, Usage::default());
        assert!(ledger.check_quota(&profile, 50, 25).is_ok());
    }

    #[test]
    fn test_check_quota_fails_closed_with_figures() {
        let quota = Quota { input: 100, output: 50, cached: 10 };
        let usage = Usage { input_used: 90, output_used: 0, cached_used: 0 };
        let (_dir, ledger, profile) = ledger_with_profile(quota, usage);

        let err = ledger.check_quota(&profile, 20, 0).unwrap_err();
        let err = err.downcast::<ColloquyError>().unwrap();
        match err {
            ColloquyError::QuotaExceeded { dimension, used, limit } => {
                assert_eq!(dimension, "input");
                assert_eq!(used, 110);
                assert_eq!(limit, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_quota_covers_output_dimension() {
        let quota = Quota { input: 100, output: 50, cached: 10 };
        let (_dir, ledger, profile) = ledger_with_profile(quota, Usage::default());
        assert!(ledger.check_quota(&profile, 10, 60).is_err());
    }

    #[test]
    fn test_commit_usage_is_monotonic() {
        let quota = Quota { input: 100, output: 50, cached: 10 };
        let (_dir, ledger, profile) = ledger_with_profile(quota, Usage::default());

        ledger.commit_usage(&profile.id, 10, 5).unwrap();
        ledger.commit_usage(&profile.id, 7, 3).unwrap();

        let stored = ledger.storage.get_profile("acct1").unwrap().unwrap();
        assert_eq!(stored.usage.input_used, 17);
        assert_eq!(stored.usage.output_used, 8);
    }

    #[test]
    fn test_should_reset_after_period() {
        let now = Utc::now();
        assert!(should_reset(None, now));
        assert!(should_reset(Some(now - Duration::hours(25)), now));
        assert!(!should_reset(Some(now - Duration::hours(1)), now));
    }

    #[test]
    fn test_check_and_reset_rolls_over_lapsed_ledger() {
        let quota = Quota { input: 1, output: 1, cached: 1 };
        let usage = Usage { input_used: 1, output_used: 1, cached_used: 0 };
        let (_dir, ledger, profile) = ledger_with_profile(quota, usage);

        // Force the last reset far into the past.
        let stale = Profile {
            quota_last_reset: Some(Utc::now() - Duration::hours(48)),
            ..profile
        };
        let refreshed = ledger.check_and_reset(stale).unwrap();

        assert_eq!(refreshed.usage, Usage::default());
        assert_eq!(refreshed.quota, plan_quota(PlanTier::Starter));
        let stored = ledger.storage.get_profile("acct1").unwrap().unwrap();
        assert_eq!(stored.usage, Usage::default());
    }

    #[test]
    fn test_check_and_reset_skips_inactive_accounts() {
        let quota = Quota { input: 1, output: 1, cached: 1 };
        let usage = Usage { input_used: 1, output_used: 0, cached_used: 0 };
        let (_dir, ledger, profile) = ledger_with_profile(quota, usage);

        let inactive = Profile {
            is_active: false,
            quota_last_reset: None,
            ..profile
        };
        let unchanged = ledger.check_and_reset(inactive).unwrap();
        assert_eq!(unchanged.usage.input_used, 1);
    }

    #[test]
    fn test_remaining_saturates_at_zero() {
        let profile = Profile {
            id: "a".into(),
            api_token: "t".into(),
            plan: PlanTier::Starter,
            is_active: true,
            quota: Quota { input: 10, output: 10, cached: 10 },
            usage: Usage { input_used: 15, output_used: 4, cached_used: 0 },
            quota_last_reset: None,
        };
        let rem = remaining(&profile);
        assert_eq!(rem.input, 0);
        assert_eq!(rem.output, 6);
    }
}
