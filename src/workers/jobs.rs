//! Concrete background jobs.

use async_trait::async_trait;
use std::sync::Arc;

use crate::evidence::ots::OtsService;
use crate::evidence::FrameworkMapper;
use crate::learning::{PromotionController, RuleBundlePublisher, RuleSyncService};
use crate::orders::OrderManager;
use crate::rollout::RolloutController;
use crate::telemetry::TelemetryArchiver;

use super::scheduler::Job;

/// Batch size for the OpenTimestamps workers
const OTS_BATCH: i64 = 100;

/// Flips pending orders past their TTL to `expired`
pub struct OrderExpiryJob(pub Arc<OrderManager>);

#[async_trait]
impl Job for OrderExpiryJob {
    fn name(&self) -> &str {
        "order-expiry"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let expired = self.0.expire_sweep().await?;
        if expired > 0 {
            log::info!("Expired {expired} stale orders");
        }
        Ok(())
    }
}

/// Submits pending bundle hashes to OpenTimestamps calendars
pub struct OtsSubmitJob(pub Arc<OtsService>);

#[async_trait]
impl Job for OtsSubmitJob {
    fn name(&self) -> &str {
        "ots-submit"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.0.submit_pending(OTS_BATCH).await?;
        Ok(())
    }
}

/// Upgrades calendar proofs to Bitcoin-anchored proofs
pub struct OtsUpgradeJob(pub Arc<OtsService>);

#[async_trait]
impl Job for OtsUpgradeJob {
    fn name(&self) -> &str {
        "ots-upgrade"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.0.upgrade_pending(OTS_BATCH).await?;
        Ok(())
    }
}

/// Rolls aged telemetry into the archive
pub struct TelemetryArchiveJob(pub Arc<TelemetryArchiver>);

#[async_trait]
impl Job for TelemetryArchiveJob {
    fn name(&self) -> &str {
        "telemetry-archive"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.0.run().await?;
        Ok(())
    }
}

/// Advances every active rollout one cycle
pub struct RolloutAdvanceJob(pub Arc<RolloutController>);

#[async_trait]
impl Job for RolloutAdvanceJob {
    fn name(&self) -> &str {
        "rollout-advance"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.0.advance_all().await?;
        Ok(())
    }
}

/// Auto-promotes qualifying cross-client patterns and republishes the
/// rule bundles when anything changed
pub struct PlatformScanJob {
    /// Promotion controller
    pub promotion: Arc<PromotionController>,
    /// Sync service for the generated deployments
    pub rule_sync: Arc<RuleSyncService>,
    /// Bundle publisher
    pub bundles: Arc<RuleBundlePublisher>,
}

#[async_trait]
impl Job for PlatformScanJob {
    fn name(&self) -> &str {
        "platform-scan"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let promoted = self.promotion.auto_promote_platform().await?;
        if !promoted.is_empty() {
            self.rule_sync.deliver_pending().await?;
            self.bundles.publish_all().await?;
        }
        Ok(())
    }
}

/// Retries pending rule deliveries and revocation orders
pub struct RuleSyncJob(pub Arc<RuleSyncService>);

#[async_trait]
impl Job for RuleSyncJob {
    fn name(&self) -> &str {
        "rule-sync"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.0.deliver_pending().await?;
        self.0.deliver_revocations().await?;
        Ok(())
    }
}

/// Recomputes compliance scores across the fleet
pub struct ScoreRefreshJob(pub Arc<FrameworkMapper>);

#[async_trait]
impl Job for ScoreRefreshJob {
    fn name(&self) -> &str {
        "score-refresh"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.0.refresh_all().await?;
        Ok(())
    }
}
