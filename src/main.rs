//! AEGIS - HIPAA Compliance Fleet Control Plane
//!
//! Main entry point for the control-plane server: migrates the schema,
//! loads the signing key, wires the domain managers, spawns the
//! background workers, and serves the HTTP surface.

use std::sync::Arc;

use aegis::api::{create_router, AppState};
use aegis::checkin::CheckinDispatcher;
use aegis::config::Config;
use aegis::crypto::credentials::CredentialMaster;
use aegis::crypto::signing::ControlPlaneSigner;
use aegis::database::Database;
use aegis::evidence::ots::OtsService;
use aegis::evidence::{EvidenceChain, FrameworkMapper};
use aegis::fleet::FleetManager;
use aegis::learning::{
    PromotionController, RuleBundlePublisher, RuleStore, RuleSyncService,
};
use aegis::orders::OrderManager;
use aegis::rollout::RolloutController;
use aegis::storage::{MinioObjectStore, ObjectStore};
use aegis::telemetry::{TelemetryArchiver, TelemetryIngest};
use aegis::workers::jobs::{
    OrderExpiryJob, OtsSubmitJob, OtsUpgradeJob, PlatformScanJob, RolloutAdvanceJob,
    RuleSyncJob, ScoreRefreshJob, TelemetryArchiveJob,
};
use aegis::workers::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("AEGIS control plane v{} starting", aegis::VERSION);

    let config = Config::from_env()?;

    // Signing key: loaded once at boot, read-only afterwards. Rotation is
    // an out-of-band deployment.
    let signer = match &config.signing_key_hex {
        Some(seed_hex) => ControlPlaneSigner::from_seed_hex(seed_hex)?,
        None => {
            log::warn!("AEGIS_SIGNING_KEY not set; using an ephemeral signing key");
            ControlPlaneSigner::generate()
        }
    };
    let control_plane_public_key = signer.public_key_hex();
    ControlPlaneSigner::init_global(signer)?;
    log::info!("Control-plane public key: {control_plane_public_key}");

    let master = Arc::new(match &config.credentials_master_hex {
        Some(secret_hex) => CredentialMaster::from_hex(secret_hex)?,
        None => {
            log::warn!("AEGIS_CREDENTIALS_MASTER not set; using an ephemeral master secret");
            CredentialMaster::generate()
        }
    });

    let db = Database::connect(&config).await?;
    db.migrate().await?;
    let pool = db.pool().clone();

    let store: Arc<dyn ObjectStore> = Arc::new(MinioObjectStore::new(&config.object_store));

    // Domain managers
    let fleet = Arc::new(FleetManager::new(pool.clone(), config.claim_code_ttl_minutes));
    let orders = Arc::new(OrderManager::new(pool.clone()));
    let evidence = Arc::new(EvidenceChain::new(pool.clone()));
    let mapper = Arc::new(FrameworkMapper::new(pool.clone()));
    let telemetry = Arc::new(TelemetryIngest::new(pool.clone()));
    let archiver = Arc::new(TelemetryArchiver::new(
        pool.clone(),
        config.telemetry_retention_days,
    ));
    let rules = RuleStore::new(pool.clone());
    let promotion = Arc::new(PromotionController::new(pool.clone()));
    let rule_sync = Arc::new(RuleSyncService::new(
        pool.clone(),
        (*orders).clone(),
        (*promotion).clone(),
    ));
    let bundles = Arc::new(RuleBundlePublisher::new(
        pool.clone(),
        rules,
        Arc::clone(&store),
    ));
    let rollout = Arc::new(RolloutController::new(
        pool.clone(),
        (*orders).clone(),
        Arc::clone(&store),
    ));
    let checkin = Arc::new(CheckinDispatcher::new(
        pool.clone(),
        (*fleet).clone(),
        (*orders).clone(),
        Arc::clone(&master),
        Arc::clone(&store),
    ));
    let ots = Arc::new(OtsService::new(pool.clone(), config.ots.clone()));

    // Background workers
    let mut scheduler = Scheduler::new();
    let cadences = &config.cadences;
    scheduler.register(&cadences.order_expiry, Arc::new(OrderExpiryJob(Arc::clone(&orders))))?;
    scheduler.register(&cadences.ots_submit, Arc::new(OtsSubmitJob(Arc::clone(&ots))))?;
    scheduler.register(&cadences.ots_upgrade, Arc::new(OtsUpgradeJob(Arc::clone(&ots))))?;
    scheduler.register(
        &cadences.telemetry_archive,
        Arc::new(TelemetryArchiveJob(Arc::clone(&archiver))),
    )?;
    scheduler.register(
        &cadences.rollout_advance,
        Arc::new(RolloutAdvanceJob(Arc::clone(&rollout))),
    )?;
    scheduler.register(
        &cadences.platform_scan,
        Arc::new(PlatformScanJob {
            promotion: Arc::clone(&promotion),
            rule_sync: Arc::clone(&rule_sync),
            bundles: Arc::clone(&bundles),
        }),
    )?;
    scheduler.register(&cadences.rule_sync, Arc::new(RuleSyncJob(Arc::clone(&rule_sync))))?;
    scheduler.register(
        &cadences.score_refresh,
        Arc::new(ScoreRefreshJob(Arc::clone(&mapper))),
    )?;
    let worker_handles = scheduler.spawn_all();
    log::info!("Spawned {} background workers", worker_handles.len());

    let state = AppState {
        fleet,
        orders,
        checkin,
        evidence,
        mapper,
        telemetry,
        promotion,
        rule_sync,
        bundles,
        rollout,
        master,
        control_plane_public_key,
        pool,
    };

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    log::info!("Listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;

    Ok(())
}
