//! Embedded schema migrations.
//!
//! The schema is the authoritative table contract (§ data model): domain
//! managers implement aggregation and counters as transactional code, and
//! triggers exist only for append-only enforcement. Migrations are applied
//! in order by [`crate::database::migrations::run`].

/// One embedded migration
pub struct EmbeddedMigration {
    /// Monotonic string version, zero-padded
    pub version: &'static str,
    /// Human-readable name recorded in `schema_migrations`
    pub name: &'static str,
    /// The SQL applied in a single transaction
    pub sql: &'static str,
}

/// The full linear migration set, in apply order
pub const MIGRATIONS: &[EmbeddedMigration] = &[
    EmbeddedMigration {
        version: "0001",
        name: "fleet_core",
        sql: r#"
CREATE TABLE client_orgs (
    org_id          TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    partner_id      TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE sites (
    site_id         TEXT PRIMARY KEY,
    org_id          TEXT REFERENCES client_orgs(org_id),
    name            TEXT NOT NULL,
    healing_tier    TEXT NOT NULL DEFAULT 'standard'
                    CHECK (healing_tier IN ('standard', 'full_coverage')),
    frameworks      TEXT[] NOT NULL DEFAULT '{hipaa}',
    ots_enabled     BOOLEAN NOT NULL DEFAULT false,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE appliances (
    appliance_id            TEXT PRIMARY KEY,
    site_id                 TEXT NOT NULL REFERENCES sites(site_id),
    status                  TEXT NOT NULL DEFAULT 'active'
                            CHECK (status IN ('active', 'suspended')),
    agent_version           TEXT,
    current_version         TEXT,
    active_partition        TEXT NOT NULL DEFAULT 'A'
                            CHECK (active_partition IN ('A', 'B')),
    capability_tier         SMALLINT NOT NULL DEFAULT 0
                            CHECK (capability_tier BETWEEN 0 AND 2),
    l2_mode                 TEXT NOT NULL DEFAULT 'manual'
                            CHECK (l2_mode IN ('auto', 'manual', 'disabled')),
    credentials_version     INTEGER NOT NULL DEFAULT 0,
    credentials_provisioned_at TIMESTAMPTZ,
    evidence_rejection_count INTEGER NOT NULL DEFAULT 0,
    last_evidence_accepted  TIMESTAMPTZ,
    last_evidence_rejection TIMESTAMPTZ,
    public_key              TEXT NOT NULL,
    checkin_secret          TEXT NOT NULL,
    last_seen               TIMESTAMPTZ,
    uptime_seconds          BIGINT,
    provisioned_at          TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX idx_appliances_site ON appliances(site_id);

CREATE TABLE appliance_claim_codes (
    code            TEXT PRIMARY KEY,
    site_id         TEXT NOT NULL REFERENCES sites(site_id),
    expires_at      TIMESTAMPTZ NOT NULL,
    used_at         TIMESTAMPTZ,
    used_by         TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE site_credentials (
    site_id         TEXT NOT NULL REFERENCES sites(site_id),
    version         INTEGER NOT NULL,
    ciphertext      TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (site_id, version)
);
"#,
    },
    EmbeddedMigration {
        version: "0002",
        name: "orders",
        sql: r#"
CREATE TABLE orders (
    order_id        UUID PRIMARY KEY,
    kind            TEXT NOT NULL
                    CHECK (kind IN ('appliance', 'fleet', 'healing')),
    appliance_id    TEXT REFERENCES appliances(appliance_id),
    site_id         TEXT REFERENCES sites(site_id),
    command_type    TEXT NOT NULL,
    parameters      JSONB NOT NULL DEFAULT '{}',
    runbook_id      TEXT,
    skip_version    TEXT,
    dedup_key       TEXT,
    nonce           UUID NOT NULL UNIQUE,
    signed_payload  TEXT NOT NULL,
    signature       TEXT NOT NULL,
    issued_at       TIMESTAMPTZ NOT NULL,
    expires_at      TIMESTAMPTZ NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'acknowledged', 'executing',
                                      'completed', 'failed', 'expired')),
    result          JSONB,
    error           TEXT,
    created_by      TEXT NOT NULL DEFAULT 'control-plane',
    acknowledged_at TIMESTAMPTZ,
    completed_at    TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    CHECK (kind = 'fleet' OR appliance_id IS NOT NULL)
);

CREATE INDEX idx_orders_dequeue
    ON orders(appliance_id, status, expires_at)
    WHERE status = 'pending';

CREATE INDEX idx_orders_fleet_pending
    ON orders(status) WHERE kind = 'fleet' AND status = 'pending';

CREATE UNIQUE INDEX idx_orders_dedup
    ON orders(appliance_id, command_type, dedup_key)
    WHERE dedup_key IS NOT NULL
      AND status IN ('pending', 'acknowledged', 'executing');

CREATE TABLE fleet_order_completions (
    fleet_order_id  UUID NOT NULL REFERENCES orders(order_id),
    appliance_id    TEXT NOT NULL REFERENCES appliances(appliance_id),
    status          TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
    result          JSONB,
    completed_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (fleet_order_id, appliance_id)
);
"#,
    },
    EmbeddedMigration {
        version: "0003",
        name: "evidence_chain",
        sql: r#"
CREATE TABLE evidence_bundles (
    bundle_id       TEXT PRIMARY KEY,
    site_id         TEXT NOT NULL REFERENCES sites(site_id),
    appliance_id    TEXT NOT NULL REFERENCES appliances(appliance_id),
    check_type      TEXT NOT NULL,
    check_result    TEXT NOT NULL
                    CHECK (check_result IN ('pass', 'fail', 'warn')),
    checks          JSONB NOT NULL,
    summary         TEXT,
    bundle_hash     TEXT NOT NULL,
    prev_bundle_id  TEXT,
    prev_hash       TEXT NOT NULL,
    chain_position  BIGINT NOT NULL,
    chain_hash      TEXT NOT NULL,
    signature       TEXT NOT NULL,
    signed_data     TEXT NOT NULL,
    signature_valid BOOLEAN NOT NULL,
    checked_at      TIMESTAMPTZ NOT NULL,
    ntp_verification JSONB,
    ots_status      TEXT NOT NULL DEFAULT 'none'
                    CHECK (ots_status IN ('none', 'pending', 'anchored', 'verified')),
    ots_submitted_at TIMESTAMPTZ,
    ots_anchored_at TIMESTAMPTZ,
    ots_error       TEXT,
    submitted_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (site_id, chain_position)
);

CREATE INDEX idx_evidence_ots_pending
    ON evidence_bundles(ots_status, submitted_at)
    WHERE ots_status = 'pending';

-- Evidence content is immutable once written. Chain metadata (prev_hash,
-- chain_position, chain_hash, prev_bundle_id) stays writable for the repair
-- procedure; ots_* columns stay writable for the anchoring workers.
CREATE OR REPLACE FUNCTION reject_evidence_content_mutation() RETURNS trigger AS $$
BEGIN
    IF TG_OP = 'DELETE' THEN
        RAISE EXCEPTION 'evidence_bundles is append-only';
    END IF;
    IF NEW.checks IS DISTINCT FROM OLD.checks
       OR NEW.bundle_hash IS DISTINCT FROM OLD.bundle_hash
       OR NEW.signature IS DISTINCT FROM OLD.signature
       OR NEW.signed_data IS DISTINCT FROM OLD.signed_data
       OR NEW.check_type IS DISTINCT FROM OLD.check_type
       OR NEW.check_result IS DISTINCT FROM OLD.check_result
       OR NEW.checked_at IS DISTINCT FROM OLD.checked_at THEN
        RAISE EXCEPTION 'evidence content fields are immutable';
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER trg_evidence_append_only
    BEFORE UPDATE OR DELETE ON evidence_bundles
    FOR EACH ROW EXECUTE FUNCTION reject_evidence_content_mutation();

CREATE TABLE ots_proofs (
    proof_id        UUID PRIMARY KEY,
    bundle_id       TEXT NOT NULL REFERENCES evidence_bundles(bundle_id),
    calendar_url    TEXT NOT NULL,
    proof_data      TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'calendar'
                    CHECK (status IN ('calendar', 'bitcoin')),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    upgraded_at     TIMESTAMPTZ
);

CREATE INDEX idx_ots_proofs_bundle ON ots_proofs(bundle_id);

CREATE TABLE check_control_mappings (
    check_type      TEXT NOT NULL,
    framework       TEXT NOT NULL,
    control_id      TEXT NOT NULL,
    PRIMARY KEY (check_type, framework, control_id)
);

CREATE TABLE evidence_framework_mappings (
    bundle_id       TEXT NOT NULL REFERENCES evidence_bundles(bundle_id),
    framework       TEXT NOT NULL,
    control_id      TEXT NOT NULL,
    PRIMARY KEY (bundle_id, framework, control_id)
);

CREATE OR REPLACE FUNCTION reject_any_mutation() RETURNS trigger AS $$
BEGIN
    RAISE EXCEPTION '% is append-only', TG_TABLE_NAME;
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER trg_framework_mappings_append_only
    BEFORE UPDATE OR DELETE ON evidence_framework_mappings
    FOR EACH ROW EXECUTE FUNCTION reject_any_mutation();

CREATE TABLE compliance_scores (
    appliance_id    TEXT NOT NULL REFERENCES appliances(appliance_id),
    framework       TEXT NOT NULL,
    score           DOUBLE PRECISION NOT NULL,
    controls_passing INTEGER NOT NULL,
    controls_total  INTEGER NOT NULL,
    computed_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (appliance_id, framework)
);
"#,
    },
    EmbeddedMigration {
        version: "0004",
        name: "telemetry_learning",
        sql: r#"
CREATE TABLE execution_telemetry (
    execution_id    TEXT PRIMARY KEY,
    incident_id     TEXT,
    site_id         TEXT NOT NULL REFERENCES sites(site_id),
    appliance_id    TEXT NOT NULL REFERENCES appliances(appliance_id),
    runbook_id      TEXT,
    hostname        TEXT NOT NULL,
    platform        TEXT NOT NULL,
    incident_type   TEXT NOT NULL,
    success         BOOLEAN NOT NULL,
    resolution_level TEXT NOT NULL
                    CHECK (resolution_level IN ('L1', 'L2', 'L3')),
    duration_seconds DOUBLE PRECISION,
    state_before    JSONB,
    state_after     JSONB,
    state_diff      JSONB,
    failure_type    TEXT,
    cost_usd        DOUBLE PRECISION,
    input_tokens    BIGINT,
    output_tokens   BIGINT,
    pattern_signature TEXT NOT NULL,
    recorded_at     TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX idx_telemetry_site_recorded ON execution_telemetry(site_id, recorded_at);
CREATE INDEX idx_telemetry_age ON execution_telemetry(recorded_at);

CREATE TABLE telemetry_archive (
    site_id         TEXT NOT NULL,
    pattern_signature TEXT NOT NULL,
    period          DATE NOT NULL,
    total_occurrences BIGINT NOT NULL,
    success_count   BIGINT NOT NULL,
    l1_count        BIGINT NOT NULL,
    l2_count        BIGINT NOT NULL,
    l3_count        BIGINT NOT NULL,
    avg_duration_seconds DOUBLE PRECISION,
    archived_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (site_id, pattern_signature, period)
);

CREATE TABLE l1_rules (
    rule_id         TEXT PRIMARY KEY,
    incident_pattern JSONB NOT NULL,
    runbook_id      TEXT NOT NULL,
    confidence      DOUBLE PRECISION NOT NULL DEFAULT 0,
    enabled         BOOLEAN NOT NULL DEFAULT true,
    source          TEXT NOT NULL DEFAULT 'builtin'
                    CHECK (source IN ('builtin', 'promoted', 'platform')),
    match_count     BIGINT NOT NULL DEFAULT 0,
    success_count   BIGINT NOT NULL DEFAULT 0,
    failure_count   BIGINT NOT NULL DEFAULT 0,
    success_rate    DOUBLE PRECISION GENERATED ALWAYS AS
                    (CASE WHEN match_count > 0
                          THEN success_count::double precision / match_count
                          ELSE 0 END) STORED,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE runbook_id_mappings (
    l1_rule_id      TEXT PRIMARY KEY,
    runbook_id      TEXT NOT NULL
);

CREATE TABLE aggregated_pattern_stats (
    site_id         TEXT NOT NULL REFERENCES sites(site_id),
    pattern_signature TEXT NOT NULL,
    total_occurrences BIGINT NOT NULL DEFAULT 0,
    l1_count        BIGINT NOT NULL DEFAULT 0,
    l2_count        BIGINT NOT NULL DEFAULT 0,
    l3_count        BIGINT NOT NULL DEFAULT 0,
    success_count   BIGINT NOT NULL DEFAULT 0,
    success_rate    DOUBLE PRECISION NOT NULL DEFAULT 0,
    avg_resolution_time_ms DOUBLE PRECISION,
    recommended_action TEXT,
    promotion_eligible BOOLEAN NOT NULL DEFAULT false,
    first_seen      TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_seen       TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (site_id, pattern_signature)
);

CREATE TABLE platform_pattern_stats (
    pattern_key     TEXT PRIMARY KEY,
    incident_type   TEXT NOT NULL,
    runbook_id      TEXT NOT NULL,
    total_occurrences BIGINT NOT NULL DEFAULT 0,
    success_count   BIGINT NOT NULL DEFAULT 0,
    success_rate    DOUBLE PRECISION NOT NULL DEFAULT 0,
    distinct_sites  INTEGER NOT NULL DEFAULT 0,
    distinct_orgs   INTEGER NOT NULL DEFAULT 0,
    auto_promoted   BOOLEAN NOT NULL DEFAULT false,
    first_seen      TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_seen       TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE platform_pattern_sites (
    pattern_key     TEXT NOT NULL,
    site_id         TEXT NOT NULL,
    org_id          TEXT,
    PRIMARY KEY (pattern_key, site_id)
);

CREATE TABLE learning_promotion_candidates (
    candidate_id    UUID PRIMARY KEY,
    site_id         TEXT NOT NULL REFERENCES sites(site_id),
    pattern_signature TEXT NOT NULL,
    approval_status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (approval_status IN ('not_submitted', 'pending', 'approved',
                                               'rejected', 'client_forwarded', 'deployed')),
    recommended_action TEXT,
    occurrences     BIGINT NOT NULL,
    success_rate    DOUBLE PRECISION NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    reviewed_at     TIMESTAMPTZ,
    reviewed_by     TEXT,
    last_error      TEXT
);

CREATE UNIQUE INDEX idx_candidates_open
    ON learning_promotion_candidates(site_id, pattern_signature)
    WHERE approval_status IN ('not_submitted', 'pending', 'client_forwarded');

CREATE TABLE promoted_rules (
    rule_id         TEXT PRIMARY KEY REFERENCES l1_rules(rule_id),
    site_id         TEXT REFERENCES sites(site_id),
    pattern_signature TEXT,
    rule_yaml       TEXT NOT NULL,
    rule_json       JSONB NOT NULL,
    confidence      DOUBLE PRECISION NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    revoked_at      TIMESTAMPTZ
);

CREATE TABLE promoted_rule_deployments (
    rule_id         TEXT NOT NULL REFERENCES promoted_rules(rule_id),
    appliance_id    TEXT NOT NULL REFERENCES appliances(appliance_id),
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'delivered', 'acknowledged', 'rolled_back')),
    order_id        UUID REFERENCES orders(order_id),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (rule_id, appliance_id)
);
"#,
    },
    EmbeddedMigration {
        version: "0005",
        name: "update_rollouts",
        sql: r#"
CREATE TABLE update_releases (
    release_id      UUID PRIMARY KEY,
    version         TEXT NOT NULL UNIQUE,
    object_key      TEXT NOT NULL,
    sha256          TEXT NOT NULL,
    size_bytes      BIGINT NOT NULL,
    notes           TEXT,
    is_latest       BOOLEAN NOT NULL DEFAULT false,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE update_rollouts (
    rollout_id      UUID PRIMARY KEY,
    release_id      UUID NOT NULL REFERENCES update_releases(release_id),
    name            TEXT NOT NULL,
    stages          JSONB NOT NULL,
    failure_threshold_percent DOUBLE PRECISION NOT NULL DEFAULT 10,
    auto_rollback   BOOLEAN NOT NULL DEFAULT true,
    maintenance_window JSONB,
    target_filter   JSONB,
    status          TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'paused', 'completed', 'failed', 'cancelled')),
    current_stage   INTEGER NOT NULL DEFAULT 0,
    stage_started_at TIMESTAMPTZ,
    stage_completed_at TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE appliance_updates (
    rollout_id      UUID NOT NULL REFERENCES update_rollouts(rollout_id),
    appliance_id    TEXT NOT NULL REFERENCES appliances(appliance_id),
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'notified', 'downloading', 'ready',
                                      'rebooting', 'verifying', 'succeeded',
                                      'failed', 'rolled_back')),
    stage_assigned  INTEGER NOT NULL,
    order_id        UUID REFERENCES orders(order_id),
    error           TEXT,
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (rollout_id, appliance_id)
);

CREATE VIEW rollout_progress AS
SELECT
    r.rollout_id,
    r.status,
    r.current_stage,
    count(u.appliance_id)                                        AS total_assigned,
    count(*) FILTER (WHERE u.status = 'succeeded')               AS succeeded,
    count(*) FILTER (WHERE u.status = 'failed')                  AS failed,
    count(*) FILTER (WHERE u.status = 'rolled_back')             AS rolled_back,
    count(*) FILTER (WHERE u.status IN ('pending', 'notified', 'downloading',
                                        'ready', 'rebooting', 'verifying')) AS in_flight
FROM update_rollouts r
LEFT JOIN appliance_updates u ON u.rollout_id = r.rollout_id
GROUP BY r.rollout_id, r.status, r.current_stage;
"#,
    },
    EmbeddedMigration {
        version: "0006",
        name: "control_audit_log",
        sql: r#"
CREATE TABLE control_audit_log (
    entry_id        BIGSERIAL PRIMARY KEY,
    actor           TEXT NOT NULL,
    action          TEXT NOT NULL,
    entity_kind     TEXT NOT NULL,
    entity_id       TEXT NOT NULL,
    details         JSONB,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TRIGGER trg_control_audit_append_only
    BEFORE UPDATE OR DELETE ON control_audit_log
    FOR EACH ROW EXECUTE FUNCTION reject_any_mutation();
"#,
    },
    EmbeddedMigration {
        version: "0007",
        name: "rule_bundles",
        sql: r#"
CREATE TABLE rule_bundles (
    bundle_version  BIGSERIAL PRIMARY KEY,
    healing_tier    TEXT NOT NULL
                    CHECK (healing_tier IN ('standard', 'full_coverage')),
    object_key      TEXT NOT NULL,
    sha256          TEXT NOT NULL,
    signature       TEXT NOT NULL,
    rule_count      INTEGER NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX idx_rule_bundles_tier ON rule_bundles(healing_tier, bundle_version DESC);
"#,
    },
    EmbeddedMigration {
        version: "0008",
        name: "telemetry_chaos_campaign",
        sql: r#"
ALTER TABLE execution_telemetry ADD COLUMN chaos_campaign_id TEXT;
CREATE INDEX idx_telemetry_chaos
    ON execution_telemetry(chaos_campaign_id)
    WHERE chaos_campaign_id IS NOT NULL;
"#,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_monotonic() {
        let mut prev = "";
        for m in MIGRATIONS {
            assert!(m.version > prev, "version {} out of order", m.version);
            prev = m.version;
        }
    }

    #[test]
    fn test_versions_zero_padded() {
        for m in MIGRATIONS {
            assert_eq!(m.version.len(), 4);
            assert!(m.version.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
