use std::net::SocketAddr;

use crate::engine::EngineError;

// ── Admission (request-driven) ──────────────────────────────────

/// Counter: admission decisions. Labels: operation, outcome.
pub const ADMISSIONS_TOTAL: &str = "shopslots_admissions_total";

/// Histogram: lock wait + evaluation + commit, in seconds. Labels: operation.
pub const ADMISSION_DURATION_SECONDS: &str = "shopslots_admission_duration_seconds";

/// Counter: reservations removed through cancel.
pub const CANCELLATIONS_TOTAL: &str = "shopslots_cancellations_total";

/// Counter: admissions that went through only because a rule was bypassed.
pub const PRIVILEGED_BYPASS_TOTAL: &str = "shopslots_privileged_bypass_total";

// ── Store (resource utilization) ────────────────────────────────

/// Gauge: shops held by the engine.
pub const SHOPS_ACTIVE: &str = "shopslots_shops_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "shopslots_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "shopslots_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "shopslots_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for the outcome of an admission-path call.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(EngineError::CapacityExceeded { .. }) => "capacity_exceeded",
        Err(EngineError::SameUserConflict(_)) => "same_user_conflict",
        Err(EngineError::PolicyViolation(_)) => "policy_violation",
        Err(EngineError::Forbidden(_)) => "forbidden",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(_) => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PolicyRule;
    use ulid::Ulid;

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome_label(&Ok::<(), EngineError>(())), "admitted");
        assert_eq!(
            outcome_label::<()>(&Err(EngineError::CapacityExceeded { capacity: 2, peak: 3 })),
            "capacity_exceeded"
        );
        assert_eq!(
            outcome_label::<()>(&Err(EngineError::PolicyViolation(PolicyRule::TooLong))),
            "policy_violation"
        );
        assert_eq!(outcome_label::<()>(&Err(EngineError::NotFound(Ulid::new()))), "not_found");
        assert_eq!(outcome_label::<()>(&Err(EngineError::WalError("disk".into()))), "error");
    }

    #[test]
    fn init_without_port_is_noop() {
        assert!(init(None).is_ok());
    }
}
