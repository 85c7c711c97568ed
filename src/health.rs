//! Minimal storage-reachability probe. Lives outside the core runtime and
//! consumes only the ping seam of the storage connection.

use async_trait::async_trait;

use crate::store::StoreError;

/// Outcome of a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The storage connection answered the ping.
    Healthy,
    /// The storage connection failed the ping.
    Unhealthy,
}

/// Connection facts reported by a reachable storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HealthData {
    /// Database the connection points at.
    pub database_id: String,

    /// Storage account the connection points at.
    pub account_id: String,

    /// Consistency level negotiated with the backend.
    pub consistency_level: String,

    /// Regions the account can be read from, when the backend reports them.
    pub readable_regions: Option<Vec<String>>,
}

/// Result of one [`StorageHealthCheck::check`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Overall probe outcome.
    pub status: HealthStatus,

    /// Human-readable summary.
    pub description: String,

    /// Connection facts; defaulted when the probe failed.
    pub data: HealthData,
}

/// Ping seam implemented by storage connections that want to be probed.
#[async_trait]
pub trait StoragePing: Send + Sync {
    /// Round-trips the storage connection and reports connection facts.
    async fn ping(&self) -> Result<HealthData, StoreError>;
}

/// Probes a storage connection through its [`StoragePing`] seam.
pub struct StorageHealthCheck<P> {
    ping: P,
}

impl<P> StorageHealthCheck<P>
where
    P: StoragePing,
{
    /// Creates a probe over the given connection.
    pub fn new(ping: P) -> Self {
        Self { ping }
    }

    /// Runs the probe once.
    pub async fn check(&self) -> HealthReport {
        match self.ping.ping().await {
            Ok(data) => HealthReport {
                status: HealthStatus::Healthy,
                description: format!("storage account '{}' is reachable", data.account_id),
                data,
            },
            Err(error) => HealthReport {
                status: HealthStatus::Unhealthy,
                description: format!("storage ping failed: {error}"),
                data: HealthData::default(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct StaticPing(Result<HealthData, ()>);

    #[async_trait]
    impl StoragePing for StaticPing {
        async fn ping(&self) -> Result<HealthData, StoreError> {
            match &self.0 {
                Ok(data) => Ok(data.clone()),
                Err(()) => Err(StoreError::Unavailable("connection refused".to_owned())),
            }
        }
    }

    #[tokio::test]
    async fn reachable_storage_reports_healthy() {
        let check = StorageHealthCheck::new(StaticPing(Ok(HealthData {
            database_id: "events".to_owned(),
            account_id: "account-1".to_owned(),
            consistency_level: "Session".to_owned(),
            readable_regions: Some(vec!["westeurope".to_owned()]),
        })));

        let report = check.check().await;
        assert_eq!(HealthStatus::Healthy, report.status);
        assert_eq!("events", report.data.database_id);
    }

    #[tokio::test]
    async fn unreachable_storage_reports_unhealthy() {
        let check = StorageHealthCheck::new(StaticPing(Err(())));

        let report = check.check().await;
        assert_eq!(HealthStatus::Unhealthy, report.status);
        assert!(report.description.contains("storage ping failed"));
    }
}
