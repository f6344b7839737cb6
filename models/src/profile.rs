//! Read-only accessor over the shared service profile.
//!
//! The profiler owns the SQLite database and its schema, refreshing service
//! rows and node free-capacity snapshots on its own cadence. The controller
//! holds a read-only pool over the same file; both workers read through it
//! concurrently. Writes are strictly the profiler's business.

use crate::constants::{NODE_RESOURCE_TABLE, SERVICE_PROFILE_TABLE};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use error::Result;

// Both long-running workers share the pool; a couple of connections is plenty
// for point reads.
const MAX_READ_CONNECTIONS: u32 = 2;

/// A victim-eligible service, as ranked by the profile.
///
/// Candidates are ordered cheapest-to-restart first (`t_cold`), then lowest
/// priority first (`weight`). This ordering is the single source of victim
/// precedence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VictimCandidate {
    pub service: String,
    pub min_container: i64,
}

/// One row of the snapshotter's node free-capacity table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeResourceStatus {
    pub node_name: String,
    pub cpu_allocatable_m: i64,
    pub cpu_free_m: i64,
    pub mem_allocatable_bytes: i64,
    pub mem_free_bytes: i64,
    pub last_updated: Option<String>,
}

#[derive(Clone)]
pub struct ProfileStore {
    pool: SqlitePool,
}

impl ProfileStore {
    /// Opens the profile database read-only. The profiler must have created
    /// the file already; a missing store is a startup failure.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_READ_CONNECTIONS)
            .connect_with(options)
            .await
            .context(error::OpenStoreSnafu { path })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The profiled container ceiling for a service, or `None` when the
    /// service has no profile row (or the profiler has not derived one yet).
    pub async fn max_container(&self, service: &str) -> Result<Option<i64>> {
        self.container_bound(service, "max_container").await
    }

    /// The profiled replica floor for a service.
    pub async fn min_container(&self, service: &str) -> Result<Option<i64>> {
        self.container_bound(service, "min_container").await
    }

    async fn container_bound(&self, service: &str, column: &str) -> Result<Option<i64>> {
        let query = format!(
            "SELECT {} FROM {} WHERE service = ? LIMIT 1",
            column, SERVICE_PROFILE_TABLE
        );
        let row = sqlx::query(&query)
            .bind(service)
            .fetch_optional(&self.pool)
            .await
            .context(error::QueryProfileSnafu { service })?;
        Ok(row.and_then(|row| row.get::<Option<i64>, _>(0)))
    }

    /// All services other than the trigger, in victim-precedence order.
    pub async fn victim_candidates(&self, trigger_service: &str) -> Result<Vec<VictimCandidate>> {
        let query = format!(
            "SELECT service, min_container FROM {} WHERE service != ? ORDER BY t_cold ASC, weight ASC",
            SERVICE_PROFILE_TABLE
        );
        let rows = sqlx::query(&query)
            .bind(trigger_service)
            .fetch_all(&self.pool)
            .await
            .context(error::QueryProfileSnafu {
                service: trigger_service,
            })?;

        Ok(rows
            .into_iter()
            .map(|row| VictimCandidate {
                service: row.get("service"),
                min_container: row.get::<Option<i64>, _>("min_container").unwrap_or(0),
            })
            .collect())
    }

    /// The snapshotter's latest per-node free-capacity estimates, ordered by
    /// node name so planner iteration is deterministic.
    pub async fn node_snapshots(&self) -> Result<Vec<NodeResourceStatus>> {
        let query = format!(
            "SELECT node_name, cpu_allocatable_m, cpu_free_m, mem_allocatable_bytes, mem_free_bytes, last_updated \
             FROM {} ORDER BY node_name ASC",
            NODE_RESOURCE_TABLE
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .context(error::QuerySnapshotsSnafu)?;

        Ok(rows
            .into_iter()
            .map(|row| NodeResourceStatus {
                node_name: row.get("node_name"),
                cpu_allocatable_m: row.get::<Option<i64>, _>("cpu_allocatable_m").unwrap_or(0),
                cpu_free_m: row.get::<Option<i64>, _>("cpu_free_m").unwrap_or(0),
                mem_allocatable_bytes: row
                    .get::<Option<i64>, _>("mem_allocatable_bytes")
                    .unwrap_or(0),
                mem_free_bytes: row.get::<Option<i64>, _>("mem_free_bytes").unwrap_or(0),
                last_updated: row.get("last_updated"),
            })
            .collect())
    }
}

pub mod error {
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, ProfileStoreError>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum ProfileStoreError {
        #[snafu(display("Unable to open profile store at '{}': '{}'", path, source))]
        OpenStore { source: sqlx::Error, path: String },

        #[snafu(display("Unable to read profile for service '{}': '{}'", service, source))]
        QueryProfile {
            source: sqlx::Error,
            service: String,
        },

        #[snafu(display("Unable to read node resource snapshots: '{}'", source))]
        QuerySnapshots { source: sqlx::Error },
    }
}
pub use error::ProfileStoreError;

#[cfg(test)]
mod test {
    use super::*;

    // Mirrors the profiler's schema; tests stand in for the profiler as the
    // schema owner.
    pub(crate) async fn fixture_store() -> ProfileStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE service_profile (
               service           TEXT    NOT NULL,
               creation_time     INTEGER NOT NULL,
               t_warm            REAL,
               t_cold            REAL,
               t_execute         REAL,
               weight            INTEGER,
               qos               REAL,
               max_container     INTEGER,
               min_container     INTEGER,
               active_container  INTEGER,
               request_cnt       INTEGER,
               PRIMARY KEY (service)
             )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE node_resource_status (
               node_name TEXT PRIMARY KEY,
               cpu_allocatable_m INTEGER,
               cpu_request_total_m INTEGER,
               cpu_free_m INTEGER,
               mem_allocatable_bytes INTEGER,
               mem_request_total_bytes INTEGER,
               mem_free_bytes INTEGER,
               last_updated DATETIME
             )",
        )
        .execute(&pool)
        .await
        .unwrap();
        ProfileStore::from_pool(pool)
    }

    async fn insert_service(
        store: &ProfileStore,
        service: &str,
        weight: i64,
        t_cold: f64,
        min_container: i64,
        max_container: i64,
    ) {
        sqlx::query(
            "INSERT INTO service_profile
               (service, creation_time, t_warm, t_cold, weight, min_container, max_container)
             VALUES (?, 0, 1.0, ?, ?, ?, ?)",
        )
        .bind(service)
        .bind(t_cold)
        .bind(weight)
        .bind(min_container)
        .bind(max_container)
        .execute(&store.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn candidates_exclude_trigger_and_follow_precedence() {
        let store = fixture_store().await;
        // b restarts cheapest; c and d tie on t_cold, so weight breaks the tie.
        insert_service(&store, "a", 1, 1623.0, 1, 3).await;
        insert_service(&store, "b", 10, 5.0, 1, 4).await;
        insert_service(&store, "c", 20, 10.0, 0, 2).await;
        insert_service(&store, "d", 5, 10.0, 2, 6).await;

        let candidates = store.victim_candidates("a").await.unwrap();
        let order: Vec<&str> = candidates.iter().map(|c| c.service.as_str()).collect();
        assert_eq!(order, vec!["b", "d", "c"]);
        assert_eq!(candidates[0].min_container, 1);

        // Stable: a second read over the same profile yields the same order.
        let again = store.victim_candidates("a").await.unwrap();
        assert_eq!(candidates, again);
    }

    #[tokio::test]
    async fn container_bounds_for_missing_service_are_none() {
        let store = fixture_store().await;
        insert_service(&store, "hello", 1, 5.0, 1, 4).await;

        assert_eq!(store.max_container("hello").await.unwrap(), Some(4));
        assert_eq!(store.min_container("hello").await.unwrap(), Some(1));
        assert_eq!(store.max_container("absent").await.unwrap(), None);
        assert_eq!(store.min_container("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn null_min_container_coerces_to_zero() {
        let store = fixture_store().await;
        sqlx::query(
            "INSERT INTO service_profile (service, creation_time, t_cold, weight)
             VALUES ('bare', 0, 2.0, 1)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let candidates = store.victim_candidates("other").await.unwrap();
        assert_eq!(candidates[0].min_container, 0);
        // A NULL bound reads as absent, not zero: the caller must treat the
        // service as unprofiled.
        assert_eq!(store.max_container("bare").await.unwrap(), None);
    }

    #[tokio::test]
    async fn node_snapshots_ordered_by_name() {
        let store = fixture_store().await;
        for (node, cpu_free, mem_free) in
            [("worker-2", 500, 1024), ("worker-1", 0, 0), ("worker-3", 250, 512)]
        {
            sqlx::query(
                "INSERT INTO node_resource_status
                   (node_name, cpu_allocatable_m, cpu_free_m, mem_allocatable_bytes, mem_free_bytes, last_updated)
                 VALUES (?, 4000, ?, 8589934592, ?, '2024-01-01 00:00:00')",
            )
            .bind(node)
            .bind(cpu_free)
            .bind(mem_free)
            .execute(&store.pool)
            .await
            .unwrap();
        }

        let snapshots = store.node_snapshots().await.unwrap();
        let names: Vec<&str> = snapshots.iter().map(|s| s.node_name.as_str()).collect();
        assert_eq!(names, vec!["worker-1", "worker-2", "worker-3"]);
        assert_eq!(snapshots[1].cpu_free_m, 500);
        assert_eq!(snapshots[1].mem_free_bytes, 1024);
        assert_eq!(snapshots[0].cpu_allocatable_m, 4000);
    }
}
