use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::RoutingDecision;

/// SQLite store for routing decisions.
pub struct AuditStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Audit writer task failed: {0}")]
    TaskFailed(String),
}

impl From<rusqlite::Error> for AuditError {
    fn from(e: rusqlite::Error) -> Self {
        AuditError::DatabaseError(e.to_string())
    }
}

/// Aggregated outcomes of one route for one task type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteStats {
    pub task_type: String,
    pub route: String,
    pub total: u64,
    pub successes: u64,
    pub avg_latency_ms: Option<f64>,
}

impl RouteStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}

impl AuditStore {
    pub fn new(database_url: &str) -> Result<Self, AuditError> {
        // Parse sqlite: prefix if present
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        // Create parent directories if needed
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| AuditError::IoError(e.to_string()))?;
        }

        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS routing_decisions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                task_type TEXT NOT NULL,
                prompt_length INTEGER NOT NULL,
                category TEXT,
                selected_route TEXT NOT NULL,
                latency_ms REAL,
                performance_score REAL,
                success INTEGER NOT NULL,
                features TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_decisions_created_at ON routing_decisions(created_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_decisions_task_route
                ON routing_decisions(task_type, selected_route)",
            [],
        )?;

        tracing::info!("Routing audit store initialized with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one decision. Re-inserting the same id is a no-op.
    pub fn insert(&self, decision: &RoutingDecision) -> Result<(), AuditError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AuditError::DatabaseError(e.to_string()))?;

        conn.execute(
            "INSERT OR IGNORE INTO routing_decisions
                (id, created_at, task_type, prompt_length, category, selected_route,
                 latency_ms, performance_score, success, features)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                decision.id.to_string(),
                decision.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                decision.task_type.as_str(),
                decision.prompt_length as i64,
                decision.category,
                decision.selected_route,
                decision.latency_ms,
                decision.performance_score,
                decision.success,
                decision.features.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Per task type and route outcome counts for decisions since `since`.
    pub fn route_stats(&self, since: DateTime<Utc>) -> Result<Vec<RouteStats>, AuditError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AuditError::DatabaseError(e.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT task_type, selected_route, COUNT(*), SUM(success), AVG(latency_ms)
             FROM routing_decisions
             WHERE created_at >= ?1
             GROUP BY task_type, selected_route
             ORDER BY task_type, selected_route",
        )?;

        let rows = stmt.query_map(params![since.to_rfc3339_opts(SecondsFormat::Micros, true)], |row| {
            Ok(RouteStats {
                task_type: row.get(0)?,
                route: row.get(1)?,
                total: row.get::<_, i64>(2)? as u64,
                successes: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u64,
                avg_latency_ms: row.get(4)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(AuditError::from)
    }

    pub fn count(&self) -> Result<u64, AuditError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AuditError::DatabaseError(e.to_string()))?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM routing_decisions", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::TaskType;
    use serde_json::json;

    fn decision(task: TaskType, route: &str, success: bool, latency: f64) -> RoutingDecision {
        RoutingDecision::new(task, 12, Some("fast"), route, success)
            .with_latency(latency)
            .with_features(json!({"model": "fast"}))
    }

    #[test]
    fn test_insert_and_aggregate() {
        let store = AuditStore::new(":memory:").unwrap();
        store.insert(&decision(TaskType::General, "local_mac", true, 100.0)).unwrap();
        store.insert(&decision(TaskType::General, "local_mac", false, 300.0)).unwrap();
        store.insert(&decision(TaskType::General, "cloud", false, 10.0)).unwrap();
        store.insert(&decision(TaskType::Coding, "mlx_studio", true, 50.0)).unwrap();
        assert_eq!(store.count().unwrap(), 4);

        let stats = store.route_stats(Utc::now() - chrono::Duration::hours(1)).unwrap();
        let mac = stats
            .iter()
            .find(|s| s.task_type == "general" && s.route == "local_mac")
            .unwrap();
        assert_eq!(mac.total, 2);
        assert_eq!(mac.successes, 1);
        assert_eq!(mac.success_rate(), 0.5);
        assert_eq!(mac.avg_latency_ms, Some(200.0));
        assert_eq!(stats.len(), 3);
    }

    #[test]
    fn test_old_decisions_are_excluded() {
        let store = AuditStore::new(":memory:").unwrap();
        store.insert(&decision(TaskType::General, "local_mac", true, 1.0)).unwrap();
        let stats = store.route_stats(Utc::now() + chrono::Duration::hours(1)).unwrap();
        assert!(stats.is_empty());
    }

    #[test]
    fn test_file_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}/nested/routing.db", dir.path().display());
        let store = AuditStore::new(&url).unwrap();
        let d = decision(TaskType::Reasoning, "mlx_studio", true, 1.0);
        store.insert(&d).unwrap();
        store.insert(&d).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert!(dir.path().join("nested/routing.db").exists());
    }
}
