use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use fleet_core::config::DatabaseConfig;
use fleet_core::models::{
    AvailableDependencyVersion, CachedDependencyVersion, ConfigStatus, Configuration,
    DependencyKind, DependencyState, DependencyVersionRecord, OrchestratorState, ScanStatus,
    Worker, WorkerUpdate,
};
use fleet_core::traits::{
    ConfigurationRepository, DependencyRepository, OrchestratorStateRepository, Repositories,
    UpdateRepository, WorkerRepository,
};
use fleet_core::{FleetError, FleetResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        address TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS configurations (
        id INTEGER PRIMARY KEY,
        data TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dependency_states (
        kind TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dependency_records (
        address TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS singletons (
        name TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worker_updates (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        worker TEXT NOT NULL,
        data TEXT NOT NULL
    )
    "#,
];

const CACHED_VERSION_KEY: &str = "cached_dependency_version";
const AVAILABLE_VERSION_KEY: &str = "available_dependency_version";
const ORCHESTRATOR_KEY: &str = "orchestrator_state";

/// 基于SQLite的存储，每条记录以其标识为键保存为JSON文档
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 以各仓库trait的形式提供存储
    pub fn repositories(&self) -> Repositories {
        Repositories {
            workers: Arc::new(self.clone()),
            configurations: Arc::new(self.clone()),
            dependencies: Arc::new(self.clone()),
            updates: Arc::new(self.clone()),
            orchestrator: Arc::new(self.clone()),
        }
    }

    /// 打开连接池并创建缺失的表
    pub async fn connect(config: &DatabaseConfig) -> FleetResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await
            .map_err(FleetError::Database)?;

        let store = Self::new(pool);
        store.migrate().await?;
        info!("SQLite存储已就绪: {}", config.url);
        Ok(store)
    }

    pub async fn migrate(&self) -> FleetResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(FleetError::Database)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn encode<T: Serialize>(value: &T) -> FleetResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode<T: DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> FleetResult<T> {
        let data: String = row.try_get("data")?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn get_singleton<T: DeserializeOwned>(&self, name: &str) -> FleetResult<Option<T>> {
        let row = sqlx::query("SELECT data FROM singletons WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn put_singleton<T: Serialize>(&self, name: &str, value: &T) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO singletons (name, data) VALUES ($1, $2)
            ON CONFLICT(name) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(name)
        .bind(Self::encode(value)?)
        .execute(&self.pool)
        .await
        .map_err(FleetError::Database)?;
        Ok(())
    }

    /// 在一个事务内读取、修改并写回Worker
    async fn modify_worker<R>(
        &self,
        address: IpAddr,
        f: impl FnOnce(&mut Worker) -> FleetResult<R> + Send,
    ) -> FleetResult<R>
    where
        R: Send,
    {
        let mut tx = self.pool.begin().await.map_err(FleetError::Database)?;

        let row = sqlx::query("SELECT data FROM workers WHERE address = $1")
            .bind(address.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(FleetError::Database)?;
        let mut worker: Worker = match row {
            Some(row) => Self::decode(&row)?,
            None => return Err(FleetError::NotFound { address }),
        };

        let result = f(&mut worker)?;

        sqlx::query("UPDATE workers SET data = $1 WHERE address = $2")
            .bind(Self::encode(&worker)?)
            .bind(address.to_string())
            .execute(&mut *tx)
            .await
            .map_err(FleetError::Database)?;
        tx.commit().await.map_err(FleetError::Database)?;

        Ok(result)
    }
}

#[async_trait]
impl WorkerRepository for SqliteStore {
    async fn upsert(&self, worker: &Worker) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (address, data) VALUES ($1, $2)
            ON CONFLICT(address) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(worker.address.to_string())
        .bind(Self::encode(worker)?)
        .execute(&self.pool)
        .await
        .map_err(FleetError::Database)?;

        debug!("已保存Worker {}", worker.address);
        Ok(())
    }

    async fn get(&self, address: IpAddr) -> FleetResult<Option<Worker>> {
        let row = sqlx::query("SELECT data FROM workers WHERE address = $1")
            .bind(address.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list(&self) -> FleetResult<Vec<Worker>> {
        let rows = sqlx::query("SELECT data FROM workers")
            .fetch_all(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        let mut workers: Vec<Worker> = rows.iter().map(Self::decode).collect::<FleetResult<_>>()?;
        workers.sort_by_key(|w| w.address);
        Ok(workers)
    }

    async fn list_by_configuration(&self, configuration_id: i64) -> FleetResult<Vec<Worker>> {
        let workers = WorkerRepository::list(self).await?;
        Ok(workers
            .into_iter()
            .filter(|w| w.configuration_ids.contains(&configuration_id))
            .collect())
    }

    async fn delete(&self, address: IpAddr) -> FleetResult<()> {
        let result = sqlx::query("DELETE FROM workers WHERE address = $1")
            .bind(address.to_string())
            .execute(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        if result.rows_affected() == 0 {
            return Err(FleetError::NotFound { address });
        }
        Ok(())
    }

    async fn set_reachability(
        &self,
        address: IpAddr,
        reachable: bool,
        system_info: Option<BTreeMap<String, String>>,
    ) -> FleetResult<()> {
        self.modify_worker(address, move |worker| {
            if reachable {
                worker.mark_reached();
            } else {
                worker.reachable = false;
            }
            if let Some(info) = system_info {
                worker.system_info = info;
            }
            Ok(())
        })
        .await
    }

    async fn set_analysis(&self, address: IpAddr, analysis_id: Option<Uuid>) -> FleetResult<()> {
        self.modify_worker(address, move |worker| {
            worker.clear_analysis();
            worker.analysis_id = analysis_id;
            Ok(())
        })
        .await
    }

    async fn set_analysis_pid(&self, address: IpAddr, pid: Option<u32>) -> FleetResult<()> {
        self.modify_worker(address, move |worker| {
            worker.analysis_pid = pid;
            Ok(())
        })
        .await
    }

    async fn transition_status(
        &self,
        address: IpAddr,
        next: ConfigStatus,
    ) -> FleetResult<ConfigStatus> {
        self.modify_worker(address, move |worker| {
            let previous = worker.status;
            worker.transition_to(next)?;
            Ok(previous)
        })
        .await
    }
}

#[async_trait]
impl ConfigurationRepository for SqliteStore {
    async fn upsert(&self, configuration: &Configuration) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO configurations (id, data) VALUES ($1, $2)
            ON CONFLICT(id) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(configuration.id)
        .bind(Self::encode(configuration)?)
        .execute(&self.pool)
        .await
        .map_err(FleetError::Database)?;
        Ok(())
    }

    async fn get(&self, id: i64) -> FleetResult<Option<Configuration>> {
        let row = sqlx::query("SELECT data FROM configurations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list(&self) -> FleetResult<Vec<Configuration>> {
        let rows = sqlx::query("SELECT data FROM configurations ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        rows.iter().map(Self::decode).collect()
    }

    async fn delete(&self, id: i64) -> FleetResult<()> {
        let result = sqlx::query("DELETE FROM configurations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        if result.rows_affected() == 0 {
            return Err(FleetError::ConfigurationNotFound { id });
        }
        Ok(())
    }

    async fn set_scan_status(&self, id: i64, status: ScanStatus) -> FleetResult<()> {
        let mut configuration = ConfigurationRepository::get(self, id)
            .await?
            .ok_or(FleetError::ConfigurationNotFound { id })?;
        configuration.scan_status = status;
        ConfigurationRepository::upsert(self, &configuration).await
    }
}

#[async_trait]
impl DependencyRepository for SqliteStore {
    async fn get_state(&self, kind: DependencyKind) -> FleetResult<DependencyState> {
        let row = sqlx::query("SELECT data FROM dependency_states WHERE kind = $1")
            .bind(kind.folder_name())
            .fetch_optional(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        match row {
            Some(row) => Self::decode(&row),
            None => Ok(DependencyState::new(kind)),
        }
    }

    async fn save_state(&self, state: &DependencyState) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dependency_states (kind, data) VALUES ($1, $2)
            ON CONFLICT(kind) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(state.kind.folder_name())
        .bind(Self::encode(state)?)
        .execute(&self.pool)
        .await
        .map_err(FleetError::Database)?;
        Ok(())
    }

    async fn list_states(&self) -> FleetResult<Vec<DependencyState>> {
        let mut states = Vec::with_capacity(DependencyKind::ALL.len());
        for kind in DependencyKind::ALL {
            states.push(self.get_state(kind).await?);
        }
        Ok(states)
    }

    async fn get_cached(&self) -> FleetResult<CachedDependencyVersion> {
        Ok(self
            .get_singleton(CACHED_VERSION_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save_cached(&self, cached: &CachedDependencyVersion) -> FleetResult<()> {
        self.put_singleton(CACHED_VERSION_KEY, cached).await
    }

    async fn get_available(&self) -> FleetResult<AvailableDependencyVersion> {
        Ok(self
            .get_singleton(AVAILABLE_VERSION_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save_available(&self, available: &AvailableDependencyVersion) -> FleetResult<()> {
        self.put_singleton(AVAILABLE_VERSION_KEY, available).await
    }

    async fn get_record(&self, worker: IpAddr) -> FleetResult<DependencyVersionRecord> {
        let row = sqlx::query("SELECT data FROM dependency_records WHERE address = $1")
            .bind(worker.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        match row {
            Some(row) => Self::decode(&row),
            None => Ok(DependencyVersionRecord::default()),
        }
    }

    async fn save_record(
        &self,
        worker: IpAddr,
        record: &DependencyVersionRecord,
    ) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dependency_records (address, data) VALUES ($1, $2)
            ON CONFLICT(address) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(worker.to_string())
        .bind(Self::encode(record)?)
        .execute(&self.pool)
        .await
        .map_err(FleetError::Database)?;
        Ok(())
    }

    async fn delete_record(&self, worker: IpAddr) -> FleetResult<()> {
        sqlx::query("DELETE FROM dependency_records WHERE address = $1")
            .bind(worker.to_string())
            .execute(&self.pool)
            .await
            .map_err(FleetError::Database)?;
        Ok(())
    }
}

#[async_trait]
impl UpdateRepository for SqliteStore {
    async fn push(&self, update: &WorkerUpdate) -> FleetResult<()> {
        sqlx::query("INSERT INTO worker_updates (id, worker, data) VALUES ($1, $2, $3)")
            .bind(update.id.to_string())
            .bind(update.worker.to_string())
            .bind(Self::encode(update)?)
            .execute(&self.pool)
            .await
            .map_err(FleetError::Database)?;
        Ok(())
    }

    async fn list(&self, worker: IpAddr) -> FleetResult<Vec<WorkerUpdate>> {
        let rows = sqlx::query("SELECT data FROM worker_updates WHERE worker = $1 ORDER BY seq")
            .bind(worker.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        rows.iter().map(Self::decode).collect()
    }

    async fn remove(&self, id: Uuid) -> FleetResult<()> {
        sqlx::query("DELETE FROM worker_updates WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(FleetError::Database)?;
        Ok(())
    }

    async fn pop_oldest(&self, worker: IpAddr) -> FleetResult<Option<WorkerUpdate>> {
        let mut tx = self.pool.begin().await.map_err(FleetError::Database)?;

        let row = sqlx::query(
            "SELECT seq, data FROM worker_updates WHERE worker = $1 ORDER BY seq LIMIT 1",
        )
        .bind(worker.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(FleetError::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let seq: i64 = row.try_get("seq")?;
        let update: WorkerUpdate = Self::decode(&row)?;

        sqlx::query("DELETE FROM worker_updates WHERE seq = $1")
            .bind(seq)
            .execute(&mut *tx)
            .await
            .map_err(FleetError::Database)?;
        tx.commit().await.map_err(FleetError::Database)?;

        Ok(Some(update))
    }

    async fn count(&self, worker: IpAddr) -> FleetResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM worker_updates WHERE worker = $1")
            .bind(worker.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        let total: i64 = row.try_get("total")?;
        Ok(total as usize)
    }

    async fn clear(&self, worker: IpAddr) -> FleetResult<usize> {
        let result = sqlx::query("DELETE FROM worker_updates WHERE worker = $1")
            .bind(worker.to_string())
            .execute(&self.pool)
            .await
            .map_err(FleetError::Database)?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl OrchestratorStateRepository for SqliteStore {
    async fn load(&self) -> FleetResult<Option<OrchestratorState>> {
        self.get_singleton(ORCHESTRATOR_KEY).await
    }

    async fn save(&self, state: &OrchestratorState) -> FleetResult<()> {
        self.put_singleton(ORCHESTRATOR_KEY, state).await
    }
}
