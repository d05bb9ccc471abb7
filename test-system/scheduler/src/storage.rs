//! Durable task table in a single-file database.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use rusqlite::{Connection, OptionalExtension as _, params};
use test_system_shared::state::TaskState;
use thiserror::Error;
use tracing::{debug, info};

pub const DATABASE_NAME: &str = "scheduler.db";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot prepare the scheduler working directory {path}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open the task database at {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("cannot update the task database")]
    Update(#[source] rusqlite::Error),
    #[error("cannot query the task database")]
    Query(#[source] rusqlite::Error),
}

/// One row of the tasks table.
#[derive(Clone, Debug)]
pub struct TaskRecord {
    pub task_id: String,
    pub queue_name: String,
    pub status: String,
    pub task_duration: Option<String>,
    pub bs_task_id: Option<i64>,
    pub callback_href: Option<String>,
}

pub struct TaskStorage {
    conn: Mutex<Connection>,
}

impl TaskStorage {
    /// Opens the database in `working_directory`, creating the directory and
    /// the tables when absent.
    pub fn open(working_directory: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(working_directory).map_err(|source| StorageError::WorkDir {
            path: working_directory.to_path_buf(),
            source,
        })?;
        let path = working_directory.join(DATABASE_NAME);
        let conn = Connection::open(&path).map_err(|source| StorageError::Open {
            path: path.clone(),
            source,
        })?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.create_tables()?;
        info!(path = %path.display(), "task database ready");
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|source| StorageError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.create_tables()?;
        Ok(storage)
    }

    fn create_tables(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queues (
                 id INTEGER PRIMARY KEY,
                 name TEXT UNIQUE,
                 cost INTEGER,
                 max_capacity INTEGER
             );
             CREATE TABLE IF NOT EXISTS tasks (
                 id INTEGER PRIMARY KEY,
                 task_id TEXT UNIQUE,
                 queue_name TEXT,
                 status TEXT,
                 task_duration TEXT,
                 bs_task_id INTEGER,
                 callback_href TEXT
             );",
        )
        .map_err(StorageError::Update)
    }

    /// Seeds the queue table with the declared queue set.
    pub fn seed_queues(&self, queues: &[(String, u8)]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction().map_err(StorageError::Update)?;
        for (name, cost) in queues {
            tx.execute(
                "INSERT OR IGNORE INTO queues (name, cost) VALUES (?1, ?2)",
                params![name, cost],
            )
            .map_err(StorageError::Update)?;
        }
        tx.commit().map_err(StorageError::Update)?;
        debug!(queues = queues.len(), "queue table seeded");
        Ok(())
    }

    pub fn insert_task(&self, record: &TaskRecord) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT INTO tasks (task_id, queue_name, status, task_duration, bs_task_id, callback_href)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.task_id,
                record.queue_name,
                record.status,
                record.task_duration,
                record.bs_task_id,
                record.callback_href,
            ],
        )
        .map_err(StorageError::Update)?;
        Ok(())
    }

    /// Monotonic status update. Returns whether a row changed: a stored
    /// terminal status is frozen and an identical status is left alone.
    pub fn update_status(&self, task_id: &str, status: TaskState) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction().map_err(StorageError::Update)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::Query)?;
        let Some(current) = current else {
            return Ok(false);
        };
        let frozen = current
            .parse::<TaskState>()
            .is_ok_and(|state| !status.supersedes(state));
        if frozen {
            return Ok(false);
        }
        tx.execute(
            "UPDATE tasks SET status = ?2 WHERE task_id = ?1",
            params![task_id, status.as_str()],
        )
        .map_err(StorageError::Update)?;
        tx.commit().map_err(StorageError::Update)?;
        Ok(true)
    }

    pub fn task_status(&self, task_id: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.query_row(
            "SELECT status FROM tasks WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StorageError::Query)
    }

    /// Every task whose status is outside the ready set.
    pub fn unfinished_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        self.select_tasks(
            "SELECT task_id, queue_name, status, task_duration, bs_task_id, callback_href
             FROM tasks WHERE status NOT IN ('SUCCESS', 'FAILURE', 'REVOKED')",
        )
    }

    pub fn tasks_with_status(&self, status: TaskState) -> Result<Vec<TaskRecord>, StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut statement = conn
            .prepare(
                "SELECT task_id, queue_name, status, task_duration, bs_task_id, callback_href
                 FROM tasks WHERE status = ?1",
            )
            .map_err(StorageError::Query)?;
        let rows = statement
            .query_map(params![status.as_str()], row_to_record)
            .map_err(StorageError::Query)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::Query)
    }

    pub fn task_count(&self) -> Result<u64, StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get::<_, i64>(0))
            .map(|count| count as u64)
            .map_err(StorageError::Query)
    }

    fn select_tasks(&self, sql: &str) -> Result<Vec<TaskRecord>, StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut statement = conn.prepare(sql).map_err(StorageError::Query)?;
        let rows = statement
            .query_map([], row_to_record)
            .map_err(StorageError::Query)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::Query)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        task_id: row.get(0)?,
        queue_name: row.get(1)?,
        status: row.get(2)?,
        task_duration: row.get(3)?,
        bs_task_id: row.get(4)?,
        callback_href: row.get(5)?,
    })
}
