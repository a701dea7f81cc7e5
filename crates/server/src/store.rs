//! SQLite record store behind the connection lifecycle manager.
//!
//! `SqliteConnector` is the production [`StoreConnector`]: opening runs the
//! embedded migrations, closing releases the file handle once no lease is
//! still using it. All record operations are synchronous and meant to run on
//! the blocking pool via [`run_blocking`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::crypto;
use crate::lifecycle::{ConnectionError, ConnectionLease, StoreConnector};
use crate::migration_runner::run_migrations;

/// Errors from record operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid credentials")]
    Unauthorized,

    #[error("password hashing failed")]
    Hash,

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Opens the SQLite database file at `db_path`.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    db_path: PathBuf,
}

impl SqliteConnector {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl StoreConnector for SqliteConnector {
    type Handle = StoreHandle;

    async fn open(&self) -> Result<StoreHandle, ConnectionError> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || StoreHandle::open(&path))
            .await?
            .map_err(|e| ConnectionError::Open(e.to_string()))
    }

    async fn close(&self, handle: Arc<StoreHandle>) -> Result<(), ConnectionError> {
        match Arc::try_unwrap(handle) {
            Ok(handle) => tokio::task::spawn_blocking(move || handle.close()).await?,
            Err(_still_leased) => {
                // The last lease drops the connection when it finishes.
                debug!(
                    component = "store",
                    event = "store.close.deferred",
                    "Connection still leased, close deferred to last holder"
                );
                Ok(())
            }
        }
    }
}

/// An open SQLite connection
pub struct StoreHandle {
    conn: Mutex<Connection>,
}

/// A course as returned to clients, with the web frontend's field names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    #[serde(rename = "titulo")]
    pub title: Option<String>,
    #[serde(rename = "descripcion")]
    pub description: Option<String>,
    #[serde(rename = "pasos")]
    pub steps: Vec<Value>,
}

/// Input for a new course
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCourse {
    #[serde(rename = "titulo")]
    pub title: Option<String>,
    #[serde(rename = "descripcion")]
    pub description: Option<String>,
    #[serde(rename = "pasos", default)]
    pub steps: Vec<Value>,
}

impl StoreHandle {
    /// Open (creating if needed) and migrate the database.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Connection(ConnectionError::Open(format!(
                        "cannot create {}: {e}",
                        parent.display()
                    )))
                })?;
            }
        }
        let mut conn = Connection::open(path)?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn close(self) -> Result<(), ConnectionError> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close()
            .map_err(|(_, e)| ConnectionError::Close(e.to_string()))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_course(&self, course: &NewCourse) -> Result<String, StoreError> {
        let steps: Vec<Value> = course.steps.iter().cloned().map(with_upload_path).collect();
        let steps_json = serde_json::to_string(&steps)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO courses (title, description, steps_json) VALUES (?1, ?2, ?3)",
            params![course.title, course.description, steps_json],
        )?;
        Ok(conn.last_insert_rowid().to_string())
    }

    pub fn list_courses(&self) -> Result<Vec<Course>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, description, steps_json FROM courses ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut courses = Vec::new();
        for row in rows {
            let (id, title, description, steps_json) = row?;
            courses.push(Course {
                id: id.to_string(),
                title,
                description,
                steps: serde_json::from_str(&steps_json)?,
            });
        }
        Ok(courses)
    }

    pub fn register_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let hash = crypto::hash_password(password).ok_or(StoreError::Hash)?;
        let inserted = self.conn().execute(
            "INSERT INTO users (username, password_hash) VALUES (?1, ?2)
             ON CONFLICT(username) DO NOTHING",
            params![username, hash],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!("user {username}")));
        }
        Ok(())
    }

    pub fn verify_login(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let stored: Option<String> = self
            .conn()
            .query_row(
                "SELECT password_hash FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            Some(hash) if crypto::verify_password(password, &hash) => Ok(()),
            _ => Err(StoreError::Unauthorized),
        }
    }

    /// Record `{paso: step}` as the user's progress in `course_id`.
    pub fn save_progress(
        &self,
        username: &str,
        course_id: &str,
        step: &Value,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        if !user_exists(&conn, username)? {
            return Err(StoreError::NotFound(format!("user {username}")));
        }
        let step_json = serde_json::to_string(&serde_json::json!({ "paso": step }))?;
        conn.execute(
            "INSERT INTO progress (username, course_id, step_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(username, course_id) DO UPDATE SET
               step_json = excluded.step_json,
               updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            params![username, course_id, step_json],
        )?;
        Ok(())
    }

    /// All progress for a user as `{course_id: {paso}}`.
    pub fn get_progress(&self, username: &str) -> Result<Value, StoreError> {
        let conn = self.conn();
        if !user_exists(&conn, username)? {
            return Err(StoreError::NotFound(format!("user {username}")));
        }
        let mut stmt = conn.prepare(
            "SELECT course_id, step_json FROM progress WHERE username = ?1 ORDER BY course_id",
        )?;
        let rows = stmt.query_map(params![username], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut progress = Map::new();
        for row in rows {
            let (course_id, step_json) = row?;
            progress.insert(course_id, serde_json::from_str(&step_json)?);
        }
        Ok(Value::Object(progress))
    }
}

fn user_exists(conn: &Connection, username: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
        params![username],
        |row| row.get(0),
    )
}

/// Uploaded step images are served from `/uploads/<name>`.
fn with_upload_path(mut step: Value) -> Value {
    if let Some(obj) = step.as_object_mut() {
        let image = match obj.get("imagen") {
            Some(Value::String(name)) if !name.is_empty() => {
                Value::String(format!("/uploads/{name}"))
            }
            _ => Value::Null,
        };
        obj.insert("imagen".to_string(), image);
    }
    step
}

/// Run a record operation on the blocking pool while holding `lease`.
pub async fn run_blocking<C, T, F>(lease: ConnectionLease<C>, op: F) -> Result<T, StoreError>
where
    C: StoreConnector<Handle = StoreHandle>,
    T: Send + 'static,
    F: FnOnce(&StoreHandle) -> Result<T, StoreError> + Send + 'static,
{
    let handle = lease.handle();
    let result = tokio::task::spawn_blocking(move || op(handle.as_ref())).await?;
    drop(lease);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn courses_roundtrip_with_upload_paths() {
        let store = StoreHandle::open_in_memory().unwrap();
        let id = store
            .insert_course(&NewCourse {
                title: Some("Seguridad".into()),
                description: Some("Curso básico".into()),
                steps: vec![
                    json!({"texto": "Paso 1", "imagen": "casco.png"}),
                    json!({"texto": "Paso 2"}),
                ],
            })
            .unwrap();

        let courses = store.list_courses().unwrap();
        assert_eq!(courses.len(), 1);
        assert_eq!(courses[0].id, id);
        assert_eq!(courses[0].steps[0]["imagen"], "/uploads/casco.png");
        assert_eq!(courses[0].steps[1]["imagen"], Value::Null);
    }

    #[test]
    fn courses_list_in_creation_order() {
        let store = StoreHandle::open_in_memory().unwrap();
        let course = |title: &str| NewCourse {
            title: Some(title.into()),
            description: None,
            steps: vec![],
        };
        let first = store.insert_course(&course("Primero")).unwrap();
        let second = store.insert_course(&course("Segundo")).unwrap();
        let third = store.insert_course(&course("Tercero")).unwrap();
        store
            .conn()
            .execute(
                "UPDATE courses SET created_at = '2020-01-01T00:00:00.000Z' WHERE id = ?1",
                params![third.parse::<i64>().unwrap()],
            )
            .unwrap();

        let ids: Vec<String> = store
            .list_courses()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, [third, first, second]);
    }

    #[test]
    fn course_serializes_with_frontend_field_names() {
        let course = Course {
            id: "1".into(),
            title: Some("T".into()),
            description: None,
            steps: vec![],
        };
        let value = serde_json::to_value(course).unwrap();
        assert_eq!(value["titulo"], "T");
        assert!(value.get("pasos").is_some());
    }

    #[test]
    fn duplicate_user_conflicts() {
        let store = StoreHandle::open_in_memory().unwrap();
        store.register_user("ana", "secreto").unwrap();
        assert!(matches!(
            store.register_user("ana", "otro"),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn login_checks_password_hash() {
        let store = StoreHandle::open_in_memory().unwrap();
        store.register_user("ana", "secreto").unwrap();
        assert!(store.verify_login("ana", "secreto").is_ok());
        assert!(matches!(
            store.verify_login("ana", "nope"),
            Err(StoreError::Unauthorized)
        ));
        assert!(matches!(
            store.verify_login("nadie", "secreto"),
            Err(StoreError::Unauthorized)
        ));
    }

    #[test]
    fn progress_is_upserted_per_course() {
        let store = StoreHandle::open_in_memory().unwrap();
        store.register_user("ana", "secreto").unwrap();
        store.save_progress("ana", "1", &json!(2)).unwrap();
        store.save_progress("ana", "1", &json!(3)).unwrap();
        store.save_progress("ana", "7", &json!(0)).unwrap();

        let progress = store.get_progress("ana").unwrap();
        assert_eq!(progress, json!({"1": {"paso": 3}, "7": {"paso": 0}}));
    }

    #[test]
    fn progress_for_unknown_user_is_not_found() {
        let store = StoreHandle::open_in_memory().unwrap();
        assert!(matches!(
            store.save_progress("nadie", "1", &json!(1)),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.get_progress("nadie"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn connector_opens_file_and_closes_unshared_handle() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SqliteConnector::new(dir.path().join("data").join("campusdock.db"));

        let handle = connector.open().await.unwrap();
        handle.register_user("ana", "secreto").unwrap();
        connector.close(Arc::new(handle)).await.unwrap();
        assert!(connector.db_path().exists());

        let reopened = connector.open().await.unwrap();
        assert!(reopened.verify_login("ana", "secreto").is_ok());
    }
}
