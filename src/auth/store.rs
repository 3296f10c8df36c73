//! Operator account storage
//! Mission: A small SQLite-backed account store for the admin surface

use anyhow::{Context, Result};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::models::{Operator, Role};

pub struct OperatorStore {
    conn: Arc<Mutex<Connection>>,
}

impl OperatorStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open operator database: {db_path}"))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS operators (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                org_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.seed_default_admin()?;
        Ok(store)
    }

    /// Seed an admin account on first start so the admin surface is usable.
    fn seed_default_admin(&self) -> Result<()> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM operators WHERE role = 'admin'",
                [],
                |row| row.get(0),
            )
            .context("Failed to check for admin operators")?;

        if count == 0 {
            let password_hash =
                hash("admin123", DEFAULT_COST).context("Failed to hash password")?;
            conn.execute(
                "INSERT INTO operators (id, username, password_hash, role, org_id, created_at)
                 VALUES (?1, ?2, ?3, 'admin', 'default', ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    "admin",
                    password_hash,
                    Utc::now().to_rfc3339(),
                ],
            )?;

            info!("🔐 Default admin operator created (username: admin)");
            warn!("⚠️  CHANGE DEFAULT PASSWORD IN PRODUCTION!");
        }
        Ok(())
    }

    pub fn by_username(&self, username: &str) -> Result<Option<Operator>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT id, username, password_hash, role, org_id, created_at
                 FROM operators WHERE username = ?1",
                params![username],
                |row| {
                    let id: String = row.get(0)?;
                    let role: String = row.get(3)?;
                    Ok(Operator {
                        id: Uuid::parse_str(&id).unwrap_or_default(),
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        role: Role::from_str(&role).unwrap_or(Role::Viewer),
                        org_id: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(result)
    }

    pub fn verify_password(&self, username: &str, password: &str) -> Result<Option<Operator>> {
        match self.by_username(username)? {
            Some(operator) => {
                let valid = verify(password, &operator.password_hash)
                    .context("Failed to verify password")?;
                Ok(valid.then_some(operator))
            }
            None => Ok(None),
        }
    }

    pub fn create(
        &self,
        username: &str,
        password: &str,
        role: Role,
        org_id: &str,
    ) -> Result<Operator> {
        let operator = Operator {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: hash(password, DEFAULT_COST).context("Failed to hash password")?,
            role,
            org_id: org_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO operators (id, username, password_hash, role, org_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                operator.id.to_string(),
                operator.username,
                operator.password_hash,
                operator.role.as_str(),
                operator.org_id,
                operator.created_at,
            ],
        )
        .context("Failed to insert operator")?;

        info!(username = %operator.username, role = operator.role.as_str(), "✅ Operator created");
        Ok(operator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn store() -> (OperatorStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = OperatorStore::new(file.path().to_str().unwrap()).unwrap();
        (store, file)
    }

    #[test]
    fn test_default_admin_seeded() {
        let (store, _f) = store();
        let admin = store.by_username("admin").unwrap().unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(store.verify_password("admin", "admin123").unwrap().is_some());
        assert!(store.verify_password("admin", "wrong").unwrap().is_none());
    }

    #[test]
    fn test_create_analyst() {
        let (store, _f) = store();
        store
            .create("rivera", "hunter2hunter2", Role::Analyst, "org_1")
            .unwrap();

        let analyst = store
            .verify_password("rivera", "hunter2hunter2")
            .unwrap()
            .unwrap();
        assert_eq!(analyst.role, Role::Analyst);
        assert_eq!(analyst.org_id, "org_1");
    }

    #[test]
    fn test_unknown_user() {
        let (store, _f) = store();
        assert!(store.by_username("ghost").unwrap().is_none());
        assert!(store.verify_password("ghost", "pw").unwrap().is_none());
    }
}
