//! Admin account rows. Authentication lives in the external HTTP
//! layer; the core only persists credentials, hashing at this edge so
//! a plaintext password never crosses the repository boundary.

use super::Database;
use crate::error::{CoreError, Result};
use chrono::Utc;
use rusqlite::params;

#[derive(Debug, Clone)]
pub struct Admin {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Clone)]
pub struct AdminRepo {
    db: Database,
}

impl AdminRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, username: &str, email: &str, password: &str) -> Result<Admin> {
        if username.trim().is_empty() || email.trim().is_empty() {
            return Err(CoreError::InvalidInput("username and email are required".into()));
        }
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| CoreError::InvalidInput(format!("password hash failed: {e}")))?;
        let now = Utc::now().timestamp();
        let id = self.db.with(|c| {
            c.execute(
                "INSERT INTO admins (username, email, password_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![username, email, hash, now],
            )?;
            Ok(c.last_insert_rowid())
        })?;
        Ok(Admin {
            id,
            username: username.to_string(),
            email: email.to_string(),
            password_hash: hash,
        })
    }

    pub fn get_by_username(&self, username: &str) -> Result<Admin> {
        self.db
            .with(|c| {
                c.query_row(
                    "SELECT id, username, email, password_hash FROM admins WHERE username = ?1",
                    params![username],
                    |r| {
                        Ok(Admin {
                            id: r.get(0)?,
                            username: r.get(1)?,
                            email: r.get(2)?,
                            password_hash: r.get(3)?,
                        })
                    },
                )
            })
            .map_err(|e| match e {
                CoreError::Storage(rusqlite::Error::QueryReturnedNoRows) => {
                    CoreError::NotFound(format!("admin '{username}'"))
                }
                other => other,
            })
    }

    pub fn verify_password(&self, admin: &Admin, password: &str) -> bool {
        bcrypt::verify(password, &admin.password_hash).unwrap_or(false)
    }
}
