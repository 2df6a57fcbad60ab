use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

/// Gateway user. `quota` is in credit units; -1 means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub api_key: String,
    pub quota: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
    pub is_admin: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn admin(api_key: &str) -> Self {
        let now = Utc::now();
        Self {
            username: "admin".to_string(),
            api_key: api_key.to_string(),
            quota: -1.0,
            expire_at: None,
            is_admin: true,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn quota_unlimited(&self) -> bool {
        self.quota < 0.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageLog {
    pub id: i64,
    pub username: String,
    pub backend_id: String,
    pub provider: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub input_price: f64,
    pub output_price: f64,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorLog {
    pub id: i64,
    pub backend_id: String,
    pub username: String,
    pub status: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                api_key TEXT NOT NULL UNIQUE,
                quota REAL NOT NULL DEFAULT -1,
                expire_at TEXT,
                is_admin INTEGER NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS usage_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                backend_id TEXT NOT NULL,
                provider TEXT NOT NULL DEFAULT '',
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                input_price REAL NOT NULL DEFAULT 0,
                output_price REAL NOT NULL DEFAULT 0,
                total_cost REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_logs_user ON usage_logs(username, created_at DESC)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS error_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backend_id TEXT NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                status INTEGER NOT NULL DEFAULT 0,
                message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_error_logs_created ON error_logs(created_at)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn get_by_api_key(&self, api_key: &str) -> Result<Option<User>, String> {
        let key = api_key.trim();
        if key.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(
            "SELECT username, api_key, quota, expire_at, is_admin, input_tokens, output_tokens, \
             total_tokens, created_at, updated_at FROM users WHERE api_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        match row {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, username: &str) -> Result<Option<User>, String> {
        let row = sqlx::query(
            "SELECT username, api_key, quota, expire_at, is_admin, input_tokens, output_tokens, \
             total_tokens, created_at, updated_at FROM users WHERE username = ?",
        )
        .bind(username.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        match row {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<User>, String> {
        let rows = sqlx::query(
            "SELECT username, api_key, quota, expire_at, is_admin, input_tokens, output_tokens, \
             total_tokens, created_at, updated_at FROM users ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_user).collect()
    }

    pub async fn create(
        &self,
        username: &str,
        api_key: &str,
        quota: f64,
        expire_at: Option<DateTime<Utc>>,
        is_admin: bool,
    ) -> Result<User, String> {
        let username = username.trim();
        let api_key = api_key.trim();
        if username.is_empty() || api_key.is_empty() {
            return Err("username and api_key required".to_string());
        }
        if quota < -1.0 {
            return Err("quota must be -1 or >= 0".to_string());
        }
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (username, api_key, quota, expire_at, is_admin, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(api_key)
        .bind(quota)
        .bind(expire_at.map(|t| t.to_rfc3339()))
        .bind(is_admin)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(User {
            username: username.to_string(),
            api_key: api_key.to_string(),
            quota,
            expire_at,
            is_admin,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn update(
        &self,
        username: &str,
        api_key: Option<&str>,
        quota: Option<f64>,
        expire_at: Option<Option<DateTime<Utc>>>,
        is_admin: Option<bool>,
    ) -> Result<bool, String> {
        let mut sets: Vec<&str> = Vec::new();
        if let Some(key) = api_key {
            if key.trim().is_empty() {
                return Err("api_key required".to_string());
            }
            sets.push("api_key = ?");
        }
        if let Some(q) = quota {
            if q < -1.0 {
                return Err("quota must be -1 or >= 0".to_string());
            }
            sets.push("quota = ?");
        }
        if expire_at.is_some() {
            sets.push("expire_at = ?");
        }
        if is_admin.is_some() {
            sets.push("is_admin = ?");
        }
        if sets.is_empty() {
            return Ok(true);
        }
        sets.push("updated_at = ?");
        let sql = format!("UPDATE users SET {} WHERE username = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        if let Some(key) = api_key {
            query = query.bind(key.trim().to_string());
        }
        if let Some(q) = quota {
            query = query.bind(q);
        }
        if let Some(exp) = &expire_at {
            query = query.bind(exp.map(|t| t.to_rfc3339()));
        }
        if let Some(admin) = is_admin {
            query = query.bind(admin);
        }
        let result = query
            .bind(Utc::now().to_rfc3339())
            .bind(username.trim())
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, username: &str) -> Result<bool, String> {
        let result = sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username.trim())
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// Accumulate token counters and debit the quota in one statement.
    /// Cost = (input/1000) * input_price + (output/1000) * output_price.
    /// Unlimited quotas (-1) stay -1; finite quotas floor at 0.
    pub async fn add_usage(
        &self,
        username: &str,
        input_tokens: i64,
        output_tokens: i64,
        input_price: f64,
        output_price: f64,
    ) -> Result<(), String> {
        let username = username.trim();
        if username.is_empty() {
            return Ok(());
        }
        let input_tokens = input_tokens.max(0);
        let output_tokens = output_tokens.max(0);
        let cost = (input_tokens as f64 / 1000.0) * input_price.max(0.0)
            + (output_tokens as f64 / 1000.0) * output_price.max(0.0);
        sqlx::query(
            r#"UPDATE users SET
                input_tokens = input_tokens + ?,
                output_tokens = output_tokens + ?,
                total_tokens = total_tokens + ?,
                quota = CASE
                    WHEN quota < 0 THEN -1
                    WHEN quota - ? < 0 THEN 0
                    ELSE quota - ?
                END,
                updated_at = ?
            WHERE username = ?"#,
        )
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(input_tokens + output_tokens)
        .bind(cost)
        .bind(cost)
        .bind(Utc::now().to_rfc3339())
        .bind(username)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Append one usage row. Zero-token rows are written too, so request
    /// rates stay auditable.
    pub async fn record_usage_log(
        &self,
        username: &str,
        backend_id: &str,
        provider: &str,
        input_tokens: i64,
        output_tokens: i64,
        input_price: f64,
        output_price: f64,
    ) -> Result<(), String> {
        let username = username.trim();
        let backend_id = backend_id.trim();
        if username.is_empty() || backend_id.is_empty() {
            return Ok(());
        }
        let input_tokens = input_tokens.max(0);
        let output_tokens = output_tokens.max(0);
        let total_cost = (input_tokens as f64 / 1000.0) * input_price.max(0.0)
            + (output_tokens as f64 / 1000.0) * output_price.max(0.0);
        sqlx::query(
            "INSERT INTO usage_logs (username, backend_id, provider, input_tokens, output_tokens, \
             input_price, output_price, total_cost, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(backend_id)
        .bind(provider)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(input_price.max(0.0))
        .bind(output_price.max(0.0))
        .bind(total_cost)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn usage_logs_for(
        &self,
        username: &str,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<UsageLog>, i64), String> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 200);
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_logs WHERE username = ?")
            .bind(username.trim())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let rows = sqlx::query(
            "SELECT id, username, backend_id, provider, input_tokens, output_tokens, input_price, \
             output_price, total_cost, created_at FROM usage_logs WHERE username = ? \
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(username.trim())
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let logs = rows
            .iter()
            .map(row_to_usage_log)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((logs, total))
    }

    /// Delete usage logs older than `days`. Returns the number of rows purged.
    pub async fn purge_usage_logs_older_than(&self, days: i64) -> Result<u64, String> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let result = sqlx::query("DELETE FROM usage_logs WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected())
    }

    pub async fn record_error_log(
        &self,
        backend_id: &str,
        username: &str,
        status: i64,
        message: &str,
    ) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO error_logs (backend_id, username, status, message, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(backend_id.trim())
        .bind(username.trim())
        .bind(status)
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn recent_error_logs(&self, limit: i64) -> Result<Vec<ErrorLog>, String> {
        let rows = sqlx::query(
            "SELECT id, backend_id, username, status, message, created_at FROM error_logs \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter()
            .map(|row| {
                Ok(ErrorLog {
                    id: row.try_get("id").map_err(|e: sqlx::Error| e.to_string())?,
                    backend_id: row.try_get("backend_id").map_err(|e| e.to_string())?,
                    username: row.try_get("username").map_err(|e| e.to_string())?,
                    status: row.try_get("status").map_err(|e| e.to_string())?,
                    message: row.try_get("message").map_err(|e| e.to_string())?,
                    created_at: parse_ts(
                        &row.try_get::<String, _>("created_at")
                            .map_err(|e| e.to_string())?,
                    ),
                })
            })
            .collect()
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, String> {
    let expire_at: Option<String> = row.try_get("expire_at").map_err(|e| e.to_string())?;
    Ok(User {
        username: row.try_get("username").map_err(|e| e.to_string())?,
        api_key: row.try_get("api_key").map_err(|e| e.to_string())?,
        quota: row.try_get("quota").map_err(|e| e.to_string())?,
        expire_at: expire_at.as_deref().map(parse_ts),
        is_admin: row.try_get::<i64, _>("is_admin").map_err(|e| e.to_string())? != 0,
        input_tokens: row.try_get("input_tokens").map_err(|e| e.to_string())?,
        output_tokens: row.try_get("output_tokens").map_err(|e| e.to_string())?,
        total_tokens: row.try_get("total_tokens").map_err(|e| e.to_string())?,
        created_at: parse_ts(
            &row.try_get::<String, _>("created_at")
                .map_err(|e| e.to_string())?,
        ),
        updated_at: parse_ts(
            &row.try_get::<String, _>("updated_at")
                .map_err(|e| e.to_string())?,
        ),
    })
}

fn row_to_usage_log(row: &sqlx::sqlite::SqliteRow) -> Result<UsageLog, String> {
    Ok(UsageLog {
        id: row.try_get("id").map_err(|e: sqlx::Error| e.to_string())?,
        username: row.try_get("username").map_err(|e| e.to_string())?,
        backend_id: row.try_get("backend_id").map_err(|e| e.to_string())?,
        provider: row.try_get("provider").map_err(|e| e.to_string())?,
        input_tokens: row.try_get("input_tokens").map_err(|e| e.to_string())?,
        output_tokens: row.try_get("output_tokens").map_err(|e| e.to_string())?,
        input_price: row.try_get("input_price").map_err(|e| e.to_string())?,
        output_price: row.try_get("output_price").map_err(|e| e.to_string())?,
        total_cost: row.try_get("total_cost").map_err(|e| e.to_string())?,
        created_at: parse_ts(
            &row.try_get::<String, _>("created_at")
                .map_err(|e| e.to_string())?,
        ),
    })
}
