use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One routable upstream: a client-visible id mapped to an endpoint,
/// credentials and wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provider: String,
    /// Wire format spoken by the upstream: anthropic | openai |
    /// openai_responses.
    #[serde(default, rename = "interface_type")]
    pub interface: String,
    /// Model id sent upstream; the local `id` is used when blank.
    #[serde(default)]
    pub upstream_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub forward_metadata: bool,
    #[serde(default)]
    pub forward_thinking: bool,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_qps: f64,
    /// Non-empty: requests go through this operator's forwarding strategy.
    #[serde(default)]
    pub operator_id: String,
    /// Optional override of the client-visible reply format.
    #[serde(default)]
    pub response_format: String,
    /// Price per 1000 tokens.
    #[serde(default)]
    pub input_price: f64,
    #[serde(default)]
    pub output_price: f64,
}

impl Backend {
    /// The `model` value placed in the forwarded body.
    pub fn upstream_model(&self) -> &str {
        let up = self.upstream_id.trim();
        if up.is_empty() { self.id.trim() } else { up }
    }

    /// Interface with legacy aliases folded in.
    pub fn normalized_interface(&self) -> &'static str {
        let it = self.interface.trim();
        if it.eq_ignore_ascii_case("anthropic") {
            "anthropic"
        } else if it.eq_ignore_ascii_case("openai_responses")
            || it.eq_ignore_ascii_case("openai_response")
        {
            "openai_responses"
        } else {
            // openai, openai_compatible, blank
            "openai"
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboItem {
    pub backend_id: String,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// A virtual backend id that resolves to one member backend per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Combo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub items: Vec<ComboItem>,
}

#[derive(Clone)]
pub struct BackendStore {
    pool: Pool<Sqlite>,
    combo_ids: Arc<RwLock<Option<HashSet<String>>>>,
}

impl BackendStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS backends (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                provider TEXT NOT NULL DEFAULT '',
                interface TEXT NOT NULL DEFAULT '',
                upstream_id TEXT NOT NULL DEFAULT '',
                api_key TEXT NOT NULL DEFAULT '',
                base_url TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                forward_metadata INTEGER NOT NULL DEFAULT 0,
                forward_thinking INTEGER NOT NULL DEFAULT 0,
                max_qps REAL NOT NULL DEFAULT 0,
                operator_id TEXT NOT NULL DEFAULT '',
                response_format TEXT NOT NULL DEFAULT '',
                input_price REAL NOT NULL DEFAULT 0,
                output_price REAL NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS combos (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS combo_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                combo_id TEXT NOT NULL,
                backend_id TEXT NOT NULL,
                weight REAL NOT NULL DEFAULT 0,
                keywords TEXT NOT NULL DEFAULT '[]',
                FOREIGN KEY (combo_id) REFERENCES combos(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_combo_items_combo ON combo_items(combo_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            pool,
            combo_ids: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Backend>, String> {
        let id = id.trim();
        if id.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(BACKEND_COLUMNS_QUERY)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        match row {
            Some(row) => Ok(Some(row_to_backend(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<Backend>, String> {
        let rows = sqlx::query(
            "SELECT id, name, provider, interface, upstream_id, api_key, base_url, description, \
             enabled, forward_metadata, forward_thinking, max_qps, operator_id, response_format, \
             input_price, output_price FROM backends ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_backend).collect()
    }

    pub async fn upsert(&self, backend: &Backend) -> Result<(), String> {
        if backend.id.trim().is_empty() {
            return Err("backend id required".to_string());
        }
        sqlx::query(
            r#"INSERT INTO backends (
                id, name, provider, interface, upstream_id, api_key, base_url, description,
                enabled, forward_metadata, forward_thinking, max_qps, operator_id,
                response_format, input_price, output_price
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                provider = excluded.provider,
                interface = excluded.interface,
                upstream_id = excluded.upstream_id,
                api_key = excluded.api_key,
                base_url = excluded.base_url,
                description = excluded.description,
                enabled = excluded.enabled,
                forward_metadata = excluded.forward_metadata,
                forward_thinking = excluded.forward_thinking,
                max_qps = excluded.max_qps,
                operator_id = excluded.operator_id,
                response_format = excluded.response_format,
                input_price = excluded.input_price,
                output_price = excluded.output_price"#,
        )
        .bind(backend.id.trim())
        .bind(&backend.name)
        .bind(&backend.provider)
        .bind(&backend.interface)
        .bind(&backend.upstream_id)
        .bind(&backend.api_key)
        .bind(&backend.base_url)
        .bind(&backend.description)
        .bind(backend.enabled)
        .bind(backend.forward_metadata)
        .bind(backend.forward_thinking)
        .bind(backend.max_qps)
        .bind(&backend.operator_id)
        .bind(&backend.response_format)
        .bind(backend.input_price)
        .bind(backend.output_price)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, String> {
        let result = sqlx::query("DELETE FROM backends WHERE id = ?")
            .bind(id.trim())
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// O(1) combo-id membership check backed by a cached id set. The cache is
    /// dropped on every combo write.
    pub async fn is_combo(&self, id: &str) -> Result<bool, String> {
        let id = id.trim();
        if id.is_empty() {
            return Ok(false);
        }
        {
            let cache = self.combo_ids.read().await;
            if let Some(ids) = cache.as_ref() {
                return Ok(ids.contains(id));
            }
        }
        let mut cache = self.combo_ids.write().await;
        if cache.is_none() {
            let rows = sqlx::query("SELECT id FROM combos")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
            let mut ids = HashSet::with_capacity(rows.len());
            for row in &rows {
                ids.insert(row.try_get::<String, _>("id").map_err(|e| e.to_string())?);
            }
            *cache = Some(ids);
        }
        Ok(cache.as_ref().map(|ids| ids.contains(id)).unwrap_or(false))
    }

    async fn invalidate_combo_cache(&self) {
        *self.combo_ids.write().await = None;
    }

    pub async fn get_combo(&self, id: &str) -> Result<Option<Combo>, String> {
        let id = id.trim();
        if id.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query("SELECT id, name, description, enabled FROM combos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut combo = Combo {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            name: row.try_get("name").map_err(|e| e.to_string())?,
            description: row.try_get("description").map_err(|e| e.to_string())?,
            enabled: row.try_get::<i64, _>("enabled").map_err(|e| e.to_string())? != 0,
            items: Vec::new(),
        };
        let items = sqlx::query(
            "SELECT backend_id, weight, keywords FROM combo_items WHERE combo_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        for item in &items {
            let keywords_json: String = item.try_get("keywords").map_err(|e| e.to_string())?;
            combo.items.push(ComboItem {
                backend_id: item.try_get("backend_id").map_err(|e| e.to_string())?,
                weight: item.try_get("weight").map_err(|e| e.to_string())?,
                keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
            });
        }
        Ok(Some(combo))
    }

    pub async fn list_combos(&self) -> Result<Vec<Combo>, String> {
        let rows = sqlx::query("SELECT id FROM combos ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id").map_err(|e| e.to_string())?;
            if let Some(combo) = self.get_combo(&id).await? {
                out.push(combo);
            }
        }
        Ok(out)
    }

    pub async fn upsert_combo(&self, combo: &Combo) -> Result<(), String> {
        if combo.id.trim().is_empty() {
            return Err("combo id required".to_string());
        }
        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;
        sqlx::query(
            r#"INSERT INTO combos (id, name, description, enabled) VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   description = excluded.description,
                   enabled = excluded.enabled"#,
        )
        .bind(combo.id.trim())
        .bind(&combo.name)
        .bind(&combo.description)
        .bind(combo.enabled)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("DELETE FROM combo_items WHERE combo_id = ?")
            .bind(combo.id.trim())
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;
        for item in &combo.items {
            let keywords = serde_json::to_string(&item.keywords)
                .unwrap_or_else(|_| "[]".to_string());
            sqlx::query(
                "INSERT INTO combo_items (combo_id, backend_id, weight, keywords) VALUES (?, ?, ?, ?)",
            )
            .bind(combo.id.trim())
            .bind(item.backend_id.trim())
            .bind(item.weight)
            .bind(keywords)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;
        }
        tx.commit().await.map_err(|e| e.to_string())?;
        self.invalidate_combo_cache().await;
        Ok(())
    }

    pub async fn delete_combo(&self, id: &str) -> Result<bool, String> {
        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;
        sqlx::query("DELETE FROM combo_items WHERE combo_id = ?")
            .bind(id.trim())
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;
        let result = sqlx::query("DELETE FROM combos WHERE id = ?")
            .bind(id.trim())
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;
        tx.commit().await.map_err(|e| e.to_string())?;
        self.invalidate_combo_cache().await;
        Ok(result.rows_affected() > 0)
    }
}

const BACKEND_COLUMNS_QUERY: &str =
    "SELECT id, name, provider, interface, upstream_id, api_key, base_url, description, enabled, \
     forward_metadata, forward_thinking, max_qps, operator_id, response_format, input_price, \
     output_price FROM backends WHERE id = ?";

fn row_to_backend(row: &sqlx::sqlite::SqliteRow) -> Result<Backend, String> {
    Ok(Backend {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        provider: row.try_get("provider").map_err(|e| e.to_string())?,
        interface: row.try_get("interface").map_err(|e| e.to_string())?,
        upstream_id: row.try_get("upstream_id").map_err(|e| e.to_string())?,
        api_key: row.try_get("api_key").map_err(|e| e.to_string())?,
        base_url: row.try_get("base_url").map_err(|e| e.to_string())?,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        enabled: row.try_get::<i64, _>("enabled").map_err(|e| e.to_string())? != 0,
        forward_metadata: row
            .try_get::<i64, _>("forward_metadata")
            .map_err(|e| e.to_string())?
            != 0,
        forward_thinking: row
            .try_get::<i64, _>("forward_thinking")
            .map_err(|e| e.to_string())?
            != 0,
        max_qps: row.try_get("max_qps").map_err(|e| e.to_string())?,
        operator_id: row.try_get("operator_id").map_err(|e| e.to_string())?,
        response_format: row.try_get("response_format").map_err(|e| e.to_string())?,
        input_price: row.try_get("input_price").map_err(|e| e.to_string())?,
        output_price: row.try_get("output_price").map_err(|e| e.to_string())?,
    })
}
