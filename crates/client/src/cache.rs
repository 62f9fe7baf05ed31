//! Local product cache for offline fallback.
//!
//! A best-effort snapshot of the remote catalog, persisted in SQLite and
//! refreshed opportunistically whenever a remote fetch succeeds. Never
//! authoritative while online; staleness is acceptable and unversioned.
//! Storage trouble degrades to empty results — the fallback path must not
//! be able to crash the search controller.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use almacen_core::{DomainError, ProductId, ProductRecord};

/// Where the backing database lives.
#[derive(Debug, Clone)]
enum CacheLocation {
    /// `{app_data_dir}/almacen/cache.db`.
    Default,
    /// Explicit file path (embedding shells with their own data dir).
    Path(PathBuf),
    /// Private in-memory database (tests, ephemeral sessions).
    InMemory,
}

/// SQLite-backed product cache.
///
/// Cheap to clone; clones share one lazily initialized pool. The database
/// is created on first use.
#[derive(Debug, Clone)]
pub struct ProductCache {
    pool: Arc<Mutex<Option<SqlitePool>>>,
    location: CacheLocation,
}

impl ProductCache {
    /// Cache at the platform's default data directory.
    pub fn new() -> Self {
        Self::at_location(CacheLocation::Default)
    }

    /// Cache backed by an explicit database file.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self::at_location(CacheLocation::Path(path.into()))
    }

    /// Cache that lives and dies with the process.
    pub fn in_memory() -> Self {
        Self::at_location(CacheLocation::InMemory)
    }

    fn at_location(location: CacheLocation) -> Self {
        Self {
            pool: Arc::new(Mutex::new(None)),
            location,
        }
    }

    /// Bulk upsert keyed by product id.
    ///
    /// Additive: entries absent from `records` are kept. Failures are
    /// logged and swallowed — the cache is opportunistic.
    pub async fn save_all(&self, records: &[ProductRecord]) {
        if records.is_empty() {
            return;
        }
        if let Err(err) = self.try_save_all(records).await {
            tracing::error!(error = ?err, "failed to cache products");
        }
    }

    /// Exact barcode lookup.
    pub async fn find_by_code(&self, code: &str) -> Option<ProductRecord> {
        match self.try_find_by_code(code).await {
            Ok(found) => found,
            Err(err) => {
                tracing::error!(error = ?err, "barcode lookup against cache failed");
                None
            }
        }
    }

    /// Case-insensitive substring search over name and category.
    ///
    /// Returns at most `limit` records; order is stable for identical
    /// input (name, then id).
    pub async fn search(&self, text: &str, limit: u32) -> Vec<ProductRecord> {
        match self.try_search(text, limit).await {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(error = ?err, "cache search failed");
                Vec::new()
            }
        }
    }

    /// Wholesale reset (logout path).
    pub async fn clear(&self) {
        if let Err(err) = self.try_clear().await {
            tracing::error!(error = ?err, "failed to clear product cache");
        }
    }

    /// Initialize the database connection (called lazily on first use).
    async fn ensure_initialized(&self) -> anyhow::Result<()> {
        let mut pool_guard = self.pool.lock().await;
        if pool_guard.is_some() {
            return Ok(());
        }

        let pool = match &self.location {
            CacheLocation::Default => connect_file(default_db_path()?).await?,
            CacheLocation::Path(path) => connect_file(path.clone()).await?,
            CacheLocation::InMemory => {
                // A fresh connection gets a fresh in-memory database, so
                // the pool must hold exactly one connection for its whole
                // lifetime.
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect("sqlite::memory:")
                    .await
                    .context("failed to open in-memory product cache")?
            }
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id        TEXT PRIMARY KEY,
                name      TEXT NOT NULL,
                category  TEXT NOT NULL,
                price     INTEGER NOT NULL,
                stock     INTEGER NOT NULL,
                barcode   TEXT NULL,
                cached_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create products table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS products_barcode ON products(barcode)")
            .execute(&pool)
            .await
            .context("failed to create barcode index")?;

        *pool_guard = Some(pool);
        Ok(())
    }

    /// Get the pool, initializing if necessary.
    async fn get_pool(&self) -> anyhow::Result<SqlitePool> {
        self.ensure_initialized().await?;
        let pool_guard = self.pool.lock().await;
        pool_guard
            .as_ref()
            .cloned()
            .context("product cache pool missing after initialization")
    }

    async fn try_save_all(&self, records: &[ProductRecord]) -> anyhow::Result<()> {
        let pool = self.get_pool().await?;
        let now = Utc::now().to_rfc3339();

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO products (id, name, category, price, stock, barcode, cached_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    category = excluded.category,
                    price = excluded.price,
                    stock = excluded.stock,
                    barcode = excluded.barcode,
                    cached_at = excluded.cached_at
                "#,
            )
            .bind(record.id.to_string())
            .bind(&record.name)
            .bind(&record.category)
            .bind(record.price as i64)
            .bind(record.stock)
            .bind(record.barcode.as_deref())
            .bind(&now)
            .execute(&pool)
            .await
            .context("failed to upsert cached product")?;
        }

        Ok(())
    }

    async fn try_find_by_code(&self, code: &str) -> anyhow::Result<Option<ProductRecord>> {
        let pool = self.get_pool().await?;

        let row = sqlx::query(
            r#"
            SELECT id, name, category, price, stock, barcode
            FROM products
            WHERE barcode = ?1
            LIMIT 1
            "#,
        )
        .bind(code)
        .fetch_optional(&pool)
        .await
        .context("failed to look up product by barcode")?;

        row.map(row_to_product).transpose()
    }

    async fn try_search(&self, text: &str, limit: u32) -> anyhow::Result<Vec<ProductRecord>> {
        let pool = self.get_pool().await?;
        let needle = format!("%{}%", escape_like(text.trim()).to_lowercase());

        let rows = sqlx::query(
            r#"
            SELECT id, name, category, price, stock, barcode
            FROM products
            WHERE lower(name) LIKE ?1 ESCAPE '\'
               OR lower(category) LIKE ?1 ESCAPE '\'
            ORDER BY name, id
            LIMIT ?2
            "#,
        )
        .bind(&needle)
        .bind(i64::from(limit))
        .fetch_all(&pool)
        .await
        .context("failed to search product cache")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(row_to_product(row)?);
        }
        Ok(records)
    }

    async fn try_clear(&self) -> anyhow::Result<()> {
        let pool = self.get_pool().await?;
        sqlx::query("DELETE FROM products")
            .execute(&pool)
            .await
            .context("failed to clear products table")?;
        Ok(())
    }
}

impl Default for ProductCache {
    fn default() -> Self {
        Self::new()
    }
}

async fn connect_file(path: PathBuf) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create cache directory at {:?}", parent))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open product cache at {:?}", path))
}

/// Map a database row into a `ProductRecord`.
fn row_to_product(row: SqliteRow) -> anyhow::Result<ProductRecord> {
    let id_str: String = row.try_get("id")?;
    let id = id_str
        .parse::<ProductId>()
        .context("invalid product id in cache")?;

    let name: String = row.try_get("name")?;
    let category: String = row.try_get("category")?;

    let price: i64 = row.try_get("price")?;
    let price = u64::try_from(price)
        .map_err(|_| DomainError::validation(format!("negative cached price: {}", price)))?;

    let stock: i64 = row.try_get("stock")?;
    let barcode: Option<String> = row.try_get("barcode")?;

    Ok(ProductRecord {
        id,
        name,
        category,
        price,
        stock,
        barcode,
    })
}

/// Escape `%` and `_` so user input cannot act as a wildcard.
fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Resolve the path to the SQLite cache database:
/// `{app_data_dir}/almacen/cache.db`.
fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut home| {
                home.push(".local");
                home.push("share");
                home
            })
        })
        .context("failed to resolve OS app data directory")?;

    let mut dir = base;
    dir.push("almacen");
    dir.push("cache.db");
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, category: &str, barcode: Option<&str>) -> ProductRecord {
        ProductRecord {
            id: ProductId::new(),
            name: name.to_string(),
            category: category.to_string(),
            price: 990,
            stock: 12,
            barcode: barcode.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_id_and_keeps_absent_entries() {
        let cache = ProductCache::in_memory();

        let mut bread = record("Pan Lactal", "Panadería", None);
        let milk = record("Leche Entera", "Lácteos", None);
        cache.save_all(&[bread.clone(), milk.clone()]).await;

        // Second batch only carries an updated bread; milk must survive.
        bread.stock = 3;
        cache.save_all(&[bread.clone()]).await;

        let all = cache.search("", 50).await;
        assert_eq!(all.len(), 2);

        let stored_bread = all.iter().find(|p| p.id == bread.id).unwrap();
        assert_eq!(stored_bread.stock, 3);
    }

    #[tokio::test]
    async fn barcode_lookup_is_exact() {
        let cache = ProductCache::in_memory();

        let scanned = record("Yerba Mate", "Almacén", Some("7790001234567"));
        cache
            .save_all(&[scanned.clone(), record("Azúcar", "Almacén", Some("7790007654321"))])
            .await;

        assert_eq!(cache.find_by_code("7790001234567").await, Some(scanned));
        assert_eq!(cache.find_by_code("779000123456").await, None);
        assert_eq!(cache.find_by_code("").await, None);
    }

    #[tokio::test]
    async fn search_matches_name_and_category_case_insensitively() {
        let cache = ProductCache::in_memory();
        cache
            .save_all(&[
                record("Pan Lactal", "Panadería", None),
                record("Pan Francés", "Panadería", None),
                record("Leche", "Lácteos", None),
            ])
            .await;

        let matches = cache.search("pan", 50).await;
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|p| p.name.starts_with("Pan")));

        // Category text matches too.
        let by_category = cache.search("lácteos", 50).await;
        assert_eq!(by_category.len(), 1);
        assert_eq!(by_category[0].name, "Leche");
    }

    #[tokio::test]
    async fn search_honors_the_limit_with_stable_order() {
        let cache = ProductCache::in_memory();
        cache
            .save_all(&[
                record("Pan Rallado", "Almacén", None),
                record("Pan Lactal", "Panadería", None),
                record("Pan Francés", "Panadería", None),
            ])
            .await;

        let bounded = cache.search("pan", 2).await;
        assert_eq!(bounded.len(), 2);
        // Name-ordered, so the same two rows come back every time.
        assert_eq!(bounded[0].name, "Pan Francés");
        assert_eq!(bounded[1].name, "Pan Lactal");
    }

    #[tokio::test]
    async fn wildcard_characters_in_input_are_literal() {
        let cache = ProductCache::in_memory();
        cache
            .save_all(&[record("Pan 100% Integral", "Panadería", None)])
            .await;

        assert_eq!(cache.search("100%", 50).await.len(), 1);
        assert_eq!(cache.search("%", 50).await.len(), 1);
        assert!(cache.search("0_0", 50).await.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_empty_results() {
        // A path under a character device cannot be created.
        let cache = ProductCache::at_path("/dev/null/nested/cache.db");

        cache.save_all(&[record("Pan Lactal", "Panadería", None)]).await;

        assert!(cache.search("pan", 50).await.is_empty());
        assert_eq!(cache.find_by_code("123").await, None);
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let cache = ProductCache::in_memory();
        cache
            .save_all(&[record("Pan Lactal", "Panadería", None)])
            .await;

        cache.clear().await;

        assert!(cache.search("", 50).await.is_empty());
    }
}
