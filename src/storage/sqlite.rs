use crate::gate::BlockPolicyConfig;
use crate::models::{CountryCode, CountryStat};
use crate::storage::trait_def::{encode_blocked_countries, policy_from_settings};
use crate::storage::{Storage, ADMIN_COUNTRY_SETTING, BLOCKED_COUNTRIES_SETTING};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn get_setting(&self, name: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM gate_settings WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool.as_ref())
            .await?;

        Ok(value)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        // Per-country visitor statistics
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS country_visitor_stats (
                country_code TEXT NOT NULL PRIMARY KEY,
                total_visits INTEGER NOT NULL DEFAULT 0,
                blocked_visits INTEGER NOT NULL DEFAULT 0,
                first_visit INTEGER,
                last_visit INTEGER
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_country_total_visits ON country_visitor_stats(total_visits)",
        )
        .execute(self.pool.as_ref())
        .await?;

        // Block policy configuration
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gate_settings (
                name TEXT NOT NULL PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn record_visit(&self, country: &CountryCode, at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO country_visitor_stats
                (country_code, total_visits, blocked_visits, first_visit, last_visit)
            VALUES (?, 1, 0, ?, ?)
            ON CONFLICT(country_code) DO UPDATE SET
                total_visits = country_visitor_stats.total_visits + 1,
                first_visit = COALESCE(country_visitor_stats.first_visit, excluded.first_visit),
                last_visit = excluded.last_visit
            "#,
        )
        .bind(country.as_str())
        .bind(at)
        .bind(at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn record_blocked(&self, country: &CountryCode) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE country_visitor_stats
            SET blocked_visits = blocked_visits + 1
            WHERE country_code = ?
            "#,
        )
        .bind(country.as_str())
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_stats(&self) -> Result<Vec<CountryStat>> {
        let stats = sqlx::query_as::<_, CountryStat>(
            r#"
            SELECT country_code, total_visits, blocked_visits, first_visit, last_visit
            FROM country_visitor_stats
            ORDER BY total_visits DESC, country_code ASC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(stats)
    }

    async fn get_stat(&self, country: &CountryCode) -> Result<Option<CountryStat>> {
        let stat = sqlx::query_as::<_, CountryStat>(
            r#"
            SELECT country_code, total_visits, blocked_visits, first_visit, last_visit
            FROM country_visitor_stats
            WHERE country_code = ?
            "#,
        )
        .bind(country.as_str())
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(stat)
    }

    async fn preload(&self, codes: &[&str]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for raw in codes {
            let Ok(code) = CountryCode::parse(raw) else {
                tracing::debug!(code = %raw, "skipping invalid seed country code");
                continue;
            };

            let result = sqlx::query(
                r#"
                INSERT INTO country_visitor_stats (country_code, total_visits, blocked_visits)
                VALUES (?, 0, 0)
                ON CONFLICT(country_code) DO NOTHING
                "#,
            )
            .bind(code.as_str())
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn load_policy(&self) -> Result<BlockPolicyConfig> {
        let blocked = self.get_setting(BLOCKED_COUNTRIES_SETTING).await?;
        let admin = self.get_setting(ADMIN_COUNTRY_SETTING).await?;
        Ok(policy_from_settings(blocked, admin))
    }

    async fn save_blocked_countries(&self, countries: &BTreeSet<CountryCode>) -> Result<()> {
        let value = encode_blocked_countries(countries)?;

        sqlx::query(
            r#"
            INSERT INTO gate_settings (name, value)
            VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(BLOCKED_COUNTRIES_SETTING)
        .bind(value)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn claim_admin_country(&self, country: &CountryCode) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO gate_settings (name, value)
            VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            WHERE NOT (
                length(trim(gate_settings.value, ' ' || char(9, 10, 13))) = 2
                AND upper(trim(gate_settings.value, ' ' || char(9, 10, 13))) GLOB '[A-Z][A-Z]'
            )
            "#,
        )
        .bind(ADMIN_COUNTRY_SETTING)
        .bind(country.as_str())
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_admin_country(&self) -> Result<bool> {
        let result = sqlx::query("DELETE FROM gate_settings WHERE name = ?")
            .bind(ADMIN_COUNTRY_SETTING)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
