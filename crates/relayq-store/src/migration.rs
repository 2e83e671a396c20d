//! Embedded schema migrations: a `_relayq_migrations` tracking table, a
//! `Vec<Migration>` of raw SQL applied in version order, each inside its own
//! transaction.

use relayq_core::Result;
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: String,
}

#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub version: i64,
    pub name: String,
    pub applied: bool,
}

#[derive(Debug, Default)]
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Migrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    pub fn with_migrations(migrations: Vec<Migration>) -> Self {
        Self { migrations }
    }

    async fn ensure_tracking_table(pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _relayq_migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn run(&self, pool: &PgPool) -> Result<()> {
        Self::ensure_tracking_table(pool).await?;

        let mut ordered = self.migrations.clone();
        ordered.sort_by_key(|m| m.version);

        for migration in ordered {
            let applied: Option<i64> =
                sqlx::query_scalar("SELECT version FROM _relayq_migrations WHERE version = $1")
                    .bind(migration.version)
                    .fetch_optional(pool)
                    .await?;

            if applied.is_some() {
                continue;
            }

            let mut tx = pool.begin().await?;
            sqlx::query(&migration.sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO _relayq_migrations (version, name) VALUES ($1, $2)")
                .bind(migration.version)
                .bind(migration.name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            tracing::info!(version = migration.version, name = migration.name, "applied migration");
        }

        Ok(())
    }

    pub async fn status(&self, pool: &PgPool) -> Result<Vec<MigrationStatus>> {
        Self::ensure_tracking_table(pool).await?;

        let mut statuses = Vec::with_capacity(self.migrations.len());
        for migration in &self.migrations {
            let applied: Option<i64> =
                sqlx::query_scalar("SELECT version FROM _relayq_migrations WHERE version = $1")
                    .bind(migration.version)
                    .fetch_optional(pool)
                    .await?;

            statuses.push(MigrationStatus {
                version: migration.version,
                name: migration.name.to_string(),
                applied: applied.is_some(),
            });
        }
        Ok(statuses)
    }
}

/// Builds the single migration creating the shared queue table plus the two
/// required indices: `(queue_name, is_dead_letter, next_delivery_ts)` for
/// the claim query, and `(queue_name, key, key_order)` for the per-key
/// head-of-line predicate.
pub fn create_initial_migrations(table_name: &str) -> Vec<Migration> {
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id UUID PRIMARY KEY,
            queue_name TEXT NOT NULL,
            payload_bytes BYTEA NOT NULL,
            payload_type TEXT NOT NULL,
            metadata_json JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            added_ts TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            next_delivery_ts TIMESTAMPTZ NOT NULL,
            delivery_attempts INT NOT NULL DEFAULT 0,
            redelivery_attempts INT NOT NULL DEFAULT 0,
            last_error TEXT,
            is_dead_letter BOOLEAN NOT NULL DEFAULT FALSE,
            delivery_mode TEXT NOT NULL DEFAULT 'normal',
            key TEXT,
            key_order BIGINT,
            claimed_at TIMESTAMPTZ,
            lease_expires_at TIMESTAMPTZ
        );

        CREATE INDEX IF NOT EXISTS idx_{table}_claim
            ON {table} (queue_name, is_dead_letter, next_delivery_ts);

        CREATE INDEX IF NOT EXISTS idx_{table}_ordering
            ON {table} (queue_name, key, key_order);
        "#,
        table = table_name,
    );

    vec![Migration {
        version: 1,
        name: "create_relayq_messages",
        sql,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_migration_names_both_required_indices() {
        let migrations = create_initial_migrations("relayq_messages");
        assert_eq!(migrations.len(), 1);
        assert!(migrations[0].sql.contains("idx_relayq_messages_claim"));
        assert!(migrations[0].sql.contains("idx_relayq_messages_ordering"));
    }

    #[test]
    fn migrator_add_preserves_order_regardless_of_call_order() {
        let migrator = Migrator::new()
            .add(Migration {
                version: 2,
                name: "second",
                sql: "SELECT 1".to_string(),
            })
            .add(Migration {
                version: 1,
                name: "first",
                sql: "SELECT 1".to_string(),
            });
        assert_eq!(migrator.migrations.len(), 2);
    }
}
