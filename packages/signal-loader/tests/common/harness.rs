//! Test harness with testcontainers for Postgres-backed tests.
//!
//! One container is started for the whole test binary and migrated once.
//! The same database doubles as the external source: tests create their own
//! source tables and register it under [`SOURCE_REF`].

use std::collections::HashMap;

use anyhow::{Context, Result};
use signal_loader::{PgSourceRegistry, PostgresSignalSink, PostgresStore};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

pub const SOURCE_REF: &str = "warehouse";

struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --ignored --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!(
            "postgresql://postgres:postgres@{}:{}/postgres",
            pg_host, pg_port
        );

        let store = PostgresStore::connect(&db_url, 5)
            .await
            .context("Failed to connect to Postgres for migrations")?;
        store.migrate().await.context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test handles onto the shared database.
///
/// ```ignore
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// #[ignore = "requires Docker"]
/// async fn my_test(ctx: &TestHarness) {
///     let job = ctx.store.upsert_job(definition).await.unwrap();
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
    pub store: PostgresStore,
    pub sink: PostgresSignalSink,
    db_url: String,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_pool = PgPool::connect(&infra.db_url)
            .await
            .context("Failed to connect to test database")?;

        Ok(Self {
            store: PostgresStore::from_pool(db_pool.clone()),
            sink: PostgresSignalSink::new(db_pool.clone()),
            db_url: infra.db_url.clone(),
            db_pool,
        })
    }

    /// Source registry resolving [`SOURCE_REF`] to the test database.
    pub fn source_registry(&self) -> PgSourceRegistry {
        PgSourceRegistry::new(HashMap::from([(SOURCE_REF.to_string(), self.db_url.clone())]))
    }

    /// Create a source table `(ts timestamptz, segment text, count bigint)`.
    pub async fn create_source_table(&self, table: &str) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE {table} (ts TIMESTAMPTZ NOT NULL, segment TEXT, count BIGINT NOT NULL)"
        ))
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    pub async fn insert_source_row(
        &self,
        table: &str,
        ts: chrono::DateTime<chrono::Utc>,
        segment: &str,
        count: i64,
    ) -> Result<()> {
        sqlx::query(&format!("INSERT INTO {table} (ts, segment, count) VALUES ($1, $2, $3)"))
            .bind(ts)
            .bind(segment)
            .bind(count)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }
}
