//! Per-test Postgres databases.
//!
//! Each test gets its own throwaway database so tests can run in parallel
//! without stepping on each other. The database is dropped when the test
//! passes and kept for inspection when it fails (or when `TEST_KEEP_DB`
//! is set).
//!
//! Requires `TEST_ADMIN_DATABASE_URL` pointing at a database with
//! CREATE/DROP DATABASE privileges (e.g. `postgres://localhost/postgres`).
//! When the variable is unset, tests skip instead of failing so the suite
//! stays green on machines without Postgres.
//!
//! Schema setup is up to the test body: the engine migrates itself on
//! start, and store-level tests invoke the migrator directly.

use std::{future::Future, pin::Pin};

use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, Connection, Executor, PgConnection, PgPool};
use url::Url;
use uuid::Uuid;

/// Run `f` against a pool connected to a freshly created database.
///
/// Cleanup only happens when `f` returns `Ok` and `TEST_KEEP_DB` is
/// unset; failures and panics leave the database behind for debugging.
pub async fn with_test_db<F>(test_name: &str, f: F) -> Result<()>
where
    F: for<'a> FnOnce(&'a PgPool) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>>,
{
    dotenvy::from_filename(".env").ok();

    let Ok(admin_url) = std::env::var("TEST_ADMIN_DATABASE_URL") else {
        eprintln!("[test-utils] TEST_ADMIN_DATABASE_URL not set, skipping '{test_name}'");
        return Ok(());
    };

    let db_name = test_db_name(test_name);
    let mut admin = PgConnection::connect(&admin_url).await?;
    admin
        .execute(format!(r#"CREATE DATABASE "{db_name}""#).as_str())
        .await?;

    let mut db_url = Url::parse(&admin_url)?;
    db_url.set_path(&format!("/{db_name}"));
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(db_url.as_str())
        .await?;

    let outcome = f(&pool).await;

    if outcome.is_ok() && std::env::var("TEST_KEEP_DB").is_err() {
        // Release every connection before dropping the database.
        pool.close().await;
        if let Err(e) = admin
            .execute(format!(r#"DROP DATABASE IF EXISTS "{db_name}" WITH (FORCE)"#).as_str())
            .await
        {
            eprintln!("[test-utils] could not drop '{db_name}': {e}");
        }
    } else {
        eprintln!("[test-utils] keeping database '{db_name}' for inspection");
    }

    outcome
}

/// Derive a unique, valid database name from a test name.
///
/// Postgres identifiers cap at 63 bytes, so the sanitized test name is
/// truncated to leave room for the prefix and a random hex suffix.
fn test_db_name(test_name: &str) -> String {
    const MAX_IDENT: usize = 63;
    const PREFIX: &str = "rl_test_";
    const SUFFIX_LEN: usize = 12;

    let mut stem: String = test_name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                c
            } else {
                '_'
            }
        })
        .collect();
    stem.truncate(MAX_IDENT - PREFIX.len() - 1 - SUFFIX_LEN);
    let stem = stem.trim_matches('_');

    let id = Uuid::new_v4().simple().to_string();
    format!("{PREFIX}{stem}_{}", &id[..SUFFIX_LEN])
}

/// Define a Postgres-backed async test.
///
/// ```ignore
/// use test_utils::pg_test;
///
/// pg_test!(inserts_a_row, pool => {
///     sqlx::query("SELECT 1").execute(pool).await?;
///     Ok(())
/// });
/// ```
///
/// Expands to a `#[tokio::test(flavor = "multi_thread")]` function whose
/// body runs through [`with_test_db`](crate::db::with_test_db) with
/// `pool` bound to the fresh database's `&PgPool`.
#[macro_export]
macro_rules! pg_test {
    ($name:ident, $pool:ident => $body:block) => {
        #[tokio::test(flavor = "multi_thread")]
        async fn $name() -> anyhow::Result<()> {
            $crate::db::with_test_db(stringify!($name), |$pool| {
                ::std::boxed::Box::pin(async move { $body })
            })
            .await
        }
    };
}
