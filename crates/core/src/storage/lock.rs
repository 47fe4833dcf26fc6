use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use uuid::Uuid;

// Advisory locks are scoped to the Postgres session, so the guard pins one pooled connection
// and unlocks on that same connection. A guard dropped without a clean `release` closes its
// connection instead of returning it to the pool; ending the session frees the lock.
const LOCK_NAMESPACE: i64 = 0x4E41_5657_4154; // "NAVWAT"

fn lock_key_for_etf(etf_id: Uuid) -> i64 {
    let (hi, lo) = etf_id.as_u64_pair();
    LOCK_NAMESPACE ^ ((hi ^ lo) as i64)
}

#[derive(Debug)]
pub struct EtfRefreshLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

/// Returns `None` when another refresh of the same ETF holds the lock.
pub async fn try_acquire_etf_lock(
    pool: &sqlx::PgPool,
    etf_id: Uuid,
) -> anyhow::Result<Option<EtfRefreshLock>> {
    let key = lock_key_for_etf(etf_id);
    let mut conn = pool
        .acquire()
        .await
        .context("acquire connection for advisory lock failed")?;

    let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(key)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("failed to acquire advisory lock (key={key})"))?;

    Ok(acquired.0.then(|| EtfRefreshLock {
        conn: Some(conn),
        key,
    }))
}

impl EtfRefreshLock {
    /// Unlocks and hands the connection back to the pool. On error the guard is dropped,
    /// which closes the connection.
    pub async fn release(mut self) -> anyhow::Result<()> {
        let key = self.key;
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(key)
            .execute(&mut **conn)
            .await
            .with_context(|| format!("failed to release advisory lock (key={key})"))?;

        // Unlocked; the connection can go back to the pool.
        self.conn.take();
        Ok(())
    }
}

impl Drop for EtfRefreshLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!(key = self.key, "refresh lock dropped while held; closing its connection");
            // Detached from the pool, the connection is closed when dropped here.
            drop(conn.detach());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_stable_and_distinct() {
        let a = Uuid::from_u128(0x1234_5678_9abc_def0_1111_2222_3333_4444);
        let b = Uuid::from_u128(0x1234_5678_9abc_def0_1111_2222_3333_4445);
        assert_eq!(lock_key_for_etf(a), lock_key_for_etf(a));
        assert_ne!(lock_key_for_etf(a), lock_key_for_etf(b));
    }

    async fn test_pool() -> sqlx::PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "needs a Postgres instance at DATABASE_URL"]
    async fn dropped_guard_frees_the_lock_for_other_connections() {
        let pool = test_pool().await;
        let etf_id = Uuid::from_u128(42);

        let guard = try_acquire_etf_lock(&pool, etf_id).await.unwrap().unwrap();
        drop(guard);

        // The server may notice the closed session a little later.
        let mut first = None;
        for _ in 0..40 {
            first = try_acquire_etf_lock(&pool, etf_id).await.unwrap();
            if first.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        first
            .expect("lock still held after its guard was dropped")
            .release()
            .await
            .unwrap();

        let mut reacquired = Vec::new();
        for _ in 0..4 {
            let guard = try_acquire_etf_lock(&pool, etf_id).await.unwrap();
            reacquired.push(guard.is_some());
            if let Some(guard) = guard {
                guard.release().await.unwrap();
            }
        }
        assert_eq!(reacquired, vec![true; 4]);
    }

    #[tokio::test]
    #[ignore = "needs a Postgres instance at DATABASE_URL"]
    async fn held_lock_blocks_a_second_acquire() {
        let pool = test_pool().await;
        let etf_id = Uuid::from_u128(43);

        let guard = try_acquire_etf_lock(&pool, etf_id).await.unwrap().unwrap();
        assert!(try_acquire_etf_lock(&pool, etf_id).await.unwrap().is_none());
        guard.release().await.unwrap();
        assert!(try_acquire_etf_lock(&pool, etf_id).await.unwrap().is_some());
    }
}
