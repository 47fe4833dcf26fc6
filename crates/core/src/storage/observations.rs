use crate::metrics::Observation;
use anyhow::Context;
use chrono::NaiveDate;
use uuid::Uuid;

type ObservationRow = (NaiveDate, f64, f64);

fn observation_from_row((date, close_price, distribution): ObservationRow) -> Observation {
    Observation {
        date,
        close_price,
        distribution,
    }
}

pub async fn upsert_observation(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    etf_id: Uuid,
    observation: &Observation,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO monthly_observations (etf_id, observation_date, close_price, distribution) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (etf_id, observation_date) DO UPDATE \
           SET close_price = EXCLUDED.close_price, distribution = EXCLUDED.distribution",
    )
    .bind(etf_id)
    .bind(observation.date)
    .bind(observation.close_price)
    .bind(observation.distribution)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("upsert monthly_observations failed (date={})", observation.date))?;
    Ok(())
}

/// Swaps the ETF's stored series for `observations` inside the caller's transaction.
pub async fn replace_observations(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    etf_id: Uuid,
    observations: &[Observation],
) -> anyhow::Result<u64> {
    sqlx::query("DELETE FROM monthly_observations WHERE etf_id = $1")
        .bind(etf_id)
        .execute(&mut **tx)
        .await
        .context("clear monthly_observations failed")?;

    if observations.is_empty() {
        return Ok(0);
    }

    let mut qb = sqlx::QueryBuilder::new(
        "INSERT INTO monthly_observations (etf_id, observation_date, close_price, distribution) ",
    );
    qb.push_values(observations, |mut b, o| {
        b.push_bind(etf_id)
            .push_bind(o.date)
            .push_bind(o.close_price)
            .push_bind(o.distribution);
    });

    let res = qb
        .build()
        .persistent(false)
        .execute(&mut **tx)
        .await
        .context("insert monthly_observations failed")?;
    Ok(res.rows_affected())
}

/// Newest first.
pub async fn list_observations(
    pool: &sqlx::PgPool,
    etf_id: Uuid,
    limit: Option<i64>,
) -> anyhow::Result<Vec<Observation>> {
    let rows = sqlx::query_as::<_, ObservationRow>(
        "SELECT observation_date, close_price, distribution \
         FROM monthly_observations \
         WHERE etf_id = $1 \
         ORDER BY observation_date DESC \
         LIMIT $2",
    )
    .bind(etf_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("select monthly_observations failed")?;
    Ok(rows.into_iter().map(observation_from_row).collect())
}

/// Oldest first, bounds inclusive.
pub async fn list_observations_range(
    pool: &sqlx::PgPool,
    etf_id: Uuid,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<Vec<Observation>> {
    let rows = sqlx::query_as::<_, ObservationRow>(
        "SELECT observation_date, close_price, distribution \
         FROM monthly_observations \
         WHERE etf_id = $1 AND observation_date >= $2 AND observation_date <= $3 \
         ORDER BY observation_date ASC",
    )
    .bind(etf_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
    .context("select monthly_observations range failed")?;
    Ok(rows.into_iter().map(observation_from_row).collect())
}
