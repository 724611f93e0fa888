//! Indexed time-series store for portfolio snapshots (`snapshots.db`).
//! A snapshot owns its holdings rows; both are append-only and pruned
//! together by retention.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use market_core::{CoreError, CoreResult, Holding, PortfolioSnapshot};

const MAGIC: &str = "TWSN";
const SCHEMA_VERSION: i64 = 1;

#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    /// Open (creating if missing) and verify the schema version.
    pub async fn new(database_url: &str) -> CoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| CoreError::Persistence(format!("snapshot db url: {e}")))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::Persistence(format!("snapshot db connect: {e}")))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> CoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS meta (
                magic TEXT NOT NULL,
                schema_version INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT magic, schema_version FROM meta LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            None => {
                sqlx::query("INSERT INTO meta (magic, schema_version) VALUES (?, ?)")
                    .bind(MAGIC)
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
            }
            Some(row) => {
                let magic: String = row.get(0);
                let version: i64 = row.get(1);
                if magic != MAGIC || version != SCHEMA_VERSION {
                    return Err(CoreError::UnreadableState(format!(
                        "snapshots.db has magic {magic:?} v{version}, expected {MAGIC:?} v{SCHEMA_VERSION}"
                    )));
                }
            }
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_ts TEXT NOT NULL,
                cash TEXT NOT NULL,
                total_value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON snapshots (snapshot_ts)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS snapshot_holdings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_id INTEGER NOT NULL REFERENCES snapshots (id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                avg_price TEXT NOT NULL,
                last_price TEXT NOT NULL,
                unrealised_pnl TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn insert(&self, snapshot: &PortfolioSnapshot) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let snapshot_id: i64 = sqlx::query(
            "INSERT INTO snapshots (snapshot_ts, cash, total_value) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(snapshot.snapshot_ts.to_rfc3339())
        .bind(snapshot.cash.to_string())
        .bind(snapshot.total_value.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .get(0);

        for holding in &snapshot.holdings {
            sqlx::query(
                "INSERT INTO snapshot_holdings
                 (snapshot_id, symbol, quantity, avg_price, last_price, unrealised_pnl)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(snapshot_id)
            .bind(&holding.symbol)
            .bind(holding.quantity.to_string())
            .bind(holding.avg_price.to_string())
            .bind(holding.last_price.to_string())
            .bind(holding.unrealised_pnl.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Snapshots within `[from, to]`, ascending, holdings attached.
    pub async fn range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<PortfolioSnapshot>> {
        let rows = sqlx::query(
            "SELECT id, snapshot_ts, cash, total_value FROM snapshots
             WHERE snapshot_ts >= ? AND snapshot_ts <= ?
             ORDER BY snapshot_ts ASC",
        )
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get(0);
            let snapshot_ts: String = row.get(1);
            let cash: String = row.get(2);
            let total_value: String = row.get(3);

            let holding_rows = sqlx::query(
                "SELECT symbol, quantity, avg_price, last_price, unrealised_pnl
                 FROM snapshot_holdings WHERE snapshot_id = ? ORDER BY symbol",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            let holdings = holding_rows
                .into_iter()
                .map(|h| {
                    Ok(Holding {
                        symbol: h.get(0),
                        quantity: parse_decimal(h.get(1))?,
                        avg_price: parse_decimal(h.get(2))?,
                        last_price: parse_decimal(h.get(3))?,
                        unrealised_pnl: parse_decimal(h.get(4))?,
                    })
                })
                .collect::<CoreResult<Vec<_>>>()?;

            snapshots.push(PortfolioSnapshot {
                snapshot_ts: parse_ts(&snapshot_ts)?,
                cash: parse_decimal(cash)?,
                total_value: parse_decimal(total_value)?,
                holdings,
            });
        }
        Ok(snapshots)
    }

    pub async fn latest(&self) -> CoreResult<Option<PortfolioSnapshot>> {
        let to = Utc::now() + chrono::Duration::days(1);
        let from = Utc::now() - chrono::Duration::days(36_500);
        Ok(self.range(from, to).await?.pop())
    }

    /// Drop snapshots older than the cutoff. Returns rows removed.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        // CASCADE is not on by default in sqlite; delete children first
        sqlx::query(
            "DELETE FROM snapshot_holdings WHERE snapshot_id IN
             (SELECT id FROM snapshots WHERE snapshot_ts < ?)",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let result = sqlx::query("DELETE FROM snapshots WHERE snapshot_ts < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::Persistence(format!("snapshot store: {e}"))
}

fn parse_decimal(s: String) -> CoreResult<Decimal> {
    Decimal::from_str(&s)
        .map_err(|e| CoreError::Persistence(format!("bad decimal {s:?}: {e}")))
}

fn parse_ts(s: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::Persistence(format!("bad timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn snapshot(minute: i64, total: Decimal) -> PortfolioSnapshot {
        PortfolioSnapshot {
            snapshot_ts: Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap()
                + chrono::Duration::minutes(minute),
            cash: dec!(50_000),
            total_value: total,
            holdings: vec![Holding {
                symbol: "NSE_EQ|INFY".to_string(),
                quantity: dec!(10),
                avg_price: dec!(1500),
                last_price: dec!(1510),
                unrealised_pnl: dec!(100),
            }],
        }
    }

    #[tokio::test]
    async fn snapshots_round_trip_bar_for_bar() {
        let store = SnapshotStore::new("sqlite::memory:").await.unwrap();
        let original = snapshot(0, dec!(65_100));
        store.insert(&original).await.unwrap();

        let loaded = store
            .range(
                original.snapshot_ts - chrono::Duration::hours(1),
                original.snapshot_ts + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(loaded, vec![original]);
    }

    #[tokio::test]
    async fn range_is_ordered_and_bounded() {
        let store = SnapshotStore::new("sqlite::memory:").await.unwrap();
        for minute in [30, 0, 60] {
            store
                .insert(&snapshot(minute, dec!(60_000)))
                .await
                .unwrap();
        }
        let base = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();
        let loaded = store
            .range(base, base + chrono::Duration::minutes(45))
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].snapshot_ts < loaded[1].snapshot_ts);
    }

    #[tokio::test]
    async fn prune_removes_old_snapshots_and_holdings() {
        let store = SnapshotStore::new("sqlite::memory:").await.unwrap();
        store.insert(&snapshot(0, dec!(1))).await.unwrap();
        store.insert(&snapshot(120, dec!(2))).await.unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 6, 3, 11, 0, 0).unwrap();
        let removed = store.prune_before(cutoff).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = store.latest().await.unwrap().unwrap();
        assert_eq!(remaining.total_value, dec!(2));
        assert_eq!(remaining.holdings.len(), 1);
    }
}
