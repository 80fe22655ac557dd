use std::fmt;

use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

use crate::error::StoreResult;
use crate::models::{EdgeObservation, NewEdgeObservation};
use crate::schema::edge_observations;
use crate::store::Evidence;

const CREATE_OBSERVATIONS: &str = "CREATE TABLE IF NOT EXISTS edge_observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    src TEXT NOT NULL,
    tgt TEXT NOT NULL,
    prob REAL NOT NULL,
    evidence TEXT NOT NULL,
    ts TEXT NOT NULL
)";

/// Create database connection pool with configurable size
pub fn create_pool(database_url: &str, max_size: u32) -> Result<DbPool, r2d2::PoolError> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    Pool::builder().max_size(max_size).build(manager)
}

/// Create the journal table when it does not exist yet
pub fn ensure_schema(conn: &mut SqliteConnection) -> QueryResult<usize> {
    diesel::sql_query(CREATE_OBSERVATIONS).execute(conn)
}

/// Append one observation row in its own transaction (rows are never updated)
pub fn insert_observation(
    conn: &mut SqliteConnection,
    src: &str,
    tgt: &str,
    prob: f64,
    evidence: &str,
    ts: &str,
) -> QueryResult<usize> {
    let row = NewEdgeObservation {
        src,
        tgt,
        prob,
        evidence,
        ts,
    };

    conn.transaction(|conn| {
        diesel::insert_into(edge_observations::table)
            .values(&row)
            .execute(conn)
    })
}

/// All journal rows in write order
pub fn load_observations(conn: &mut SqliteConnection) -> QueryResult<Vec<EdgeObservation>> {
    edge_observations::table
        .order(edge_observations::id.asc())
        .select(EdgeObservation::as_select())
        .load(conn)
}

/// Append-only audit log of individual edge observations.
#[derive(Clone)]
pub struct ObservationJournal {
    pool: DbPool,
}

impl fmt::Debug for ObservationJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationJournal")
            .field("max_size", &self.pool.max_size())
            .finish()
    }
}

impl ObservationJournal {
    /// Open (or create) the SQLite journal at `database_url`.
    pub fn open(database_url: &str, pool_size: u32) -> StoreResult<Self> {
        let pool = create_pool(database_url, pool_size.max(1))?;
        let mut conn = pool.get()?;
        ensure_schema(&mut conn)?;
        tracing::info!("Observation journal ready at {}", database_url);
        Ok(Self { pool })
    }

    pub fn append(&self, src: &str, tgt: &str, evidence: &Evidence) -> StoreResult<()> {
        let json = serde_json::to_string(&[evidence])?;
        let mut conn = self.pool.get()?;
        insert_observation(&mut conn, src, tgt, evidence.score, &json, &evidence.ts)?;
        Ok(())
    }

    pub fn observations(&self) -> StoreResult<Vec<EdgeObservation>> {
        let mut conn = self.pool.get()?;
        Ok(load_observations(&mut conn)?)
    }
}
