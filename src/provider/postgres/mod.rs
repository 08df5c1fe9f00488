//! PostgreSQL implementation of the provider contract, grounded on
//! `eventually-postgres::store::EventStore`: a `bb8` connection pool,
//! `refinery`-embedded migrations run once at construction, and a
//! `thiserror` error enum distinguishing encode/decode failures from the
//! underlying driver's own errors.

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::Socket;

use crate::event::Record;
use crate::provider::{
    ContextOp, ContextOpKind, ContextsProvider, Direction, DuplicateIdError, EventsProvider,
    GetOptions, Snapshot, SnapshotsProvider,
};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("src/provider/postgres/migrations");
}

/// Error type returned by the Postgres provider implementations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("postgres client returned an error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("bb8 connection pool returned an error: {0}")]
    Pool(#[from] bb8::RunError<tokio_postgres::Error>),

    #[error("failed to decode a row from the database: {0}")]
    Decode(#[source] anyhow::Error),
}

/// A `bb8`-pooled connection to Postgres, shared by the three provider
/// implementations below.
#[derive(Clone)]
pub struct Connection<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    pool: Pool<PostgresConnectionManager<Tls>>,
}

impl<Tls> Connection<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    /// Runs the embedded migrations and returns a shared handle usable to
    /// build all three providers.
    pub async fn migrate(pool: Pool<PostgresConnectionManager<Tls>>) -> anyhow::Result<Self> {
        let mut connection = pool.get().await?;
        embedded::migrations::runner()
            .run_async(&mut *connection)
            .await?;
        Ok(Self { pool })
    }

    pub fn events(&self) -> PostgresEvents<Tls> {
        PostgresEvents { pool: self.pool.clone() }
    }

    pub fn contexts(&self) -> PostgresContexts<Tls> {
        PostgresContexts { pool: self.pool.clone() }
    }

    pub fn snapshots(&self) -> PostgresSnapshots<Tls> {
        PostgresSnapshots { pool: self.pool.clone() }
    }
}

fn row_to_record(row: &tokio_postgres::Row) -> Result<Record, Error> {
    Ok(Record {
        id: row.try_get("id").map_err(|e| Error::Decode(e.into()))?,
        stream: row.try_get("stream").map_err(|e| Error::Decode(e.into()))?,
        r#type: row.try_get("type").map_err(|e| Error::Decode(e.into()))?,
        data: row.try_get("data").map_err(|e| Error::Decode(e.into()))?,
        meta: row.try_get("meta").map_err(|e| Error::Decode(e.into()))?,
        created: row.try_get("created").map_err(|e| Error::Decode(e.into()))?,
        recorded: row.try_get("recorded").map_err(|e| Error::Decode(e.into()))?,
    })
}

fn select_clause(base: &str, options: &GetOptions) -> (String, Vec<String>) {
    let mut query = base.to_string();
    let mut extra_params = Vec::new();

    if let Some(cursor) = &options.cursor {
        query.push_str(&format!(" AND created > ${}", extra_params.len() + 2));
        extra_params.push(cursor.clone());
    }

    if !options.filter.types.is_empty() {
        let placeholders: Vec<String> = options
            .filter
            .types
            .iter()
            .enumerate()
            .map(|(i, _)| format!("${}", extra_params.len() + 2 + i))
            .collect();
        query.push_str(&format!(" AND type IN ({})", placeholders.join(", ")));
        extra_params.extend(options.filter.types.iter().cloned());
    }

    query.push_str(" ORDER BY created ");
    query.push_str(match options.direction() {
        Direction::Asc => "ASC",
        Direction::Desc => "DESC",
    });
    query.push_str(", id ASC");

    if let Some(limit) = options.limit {
        query.push_str(&format!(" LIMIT {limit}"));
    }

    (query, extra_params)
}

/// Postgres-backed [`EventsProvider`].
#[derive(Clone)]
pub struct PostgresEvents<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    pool: Pool<PostgresConnectionManager<Tls>>,
}

#[async_trait]
impl<Tls> EventsProvider for PostgresEvents<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, record)))]
    async fn insert(&self, record: Record) -> anyhow::Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "INSERT INTO events (id, stream, type, data, meta, created, recorded)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &record.id,
                    &record.stream,
                    &record.r#type,
                    &record.data,
                    &record.meta,
                    &record.created,
                    &record.recorded,
                ],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
                    anyhow::Error::new(DuplicateIdError(record.id.clone()))
                } else {
                    Error::from(e).into()
                }
            })?;
        Ok(())
    }

    async fn insert_many(&self, records: Vec<Record>) -> anyhow::Result<()> {
        let mut client = self.pool.get().await.map_err(Error::from)?;
        let tx = client.transaction().await.map_err(Error::from)?;
        for record in records {
            tx.execute(
                "INSERT INTO events (id, stream, type, data, meta, created, recorded)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &record.id,
                    &record.stream,
                    &record.r#type,
                    &record.data,
                    &record.meta,
                    &record.created,
                    &record.recorded,
                ],
            )
            .await
            .map_err(Error::from)?;
        }
        tx.commit().await.map_err(Error::from)?;
        Ok(())
    }

    async fn get(&self, options: &GetOptions) -> anyhow::Result<Vec<Record>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let (query, params) = select_clause("SELECT * FROM events WHERE true", options);
        let param_refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync)).collect();

        let rows = client.query(query.as_str(), &param_refs).await.map_err(Error::from)?;
        rows.iter().map(row_to_record).map(|r| r.map_err(Into::into)).collect()
    }

    async fn get_by_stream(&self, stream: &str, options: &GetOptions) -> anyhow::Result<Vec<Record>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let (query, extra) = select_clause("SELECT * FROM events WHERE stream = $1", options);

        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&stream];
        params.extend(extra.iter().map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync)));

        let rows = client.query(query.as_str(), &params).await.map_err(Error::from)?;
        rows.iter().map(row_to_record).map(|r| r.map_err(Into::into)).collect()
    }

    async fn get_by_streams(&self, streams: &[String], options: &GetOptions) -> anyhow::Result<Vec<Record>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let (query, extra) = select_clause("SELECT * FROM events WHERE stream = ANY($1)", options);

        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&streams];
        params.extend(extra.iter().map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync)));

        let rows = client.query(query.as_str(), &params).await.map_err(Error::from)?;
        rows.iter().map(row_to_record).map(|r| r.map_err(Into::into)).collect()
    }

    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Record>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_opt("SELECT * FROM events WHERE id = $1", &[&id])
            .await
            .map_err(Error::from)?;
        row.as_ref().map(row_to_record).transpose().map_err(Into::into)
    }

    async fn check_outdated(&self, record: &Record) -> anyhow::Result<bool> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1 FROM events
                     WHERE stream = $1 AND type = $2 AND created > $3
                 )",
                &[&record.stream, &record.r#type, &record.created],
            )
            .await
            .map_err(Error::from)?;
        Ok(row.get::<_, bool>(0))
    }
}

/// Postgres-backed [`ContextsProvider`], deduplicated via `ON CONFLICT DO NOTHING`.
#[derive(Clone)]
pub struct PostgresContexts<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    pool: Pool<PostgresConnectionManager<Tls>>,
}

#[async_trait]
impl<Tls> ContextsProvider for PostgresContexts<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    async fn insert(&self, key: &str, stream: &str) -> anyhow::Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "INSERT INTO contexts (key, stream) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                &[&key, &stream],
            )
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn remove(&self, key: &str, stream: &str) -> anyhow::Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute("DELETE FROM contexts WHERE key = $1 AND stream = $2", &[&key, &stream])
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn get_by_key(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let rows = client
            .query("SELECT stream FROM contexts WHERE key = $1", &[&key])
            .await
            .map_err(Error::from)?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn handle(&self, ops: &[ContextOp]) -> anyhow::Result<()> {
        let mut client = self.pool.get().await.map_err(Error::from)?;
        let tx = client.transaction().await.map_err(Error::from)?;
        for op in ops {
            match op.op {
                ContextOpKind::Insert => {
                    tx.execute(
                        "INSERT INTO contexts (key, stream) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                        &[&op.key, &op.stream],
                    )
                    .await
                    .map_err(Error::from)?;
                }
                ContextOpKind::Remove => {
                    tx.execute(
                        "DELETE FROM contexts WHERE key = $1 AND stream = $2",
                        &[&op.key, &op.stream],
                    )
                    .await
                    .map_err(Error::from)?;
                }
            }
        }
        tx.commit().await.map_err(Error::from)?;
        Ok(())
    }
}

/// Postgres-backed [`SnapshotsProvider`], upserting via `ON CONFLICT DO UPDATE`.
#[derive(Clone)]
pub struct PostgresSnapshots<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    pool: Pool<PostgresConnectionManager<Tls>>,
}

#[async_trait]
impl<Tls> SnapshotsProvider for PostgresSnapshots<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    async fn insert(&self, name: &str, stream: &str, cursor: &str, state: serde_json::Value) -> anyhow::Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "INSERT INTO snapshots (name, stream, cursor, state)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (name, stream) DO UPDATE SET cursor = EXCLUDED.cursor, state = EXCLUDED.state",
                &[&name, &stream, &cursor, &state],
            )
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn get_by_stream(&self, name: &str, stream: &str) -> anyhow::Result<Option<Snapshot>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_opt(
                "SELECT cursor, state FROM snapshots WHERE name = $1 AND stream = $2",
                &[&name, &stream],
            )
            .await
            .map_err(Error::from)?;

        Ok(row.map(|row| Snapshot {
            cursor: row.get("cursor"),
            state: row.get("state"),
        }))
    }

    async fn remove(&self, name: &str, stream: &str) -> anyhow::Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute("DELETE FROM snapshots WHERE name = $1 AND stream = $2", &[&name, &stream])
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}
