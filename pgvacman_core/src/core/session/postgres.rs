use log::{debug, trace};
use tokio_postgres::{CancelToken, Client, Config, NoTls};

use crate::{
    core::{
        catalog::{
            CANDIDATE_RELATIONS_QUERY, CandidateRelation, LIST_DATABASES_QUERY, RelationKind,
            parse_options, row_estimate,
        },
        session::traits::{CatalogSession, SessionProvider, StatementCanceller},
    },
    error::{DbError, VacmanError},
};

pub const APPLICATION_NAME: &str = "pgvacman";

pub struct PgSession {
    client: Client,
}

impl PgSession {
    pub async fn connect(config: &Config) -> Result<Self, VacmanError> {
        let (client, connection) = config.connect(NoTls).await.map_err(|e| {
            let error = DbError::from(e);
            if error.is_password_failure() {
                VacmanError::PasswordAuthentication(error)
            } else {
                VacmanError::Connection(error)
            }
        })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Connection closed with error: {}", e);
            }
        });

        Ok(Self { client })
    }
}

impl CatalogSession for PgSession {
    type Canceller = PgCanceller;

    async fn execute(&mut self, statement: &str) -> Result<(), DbError> {
        trace!("Executing: {}", statement);
        self.client.batch_execute(statement).await.map_err(DbError::from)
    }

    async fn fetch_candidates(&mut self) -> Result<Vec<CandidateRelation>, DbError> {
        let rows = self.client.query(CANDIDATE_RELATIONS_QUERY, &[]).await?;
        let mut relations = Vec::with_capacity(rows.len());

        for row in rows {
            let relkind: String = row.try_get("relkind")?;
            let Some(kind) = RelationKind::from_relkind(&relkind) else {
                continue;
            };

            let reloptions: Vec<String> = row.try_get("reloptions")?;
            let toastoptions: Vec<String> = row.try_get("toastoptions")?;

            relations.push(CandidateRelation {
                oid: row.try_get("reloid")?,
                kind,
                schema: row.try_get("nspname")?,
                name: row.try_get("relname")?,
                owner: row.try_get("relowner")?,
                row_estimate: row_estimate(row.try_get("reltuples")?),
                options: parse_options(&reloptions, &toastoptions),
            });
        }

        debug!("Read {} candidate relations from catalog", relations.len());
        Ok(relations)
    }

    async fn list_databases(&mut self) -> Result<Vec<String>, DbError> {
        let rows = self.client.query(LIST_DATABASES_QUERY, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(DbError::from))
            .collect()
    }

    fn canceller(&self) -> PgCanceller {
        PgCanceller {
            token: self.client.cancel_token(),
        }
    }
}

/// Sends a PostgreSQL CancelRequest over a separate socket.
pub struct PgCanceller {
    token: CancelToken,
}

impl StatementCanceller for PgCanceller {
    async fn cancel(&self) -> Result<(), DbError> {
        self.token.cancel_query(NoTls).await.map_err(DbError::from)
    }
}

pub struct PgProvider {
    config: Config,
}

impl PgProvider {
    pub fn new(mut config: Config) -> Self {
        config.application_name(APPLICATION_NAME);
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Same server and credentials, different database.
    pub fn for_database(&self, dbname: &str) -> Self {
        let mut config = self.config.clone();
        config.dbname(dbname);
        Self { config }
    }
}

impl SessionProvider for PgProvider {
    type Session = PgSession;

    async fn connect(&self) -> Result<PgSession, VacmanError> {
        PgSession::connect(&self.config).await
    }
}
