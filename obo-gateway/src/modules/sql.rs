//! SQL delegation adapter (PostgreSQL via sqlx).
//!
//! Exchanges the requestor's token for a delegation token carrying a
//! `legacy_name`, then executes the statement inside a pooled session that
//! assumed that identity (`SET SESSION AUTHORIZATION`). The identity is
//! reverted on every exit path; a connection whose revert fails is dropped
//! instead of returning to the pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as _, Row as _, TypeInfo as _};
use tokio::sync::OnceCell;

use crate::audit::{AuditEntry, AuditSource};
use crate::delegation::{DelegationContext, DelegationModule, DelegationResult, MODULE_NOT_INITIALIZED};
use crate::session::UserSession;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keywords refused inside delegated statements. The check runs over a
/// tokenised form, so `DROP/**/TABLE` tricks don't slip through as part of
/// a longer word.
const DENIED_KEYWORDS: &[&str] = &[
    "GRANT", "REVOKE", "DROP", "ALTER", "CREATE", "TRUNCATE", "COPY", "VACUUM", "SET", "RESET", "DO", "PREPARE",
    "DEALLOCATE", "LISTEN", "NOTIFY",
];

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SqlModuleConfig {
    /// Connection string; normally supplied through a `$secret` descriptor.
    pub url: String,
    /// Token-exchange audience naming the database.
    pub audience: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StatementParams {
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    procedure: Option<String>,
    #[serde(default)]
    args: Vec<Value>,
}

struct SqlState {
    pool: PgPool,
    config: SqlModuleConfig,
}

pub struct SqlDelegationModule {
    name: String,
    state: OnceCell<SqlState>,
}

impl SqlDelegationModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: OnceCell::new(),
        }
    }

    fn trail(&self, session: &UserSession, action: &str, success: bool) -> AuditEntry {
        AuditEntry::builder()
            .source(AuditSource::parse("delegation:sql").expect("static tag"))
            .user_id(session.user_id.as_str())
            .action(format!("{}:{action}", self.name))
            .success(success)
            .build()
    }

    async fn run_as(
        &self,
        state: &SqlState,
        legacy_name: &str,
        action: &str,
        params: &StatementParams,
    ) -> anyhow::Result<Value> {
        use anyhow::Context as _;

        let mut conn = state.pool.acquire().await.context("failed to acquire connection")?;

        sqlx::query(&format!("SET SESSION AUTHORIZATION {}", quote_ident(legacy_name)))
            .execute(&mut *conn)
            .await
            .context("failed to assume delegated identity")?;

        let outcome = execute_action(&mut conn, action, params).await;

        let reverted = sqlx::query("RESET SESSION AUTHORIZATION").execute(&mut *conn).await;

        if let Err(revert_error) = reverted {
            // Never return a connection that still wears the delegated
            // identity to the pool.
            warn!(error = %revert_error, "Failed to revert session authorization, dropping connection");
            drop(conn.detach());
        }

        outcome
    }
}

#[async_trait]
impl DelegationModule for SqlDelegationModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "sql"
    }

    async fn initialize(&self, config: &Value) -> anyhow::Result<()> {
        use anyhow::Context as _;

        let config: SqlModuleConfig =
            serde_json::from_value(config.clone()).context("invalid SQL module configuration")?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
            .connect(&config.url)
            .await
            .context("failed to open connection pool")?;

        self.state
            .set(SqlState { pool, config })
            .map_err(|_| anyhow::anyhow!("module is already initialized"))
    }

    async fn delegate(
        &self,
        session: &UserSession,
        action: &str,
        params: &Value,
        ctx: &DelegationContext,
    ) -> anyhow::Result<DelegationResult> {
        let Some(state) = self.state.get() else {
            return Ok(DelegationResult::failure(
                MODULE_NOT_INITIALIZED,
                self.trail(session, action, false),
            ));
        };

        if !matches!(action, "query" | "execute" | "procedure") {
            return Ok(DelegationResult::failure(
                "UNSUPPORTED_ACTION",
                self.trail(session, action, false),
            ));
        }

        let params: StatementParams = match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(error) => {
                debug!(%error, "Bad statement parameters");
                return Ok(DelegationResult::failure(
                    "INVALID_INPUT",
                    self.trail(session, action, false),
                ));
            }
        };

        if let Err(reason) = screen_params(action, &params) {
            debug!(reason, "Refused delegated statement");
            return Ok(DelegationResult::failure(
                "STATEMENT_REFUSED",
                self.trail(session, action, false),
            ));
        }

        let Some(exchange) = &ctx.exchange else {
            return Ok(DelegationResult::failure(
                "EXCHANGE_REQUIRED",
                self.trail(session, action, false),
            ));
        };

        let delegation = match exchange
            .exchange_for(
                session,
                &state.config.audience,
                state.config.scope.as_deref(),
                ctx.session_id.as_deref(),
            )
            .await
        {
            Ok(token) => token,
            Err(error) => {
                return Ok(DelegationResult::failure(
                    error.code(),
                    self.trail(session, action, false),
                ));
            }
        };

        // The downstream identity comes from the delegation token; the
        // session's own mapped legacy name is only a fallback.
        let legacy_name = delegation
            .claims
            .legacy_name
            .clone()
            .or_else(|| session.legacy_username.clone());

        let Some(legacy_name) = legacy_name else {
            return Ok(DelegationResult::failure(
                "NO_LEGACY_IDENTITY",
                self.trail(session, action, false),
            ));
        };

        match self.run_as(state, &legacy_name, action, &params).await {
            Ok(data) => Ok(DelegationResult::success(data, self.trail(session, action, true))),
            Err(error) => {
                debug!(error = format!("{error:#}"), "Delegated statement failed");
                Ok(DelegationResult::failure(
                    "STATEMENT_FAILED",
                    self.trail(session, action, false),
                ))
            }
        }
    }

    async fn health_check(&self) -> bool {
        match self.state.get() {
            Some(state) => sqlx::query("SELECT 1").execute(&state.pool).await.is_ok(),
            None => false,
        }
    }

    async fn destroy(&self) {
        if let Some(state) = self.state.get() {
            state.pool.close().await;
        }
    }
}

async fn execute_action(
    conn: &mut sqlx::pool::PoolConnection<sqlx::Postgres>,
    action: &str,
    params: &StatementParams,
) -> anyhow::Result<Value> {
    use anyhow::Context as _;

    let statement = match action {
        "procedure" => {
            let procedure = params.procedure.as_deref().context("`procedure` is required")?;
            let placeholders: Vec<String> = (1..=params.args.len()).map(|i| format!("${i}")).collect();
            format!("CALL {}({})", procedure, placeholders.join(", "))
        }
        _ => params.sql.clone().context("`sql` is required")?,
    };

    let mut query = sqlx::query(&statement);
    for arg in &params.args {
        query = bind_value(query, arg);
    }

    match action {
        "query" => {
            let rows = query.fetch_all(&mut **conn).await.context("query failed")?;
            let rows: Vec<Value> = rows.iter().map(row_to_json).collect();
            Ok(Value::Array(rows))
        }
        _ => {
            let result = query.execute(&mut **conn).await.context("statement failed")?;
            Ok(serde_json::json!({ "rowsAffected": result.rows_affected() }))
        }
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_value<'q>(query: PgQuery<'q>, value: &'q Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                query.bind(int)
            } else {
                query.bind(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other @ (Value::Array(_) | Value::Object(_)) => query.bind(sqlx::types::Json(other.clone())),
    }
}

fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::new();

    for (index, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => row.try_get::<Option<bool>, _>(index).map(|v| v.map(Value::from)),
            "INT2" => row.try_get::<Option<i16>, _>(index).map(|v| v.map(Value::from)),
            "INT4" => row.try_get::<Option<i32>, _>(index).map(|v| v.map(Value::from)),
            "INT8" => row.try_get::<Option<i64>, _>(index).map(|v| v.map(Value::from)),
            "FLOAT4" => row.try_get::<Option<f32>, _>(index).map(|v| v.map(Value::from)),
            "FLOAT8" => row.try_get::<Option<f64>, _>(index).map(|v| v.map(Value::from)),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index),
            "UUID" => row
                .try_get::<Option<sqlx::types::Uuid>, _>(index)
                .map(|v| v.map(|u| Value::String(u.to_string()))),
            "TIMESTAMPTZ" => row.try_get::<Option<time::OffsetDateTime>, _>(index).map(|v| {
                v.and_then(|ts| {
                    ts.format(&time::format_description::well_known::Rfc3339)
                        .ok()
                        .map(Value::String)
                })
            }),
            _ => row
                .try_get::<Option<String>, _>(index)
                .map(|v| v.map(Value::String)),
        };

        let value = match value {
            Ok(Some(value)) => value,
            Ok(None) => Value::Null,
            Err(error) => {
                debug!(column = column.name(), %error, "Undecodable column value");
                Value::Null
            }
        };

        object.insert(column.name().to_owned(), value);
    }

    Value::Object(object)
}

fn screen_params(action: &str, params: &StatementParams) -> Result<(), &'static str> {
    match action {
        "procedure" => {
            let Some(procedure) = params.procedure.as_deref() else {
                return Err("procedure name is missing");
            };

            if !valid_identifier_path(procedure) {
                return Err("procedure name is not a valid identifier");
            }

            Ok(())
        }
        _ => {
            let Some(sql) = params.sql.as_deref() else {
                return Err("statement is missing");
            };

            screen_statement(sql)
        }
    }
}

/// List-based keyword check over a tokenised form of the statement, plus a
/// handful of structural refusals (multiple statements, comments).
fn screen_statement(sql: &str) -> Result<(), &'static str> {
    let trimmed = sql.trim();

    if trimmed.is_empty() {
        return Err("statement is empty");
    }

    if trimmed.trim_end_matches(';').contains(';') {
        return Err("multiple statements are not allowed");
    }

    if trimmed.contains("--") || trimmed.contains("/*") {
        return Err("comments are not allowed");
    }

    for token in tokens(trimmed) {
        if DENIED_KEYWORDS.iter().any(|denied| token.eq_ignore_ascii_case(denied)) {
            return Err("statement contains a denied keyword");
        }
    }

    Ok(())
}

fn tokens(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
}

fn valid_identifier(identifier: &str) -> bool {
    let mut chars = identifier.chars();

    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `schema.name` or bare `name`.
fn valid_identifier_path(path: &str) -> bool {
    let mut segments = path.split('.');
    let valid = segments.by_ref().take(2).all(valid_identifier);
    valid && segments.next().is_none()
}

fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Convenience constructor used by bootstrap code.
pub fn module(name: &str) -> Arc<dyn DelegationModule> {
    Arc::new(SqlDelegationModule::new(name))
}
