use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::CabinAuthSource;
use crate::engine::{Engine, EngineError, Rejection};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, Lookup, SqlError, WindowTarget};

pub struct CabinHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CabinQueryParser>,
}

impl CabinHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CabinQueryParser),
        }
    }

    /// Run one command and record its outcome.
    async fn run(&self, actor: &str, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: &str, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertCabin { id, details } => {
                engine
                    .create_cabin(id, actor, details)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateCabin { id, patch } => {
                engine.update_cabin(id, actor, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteCabin { id } => {
                engine.delete_cabin(id, actor).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectCabins { id } => {
                let cabins = match id {
                    Some(id) => vec![engine.get_cabin(id).await.map_err(engine_err)?],
                    None => engine.list_cabins().await,
                };
                cabin_rows(cabins)
            }
            Command::InsertAdvert {
                id,
                cabin_id,
                price_per_day,
                span,
            } => {
                engine
                    .list_advert(id, cabin_id, actor, price_per_day, span)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateAdvert { id, patch } => {
                engine.update_advert(id, actor, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteAdvert { id } => {
                engine.withdraw_advert(id, actor).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAdverts { lookup } => {
                let adverts = match lookup {
                    Lookup::ById(id) => vec![engine.get_advert(id).await.map_err(engine_err)?],
                    Lookup::ByParent(cabin_id) => {
                        engine.list_adverts(Some(cabin_id)).await.map_err(engine_err)?
                    }
                    Lookup::All => engine.list_adverts(None).await.map_err(engine_err)?,
                };
                advert_rows(adverts)
            }
            Command::InsertBooking {
                id,
                advert_id,
                span,
            } => {
                engine
                    .place_booking(id, advert_id, actor, span)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateBooking { id, patch } => {
                engine.update_booking(id, actor, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id, actor).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { lookup } => {
                let bookings = match lookup {
                    Lookup::ById(id) => vec![engine.get_booking(id).await.map_err(engine_err)?],
                    Lookup::ByParent(advert_id) => {
                        engine.list_bookings(Some(advert_id)).await.map_err(engine_err)?
                    }
                    Lookup::All => engine.list_bookings(None).await.map_err(engine_err)?,
                };
                booking_rows(bookings)
            }
            Command::WindowCheck {
                target,
                span,
                exclude,
            } => {
                let outcome = match target {
                    WindowTarget::Cabin(cabin_id) => {
                        engine.validate_advert_window(cabin_id, span, exclude).await
                    }
                    WindowTarget::Advert(advert_id) => {
                        engine.validate_booking_window(advert_id, span, exclude).await
                    }
                };
                let rejection = match outcome {
                    Ok(()) => None,
                    Err(EngineError::Rejected(reason)) => Some(reason),
                    Err(e) => return Err(engine_err(e)),
                };
                window_check_row(rejection)
            }
        }
    }
}

/// The login user, which acts as owner/booker for every statement.
fn actor<C: ClientInfo>(client: &C) -> PgWireResult<String> {
    client
        .metadata()
        .get(pgwire::api::METADATA_USER)
        .cloned()
        .ok_or_else(|| user_error("28000", "no user on connection".into()))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn cabin_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner", Type::VARCHAR),
        field("address", Type::VARCHAR),
        field("squarage_property", Type::INT8),
        field("squarage_cabin", Type::INT8),
        field("sauna", Type::BOOL),
        field("beachfront", Type::BOOL),
    ]
}

fn advert_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("cabin_id", Type::VARCHAR),
        field("price_per_day", Type::INT8),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("created_by", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("advert_id", Type::VARCHAR),
        field("booked_by", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn window_check_schema() -> Vec<FieldInfo> {
    vec![field("ok", Type::BOOL), field("reason", Type::VARCHAR)]
}

/// Result columns for a statement, judged from the table after `FROM`.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lowered = sql.to_lowercase();
    let mut tokens = lowered.split_whitespace();
    if tokens.next() != Some("select") {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| *t != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c: char| c == ';' || c == '"'));
    match table {
        Some("cabins") => cabin_schema(),
        Some("adverts") => advert_schema(),
        Some("bookings") => booking_schema(),
        Some("window_check") => window_check_schema(),
        _ => vec![],
    }
}

fn cabin_rows(cabins: Vec<Cabin>) -> PgWireResult<Response> {
    let schema = Arc::new(cabin_schema());
    let rows: Vec<PgWireResult<_>> = cabins
        .into_iter()
        .map(|cabin| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&cabin.id.to_string())?;
            encoder.encode_field(&cabin.owner)?;
            encoder.encode_field(&cabin.details.address)?;
            encoder.encode_field(&i64::from(cabin.details.squarage_property))?;
            encoder.encode_field(&i64::from(cabin.details.squarage_cabin))?;
            encoder.encode_field(&cabin.details.sauna)?;
            encoder.encode_field(&cabin.details.beachfront)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn advert_rows(adverts: Vec<Advert>) -> PgWireResult<Response> {
    let schema = Arc::new(advert_schema());
    let rows: Vec<PgWireResult<_>> = adverts
        .into_iter()
        .map(|advert| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&advert.id.to_string())?;
            encoder.encode_field(&advert.cabin_id.to_string())?;
            encoder.encode_field(&i64::from(advert.price_per_day))?;
            encoder.encode_field(&advert.span.start)?;
            encoder.encode_field(&advert.span.end)?;
            encoder.encode_field(&advert.created_by)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|booking| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&booking.id.to_string())?;
            encoder.encode_field(&booking.advert_id.to_string())?;
            encoder.encode_field(&booking.booked_by)?;
            encoder.encode_field(&booking.span.start)?;
            encoder.encode_field(&booking.span.end)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn window_check_row(rejection: Option<Rejection>) -> PgWireResult<Response> {
    let schema = Arc::new(window_check_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&rejection.is_none())?;
    encoder.encode_field(&rejection.map(|r| r.as_str()))?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for CabinHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(SqlError::Empty) => return Ok(vec![Response::EmptyQuery]),
            Err(e) => return Err(sql_err(e)),
        };
        let actor = actor(client)?;
        Ok(vec![self.run(&actor, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CabinQueryParser;

#[async_trait]
impl QueryParser for CabinQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CabinHandler {
    type Statement = String;
    type QueryParser = CabinQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let cmd = match sql::parse_sql(&sql) {
            Ok(cmd) => cmd,
            Err(SqlError::Empty) => return Ok(Response::EmptyQuery),
            Err(e) => return Err(sql_err(e)),
        };
        let actor = actor(client)?;
        self.run(&actor, cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// A statement split at its `$N` placeholders.
#[derive(Debug, PartialEq)]
enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split `sql` at `$N` placeholders in one pass. Nothing inside single or
/// double quotes is a placeholder.
fn split_placeholders(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut quote: Option<u8> = None;
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                // A doubled quote closes and reopens, which comes out the same.
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let digits_end = bytes[i + 1..]
                    .iter()
                    .position(|c| !c.is_ascii_digit())
                    .map_or(bytes.len(), |p| i + 1 + p);
                match sql[i + 1..digits_end].parse::<usize>() {
                    Ok(n) => {
                        pieces.push(Piece::Text(&sql[text_start..i]));
                        pieces.push(Piece::Param(n));
                        i = digits_end;
                        text_start = i;
                    }
                    Err(_) => i += 1,
                }
            }
            None => i += 1,
        }
    }
    pieces.push(Piece::Text(&sql[text_start..]));
    pieces
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    split_placeholders(sql)
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => Some(n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Replace each `$N` with the bound text parameter, quoted, exactly once.
/// A placeholder with no bound value is left for the parser to reject.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    for piece in split_placeholders(sql) {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Param(n) => match n.checked_sub(1).and_then(|i| params.get(i)) {
                Some(Some(bytes)) => {
                    let value = String::from_utf8_lossy(bytes.as_ref());
                    out.push('\'');
                    out.push_str(&value.replace('\'', "''"));
                    out.push('\'');
                }
                Some(None) => out.push_str("NULL"),
                None => {
                    out.push('$');
                    out.push_str(&n.to_string());
                }
            },
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CabinFactory {
    handler: Arc<CabinHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CabinAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CabinFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(CabinHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                CabinAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CabinFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(CabinFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Rejected(Rejection::OverlapsExisting) => "23P01",
        EngineError::Rejected(_) | EngineError::WouldStrandBooking { .. } => "23514",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden { .. } => "42501",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::HasChildren(_) => "2BP01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest_index() {
        assert_eq!(count_params("SELECT * FROM cabins"), 0);
        assert_eq!(
            count_params(r#"INSERT INTO bookings VALUES ($1, $2, $3, $4)"#),
            4
        );
        assert_eq!(count_params("UPDATE adverts SET start = $12 WHERE id = $3"), 12);
        assert_eq!(count_params("SELECT '$' FROM cabins"), 0);
    }

    #[test]
    fn quoted_dollars_are_not_placeholders() {
        assert_eq!(count_params("SELECT * FROM cabins WHERE address = 'x$3'"), 0);
        assert_eq!(
            count_params(r#"SELECT * FROM cabins WHERE "a$9" = $2 AND address = 'it''s $5'"#),
            2
        );
    }

    #[test]
    fn bound_values_are_inserted_once_and_verbatim() {
        let sql = "INSERT INTO cabins (id, address) VALUES ($1, $2)";
        let params = [Some("01ARZ3NDEKTSV4RRFFQ69G5FAV"), Some("Lake road $1")];
        assert_eq!(
            substitute_params(sql, &params),
            "INSERT INTO cabins (id, address) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'Lake road $1')"
        );
    }

    #[test]
    fn substitution_quotes_nulls_and_high_indexes() {
        let params: Vec<Option<String>> = (1..=10)
            .map(|i| if i == 3 { None } else { Some(format!("v{i}")) })
            .collect();
        assert_eq!(
            substitute_params("SELECT $10, $1, $3, '$2', $11", &params),
            "SELECT 'v10', 'v1', NULL, '$2', $11"
        );
        assert_eq!(
            substitute_params("SELECT $1", &[Some("O'Brien")]),
            "SELECT 'O''Brien'"
        );
    }

    #[test]
    fn result_schema_follows_from_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM window_check WHERE cabin_id = $1"), ["ok", "reason"]);
        assert_eq!(names("select * from bookings;").len(), 5);
        assert_eq!(names("SELECT * FROM cabins WHERE id = $1").len(), 7);
        assert!(names("DELETE FROM cabins WHERE id = $1").is_empty());
    }

    #[test]
    fn sqlstates_distinguish_conflict_from_window() {
        assert_eq!(
            sqlstate(&EngineError::Rejected(Rejection::OverlapsExisting)),
            "23P01"
        );
        for reason in [
            Rejection::StartAfterEnd,
            Rejection::DatesInPast,
            Rejection::OutsideParentWindow,
        ] {
            assert_eq!(sqlstate(&EngineError::Rejected(reason)), "23514");
        }
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::nil())), "P0002");
        assert_eq!(
            sqlstate(&EngineError::Forbidden {
                id: Ulid::nil(),
                actor: "x".into()
            }),
            "42501"
        );
    }
}
