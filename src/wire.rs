use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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

use crate::auth::RentdAuthSource;
use crate::engine::{AdmissionError, BookingRequest, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct RentdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RentdQueryParser>,
}

impl RentdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RentdQueryParser),
        }
    }

    /// The connection's database name is the business id.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            tracing::error!("tenant {db:?} unavailable: {e}");
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    async fn run(&self, engine: &Engine, sql_text: &str, format: Option<&Format>) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertProduct {
                id,
                name,
                price_per_day,
            } => {
                engine
                    .create_product(id, name, price_per_day)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertAsset {
                id,
                product_id,
                identifier,
                status,
            } => {
                engine
                    .add_asset(id, product_id, identifier, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetAssetStatus { asset_id, status } => {
                engine
                    .set_asset_status(asset_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertCustomer { id, name, email } => {
                engine
                    .create_customer(id, name, email)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking {
                product_id,
                start,
                end,
                quantity,
                customer,
                notes,
            } => {
                let request = BookingRequest {
                    product_id,
                    start,
                    end,
                    quantity,
                    customer,
                    notes,
                };
                let booking = engine
                    .create_booking_with(request, self.tenant_manager.admission())
                    .await
                    .map_err(admission_err)?;
                bookings_response(vec![booking], format)
            }
            Command::SetBookingStatus { booking_id, status } => {
                engine
                    .transition_booking(booking_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAvailability {
                product_id,
                start,
                end,
                quantity,
            } => {
                let availability = engine
                    .availability(product_id, start, end, quantity)
                    .await
                    .map_err(admission_err)?;
                let schema = Arc::new(availability_schema(format));
                let pid = product_id.to_string();
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&pid)?;
                encoder.encode_field(&availability.exists)?;
                encoder.encode_field(&i64::from(availability.remaining))?;
                encoder.encode_field(&i64::from(availability.total))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectProducts => {
                let products = engine.list_products().await;
                let schema = Arc::new(products_schema(format));
                let rows: Vec<PgWireResult<_>> = products
                    .iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&p.name)?;
                        encoder.encode_field(&p.price_per_day)?;
                        encoder.encode_field(&i64::from(p.quantity))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectCustomers => {
                let customers = engine.list_customers();
                let schema = Arc::new(customers_schema(format));
                let rows: Vec<PgWireResult<_>> = customers
                    .iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.id.to_string())?;
                        encoder.encode_field(&c.name)?;
                        encoder.encode_field(&c.email)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBooking { id } => {
                bookings_response(engine.get_booking(&id).into_iter().collect(), format)
            }
            Command::SelectBookings { filter } => {
                let window = sql::booking_window(filter, chrono::Utc::now()).ok_or_else(|| {
                    user_error("22007", "invalid range: start must be strictly before end".into())
                })?;
                bookings_response(engine.list_bookings(&window), format)
            }
        }
    }
}

fn bookings_response(bookings: Vec<Booking>, format: Option<&Format>) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema(format));
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.items.first().map(|i| i.product_id.to_string()))?;
            encoder.encode_field(&b.customer_id.to_string())?;
            encoder.encode_field(&b.status.to_string())?;
            encoder.encode_field(&sql::format_instant(b.span.start))?;
            encoder.encode_field(&sql::format_instant(b.span.end))?;
            encoder.encode_field(&(b.items.len() as i64))?;
            encoder.encode_field(&b.notes)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Result schemas ───────────────────────────────────────────────

fn fields(columns: &[(&str, Type)], format: Option<&Format>) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(idx));
            FieldInfo::new((*name).into(), None, None, ty.clone(), field_format)
        })
        .collect()
}

fn availability_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    fields(
        &[
            ("product_id", Type::VARCHAR),
            ("exists", Type::BOOL),
            ("remaining", Type::INT8),
            ("total", Type::INT8),
        ],
        format,
    )
}

fn bookings_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("product_id", Type::VARCHAR),
            ("customer_id", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("start", Type::VARCHAR),
            ("end", Type::VARCHAR),
            ("quantity", Type::INT8),
            ("notes", Type::VARCHAR),
        ],
        format,
    )
}

fn products_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("price_per_day", Type::INT8),
            ("quantity", Type::INT8),
        ],
        format,
    )
}

fn customers_schema(format: Option<&Format>) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("email", Type::VARCHAR),
        ],
        format,
    )
}

/// Table a statement reads from (or inserts into), lowercased.
fn target_table(sql: &str) -> Option<(bool, String)> {
    let tokens: Vec<&str> = sql.split_whitespace().collect();
    let is_select = tokens.first()?.eq_ignore_ascii_case("SELECT");
    let keyword = if is_select { "FROM" } else { "INTO" };
    let pos = tokens.iter().position(|t| t.eq_ignore_ascii_case(keyword))?;
    let table = tokens.get(pos + 1)?;
    let table = table
        .split('(')
        .next()
        .unwrap_or_default()
        .trim_matches(|c| c == '"' || c == ';')
        .to_lowercase();
    Some((is_select, table))
}

/// Row description for a statement before it runs. Only statements that
/// return rows have one.
fn statement_schema(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    match target_table(sql) {
        Some((true, t)) if t == "availability" => availability_schema(format),
        Some((true, t)) if t == "products" => products_schema(format),
        Some((true, t)) if t == "customers" => customers_schema(format),
        Some((_, t)) if t == "bookings" => bookings_schema(format),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for RentdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RentdQueryParser;

#[async_trait]
impl QueryParser for RentdQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RentdHandler {
    type Statement = String;
    type QueryParser = RentdQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql, Some(&portal.result_column_format)).await
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
            statement_schema(&target.statement, None),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// Byte ranges and indexes of `$N` placeholders outside quoted literals
/// and quoted identifiers.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which needs no special case.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start, i, n));
                }
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// One left-to-right pass; inserted values are never scanned again.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut last = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            continue;
        };
        result.push_str(&sql[last..start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        last = end;
    }
    result.push_str(&sql[last..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RentdFactory {
    handler: Arc<RentdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RentdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RentdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RentdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RentdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RentdFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(RentdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn admission_sqlstate(e: &AdmissionError) -> &'static str {
    match e {
        AdmissionError::InvalidRange(_) => "22007",
        AdmissionError::InvalidQuantity(_) => "22023",
        AdmissionError::ProductNotFound(_) | AdmissionError::CustomerNotFound(_) => "P0002",
        AdmissionError::NotAvailable { .. } => "23P01",
        AdmissionError::TransientConflict { .. } | AdmissionError::Timeout(_) => "40001",
        AdmissionError::LimitExceeded(_) => "54000",
        AdmissionError::Storage(_) => "XX000",
    }
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::AlreadyExists(_) | EngineError::InvalidTransition { .. } | EngineError::WalError(_) => {
            "XX000"
        }
    }
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidInstant(_) => "22007",
        SqlError::InvalidQuantity(_) | SqlError::InvalidValue(_) => "22023",
        _ => "42601",
    }
}

fn admission_err(e: AdmissionError) -> PgWireError {
    user_error(admission_sqlstate(&e), e.to_string())
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(msg) = &e {
        tracing::error!("storage failure: {msg}");
    }
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ulid::Ulid;

    use super::*;

    #[test]
    fn admission_errors_map_to_sqlstates() {
        let cases = [
            (AdmissionError::InvalidRange("x".into()), "22007"),
            (AdmissionError::InvalidQuantity("x".into()), "22023"),
            (AdmissionError::ProductNotFound(Ulid::new()), "P0002"),
            (AdmissionError::CustomerNotFound(Ulid::new()), "P0002"),
            (
                AdmissionError::NotAvailable {
                    requested: 2,
                    remaining: 1,
                },
                "23P01",
            ),
            (AdmissionError::TransientConflict { attempts: 5 }, "40001"),
            (AdmissionError::Timeout(Duration::from_secs(2)), "40001"),
            (AdmissionError::LimitExceeded("window too wide"), "54000"),
            (AdmissionError::Storage("disk".into()), "XX000"),
        ];
        for (err, code) in cases {
            assert_eq!(admission_sqlstate(&err), code, "{err}");
        }
    }

    #[test]
    fn engine_and_sql_errors_map_to_sqlstates() {
        assert_eq!(engine_sqlstate(&EngineError::NotFound(Ulid::new())), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::LimitExceeded("too many products")), "54000");
        assert_eq!(sql_sqlstate(&SqlError::InvalidInstant("soon".into())), "22007");
        assert_eq!(sql_sqlstate(&SqlError::InvalidQuantity("2.5".into())), "22023");
        assert_eq!(sql_sqlstate(&SqlError::Empty), "42601");
    }

    #[test]
    fn statement_schemas_follow_target_table() {
        let names = |sql: &str| -> Vec<String> {
            statement_schema(sql, None)
                .iter()
                .map(|f| f.name().to_string())
                .collect()
        };
        assert_eq!(
            names("SELECT * FROM availability WHERE product_id = $1"),
            ["product_id", "exists", "remaining", "total"]
        );
        assert_eq!(names("select * from Products"), ["id", "name", "price_per_day", "quantity"]);
        assert_eq!(names("INSERT INTO bookings(product_id) VALUES ($1)")[0], "id");
        assert!(names("INSERT INTO products (id) VALUES ($1)").is_empty());
        assert!(names("DELETE FROM bookings WHERE id = $1").is_empty());
    }

    #[test]
    fn params_are_counted_and_quoted() {
        assert_eq!(count_params("SELECT $1, $2, $10"), 10);
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("SELECT '$3' FROM t WHERE a = $1"), 1);
        let sql = substitute(
            "INSERT INTO customers (id, name, email) VALUES ($1, $2, $3)",
            &[Some("01ARZ3NDEKTSV4RRFFQ69G5FAV".into()), Some("O'Brien".into()), None],
        );
        assert_eq!(
            sql,
            "INSERT INTO customers (id, name, email) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'O''Brien', NULL)"
        );
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let id = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let sql = substitute(
            "INSERT INTO customers (id, name, email) VALUES ($1, $2, $3)",
            &[Some(id.into()), Some("Studio $1".into()), None],
        );
        assert_eq!(
            sql,
            format!("INSERT INTO customers (id, name, email) VALUES ('{id}', 'Studio $1', NULL)")
        );
        match sql::parse_sql(&sql).unwrap() {
            Command::InsertCustomer { name, email, .. } => {
                assert_eq!(name, "Studio $1");
                assert_eq!(email, None);
            }
            cmd => panic!("expected InsertCustomer, got {cmd:?}"),
        }
    }

    #[test]
    fn placeholders_inside_literals_and_past_the_end_are_kept() {
        let sql = substitute(
            "SELECT * FROM bookings WHERE id = $1 AND notes = 'costs $2' AND x = $10",
            &[Some("a".into()), Some("b".into())],
        );
        assert_eq!(sql, "SELECT * FROM bookings WHERE id = 'a' AND notes = 'costs $2' AND x = $10");
    }
}
