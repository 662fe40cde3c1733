use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, error};
use ulid::Ulid;

use crate::auth::FleetslotAuthSource;
use crate::calendar;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct FleetslotHandler {
    engine: Arc<Engine>,
    query_parser: Arc<FleetslotQueryParser>,
}

impl FleetslotHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(FleetslotQueryParser),
        }
    }

    /// Parse, run and record one statement.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        reject_past_dates(&cmd, chrono::Local::now().date_naive())?;
        let engine = &self.engine;

        match cmd {
            Command::InsertVehicle(vehicle) => {
                engine.register_vehicle(vehicle).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertUser(user) => {
                engine.register_user(user).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::BookSlots {
                vehicle_id,
                user_id,
                date,
                starts,
            } => {
                let booked = engine
                    .book_slots(vehicle_id, user_id, date, &starts)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(booked.len()),
                ))
            }
            Command::ImportReservations { rows } => {
                let reservations = rows
                    .into_iter()
                    .map(|r| Reservation {
                        id: Ulid::new(),
                        vehicle_id: r.vehicle_id,
                        user_id: r.user_id,
                        date: r.date,
                        start: r.start,
                        end: r.end,
                    })
                    .collect();
                let stored = engine
                    .import_reservations(reservations)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(stored.len()),
                ))
            }
            Command::SelectSlots => {
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<DataRow>> = calendar::day_slots()
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&fmt_time(slot.start))?;
                        encoder.encode_field(&fmt_time(slot.end))?;
                        encoder.encode_field(&slot.label())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAvailability {
                vehicle_id,
                date,
                viewer,
            } => {
                let slots = engine
                    .slot_availability(vehicle_id, date, viewer)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema(false));
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .iter()
                    .map(|s| encode_slot_status(&schema, vehicle_id, None, s))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectCompanyAvailability { user_id, date } => {
                let fleet = engine
                    .company_availability(user_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema(true));
                let rows: Vec<PgWireResult<DataRow>> = fleet
                    .iter()
                    .flat_map(|va| {
                        va.slots.iter().map(|s| {
                            encode_slot_status(&schema, va.vehicle.id, Some(va.vehicle.plate.as_str()), s)
                        })
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectReservations { day } => {
                let reservations = match day {
                    Some((vehicle_id, date)) => engine
                        .reservations_for(vehicle_id, date)
                        .await
                        .map_err(engine_err)?,
                    None => engine.list_reservations().await,
                };
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<DataRow>> = reservations
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.vehicle_id.to_string())?;
                        encoder.encode_field(&r.user_id.to_string())?;
                        encoder.encode_field(&r.date.to_string())?;
                        encoder.encode_field(&fmt_time(r.start))?;
                        encoder.encode_field(&fmt_time(r.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectVehicles { company } => {
                let vehicles = engine.list_vehicles(company.as_deref()).await;
                let schema = Arc::new(vehicles_schema());
                let rows: Vec<PgWireResult<DataRow>> = vehicles
                    .iter()
                    .map(|v| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&v.id.to_string())?;
                        encoder.encode_field(&v.company)?;
                        encoder.encode_field(&v.company2)?;
                        encoder.encode_field(&v.rut)?;
                        encoder.encode_field(&v.plate)?;
                        encoder.encode_field(&v.vehicle_type)?;
                        encoder.encode_field(&v.brand)?;
                        encoder.encode_field(&v.model)?;
                        encoder.encode_field(&v.transmission)?;
                        encoder.encode_field(&v.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectUsers => {
                let users = engine.list_users();
                let schema = Arc::new(users_schema());
                let rows: Vec<PgWireResult<DataRow>> = users
                    .iter()
                    .map(|u| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&u.id.to_string())?;
                        encoder.encode_field(&u.full_name)?;
                        encoder.encode_field(&u.company)?;
                        encoder.encode_field(&u.company2)?;
                        encoder.encode_field(&u.rut)?;
                        encoder.encode_field(&u.city)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

/// Writes may not target a day that has already passed.
fn reject_past_dates(cmd: &Command, today: NaiveDate) -> PgWireResult<()> {
    match cmd.booking_dates().into_iter().find(|d| *d < today) {
        Some(past) => Err(user_error(
            "22007",
            format!("cannot reserve {past}: date is in the past"),
        )),
        None => Ok(()),
    }
}

fn encode_slot_status(
    schema: &Arc<Vec<FieldInfo>>,
    vehicle_id: VehicleId,
    plate: Option<&str>,
    status: &SlotStatus,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&vehicle_id.to_string())?;
    if let Some(plate) = plate {
        encoder.encode_field(&plate)?;
    }
    encoder.encode_field(&fmt_time(status.slot.start))?;
    encoder.encode_field(&fmt_time(status.slot.end))?;
    encoder.encode_field(&status.slot.label())?;
    encoder.encode_field(&status.is_free())?;
    encoder.encode_field(&status.booked_by.map(|u| u.to_string()))?;
    encoder.encode_field(&status.booked_by_viewer)?;
    Ok(encoder.take_row())
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text("start"), text("end"), text("label")]
}

fn availability_schema(with_plate: bool) -> Vec<FieldInfo> {
    let mut fields = vec![text("vehicle_id")];
    if with_plate {
        fields.push(text("plate"));
    }
    fields.extend([
        text("start"),
        text("end"),
        text("label"),
        boolean("available"),
        text("booked_by"),
        boolean("booked_by_me"),
    ]);
    fields
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("vehicle_id"),
        text("user_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
    ]
}

fn vehicles_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("company"),
        text("company2"),
        text("rut"),
        text("plate"),
        text("vehicle_type"),
        text("brand"),
        text("model"),
        text("transmission"),
        text("status"),
    ]
}

fn users_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("full_name"),
        text("company"),
        text("company2"),
        text("rut"),
        text("city"),
    ]
}

/// Result columns of a statement, from the table after `FROM`. Statements
/// are described before their parameters are bound, so this cannot go
/// through the full parser.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == ';' || c == '(' || c == ')')
        .filter(|w| !w.is_empty());
    if words.next() != Some("select") {
        return Vec::new();
    }
    let table = words
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches('"').rsplit('.').next().unwrap_or(t).to_string());
    match table.as_deref() {
        Some("slots") => slots_schema(),
        Some("availability") => availability_schema(false),
        Some("company_availability") => availability_schema(true),
        Some("reservations") => reservations_schema(),
        Some("vehicles") => vehicles_schema(),
        Some("users") => users_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for FleetslotHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetslotQueryParser;

#[async_trait]
impl QueryParser for FleetslotQueryParser {
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
impl ExtendedQueryHandler for FleetslotHandler {
    type Statement = String;
    type QueryParser = FleetslotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(&sql).await
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

/// `$N` placeholders outside quoted literals and identifiers, as
/// `(byte range, N)`.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start + 1..end].parse::<usize>() {
                    found.push((start..end, n));
                    i = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound parameters as quoted text literals in one left-to-right pass
/// over the statement. Substituted text is never rescanned.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetslotFactory {
    handler: Arc<FleetslotHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<FleetslotAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl FleetslotFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> io::Result<Self> {
        let auth_source = FleetslotAuthSource::new(password)?;
        let param_provider = DefaultServerParameterProvider::default();
        Ok(Self {
            handler: Arc::new(FleetslotHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        })
    }
}

impl PgWireServerHandlers for FleetslotFactory {
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

/// Serve one client connection until it closes. The factory is shared by
/// every connection.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<FleetslotFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
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

/// SQLSTATE for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23505",
        EngineError::AlreadyExists(_) | EngineError::PlateTaken(_) => "23505",
        EngineError::InvalidSlot(_) => "22023",
        EngineError::Validation(_) => "23514",
        EngineError::VehicleNotFound(_) | EngineError::UserNotFound(_) => "P0002",
        EngineError::NotAuthorized { .. } => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    match &e {
        EngineError::WalError(_) => error!("{e}"),
        _ => debug!("request rejected: {e}"),
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
