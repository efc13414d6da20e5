use std::fmt::Debug;
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

use crate::auth::{AuthError, Session, SlotbookAuthSource, resolve_session};
use crate::engine::{
    AvailabilityPatch, AvailabilityRequest, BookingRequest, Engine, EngineError, ErrorKind,
};
use crate::model::*;
use crate::observability::{self, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ProfessionalRef};
use crate::tenant::TenantManager;
use crate::time::{format_date, format_time, normalize_date};

pub struct SlotbookHandler {
    tenant_manager: Arc<TenantManager>,
    operator: String,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, operator: String) -> Self {
        Self {
            tenant_manager,
            operator,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("marketplace error: {e}"))
        })
    }

    /// Resolved per statement, so directory changes apply to open connections.
    fn resolve_session<C: ClientInfo>(&self, client: &C, engine: &Engine) -> PgWireResult<Session> {
        let login = client.metadata().get("user").map(String::as_str);
        resolve_session(login, &self.operator, engine).map_err(auth_err)
    }

    /// Run statements in order. The first failure stops the batch; statements
    /// before it stay committed.
    async fn run<C: ClientInfo>(
        &self,
        client: &C,
        commands: Vec<Command>,
    ) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            let session = self.resolve_session(client, &engine)?;
            let label = observability::command_label(&cmd);
            let started = Instant::now();
            let result = self.execute_command(&engine, session, cmd).await;
            metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
                .record(started.elapsed().as_secs_f64());
            let status = if result.is_ok() { "ok" } else { "error" };
            metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
            responses.extend(result?);
        }
        Ok(responses)
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        session: Session,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertUser { id, role } => {
                require_operator(session)?;
                engine.register_user(id, role).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertProfessional { id, user_id, name } => {
                require_operator(session)?;
                engine
                    .register_professional(id, user_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectAvailability { professional, date } => {
                let date = date
                    .as_deref()
                    .map(normalize_date)
                    .transpose()
                    .map_err(|e| engine_err(e.into()))?;
                let intervals = match (professional, session) {
                    (ProfessionalRef::Id(pid), _) => engine.list_availability(pid, date).await,
                    (ProfessionalRef::Me, Session::Caller(caller)) => {
                        engine.list_my_availability(&caller, date).await
                    }
                    (ProfessionalRef::Me, Session::Operator) => Err(EngineError::Unauthorized(
                        "the operator has no calendar",
                    )),
                }
                .map_err(engine_err)?;
                Ok(vec![interval_rows(intervals)])
            }
            other => {
                let caller = require_caller(session)?;
                self.execute_as(engine, &caller, other).await
            }
        }
    }

    async fn execute_as(
        &self,
        engine: &Engine,
        caller: &Caller,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertAvailability { id, date, start, end, title } => {
                let req = AvailabilityRequest { id, date, start, end, title };
                engine.create_availability(caller, req).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateAvailability { id, date, start, end, title } => {
                let patch = AvailabilityPatch { date, start, end, title };
                engine.edit_availability(caller, id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteAvailability { id } => {
                engine.delete_availability(caller, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertAppointment { id, professional_id, date, start, end } => {
                let req = BookingRequest { id, professional_id, date, start, end };
                let booking = engine.book_appointment(caller, req).await.map_err(engine_err)?;
                Ok(vec![
                    appointment_rows(vec![booking.appointment]),
                    interval_rows(booking.remaining),
                ])
            }
            Command::UpdateAppointmentStatus { id, status } => {
                let updated = match status {
                    AppointmentStatus::Cancelled => engine.cancel_appointment(id, caller).await,
                    AppointmentStatus::Completed => engine.complete_appointment(id, caller).await,
                    AppointmentStatus::Booked => {
                        return Err(user_error(
                            "55000",
                            "an appointment cannot be set back to BOOKED; book a new one".into(),
                        ));
                    }
                };
                updated.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CancelAppointment { id } => {
                engine.cancel_appointment(id, caller).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectAppointments { id: Some(id) } => {
                let appointment = engine
                    .get_appointment_by_id(id, caller)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![appointment_rows(vec![appointment])])
            }
            Command::SelectAppointments { id: None } => {
                let appointments = engine.get_my_appointments(caller).await.map_err(engine_err)?;
                Ok(vec![appointment_rows(appointments)])
            }
            Command::InsertUser { .. }
            | Command::InsertProfessional { .. }
            | Command::SelectAvailability { .. } => Err(user_error(
                "42501",
                "statement not available to this session".into(),
            )),
        }
    }
}

fn require_operator(session: Session) -> PgWireResult<()> {
    match session {
        Session::Operator => Ok(()),
        Session::Caller(_) => Err(user_error(
            "42501",
            "only the operator may register users and professionals".into(),
        )),
    }
}

fn require_caller(session: Session) -> PgWireResult<Caller> {
    match session {
        Session::Caller(caller) => Ok(caller),
        Session::Operator => Err(user_error(
            "42501",
            "the operator may only register users and read listings".into(),
        )),
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    ["id", "professional_id", "date", "start_time", "end_time", "title"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn appointment_schema() -> Vec<FieldInfo> {
    ["id", "user_id", "professional_id", "date", "start_time", "end_time", "status"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn interval_rows(intervals: Vec<AvailabilityInterval>) -> Response {
    let schema = Arc::new(availability_schema());
    let rows: Vec<PgWireResult<_>> = intervals
        .into_iter()
        .map(|i| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&i.id.to_string())?;
            encoder.encode_field(&i.professional_id.to_string())?;
            encoder.encode_field(&format_date(i.date))?;
            encoder.encode_field(&format_time(i.range.start))?;
            encoder.encode_field(&format_time(i.range.end))?;
            encoder.encode_field(&i.title)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn appointment_rows(appointments: Vec<Appointment>) -> Response {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<_>> = appointments
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.user_id.to_string())?;
            encoder.encode_field(&a.professional_id.to_string())?;
            encoder.encode_field(&format_date(a.date))?;
            encoder.encode_field(&format_time(a.range.start))?;
            encoder.encode_field(&format_time(a.range.end))?;
            encoder.encode_field(&a.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Shape of the first result set a statement produces, judged from its text.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    let reads = upper.starts_with("SELECT");
    if upper.contains("APPOINTMENTS") && (reads || upper.starts_with("INSERT")) {
        appointment_schema()
    } else if upper.contains("AVAILABILITY") && reads {
        availability_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        self.run(client, commands).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    /// Only the first result set is returned; a booking's remaining intervals
    /// are available through the simple protocol or a follow-up SELECT.
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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run(client, vec![cmd]).await?;
        Ok(responses.remove(0))
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

/// Highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String, operator: String) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(tenant_manager, operator)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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
    operator: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(tenant_manager, password, operator));
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

pub fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidFormat => "22007",
        ErrorKind::MissingField => "23502",
        ErrorKind::InvalidRange => "22023",
        ErrorKind::NoAvailability | ErrorKind::SlotAlreadyTaken => "23P01",
        ErrorKind::Conflict => "40001",
        ErrorKind::NotFound => "P0002",
        ErrorKind::AlreadyExists => "23505",
        ErrorKind::Unauthorized => "42501",
        ErrorKind::InvalidTransition => "55000",
        ErrorKind::LimitExceeded => "54000",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let kind = e.kind();
    if kind == ErrorKind::Internal {
        tracing::error!("statement failed: {e}");
    }
    user_error(sqlstate(kind), e.public_message())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn auth_err(e: AuthError) -> PgWireError {
    metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
    tracing::warn!("rejected session: {e}");
    user_error("28000", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_counting() {
        assert_eq!(count_params("SELECT * FROM appointments"), 0);
        assert_eq!(count_params("DELETE FROM availability WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO appointments VALUES ($1, $2, $3, $4, $10)"),
            10
        );
        assert_eq!(count_params("SELECT '$' FROM appointments"), 0);
    }

    #[test]
    fn schemas_follow_statement() {
        assert_eq!(result_schema("select * from appointments").len(), 7);
        assert_eq!(
            result_schema("INSERT INTO appointments (professional_id) VALUES ($1)").len(),
            7
        );
        assert_eq!(
            result_schema("SELECT * FROM availability WHERE professional_id = 'me'").len(),
            6
        );
        assert!(result_schema("INSERT INTO availability (date) VALUES ($1)").is_empty());
        assert!(result_schema("DELETE FROM appointments WHERE id = $1").is_empty());
    }

    #[test]
    fn retryable_conflict_has_serialization_code() {
        assert_eq!(sqlstate(EngineError::Conflict.kind()), "40001");
        assert_eq!(sqlstate(EngineError::NoAvailability.kind()), "23P01");
        assert_eq!(sqlstate(EngineError::WalError("disk".into()).kind()), "XX000");
    }
}
