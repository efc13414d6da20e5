use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

const USER_COLUMNS: &[&str] = &["id", "role"];
const PROFESSIONAL_COLUMNS: &[&str] = &["id", "user_id", "name"];
const AVAILABILITY_COLUMNS: &[&str] = &["id", "date", "start_time", "end_time", "title"];
const APPOINTMENT_COLUMNS: &[&str] = &["id", "professional_id", "date", "start_time", "end_time"];

/// Which professional's calendar a listing targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfessionalRef {
    /// The caller's own profile.
    Me,
    Id(Ulid),
}

/// Parsed command from SQL input. Date and time values stay raw strings; the
/// engine normalizes them.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        role: UserRole,
    },
    InsertProfessional {
        id: Ulid,
        user_id: Ulid,
        name: Option<String>,
    },
    InsertAvailability {
        id: Option<Ulid>,
        date: Option<String>,
        start: Option<String>,
        end: Option<String>,
        title: Option<String>,
    },
    UpdateAvailability {
        id: Ulid,
        date: Option<String>,
        start: Option<String>,
        end: Option<String>,
        title: Option<String>,
    },
    DeleteAvailability {
        id: Ulid,
    },
    SelectAvailability {
        professional: ProfessionalRef,
        date: Option<String>,
    },
    InsertAppointment {
        id: Option<Ulid>,
        professional_id: Option<Ulid>,
        date: Option<String>,
        start: Option<String>,
        end: Option<String>,
    },
    UpdateAppointmentStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    /// `DELETE FROM appointments` cancels rather than erases.
    CancelAppointment {
        id: Ulid,
    },
    SelectAppointments {
        id: Option<Ulid>,
    },
}

/// Parse every statement of a simple-query string, in order. Nothing is
/// returned unless all of them parse.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

/// Parse exactly one statement, as the extended protocol requires.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::MultipleStatements(commands.len()));
    }
    Ok(commands.remove(0))
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "users" => {
            let row = Row::from_insert(insert, "users", USER_COLUMNS)?;
            let role = row
                .text("role")?
                .ok_or(SqlError::MissingValue("users", "role"))?;
            Ok(Command::InsertUser {
                id: row.required_ulid("id")?,
                role: UserRole::parse(&role)
                    .ok_or_else(|| SqlError::Parse(format!("unknown role: {role}")))?,
            })
        }
        "professionals" => {
            let row = Row::from_insert(insert, "professionals", PROFESSIONAL_COLUMNS)?;
            Ok(Command::InsertProfessional {
                id: row.required_ulid("id")?,
                user_id: row.required_ulid("user_id")?,
                name: row.text("name")?,
            })
        }
        "availability" => {
            let row = Row::from_insert(insert, "availability", AVAILABILITY_COLUMNS)?;
            Ok(Command::InsertAvailability {
                id: row.ulid("id")?,
                date: row.text("date")?,
                start: row.text("start_time")?,
                end: row.text("end_time")?,
                title: row.text("title")?,
            })
        }
        "appointments" => {
            let row = Row::from_insert(insert, "appointments", APPOINTMENT_COLUMNS)?;
            Ok(Command::InsertAppointment {
                id: row.ulid("id")?,
                professional_id: row.ulid("professional_id")?,
                date: row.text("date")?,
                start: row.text("start_time")?,
                end: row.text("end_time")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &a.value));
    }

    match table.as_str() {
        "availability" => {
            let (mut date, mut start, mut end, mut title) = (None, None, None, None);
            for (column, value) in set {
                let slot = match column.as_str() {
                    "date" => &mut date,
                    "start_time" => &mut start,
                    "end_time" => &mut end,
                    "title" => &mut title,
                    _ => return Err(SqlError::UnknownColumn("availability", column)),
                };
                *slot = parse_text(value)?;
            }
            Ok(Command::UpdateAvailability { id, date, start, end, title })
        }
        "appointments" => {
            let [(column, value)] = set.as_slice() else {
                return Err(SqlError::Unsupported("appointments accept only SET status".into()));
            };
            if column != "status" {
                return Err(SqlError::UnknownColumn("appointments", column.clone()));
            }
            let status = parse_text(value)?.ok_or(SqlError::MissingValue("appointments", "status"))?;
            let status = AppointmentStatus::parse(&status)
                .ok_or_else(|| SqlError::Parse(format!("unknown status: {status}")))?;
            Ok(Command::UpdateAppointmentStatus { id, status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "availability" => Ok(Command::DeleteAvailability { id }),
        "appointments" => Ok(Command::CancelAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => {
            let (mut professional, mut date) = (None, None);
            for (column, value) in filters {
                match column.as_str() {
                    "professional_id" => {
                        let raw = parse_text(value)?
                            .ok_or(SqlError::MissingFilter("professional_id"))?;
                        professional = Some(if raw.eq_ignore_ascii_case("me") {
                            ProfessionalRef::Me
                        } else {
                            ProfessionalRef::Id(parse_ulid_str(&raw)?)
                        });
                    }
                    "date" => date = parse_text(value)?,
                    _ => return Err(SqlError::UnknownColumn("availability", column)),
                }
            }
            Ok(Command::SelectAvailability {
                professional: professional.ok_or(SqlError::MissingFilter("professional_id"))?,
                date,
            })
        }
        "appointments" => {
            let mut id = None;
            for (column, value) in filters {
                match column.as_str() {
                    "id" => id = Some(parse_ulid_expr(value)?),
                    _ => return Err(SqlError::UnknownColumn("appointments", column)),
                }
            }
            Ok(Command::SelectAppointments { id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms joined by AND.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Rows ──────────────────────────────────────────────────────

/// Values of a single-row INSERT keyed by column. Without a column list the
/// table's default column order applies and trailing columns may be omitted.
struct Row<'a> {
    table: &'static str,
    values: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn from_insert(
        insert: &'a ast::Insert,
        table: &'static str,
        columns: &[&'static str],
    ) -> Result<Self, SqlError> {
        let values = extract_single_row(insert)?;
        let names: Vec<&'static str> = if insert.columns.is_empty() {
            if values.len() > columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            columns[..values.len()].to_vec()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert
                .columns
                .iter()
                .map(|ident| {
                    let name = ident.value.to_lowercase();
                    columns
                        .iter()
                        .find(|c| **c == name)
                        .copied()
                        .ok_or(SqlError::UnknownColumn(table, name))
                })
                .collect::<Result<_, _>>()?
        };
        Ok(Self {
            table,
            values: names.into_iter().zip(values.iter()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values.iter().find(|(c, _)| *c == column).map(|(_, e)| *e)
    }

    fn text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_text).transpose().map(Option::flatten)
    }

    fn ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(parse_ulid_or_null).transpose().map(Option::flatten)
    }

    fn required_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.ulid(column)?.ok_or(SqlError::MissingValue(self.table, column))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_single_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// String literal, bare number, or NULL.
fn parse_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match parse_ulid_or_null(expr)? {
        Some(id) => Ok(id),
        None => Err(SqlError::Parse("expected ULID, got NULL".into())),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    parse_text(expr)?.map(|s| parse_ulid_str(&s)).transpose()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingValue(&'static str, &'static str),
    MissingFilter(&'static str),
    MultipleStatements(usize),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::MultipleStatements(_) => "0A000",
            _ => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingValue(t, c) => write!(f, "{t}: {c} is required"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MultipleStatements(n) => {
                write!(f, "expected one statement, got {n}")
            }
        }
    }
}

impl std::error::Error for SqlError {}
