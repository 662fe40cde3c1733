use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::{MAX_BATCH_SIZE, MAX_IMPORT_SIZE};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle(Vehicle),
    InsertUser(UserProfile),
    /// One booking request: every row of the INSERT, same vehicle, user and day.
    BookSlots {
        vehicle_id: VehicleId,
        user_id: UserId,
        date: NaiveDate,
        starts: Vec<NaiveTime>,
    },
    /// Reservations with an explicit end time, committed as one set.
    ImportReservations {
        rows: Vec<ImportRow>,
    },
    SelectSlots,
    SelectAvailability {
        vehicle_id: VehicleId,
        date: NaiveDate,
        viewer: Option<UserId>,
    },
    SelectCompanyAvailability {
        user_id: UserId,
        date: NaiveDate,
    },
    /// All reservations, or one vehicle's on one day.
    SelectReservations {
        day: Option<(VehicleId, NaiveDate)>,
    },
    SelectVehicles {
        company: Option<String>,
    },
    SelectUsers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub vehicle_id: VehicleId,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Command {
    /// The calendar date a write targets, if any.
    pub fn booking_dates(&self) -> Vec<NaiveDate> {
        match self {
            Command::BookSlots { date, .. } => vec![*date],
            Command::ImportReservations { rows } => rows.iter().map(|r| r.date).collect(),
            _ => Vec::new(),
        }
    }
}

const VEHICLE_COLUMNS: &[&str] = &[
    "id",
    "company",
    "plate",
    "brand",
    "model",
    "vehicle_type",
    "transmission",
    "status",
    "rut",
    "company2",
];

const USER_COLUMNS: &[&str] = &["id", "full_name", "company", "city", "rut", "company2"];

const RESERVATION_COLUMNS: &[&str] = &["vehicle_id", "user_id", "date", "start_time", "end_time"];

/// Columns each readable table accepts in `WHERE`.
fn filter_columns(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    const NONE: &[&str] = &[];
    const AVAILABILITY: &[&str] = &["vehicle_id", "date", "user_id"];
    const COMPANY_AVAILABILITY: &[&str] = &["user_id", "date"];
    const RESERVATIONS: &[&str] = &["vehicle_id", "date"];
    const VEHICLES: &[&str] = &["company"];
    match table {
        "slots" => Some(("slots", NONE)),
        "availability" => Some(("availability", AVAILABILITY)),
        "company_availability" => Some(("company_availability", COMPANY_AVAILABILITY)),
        "reservations" => Some(("reservations", RESERVATIONS)),
        "vehicles" => Some(("vehicles", VEHICLES)),
        "users" => Some(("users", NONE)),
        _ => None,
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        many => return Err(SqlError::MultipleStatements(many.len())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's default column order applies.
struct Row<'a> {
    table: &'static str,
    values: HashMap<&'a str, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &'static str) -> Option<&'a Expr> {
        self.values.get(col).copied()
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.required(col)?)
    }

    fn text_or_empty(&self, col: &'static str) -> Result<String, SqlError> {
        Ok(self.opt_text(col)?.unwrap_or_default())
    }

    fn opt_text(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        match self.get(col) {
            Some(expr) => parse_string_or_null(expr),
            None => Ok(None),
        }
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(col)?)
    }
}

fn rows_of<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    defaults: &[&'static str],
) -> Result<Vec<Row<'a>>, SqlError> {
    let columns: Vec<&'a str> = if insert.columns.is_empty() {
        Vec::new()
    } else {
        insert.columns.iter().map(|c| c.value.as_str()).collect()
    };

    let mut rows = Vec::new();
    for values in extract_all_insert_rows(insert)? {
        let mut map = HashMap::new();
        if columns.is_empty() {
            if values.len() > defaults.len() {
                return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
            }
            for (col, expr) in defaults.iter().zip(values) {
                map.insert(*col, expr);
            }
        } else {
            if values.len() != columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            for (col, expr) in columns.iter().zip(values) {
                let known = defaults
                    .iter()
                    .find(|d| d.eq_ignore_ascii_case(col))
                    .ok_or_else(|| SqlError::UnknownColumn(table, col.to_string()))?;
                map.insert(*known, expr);
            }
        }
        rows.push(Row { table, values: map });
    }
    Ok(rows)
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "vehicles" => {
            let row = single_row(rows_of(insert, "vehicles", VEHICLE_COLUMNS)?, "vehicles")?;
            let status = match row.opt_text("status")? {
                Some(s) => s.parse().map_err(SqlError::Parse)?,
                None => VehicleStatus::Active,
            };
            Ok(Command::InsertVehicle(Vehicle {
                id: row.ulid("id")?,
                company: row.text("company")?,
                company2: row.opt_text("company2")?,
                rut: row.text_or_empty("rut")?,
                plate: row.text("plate")?,
                vehicle_type: row.text("vehicle_type")?,
                brand: row.text("brand")?,
                model: row.text("model")?,
                transmission: row.text_or_empty("transmission")?,
                status,
            }))
        }
        "users" => {
            let row = single_row(rows_of(insert, "users", USER_COLUMNS)?, "users")?;
            Ok(Command::InsertUser(UserProfile {
                id: row.ulid("id")?,
                full_name: row.text("full_name")?,
                company: row.text("company")?,
                company2: row.opt_text("company2")?,
                rut: row.text_or_empty("rut")?,
                city: row.text_or_empty("city")?,
            }))
        }
        "reservations" => parse_insert_reservations(insert),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_row<'a>(mut rows: Vec<Row<'a>>, table: &'static str) -> Result<Row<'a>, SqlError> {
    if rows.len() != 1 {
        return Err(SqlError::Parse(format!("{table}: expected one row, got {}", rows.len())));
    }
    rows.pop().ok_or(SqlError::Parse(format!("{table}: empty VALUES")))
}

fn parse_insert_reservations(insert: &ast::Insert) -> Result<Command, SqlError> {
    let rows = rows_of(insert, "reservations", RESERVATION_COLUMNS)?;

    if rows.iter().any(|r| r.get("end_time").is_some()) {
        if rows.len() > MAX_IMPORT_SIZE {
            return Err(SqlError::TooManyRows(MAX_IMPORT_SIZE));
        }
        let mut out = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let parsed = (|| {
                Ok::<_, SqlError>(ImportRow {
                    vehicle_id: row.ulid("vehicle_id")?,
                    user_id: row.ulid("user_id")?,
                    date: parse_date_expr(row.required("date")?)?,
                    start: parse_time_expr(row.required("start_time")?)?,
                    end: parse_time_expr(row.required("end_time")?)?,
                })
            })()
            .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
            out.push(parsed);
        }
        return Ok(Command::ImportReservations { rows: out });
    }

    if rows.len() > MAX_BATCH_SIZE {
        return Err(SqlError::TooManyRows(MAX_BATCH_SIZE));
    }
    let mut target: Option<(VehicleId, UserId, NaiveDate)> = None;
    let mut starts = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let key = (
            row.ulid("vehicle_id")?,
            row.ulid("user_id")?,
            parse_date_expr(row.required("date")?)?,
        );
        match target {
            None => target = Some(key),
            Some(t) if t != key => {
                return Err(SqlError::Parse(format!(
                    "row {i}: all rows of a booking must share vehicle_id, user_id and date"
                )));
            }
            Some(_) => {}
        }
        starts.push(parse_time_expr(row.required("start_time")?)?);
    }

    let (vehicle_id, user_id, date) = target.ok_or(SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::BookSlots {
        vehicle_id,
        user_id,
        date,
        starts,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let (table_name, allowed) =
        filter_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    if let Some(col) = filters.keys().find(|c| !allowed.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table_name, col.clone()));
    }
    let filter = |col: &'static str| filters.get(col).copied();
    let required = |col: &'static str| filter(col).ok_or(SqlError::MissingFilter(col));

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots),
        "availability" => Ok(Command::SelectAvailability {
            vehicle_id: parse_ulid_expr(required("vehicle_id")?)?,
            date: parse_date_expr(required("date")?)?,
            viewer: filter("user_id").map(parse_ulid_expr).transpose()?,
        }),
        "company_availability" => Ok(Command::SelectCompanyAvailability {
            user_id: parse_ulid_expr(required("user_id")?)?,
            date: parse_date_expr(required("date")?)?,
        }),
        "reservations" => {
            let day = match (filter("vehicle_id"), filter("date")) {
                (None, None) => None,
                (Some(v), Some(d)) => Some((parse_ulid_expr(v)?, parse_date_expr(d)?)),
                (None, Some(_)) => return Err(SqlError::MissingFilter("vehicle_id")),
                (Some(_), None) => return Err(SqlError::MissingFilter("date")),
            };
            Ok(Command::SelectReservations { day })
        }
        "vehicles" => Ok(Command::SelectVehicles {
            company: filter("company").map(parse_string_expr).transpose()?,
        }),
        "users" => Ok(Command::SelectUsers),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` terms joined by AND.
fn collect_eq_filters<'a>(
    expr: &'a Expr,
    out: &mut HashMap<String, &'a Expr>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(col, right.as_ref());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?} (expected YYYY-MM-DD): {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string_expr(expr)?;
    let t = s.trim();
    NaiveTime::parse_from_str(t, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?} (expected HH:MM): {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    TooManyRows(usize),
    MultipleStatements(usize),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::TooManyRows(max) => write!(f, "at most {max} rows per INSERT"),
            SqlError::MultipleStatements(n) => {
                write!(f, "one statement per query, got {n}")
            }
        }
    }
}

impl std::error::Error for SqlError {}
