use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::CustomerRef;
use crate::model::*;

/// Which bookings a dashboard query wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    Window { start: Ms, end: Ms },
    Month { year: i32, month: u32 },
    CurrentMonth,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProduct {
        id: Ulid,
        name: String,
        price_per_day: Cents,
    },
    InsertAsset {
        id: Ulid,
        product_id: Ulid,
        identifier: String,
        status: AssetStatus,
    },
    SetAssetStatus {
        asset_id: Ulid,
        status: AssetStatus,
    },
    InsertCustomer {
        id: Ulid,
        name: String,
        email: Option<String>,
    },
    InsertBooking {
        product_id: Ulid,
        start: Ms,
        end: Ms,
        quantity: i64,
        customer: Option<CustomerRef>,
        notes: Option<String>,
    },
    SetBookingStatus {
        booking_id: Ulid,
        status: BookingStatus,
    },
    CancelBooking {
        id: Ulid,
    },
    SelectAvailability {
        product_id: Ulid,
        start: Ms,
        end: Ms,
        quantity: i64,
    },
    SelectProducts,
    SelectCustomers,
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column name → value for a single-row INSERT. Without a column list,
/// values are matched to `defaults` by position.
struct Row {
    values: HashMap<String, Expr>,
}

impl Row {
    fn from_insert(insert: &ast::Insert, table: &'static str, defaults: &[&str]) -> Result<Self, SqlError> {
        let rows = extract_insert_rows(insert)?;
        if rows.len() > 1 {
            return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
        }
        let row = &rows[0];
        let names: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if row.len() > names.len() {
            return Err(SqlError::Parse(format!(
                "{table}: {} values for {} columns",
                row.len(),
                names.len()
            )));
        }
        let values = names.into_iter().zip(row.iter().cloned()).collect();
        Ok(Self { values })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.values.get(column).filter(|e| !is_null(e))
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "products" => {
            let row = Row::from_insert(insert, "products", &["id", "name", "price_per_day"])?;
            let price_per_day = parse_i64_expr(row.required("price_per_day")?)?;
            if price_per_day < 0 {
                return Err(SqlError::InvalidValue("price_per_day must not be negative".into()));
            }
            Ok(Command::InsertProduct {
                id: parse_ulid_expr(row.required("id")?)?,
                name: parse_string_expr(row.required("name")?)?,
                price_per_day,
            })
        }
        "assets" => {
            let row = Row::from_insert(insert, "assets", &["id", "product_id", "identifier", "status"])?;
            let status = match row.get("status") {
                Some(expr) => parse_status_expr(expr)?,
                None => AssetStatus::Available,
            };
            Ok(Command::InsertAsset {
                id: parse_ulid_expr(row.required("id")?)?,
                product_id: parse_ulid_expr(row.required("product_id")?)?,
                identifier: parse_string_expr(row.required("identifier")?)?,
                status,
            })
        }
        "asset_status" => {
            let row = Row::from_insert(insert, "asset_status", &["asset_id", "status"])?;
            Ok(Command::SetAssetStatus {
                asset_id: parse_ulid_expr(row.required("asset_id")?)?,
                status: parse_status_expr(row.required("status")?)?,
            })
        }
        "customers" => {
            let row = Row::from_insert(insert, "customers", &["id", "name", "email"])?;
            Ok(Command::InsertCustomer {
                id: parse_ulid_expr(row.required("id")?)?,
                name: parse_string_expr(row.required("name")?)?,
                email: row.get("email").map(parse_string_expr).transpose()?,
            })
        }
        "bookings" => {
            let row = Row::from_insert(
                insert,
                "bookings",
                &["product_id", "start", "end", "quantity", "customer_id", "customer_name", "notes"],
            )?;
            let customer = match (row.get("customer_id"), row.get("customer_name")) {
                (Some(id), _) => Some(CustomerRef::Existing(parse_ulid_expr(id)?)),
                (None, Some(name)) => Some(CustomerRef::Guest {
                    name: parse_string_expr(name)?,
                }),
                (None, None) => None,
            };
            Ok(Command::InsertBooking {
                product_id: parse_ulid_expr(row.required("product_id")?)?,
                start: parse_instant_expr(row.required("start")?)?,
                end: parse_instant_expr(row.required("end")?)?,
                quantity: match row.get("quantity") {
                    Some(expr) => parse_quantity_expr(expr)?,
                    None => 1,
                },
                customer,
                notes: row.get("notes").map(parse_string_expr).transpose()?,
            })
        }
        "booking_status" => {
            let row = Row::from_insert(insert, "booking_status", &["booking_id", "status"])?;
            Ok(Command::SetBookingStatus {
                booking_id: parse_ulid_expr(row.required("booking_id")?)?,
                status: parse_status_expr(row.required("status")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        // Bookings are never removed, only cancelled.
        "bookings" => Ok(Command::CancelBooking { id }),
        _ => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    product_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    quantity: Option<i64>,
    month: Option<(i32, u32)>,
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            product_id: filters.product_id.ok_or(SqlError::MissingFilter("product_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            quantity: filters.quantity.unwrap_or(1),
        }),
        "products" => Ok(Command::SelectProducts),
        "customers" => Ok(Command::SelectCustomers),
        "bookings" => {
            if let Some(id) = filters.id {
                return Ok(Command::SelectBooking { id });
            }
            let filter = match (filters.start, filters.end, filters.month) {
                (Some(start), Some(end), _) => BookingFilter::Window { start, end },
                (Some(_), None, _) => return Err(SqlError::MissingFilter("end")),
                (None, Some(_), _) => return Err(SqlError::MissingFilter("start")),
                (None, None, Some((year, month))) => BookingFilter::Month { year, month },
                (None, None, None) => BookingFilter::CurrentMonth,
            };
            Ok(Command::SelectBookings { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => filters.id = Some(parse_ulid_expr(right)?),
                Some("product_id") => filters.product_id = Some(parse_ulid_expr(right)?),
                Some("quantity") => filters.quantity = Some(parse_quantity_expr(right)?),
                Some("month") => filters.month = Some(parse_month_expr(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_instant_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_instant_expr(right)?);
                }
            }
            _ => {}
        },
        _ => {}
    }
    Ok(())
}

// ── Time ──────────────────────────────────────────────────────

/// RFC 3339 instant, `YYYY-MM-DD` (midnight UTC), or epoch milliseconds.
pub fn parse_instant(s: &str) -> Result<Ms, SqlError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    if let Some(midnight) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc().timestamp_millis());
    }
    Err(SqlError::InvalidInstant(s.to_string()))
}

/// RFC 3339 with millisecond precision, always UTC.
pub fn format_instant(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

/// `[first of month, first of next month)` in UTC.
pub fn month_window(year: i32, month: u32) -> Option<Span> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let start = first.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
    let end = next.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
    Span::try_new(start, end)
}

/// Resolve a dashboard filter to a concrete window.
pub fn booking_window(filter: BookingFilter, now: DateTime<Utc>) -> Option<Span> {
    use chrono::Datelike;
    match filter {
        BookingFilter::Window { start, end } => Span::try_new(start, end),
        BookingFilter::Month { year, month } => month_window(year, month),
        BookingFilter::CurrentMonth => month_window(now.year(), now.month()),
    }
}

fn parse_month(s: &str) -> Result<(i32, u32), SqlError> {
    let bad = || SqlError::InvalidValue(format!("month must be YYYY-MM, got {s:?}"));
    let (year, month) = s.trim().split_once('-').ok_or_else(bad)?;
    let year: i32 = year.parse().map_err(|_| bad())?;
    let month: u32 = month.parse().map_err(|_| bad())?;
    if !(1..=12).contains(&month) {
        return Err(bad());
    }
    Ok((year, month))
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Quantities must be integers; `2.5` or `'two'` is a quantity error, not a parse error.
fn parse_quantity_expr(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr).map_err(|_| SqlError::InvalidQuantity(expr.to_string()))
}

fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        ..
    } = expr
    {
        return parse_i64_expr(expr).map_err(|_| SqlError::InvalidInstant(expr.to_string()));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => parse_instant(s),
        _ => Err(SqlError::InvalidInstant(expr.to_string())),
    }
}

fn parse_month_expr(expr: &Expr) -> Result<(i32, u32), SqlError> {
    parse_month(&parse_string_expr(expr)?)
}

fn parse_status_expr<T: std::str::FromStr<Err = UnknownStatus>>(expr: &Expr) -> Result<T, SqlError> {
    let s = parse_string_expr(expr)?;
    s.parse().map_err(|e: UnknownStatus| SqlError::InvalidValue(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid range: unparseable instant {0}")]
    InvalidInstant(String),
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const JAN1: Ms = 1_767_225_600_000;

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_insert_product() {
        let sql = format!("INSERT INTO products (id, name, price_per_day) VALUES ('{ID}', 'Sony A7SIII', 15000)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertProduct {
                id: id(),
                name: "Sony A7SIII".into(),
                price_per_day: 15_000
            }
        );
    }

    #[test]
    fn negative_price_rejected() {
        let sql = format!("INSERT INTO products (id, name, price_per_day) VALUES ('{ID}', 'X', -1)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_insert_asset_defaults_to_available() {
        let sql = format!("INSERT INTO assets (id, product_id, identifier) VALUES ('{ID}', '{ID}', 'CAM-001')");
        match parse_sql(&sql).unwrap() {
            Command::InsertAsset { identifier, status, .. } => {
                assert_eq!(identifier, "CAM-001");
                assert_eq!(status, AssetStatus::Available);
            }
            cmd => panic!("expected InsertAsset, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_asset_status_change() {
        let sql = format!("INSERT INTO asset_status (asset_id, status) VALUES ('{ID}', 'unavailable')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetAssetStatus {
                asset_id: id(),
                status: AssetStatus::Unavailable
            }
        );
    }

    #[test]
    fn unknown_status_is_invalid_value() {
        let sql = format!("INSERT INTO booking_status (booking_id, status) VALUES ('{ID}', 'lost')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_insert_customer_with_optional_email() {
        let sql = format!("INSERT INTO customers (id, name) VALUES ('{ID}', 'Ada')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertCustomer {
                id: id(),
                name: "Ada".into(),
                email: None
            }
        );
        let sql = format!("INSERT INTO customers (id, name, email) VALUES ('{ID}', 'Ada', 'ada@example.com')");
        match parse_sql(&sql).unwrap() {
            Command::InsertCustomer { email, .. } => assert_eq!(email.as_deref(), Some("ada@example.com")),
            cmd => panic!("expected InsertCustomer, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_with_iso_instants() {
        let sql = format!(
            r#"INSERT INTO bookings (product_id, start, "end", quantity) VALUES ('{ID}', '2026-01-01T00:00:00Z', '2026-01-03T00:00:00Z', 2)"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                product_id: id(),
                start: JAN1,
                end: JAN1 + 2 * 86_400_000,
                quantity: 2,
                customer: None,
                notes: None,
            }
        );
    }

    #[test]
    fn parse_insert_booking_positional_with_guest() {
        let sql = format!(
            "INSERT INTO bookings VALUES ('{ID}', {JAN1}, {}, 1, NULL, 'Walk-in', 'cash')",
            JAN1 + 1
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { customer, notes, start, end, .. } => {
                assert_eq!((start, end), (JAN1, JAN1 + 1));
                assert_eq!(customer, Some(CustomerRef::Guest { name: "Walk-in".into() }));
                assert_eq!(notes.as_deref(), Some("cash"));
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_existing_customer() {
        let sql = format!(
            r#"INSERT INTO bookings (product_id, start, "end", customer_id) VALUES ('{ID}', '2026-01-01', '2026-01-02', '{ID}')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { customer, quantity, .. } => {
                assert_eq!(customer, Some(CustomerRef::Existing(id())));
                assert_eq!(quantity, 1);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn booking_quantity_must_be_integer() {
        let sql = format!(r#"INSERT INTO bookings (product_id, start, "end", quantity) VALUES ('{ID}', 1, 2, 2.5)"#);
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidQuantity(_))));
        // Non-positive integers parse; the engine rejects them.
        let sql = format!(r#"INSERT INTO bookings (product_id, start, "end", quantity) VALUES ('{ID}', 1, 2, -1)"#);
        assert!(matches!(parse_sql(&sql), Ok(Command::InsertBooking { quantity: -1, .. })));
    }

    #[test]
    fn unparseable_instant() {
        let sql = format!(r#"INSERT INTO bookings (product_id, start, "end") VALUES ('{ID}', 'next tuesday', 2)"#);
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidInstant(_))));
    }

    #[test]
    fn missing_required_column() {
        let sql = format!("INSERT INTO bookings (product_id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("start"))));
    }

    #[test]
    fn parse_booking_status_and_cancel() {
        let sql = format!("INSERT INTO booking_status (booking_id, status) VALUES ('{ID}', 'confirmed')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetBookingStatus {
                booking_id: id(),
                status: BookingStatus::Confirmed
            }
        );
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CancelBooking { id: id() });
    }

    #[test]
    fn deleting_catalog_rows_is_unsupported() {
        let sql = format!("DELETE FROM products WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            r#"SELECT * FROM availability WHERE product_id = '{ID}' AND start >= '2026-01-01T00:00:00Z' AND "end" <= {} AND quantity = 3"#,
            JAN1 + 1000
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                product_id: id(),
                start: JAN1,
                end: JAN1 + 1000,
                quantity: 3
            }
        );
    }

    #[test]
    fn availability_requires_window() {
        let sql = format!("SELECT * FROM availability WHERE product_id = '{ID}' AND start >= 1");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_select_listings() {
        assert_eq!(parse_sql("SELECT * FROM products").unwrap(), Command::SelectProducts);
        assert_eq!(parse_sql("SELECT * FROM customers").unwrap(), Command::SelectCustomers);
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings { filter: BookingFilter::CurrentMonth }
        );
    }

    #[test]
    fn parse_select_bookings_filters() {
        let sql = format!("SELECT * FROM bookings WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectBooking { id: id() });

        let sql = "SELECT * FROM bookings WHERE month = '2026-02'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectBookings { filter: BookingFilter::Month { year: 2026, month: 2 } }
        );

        let sql = r#"SELECT * FROM bookings WHERE start >= 10 AND "end" <= 20"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectBookings { filter: BookingFilter::Window { start: 10, end: 20 } }
        );

        let sql = "SELECT * FROM bookings WHERE month = '2026-13'";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn instants_round_trip_through_rfc3339() {
        assert_eq!(parse_instant("2026-01-01T00:00:00Z").unwrap(), JAN1);
        assert_eq!(parse_instant("2026-01-01T01:00:00+01:00").unwrap(), JAN1);
        assert_eq!(parse_instant("2026-01-01").unwrap(), JAN1);
        assert_eq!(parse_instant(&JAN1.to_string()).unwrap(), JAN1);
        assert_eq!(format_instant(JAN1), "2026-01-01T00:00:00.000Z");
    }

    #[test]
    fn month_windows_cover_calendar_months() {
        let jan = month_window(2026, 1).unwrap();
        assert_eq!(jan, Span::new(JAN1, JAN1 + 31 * 86_400_000));
        let dec = month_window(2025, 12).unwrap();
        assert_eq!(dec.end, JAN1);
        assert!(month_window(2026, 0).is_none());

        let now = DateTime::<Utc>::from_timestamp_millis(JAN1 + 5 * 86_400_000).unwrap();
        assert_eq!(booking_window(BookingFilter::CurrentMonth, now), Some(jan));
        assert_eq!(booking_window(BookingFilter::Window { start: 5, end: 5 }, now), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
