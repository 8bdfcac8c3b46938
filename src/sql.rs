use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which rows a SELECT asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    All,
    ById(Ulid),
    /// Children of one parent: adverts of a cabin, bookings of an advert.
    ByParent(Ulid),
}

/// Parent a dry-run window check is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowTarget {
    Cabin(Ulid),
    Advert(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCabin {
        id: Ulid,
        details: CabinDetails,
    },
    UpdateCabin {
        id: Ulid,
        patch: CabinPatch,
    },
    DeleteCabin {
        id: Ulid,
    },
    SelectCabins {
        id: Option<Ulid>,
    },
    InsertAdvert {
        id: Ulid,
        cabin_id: Ulid,
        price_per_day: u32,
        span: Span,
    },
    UpdateAdvert {
        id: Ulid,
        patch: AdvertPatch,
    },
    DeleteAdvert {
        id: Ulid,
    },
    SelectAdverts {
        lookup: Lookup,
    },
    InsertBooking {
        id: Ulid,
        advert_id: Ulid,
        span: Span,
    },
    UpdateBooking {
        id: Ulid,
        patch: SpanPatch,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        lookup: Lookup,
    },
    WindowCheck {
        target: WindowTarget,
        span: Span,
        exclude: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns = &insert.columns;

    match table.as_str() {
        "cabins" => {
            let values = insert_row("cabins", &CABIN_COLUMNS, columns, values)?;
            Ok(Command::InsertCabin {
                id: parse_ulid(&values[0])?,
                details: CabinDetails {
                    address: parse_string(&values[1])?,
                    squarage_property: parse_u32(&values[2])?,
                    squarage_cabin: parse_u32(&values[3])?,
                    sauna: parse_bool(&values[4])?,
                    beachfront: parse_bool(&values[5])?,
                },
            })
        }
        "adverts" => {
            let values = insert_row("adverts", &ADVERT_COLUMNS, columns, values)?;
            Ok(Command::InsertAdvert {
                id: parse_ulid(&values[0])?,
                cabin_id: parse_ulid(&values[1])?,
                price_per_day: parse_u32(&values[2])?,
                span: Span::new(parse_i64(&values[3])?, parse_i64(&values[4])?),
            })
        }
        "bookings" => {
            let values = insert_row("bookings", &BOOKING_COLUMNS, columns, values)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                advert_id: parse_ulid(&values[1])?,
                span: Span::new(parse_i64(&values[2])?, parse_i64(&values[3])?),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut columns = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let AssignmentTarget::ColumnName(name) = &assignment.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let column =
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?;
        columns.push((column, &assignment.value));
    }

    match table.as_str() {
        "cabins" => {
            let mut patch = CabinPatch::default();
            for (column, value) in columns {
                match column.as_str() {
                    "address" => patch.address = Some(parse_string(value)?),
                    "squarage_property" => patch.squarage_property = Some(parse_u32(value)?),
                    "squarage_cabin" => patch.squarage_cabin = Some(parse_u32(value)?),
                    "sauna" => patch.sauna = Some(parse_bool(value)?),
                    "beachfront" => patch.beachfront = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("cabins", column)),
                }
            }
            Ok(Command::UpdateCabin { id, patch })
        }
        "adverts" => {
            let mut patch = AdvertPatch::default();
            for (column, value) in columns {
                match column.as_str() {
                    "price_per_day" => patch.price_per_day = Some(parse_u32(value)?),
                    "start" => patch.span.start = Some(parse_i64(value)?),
                    "end" => patch.span.end = Some(parse_i64(value)?),
                    _ => return Err(SqlError::UnknownColumn("adverts", column)),
                }
            }
            Ok(Command::UpdateAdvert { id, patch })
        }
        "bookings" => {
            let mut patch = SpanPatch::default();
            for (column, value) in columns {
                match column.as_str() {
                    "start" => patch.start = Some(parse_i64(value)?),
                    "end" => patch.end = Some(parse_i64(value)?),
                    _ => return Err(SqlError::UnknownColumn("bookings", column)),
                }
            }
            Ok(Command::UpdateBooking { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "cabins" => Ok(Command::DeleteCabin { id }),
        "adverts" => Ok(Command::DeleteAdvert { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "cabins" => {
            let id = match lookup(&filters, "cabins", None)? {
                Lookup::ById(id) => Some(id),
                _ => None,
            };
            Ok(Command::SelectCabins { id })
        }
        "adverts" => Ok(Command::SelectAdverts {
            lookup: lookup(&filters, "adverts", Some("cabin_id"))?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            lookup: lookup(&filters, "bookings", Some("advert_id"))?,
        }),
        "window_check" => parse_window_check(&filters),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Resolve `WHERE id = ...` or `WHERE <parent_column> = ...` into a lookup.
fn lookup(
    filters: &[(String, &Expr)],
    table: &'static str,
    parent_column: Option<&'static str>,
) -> Result<Lookup, SqlError> {
    match filters {
        [] => Ok(Lookup::All),
        [(column, value)] if column == "id" => Ok(Lookup::ById(parse_ulid(value)?)),
        [(column, value)] if Some(column.as_str()) == parent_column => {
            Ok(Lookup::ByParent(parse_ulid(value)?))
        }
        [(column, _)] => Err(SqlError::UnknownColumn(table, column.clone())),
        _ => Err(SqlError::Unsupported(format!("{table}: more than one filter"))),
    }
}

fn parse_window_check(filters: &[(String, &Expr)]) -> Result<Command, SqlError> {
    let (mut target, mut start, mut end, mut exclude) = (None, None, None, None);
    for (column, value) in filters {
        match column.as_str() {
            "cabin_id" => target = Some(WindowTarget::Cabin(parse_ulid(value)?)),
            "advert_id" => target = Some(WindowTarget::Advert(parse_ulid(value)?)),
            "start" => start = Some(parse_i64(value)?),
            "end" => end = Some(parse_i64(value)?),
            "exclude_id" => exclude = parse_ulid_or_null(value)?,
            _ => return Err(SqlError::UnknownColumn("window_check", column.clone())),
        }
    }
    Ok(Command::WindowCheck {
        target: target.ok_or(SqlError::MissingFilter("cabin_id or advert_id"))?,
        span: Span::new(
            start.ok_or(SqlError::MissingFilter("start"))?,
            end.ok_or(SqlError::MissingFilter("end"))?,
        ),
        exclude,
    })
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((column, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

const CABIN_COLUMNS: [&str; 6] = [
    "id",
    "address",
    "squarage_property",
    "squarage_cabin",
    "sauna",
    "beachfront",
];
const ADVERT_COLUMNS: [&str; 5] = ["id", "cabin_id", "price_per_day", "start", "end"];
const BOOKING_COLUMNS: [&str; 4] = ["id", "advert_id", "start", "end"];

fn expect_arity(table: &'static str, expected: usize, values: &[Expr]) -> Result<(), SqlError> {
    if values.len() != expected {
        return Err(SqlError::WrongArity(table, expected, values.len()));
    }
    Ok(())
}

/// VALUES reordered to `expected`. A column list may name the columns in any
/// order; without one, values are positional.
fn insert_row(
    table: &'static str,
    expected: &[&str],
    columns: &[ast::Ident],
    values: Vec<Expr>,
) -> Result<Vec<Expr>, SqlError> {
    expect_arity(table, expected.len(), &values)?;
    if columns.is_empty() {
        return Ok(values);
    }
    if columns.len() != values.len() {
        return Err(SqlError::Parse(format!(
            "{table}: {} columns but {} values",
            columns.len(),
            values.len()
        )));
    }
    let names: Vec<String> = columns.iter().map(|c| c.value.to_lowercase()).collect();
    if let Some(unknown) = names.iter().find(|n| !expected.contains(&n.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }
    expected
        .iter()
        .map(|want| {
            names
                .iter()
                .position(|n| n == want)
                .map(|i| values[i].clone())
                .ok_or_else(|| SqlError::Parse(format!("{table}: missing column {want}")))
        })
        .collect()
}

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr).map(|v| -v);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
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
    MissingFilter(&'static str),
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
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_insert_cabin() {
        let sql = format!(
            "INSERT INTO cabins (id, address, squarage_property, squarage_cabin, sauna, beachfront) \
             VALUES ('{ID}', 'Fjordgata 3', 900, 60, true, 'f')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertCabin { id: got, details } => {
                assert_eq!(got, id());
                assert_eq!(details.address, "Fjordgata 3");
                assert_eq!(details.squarage_property, 900);
                assert_eq!(details.squarage_cabin, 60);
                assert!(details.sauna);
                assert!(!details.beachfront);
            }
            cmd => panic!("expected InsertCabin, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_cabin_wrong_arity() {
        let sql = format!("INSERT INTO cabins (id, address) VALUES ('{ID}', 'x')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::WrongArity("cabins", 6, 2))
        ));
    }

    #[test]
    fn insert_columns_bind_by_name() {
        let sql = format!(
            r#"INSERT INTO bookings (id, advert_id, "end", start) VALUES ('{ID}', '{ID}', 2000, 1000)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { span, .. } => assert_eq!(span, Span::new(1000, 2000)),
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_without_column_list_is_positional() {
        let sql = format!("INSERT INTO bookings VALUES ('{ID}', '{ID}', 1000, 2000)");
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { span, .. } => assert_eq!(span, Span::new(1000, 2000)),
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_column_list_must_match_table() {
        let unknown = format!(
            r#"INSERT INTO bookings (id, advert_id, start, stop) VALUES ('{ID}', '{ID}', 1, 2)"#
        );
        assert!(matches!(
            parse_sql(&unknown),
            Err(SqlError::UnknownColumn("bookings", col)) if col == "stop"
        ));

        let repeated = format!(
            r#"INSERT INTO bookings (id, advert_id, start, start) VALUES ('{ID}', '{ID}', 1, 2)"#
        );
        assert!(matches!(parse_sql(&repeated), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_advert() {
        let sql = format!(
            r#"INSERT INTO adverts (id, cabin_id, price_per_day, start, "end") VALUES ('{ID}', '{ID}', 1200, 1000, 2000)"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertAdvert {
                id: id(),
                cabin_id: id(),
                price_per_day: 1200,
                span: Span::new(1000, 2000),
            }
        );
    }

    #[test]
    fn parse_insert_booking_keeps_reversed_span() {
        let sql = format!(
            r#"INSERT INTO bookings (id, advert_id, start, "end") VALUES ('{ID}', '{ID}', 2000, 1000)"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                id: id(),
                advert_id: id(),
                span: Span::new(2000, 1000),
            }
        );
    }

    #[test]
    fn parse_multi_row_insert_rejected() {
        let sql = format!(
            r#"INSERT INTO bookings (id, advert_id, start, "end") VALUES ('{ID}', '{ID}', 1, 2), ('{ID}', '{ID}', 3, 4)"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_update_booking_end_only() {
        let sql = format!(r#"UPDATE bookings SET "end" = 25 WHERE id = '{ID}'"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateBooking {
                id: id(),
                patch: SpanPatch { start: None, end: Some(25) },
            }
        );
    }

    #[test]
    fn parse_update_advert_price_and_start() {
        let sql = format!("UPDATE adverts SET price_per_day = 800, start = 5 WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateAdvert {
                id: id(),
                patch: AdvertPatch {
                    price_per_day: Some(800),
                    span: SpanPatch { start: Some(5), end: None },
                },
            }
        );
    }

    #[test]
    fn parse_update_cabin() {
        let sql = format!("UPDATE cabins SET sauna = false, address = 'Nytt 1' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateCabin {
                id: id(),
                patch: CabinPatch {
                    address: Some("Nytt 1".into()),
                    sauna: Some(false),
                    ..CabinPatch::default()
                },
            }
        );
    }

    #[test]
    fn parse_update_unknown_column() {
        let sql = format!("UPDATE bookings SET price_per_day = 1 WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::UnknownColumn("bookings", _))
        ));
    }

    #[test]
    fn parse_update_requires_id() {
        let sql = "UPDATE bookings SET start = 1";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_deletes() {
        for (table, expect) in [
            ("cabins", Command::DeleteCabin { id: id() }),
            ("adverts", Command::DeleteAdvert { id: id() }),
            ("bookings", Command::DeleteBooking { id: id() }),
        ] {
            let sql = format!("DELETE FROM {table} WHERE id = '{ID}'");
            assert_eq!(parse_sql(&sql).unwrap(), expect);
        }
    }

    #[test]
    fn parse_selects() {
        assert_eq!(
            parse_sql("SELECT * FROM cabins").unwrap(),
            Command::SelectCabins { id: None }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM adverts WHERE cabin_id = '{ID}'")).unwrap(),
            Command::SelectAdverts { lookup: Lookup::ByParent(id()) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM bookings WHERE id = '{ID}'")).unwrap(),
            Command::SelectBookings { lookup: Lookup::ById(id()) }
        );
        assert!(matches!(
            parse_sql(&format!("SELECT * FROM bookings WHERE cabin_id = '{ID}'")),
            Err(SqlError::UnknownColumn("bookings", _))
        ));
    }

    #[test]
    fn parse_window_check_for_booking() {
        let sql = format!(
            r#"SELECT * FROM window_check WHERE advert_id = '{ID}' AND start = 10 AND "end" = 20 AND exclude_id = '{ID}'"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::WindowCheck {
                target: WindowTarget::Advert(id()),
                span: Span::new(10, 20),
                exclude: Some(id()),
            }
        );
    }

    #[test]
    fn parse_window_check_for_advert_without_exclude() {
        let sql = format!(
            r#"SELECT * FROM window_check WHERE cabin_id = '{ID}' AND start = 1 AND "end" = 10"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::WindowCheck {
                target: WindowTarget::Cabin(id()),
                span: Span::new(1, 10),
                exclude: None,
            }
        );
    }

    #[test]
    fn parse_window_check_missing_bound() {
        let sql = format!("SELECT * FROM window_check WHERE cabin_id = '{ID}' AND start = 1");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_negative_timestamp() {
        let sql = format!(
            r#"INSERT INTO bookings (id, advert_id, start, "end") VALUES ('{ID}', '{ID}', -5, 10)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { span, .. } => assert_eq!(span, Span::new(-5, 10)),
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO resources (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
