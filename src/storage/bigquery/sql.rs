use chrono::{DateTime, Utc};
use google_cloud_bigquery::http::types::{QueryParameter, QueryParameterType, QueryParameterValue};

use crate::storage::bigquery::schema::BLOCK_COLUMNS;

/// A GoogleSQL statement plus its named parameters. String values supplied by
/// callers are always bound, never spliced into the text.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParameter>,
}

impl Statement {
    fn new(sql: String) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }

    fn bind_string(mut self, name: &str, value: &str) -> Self {
        self.params.push(QueryParameter {
            name: Some(name.to_string()),
            parameter_type: QueryParameterType {
                parameter_type: "STRING".to_string(),
                ..Default::default()
            },
            parameter_value: QueryParameterValue {
                value: Some(value.to_string()),
                ..Default::default()
            },
        });
        self
    }
}

fn select_list() -> String {
    BLOCK_COLUMNS
        .iter()
        .map(|column| match *column {
            // Timestamps come back as unix seconds to avoid float parsing
            "date_time" | "inserted_at" => format!("UNIX_SECONDS({column}) AS {column}"),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_blocks(table: &str, filter: Option<&str>, tail: &str) -> String {
    let mut sql = format!("SELECT {} FROM {table}", select_list());
    if let Some(filter) = filter {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }
    sql.push_str(" ORDER BY block_height DESC");
    if !tail.is_empty() {
        sql.push(' ');
        sql.push_str(tail);
    }
    sql
}

pub fn exists(table: &str, block_id: &str) -> Statement {
    Statement::new(format!("SELECT 1 FROM {table} WHERE block_id = @block_id LIMIT 1"))
        .bind_string("block_id", block_id)
}

pub fn by_id(table: &str, block_id: &str) -> Statement {
    Statement::new(select_blocks(table, Some("block_id = @block_id"), "LIMIT 1"))
        .bind_string("block_id", block_id)
}

pub fn latest(table: &str, limit: u64) -> Statement {
    Statement::new(select_blocks(table, None, &format!("LIMIT {limit}")))
}

pub fn page(table: &str, page: u64, page_size: u64) -> Statement {
    let offset = (page.saturating_sub(1)).saturating_mul(page_size);
    Statement::new(select_blocks(
        table,
        None,
        &format!("LIMIT {page_size} OFFSET {offset}"),
    ))
}

pub fn count(table: &str) -> Statement {
    Statement::new(format!("SELECT COUNT(*) FROM {table}"))
}

pub fn by_height_range(table: &str, from: u64, to: u64) -> Statement {
    Statement::new(select_blocks(
        table,
        Some(&format!("block_height BETWEEN {from} AND {to}")),
        "",
    ))
}

pub fn by_issuer(table: &str, issuer: &str, limit: u64) -> Statement {
    Statement::new(select_blocks(
        table,
        Some("issuer = @issuer"),
        &format!("LIMIT {limit}"),
    ))
    .bind_string("issuer", issuer)
}

pub fn by_date_range(table: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Statement {
    Statement::new(select_blocks(
        table,
        Some(&format!(
            "date_time BETWEEN TIMESTAMP_SECONDS({}) AND TIMESTAMP_SECONDS({})",
            from.timestamp(),
            to.timestamp()
        )),
        "",
    ))
}

pub fn stats(table: &str) -> Statement {
    Statement::new(format!(
        "SELECT COUNT(*), SUM(tx_count), SUM(fees), SUM(ada_output), COUNT(DISTINCT issuer), \
         MAX(block_height), AVG(block_size), AVG(tx_count), AVG(fees) FROM {table}"
    ))
}

pub fn issuer_distribution(table: &str, limit: u64) -> Statement {
    Statement::new(format!(
        "SELECT issuer, COUNT(*) AS block_count, SUM(fees), AVG(tx_count), AVG(block_size) \
         FROM {table} GROUP BY issuer ORDER BY block_count DESC, issuer LIMIT {limit}"
    ))
}

pub fn daily_stats(table: &str, days: u64) -> Statement {
    Statement::new(format!(
        "SELECT FORMAT_DATE('%F', DATE(date_time)) AS day, COUNT(*), SUM(tx_count), SUM(fees), \
         SUM(ada_output) FROM {table} \
         WHERE DATE(date_time) > DATE_SUB(CURRENT_DATE(), INTERVAL {days} DAY) \
         GROUP BY day ORDER BY day DESC"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TABLE: &str = "`proj.cardano.blocks`";

    fn bound(statement: &Statement) -> Vec<(Option<&str>, &str, Option<&str>)> {
        statement
            .params
            .iter()
            .map(|p| {
                (
                    p.name.as_deref(),
                    p.parameter_type.parameter_type.as_str(),
                    p.parameter_value.value.as_deref(),
                )
            })
            .collect()
    }

    #[test]
    fn test_exists_binds_block_id() {
        let statement = exists(TABLE, "b1");
        assert_eq!(
            statement.sql,
            "SELECT 1 FROM `proj.cardano.blocks` WHERE block_id = @block_id LIMIT 1"
        );
        assert_eq!(bound(&statement), vec![(Some("block_id"), "STRING", Some("b1"))]);
    }

    #[test]
    fn test_user_strings_never_reach_the_sql_text() {
        let hostile = "x' OR '1'='1";
        let statement = by_issuer(TABLE, hostile, 7);
        assert!(!statement.sql.contains(hostile));
        assert!(statement.sql.contains("WHERE issuer = @issuer ORDER BY block_height DESC LIMIT 7"));
        assert_eq!(bound(&statement), vec![(Some("issuer"), "STRING", Some(hostile))]);

        let statement = by_id(TABLE, "b'1");
        assert!(!statement.sql.contains("b'1"));
        assert_eq!(bound(&statement), vec![(Some("block_id"), "STRING", Some("b'1"))]);
    }

    #[test]
    fn test_block_selects_order_by_height() {
        let sql = latest(TABLE, 5).sql;
        assert!(sql.starts_with("SELECT block_id, block_height, block_slot"));
        assert!(sql.contains("UNIX_SECONDS(date_time) AS date_time"));
        assert!(sql.ends_with("ORDER BY block_height DESC LIMIT 5"));
        assert!(latest(TABLE, 5).params.is_empty());

        assert!(page(TABLE, 3, 20).sql.ends_with("LIMIT 20 OFFSET 40"));
        assert!(page(TABLE, 0, 20).sql.ends_with("LIMIT 20 OFFSET 0"));
        assert!(
            page(TABLE, u64::MAX, 100)
                .sql
                .ends_with(&format!("LIMIT 100 OFFSET {}", u64::MAX))
        );
        assert!(
            by_height_range(TABLE, 10, 20)
                .sql
                .contains("WHERE block_height BETWEEN 10 AND 20 ORDER BY block_height DESC")
        );
    }

    #[test]
    fn test_date_range_uses_unix_seconds() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let sql = by_date_range(TABLE, from, to).sql;
        assert!(sql.contains(
            "date_time BETWEEN TIMESTAMP_SECONDS(1704067200) AND TIMESTAMP_SECONDS(1704153600)"
        ));
    }
}
