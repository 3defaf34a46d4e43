use google_cloud_bigquery::http::table::{
    Clustering, TableFieldMode, TableFieldSchema, TableFieldType, TableSchema, TimePartitionType,
    TimePartitioning,
};

pub const PARTITION_FIELD: &str = "date_time";
pub const CLUSTERING_FIELDS: [&str; 1] = ["block_height"];

/// Column order used by every block SELECT; row mapping relies on it.
pub const BLOCK_COLUMNS: [&str; 10] = [
    "block_id",
    "block_height",
    "block_slot",
    "block_size",
    "issuer",
    "tx_count",
    "ada_output",
    "fees",
    "date_time",
    "inserted_at",
];

fn field(name: &str, data_type: TableFieldType, description: &str) -> TableFieldSchema {
    TableFieldSchema {
        name: name.to_string(),
        data_type,
        mode: Some(TableFieldMode::Required),
        description: Some(description.to_string()),
        ..Default::default()
    }
}

pub fn block_schema() -> TableSchema {
    TableSchema {
        fields: vec![
            field(
                "block_id",
                TableFieldType::String,
                "Block hash, natural key used for deduplication",
            ),
            field("block_height", TableFieldType::Integer, "Height of the block"),
            field("block_slot", TableFieldType::Integer, "Slot in which the block was forged"),
            field("block_size", TableFieldType::Integer, "Size of the block in bytes"),
            field(
                "issuer",
                TableFieldType::String,
                "Normalized issuer: pool id, VRF key, serialized credential or 'unknown'",
            ),
            field(
                "tx_count",
                TableFieldType::Integer,
                "Number of transactions in the block",
            ),
            field(
                "ada_output",
                TableFieldType::Integer,
                "Sum of all transaction outputs in lovelace",
            ),
            field(
                "fees",
                TableFieldType::Integer,
                "Sum of all transaction fees in lovelace",
            ),
            field(
                "date_time",
                TableFieldType::Timestamp,
                "Ingestion time truncated to seconds",
            ),
            field(
                "inserted_at",
                TableFieldType::Timestamp,
                "Time the row was written, truncated to seconds",
            ),
        ],
    }
}

pub fn block_partitioning() -> TimePartitioning {
    TimePartitioning {
        partition_type: TimePartitionType::Month,
        field: Some(PARTITION_FIELD.to_string()),
        ..Default::default()
    }
}

pub fn block_clustering() -> Clustering {
    Clustering {
        fields: CLUSTERING_FIELDS.iter().map(|f| f.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_matches_select_columns() {
        let schema = block_schema();
        let names: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, BLOCK_COLUMNS.to_vec());
        assert!(
            schema
                .fields
                .iter()
                .all(|f| matches!(f.mode, Some(TableFieldMode::Required)))
        );
    }

    #[test]
    fn test_partitioned_by_month_on_date_time() {
        let partitioning = block_partitioning();
        assert!(matches!(
            partitioning.partition_type,
            TimePartitionType::Month
        ));
        assert_eq!(partitioning.field.as_deref(), Some("date_time"));
        assert_eq!(block_clustering().fields, vec!["block_height".to_string()]);
    }
}
