//! Schema bootstrap statements for the telemetry table.

/// Statements that create the keyspace and the telemetry table, in order.
pub fn schema_statements(keyspace: &str, table: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE KEYSPACE IF NOT EXISTS {} \
             WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
            keyspace
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\
             sensor_id text, \
             event_time timestamp, \
             metric_name text, \
             value double, \
             unit text, \
             PRIMARY KEY ((sensor_id), event_time, metric_name)\
             ) WITH CLUSTERING ORDER BY (event_time DESC, metric_name ASC)",
            keyspace, table
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements() {
        let stmts = schema_statements("sensor_traffic", "telemetry_data");
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE KEYSPACE IF NOT EXISTS sensor_traffic"));
        assert!(stmts[0].contains("'replication_factor': 1"));
        assert!(stmts[1].contains("sensor_traffic.telemetry_data"));
        assert!(stmts[1].contains("PRIMARY KEY ((sensor_id), event_time, metric_name)"));
        assert!(stmts[1].contains("CLUSTERING ORDER BY (event_time DESC"));
    }
}
