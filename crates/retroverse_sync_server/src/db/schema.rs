use rusqlite::Connection;

/// SQL schema for the users database
const SCHEMA: &str = r#"
-- Users table (API tokens map to a user and its roles)
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    api_token TEXT UNIQUE NOT NULL,
    roles TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    last_seen_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_users_token ON users(api_token);
"#;

/// SQL schema of one data store
const DATA_SCHEMA: &str = r#"
-- One row per stored record; content is the JSON row tree
CREATE TABLE IF NOT EXISTS datons (
    daton_key TEXT PRIMARY KEY,
    type_name TEXT NOT NULL,
    main_table TEXT NOT NULL,
    content TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_datons_main_table ON datons(main_table);

-- Primary key generators, one per table
CREATE TABLE IF NOT EXISTS id_sequence (
    table_name TEXT PRIMARY KEY,
    next_id INTEGER NOT NULL
);
"#;

/// Initialize the users database
pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Initialize one data store
pub fn init_data_store(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(DATA_SCHEMA)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_init_database() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        assert!(tables(&conn).contains(&"users".to_string()));
    }

    #[test]
    fn test_init_data_store_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_data_store(&conn).unwrap();
        init_data_store(&conn).unwrap();
        let tables = tables(&conn);
        assert!(tables.contains(&"datons".to_string()));
        assert!(tables.contains(&"id_sequence".to_string()));
    }
}
