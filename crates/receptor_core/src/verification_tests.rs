//! End-to-end verification of the row cache against the in-memory SQLite
//! driver.
//!
//! These tests cover:
//! - Variable restart bookkeeping (`is_new`)
//! - Row loads return defaults or persisted values, never orphans
//! - Default backfill reaching rows that are not loaded
//! - Bulk set/delete keeping loaded rows consistent with the store
//! - Save/stop/start round trips
//! - Create/delete/exists idempotence for every entity
//! - Persistence across sessions with a file-backed directory

#[cfg(test)]
mod tests {
    use crate::models::{RowKey, SessionConfig, TextSize, Value, VariableType};
    use crate::query::Condition;
    use crate::schema::{Row, Table, Variable};
    use crate::session::Session;

    async fn connected(config: SessionConfig) -> Session {
        let session = Session::new(config).unwrap();
        session.connect().await.unwrap();
        session
    }

    async fn started_table(session: &Session, database: &str, table: &str) -> Table {
        let db = session.database(database).unwrap();
        if !db.is_loaded() {
            db.start().await.unwrap();
        }
        let table = db.table(table).unwrap();
        table.start().await.unwrap();
        table
    }

    async fn memory_table() -> (Session, Table) {
        let session = connected(SessionConfig::sqlite_in_memory()).await;
        let table = started_table(&session, "game", "players").await;
        (session, table)
    }

    async fn started_variable(
        table: &Table,
        id: &str,
        ty: VariableType,
        default: impl Into<Value>,
    ) -> Variable {
        let variable = Variable::new(table, id, ty, default).unwrap();
        variable.start().await.unwrap();
        variable
    }

    async fn loaded_row(table: &Table) -> Row {
        let row = table.create_row().await.unwrap();
        row.start().await.unwrap();
        row
    }

    // =========================================================================
    // Variable lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_variable_restart_is_not_new() {
        let (_session, table) = memory_table().await;
        let level = started_variable(&table, "Level", VariableType::Integer, 1).await;
        assert!(level.is_new());
        assert_eq!(table.variable("level").unwrap(), level);

        level.stop().await.unwrap();
        assert!(table.variable("level").is_none());

        level.start().await.unwrap();
        assert!(!level.is_new());
        assert!(level.is_loaded());
    }

    #[tokio::test]
    async fn test_duplicate_variable_id_rejected() {
        let (_session, table) = memory_table().await;
        started_variable(&table, "name", VariableType::Text(TextSize::Normal), "").await;

        let clash = Variable::new(&table, "NAME", VariableType::Text(TextSize::Normal), "").unwrap();
        let err = clash.start().await.unwrap_err();
        assert!(err.is_state());
        assert!(!clash.is_loaded());
    }

    #[tokio::test]
    async fn test_reserved_and_invalid_variable_ids() {
        let (_session, table) = memory_table().await;
        assert!(Variable::new(&table, "Row", VariableType::Integer, 0).is_err());
        assert!(Variable::new(&table, "has space", VariableType::Integer, 0).is_err());
        assert!(Variable::with_nullable(&table, "hp", VariableType::Integer, Value::Null, false)
            .is_err());
    }

    #[tokio::test]
    async fn test_variable_requires_loaded_table() {
        let session = connected(SessionConfig::sqlite_in_memory()).await;
        let db = session.database("game").unwrap();
        db.start().await.unwrap();
        let table = db.table("players").unwrap();

        let level = Variable::new(&table, "level", VariableType::Integer, 1).unwrap();
        assert!(level.start().await.unwrap_err().is_state());
    }

    #[tokio::test]
    async fn test_stopped_variable_leaves_stale_value() {
        let (_session, table) = memory_table().await;
        let gold = started_variable(&table, "gold", VariableType::BigInt, 0).await;
        let row = loaded_row(&table).await;
        row.set(&gold, 250).await.unwrap();

        gold.stop().await.unwrap();
        assert_eq!(row.get(&gold).unwrap(), Value::Int(250));
        assert!(row.set(&gold, 1).await.unwrap_err().is_state());

        gold.start().await.unwrap();
        assert_eq!(row.get(&gold).unwrap(), Value::Int(250));
    }

    #[tokio::test]
    async fn test_variable_delete_and_exists() {
        let (_session, table) = memory_table().await;
        let mana = started_variable(&table, "mana", VariableType::Real, 1.5).await;
        assert!(mana.exists().await.unwrap());

        assert!(mana.delete().await.unwrap());
        assert!(!mana.is_loaded());
        assert!(!mana.exists().await.unwrap());
        assert!(!mana.delete().await.unwrap());
    }

    #[tokio::test]
    async fn test_default_variables_start_with_table() {
        let session = connected(SessionConfig::sqlite_in_memory()).await;
        let db = session.database("game").unwrap();
        db.start().await.unwrap();
        let table = db.table("players").unwrap();

        let hp = Variable::with_nullable(&table, "HP", VariableType::SmallInt, 100, false).unwrap();
        table.add_default_variable(&hp).unwrap();
        assert!(table.add_default_variable(&hp).is_err());
        assert_eq!(table.default_variables(), vec!["HP".to_string()]);

        table.start().await.unwrap();
        let started = table.variable("hp").unwrap();
        assert!(started.is_loaded());
        assert!(started.is_new());
        assert!(!started.is_nullable());

        let row = loaded_row(&table).await;
        assert_eq!(row.get(&started).unwrap(), Value::Int(100));

        table.stop().await.unwrap();
        assert!(!started.is_loaded());
        table.start().await.unwrap();
        assert!(!table.variable("hp").unwrap().is_new());
    }

    // =========================================================================
    // Row loading
    // =========================================================================

    #[tokio::test]
    async fn test_get_returns_default_or_persisted_never_orphan() {
        let (_session, table) = memory_table().await;
        let name = started_variable(&table, "name", VariableType::Text(TextSize::Tiny), "anon").await;
        let title = started_variable(&table, "title", VariableType::Text(TextSize::Tiny), "none").await;

        let row = loaded_row(&table).await;
        assert!(row.is_new());
        assert_eq!(row.get(&name).unwrap(), Value::from("anon"));

        row.set(&name, "ada").await.unwrap();
        row.set(&title, "countess").await.unwrap();
        row.stop(true).await.unwrap();

        // Without a loaded variable the column is only an orphan.
        title.stop().await.unwrap();
        row.start().await.unwrap();
        assert!(!row.is_new());
        assert_eq!(row.get(&name).unwrap(), Value::from("ada"));
        assert_eq!(row.orphan("TITLE"), Some(Value::from("countess")));
        assert!(row.get(&title).unwrap_err().is_state());

        title.start().await.unwrap();
        assert_eq!(row.get(&title).unwrap(), Value::from("countess"));
        assert_eq!(row.orphan("title"), None);
    }

    #[tokio::test]
    async fn test_scenario_set_stop_start() {
        let (_session, table) = memory_table().await;
        let v = started_variable(&table, "v", VariableType::Text(TextSize::Normal), "a").await;

        let r = loaded_row(&table).await;
        assert_eq!(r.get(&v).unwrap(), Value::from("a"));
        r.set(&v, "b").await.unwrap();
        r.stop(true).await.unwrap();
        assert!(!r.is_loaded());

        r.start().await.unwrap();
        assert_eq!(r.get_as::<String>(&v).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_round_trip_preserves_every_value() {
        let (_session, table) = memory_table().await;
        let alive = started_variable(&table, "alive", VariableType::Boolean, false).await;
        let level = started_variable(&table, "level", VariableType::Integer, 1).await;
        let ratio = started_variable(&table, "ratio", VariableType::Double, 0.0).await;
        let motto = started_variable(&table, "motto", VariableType::Text(TextSize::Long), "").await;
        let blob = started_variable(&table, "blob", VariableType::Bytes, Vec::<u8>::new()).await;
        let note = started_variable(&table, "note", VariableType::Text(TextSize::Normal), Value::Null)
            .await;

        let row = loaded_row(&table).await;
        row.set(&alive, true).await.unwrap();
        row.set(&level, 42).await.unwrap();
        row.set(&ratio, 0.125).await.unwrap();
        row.set(&motto, "carpe diem").await.unwrap();
        row.set(&blob, vec![0u8, 1, 255]).await.unwrap();
        row.set(&note, Value::Null).await.unwrap();
        row.save().await.unwrap();
        row.stop(true).await.unwrap();

        row.start().await.unwrap();
        assert!(row.get_as::<bool>(&alive).unwrap());
        assert_eq!(row.get_as::<i32>(&level).unwrap(), 42);
        assert_eq!(row.get_as::<f64>(&ratio).unwrap(), 0.125);
        assert_eq!(row.get_as::<String>(&motto).unwrap(), "carpe diem");
        assert_eq!(row.get_as::<Vec<u8>>(&blob).unwrap(), vec![0u8, 1, 255]);
        assert!(row.get(&note).unwrap().is_null());
    }

    #[tokio::test]
    async fn test_set_validates_before_caching() {
        let (_session, table) = memory_table().await;
        let small = started_variable(&table, "small", VariableType::SmallInt, 0).await;
        let strict =
            Variable::with_nullable(&table, "strict", VariableType::Integer, 5, false).unwrap();
        strict.start().await.unwrap();

        let row = loaded_row(&table).await;
        assert!(row.set(&small, 70_000).await.is_err());
        assert!(row.set(&strict, Value::Null).await.is_err());
        assert_eq!(row.get(&small).unwrap(), Value::Int(0));
        assert_eq!(row.get(&strict).unwrap(), Value::Int(5));

        // Text that parses is converted on the way in.
        row.set(&small, "12").await.unwrap();
        assert_eq!(row.get(&small).unwrap(), Value::Int(12));
    }

    #[tokio::test]
    async fn test_row_lifecycle_errors() {
        let (_session, table) = memory_table().await;
        let level = started_variable(&table, "level", VariableType::Integer, 1).await;

        let row = table.row(RowKey(9));
        assert!(row.get(&level).unwrap_err().is_state());
        assert!(row.stop(false).await.unwrap_err().is_state());

        row.start().await.unwrap();
        assert!(row.start().await.unwrap_err().is_state());
        assert_eq!(table.row(RowKey(9)), row);
    }

    #[tokio::test]
    async fn test_row_create_delete_exists() {
        let (_session, table) = memory_table().await;
        started_variable(&table, "level", VariableType::Integer, 1).await;

        let row = table.create_row().await.unwrap();
        assert!(!row.exists().await.unwrap());
        assert!(row.create().await.unwrap());
        assert!(!row.create().await.unwrap());
        assert!(row.exists().await.unwrap());

        row.start().await.unwrap();
        assert!(!row.is_new());
        assert!(row.delete().await.unwrap());
        assert!(!row.is_loaded());
        assert!(!row.exists().await.unwrap());
        assert!(!row.delete().await.unwrap());
    }

    #[tokio::test]
    async fn test_create_row_reserves_distinct_keys() {
        let (_session, table) = memory_table().await;
        let first = table.create_row().await.unwrap();
        let second = table.create_row().await.unwrap();
        assert_ne!(first.key(), second.key());
        assert!(!first.is_loaded());
    }

    // =========================================================================
    // Backfill
    // =========================================================================

    #[tokio::test]
    async fn test_backfill_reaches_unloaded_rows() {
        let (_session, table) = memory_table().await;
        let loaded = loaded_row(&table).await;
        let parked = loaded_row(&table).await;
        parked.stop(true).await.unwrap();

        let score = started_variable(&table, "score", VariableType::Integer, 7).await;
        assert_eq!(loaded.get(&score).unwrap(), Value::Int(7));
        assert_eq!(table.fetch_value(&score, parked.key()).await.unwrap(), Some(Value::Int(7)));

        parked.start().await.unwrap();
        assert_eq!(parked.get(&score).unwrap(), Value::Int(7));
    }

    #[tokio::test]
    async fn test_new_variable_default_reaches_store_for_loaded_rows() {
        let (_session, table) = memory_table().await;
        let w = started_variable(&table, "w", VariableType::Integer, 1).await;
        let row = loaded_row(&table).await;

        let v = started_variable(&table, "v", VariableType::Integer, 0).await;
        assert!(v.is_nullable());
        assert_eq!(row.get(&v).unwrap(), Value::Int(0));
        assert_eq!(table.fetch_value(&v, row.key()).await.unwrap(), Some(Value::Int(0)));

        let affected = table.set_where(&w, 9, &[Condition::of(&v, 0).unwrap()]).await.unwrap();
        assert_eq!(affected, 1);
        assert_eq!(row.get(&w).unwrap(), Value::Int(9));
        assert_eq!(table.fetch_value(&w, row.key()).await.unwrap(), Some(Value::Int(9)));

        row.stop(false).await.unwrap();
        row.start().await.unwrap();
        assert_eq!(row.get(&v).unwrap(), Value::Int(0));
        assert_eq!(row.get(&w).unwrap(), Value::Int(9));
    }

    #[tokio::test]
    async fn test_seeded_default_written_for_new_rows() {
        let (_session, table) = memory_table().await;
        let old_rank = started_variable(&table, "rank", VariableType::Integer, 1).await;
        old_rank.stop().await.unwrap();

        let row = loaded_row(&table).await;
        assert!(row.is_new());
        assert_eq!(row.orphan("rank"), Some(Value::Int(1)));

        let rank = started_variable(&table, "rank", VariableType::Integer, 5).await;
        assert_eq!(row.get(&rank).unwrap(), Value::Int(5));
        assert_eq!(table.fetch_value(&rank, row.key()).await.unwrap(), Some(Value::Int(5)));
        assert_eq!(table.count(&[Condition::of(&rank, 5).unwrap()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scenario_hundred_rows_then_variable() {
        let (_session, table) = memory_table().await;
        let mut rows = Vec::with_capacity(100);
        for _ in 0..100 {
            rows.push(loaded_row(&table).await);
        }

        let v = started_variable(&table, "v", VariableType::Integer, 0).await;
        assert!(rows.iter().all(|r| r.get(&v).unwrap() == Value::Int(0)));
        assert_eq!(table.count(&[]).await.unwrap(), 100);
        assert_eq!(table.count(&[Condition::of(&v, 0).unwrap()]).await.unwrap(), 100);
    }

    // =========================================================================
    // Bulk operations
    // =========================================================================

    async fn teams(table: &Table) -> (Variable, Variable, Vec<Row>) {
        let team = started_variable(table, "team", VariableType::Text(TextSize::Tiny), "none").await;
        let score = started_variable(table, "score", VariableType::Integer, 0).await;
        let mut rows = Vec::new();
        for color in ["red", "red", "blue", "blue", "red"] {
            let row = loaded_row(table).await;
            row.set(&team, color).await.unwrap();
            rows.push(row);
        }
        (team, score, rows)
    }

    #[tokio::test]
    async fn test_set_where_updates_store_and_cache() {
        let (_session, table) = memory_table().await;
        let (team, score, rows) = teams(&table).await;
        let parked = rows[4].clone();
        parked.stop(true).await.unwrap();

        let red = Condition::of(&team, "red").unwrap();
        let affected = table.set_where(&score, 10, &[red]).await.unwrap();
        assert_eq!(affected, 3);

        assert_eq!(rows[0].get(&score).unwrap(), Value::Int(10));
        assert_eq!(rows[1].get(&score).unwrap(), Value::Int(10));
        assert_eq!(rows[2].get(&score).unwrap(), Value::Int(0));
        assert_eq!(rows[3].get(&score).unwrap(), Value::Int(0));
        assert_eq!(table.fetch_value(&score, parked.key()).await.unwrap(), Some(Value::Int(10)));
    }

    #[tokio::test]
    async fn test_set_row_by_key() {
        let (_session, table) = memory_table().await;
        let (_team, score, rows) = teams(&table).await;

        assert!(table.set_row(rows[2].key(), &score, 99).await.unwrap());
        assert_eq!(rows[2].get(&score).unwrap(), Value::Int(99));
        assert!(!table.set_row(RowKey(10_000), &score, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_where_evicts_matching_rows() {
        let (_session, table) = memory_table().await;
        let (team, _score, rows) = teams(&table).await;
        rows[4].stop(true).await.unwrap();

        let deleted = table.delete_where(&[Condition::of(&team, "red").unwrap()]).await.unwrap();
        assert_eq!(deleted, 3);

        for row in [&rows[0], &rows[1], &rows[4]] {
            assert!(!row.is_loaded());
            assert!(!row.exists().await.unwrap());
        }
        for row in [&rows[2], &rows[3]] {
            assert!(row.is_loaded());
            assert!(row.exists().await.unwrap());
        }
        assert_eq!(table.count(&[]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_row_by_key() {
        let (_session, table) = memory_table().await;
        let (_team, _score, rows) = teams(&table).await;

        assert!(table.delete_row(rows[0].key()).await.unwrap());
        assert!(!rows[0].is_loaded());
        assert!(!table.delete_row(rows[0].key()).await.unwrap());
        assert_eq!(table.count(&[]).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_retrieve_loads_matching_rows() {
        let (_session, table) = memory_table().await;
        let (team, _score, rows) = teams(&table).await;
        rows[0].stop(true).await.unwrap();
        rows[1].stop(true).await.unwrap();

        let found = table.retrieve(&[Condition::of(&team, "red").unwrap()]).await.unwrap();
        let keys: Vec<RowKey> = found.iter().map(Row::key).collect();
        assert_eq!(keys, vec![rows[0].key(), rows[1].key(), rows[4].key()]);
        assert!(found.iter().all(|r| r.is_loaded()));
        assert!(found.iter().all(|r| r.get(&team).unwrap() == Value::from("red")));
        // Rows that were already loaded come back as the same instance.
        assert_eq!(found[2], rows[4]);

        let everything = table.retrieve(&[]).await.unwrap();
        assert_eq!(everything.len(), 5);
    }

    #[tokio::test]
    async fn test_matches_uses_cache() {
        let (_session, table) = memory_table().await;
        let (team, score, rows) = teams(&table).await;
        let red = Condition::of(&team, "red").unwrap();
        let zero = Condition::of(&score, 0).unwrap();

        assert!(rows[0].matches(&[red.clone(), zero.clone()]));
        assert!(!rows[2].matches(&[red]));
        assert!(rows[2].matches(&[]));
        assert!(!rows[2].matches(&[Condition::of(&team, Value::Null).unwrap()]));
    }

    #[tokio::test]
    async fn test_conditions_from_other_table_rejected() {
        let session = connected(SessionConfig::sqlite_in_memory()).await;
        let players = started_table(&session, "game", "players").await;
        let items = started_table(&session, "game", "items").await;
        let weight = started_variable(&items, "weight", VariableType::Integer, 0).await;

        let err = players.count(&[Condition::of(&weight, 1).unwrap()]).await.unwrap_err();
        assert!(err.is_state());
        assert!(players.set_where(&weight, 1, &[]).await.unwrap_err().is_state());
    }

    #[tokio::test]
    async fn test_fetch_value_missing_row() {
        let (_session, table) = memory_table().await;
        let level = started_variable(&table, "level", VariableType::Integer, 1).await;
        assert_eq!(table.fetch_value(&level, RowKey(404)).await.unwrap(), None);
    }

    // =========================================================================
    // Database and table lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_database_create_delete_exists() {
        let session = connected(SessionConfig::sqlite_in_memory()).await;
        let db = session.database("archive").unwrap();

        assert!(!db.exists().await.unwrap());
        assert!(db.create().await.unwrap());
        assert!(!db.create().await.unwrap());
        assert!(db.exists().await.unwrap());

        assert!(db.delete().await.unwrap());
        assert!(!db.exists().await.unwrap());
        assert!(!db.delete().await.unwrap());
    }

    #[tokio::test]
    async fn test_table_create_delete_exists() {
        let session = connected(SessionConfig::sqlite_in_memory()).await;
        let db = session.database("game").unwrap();
        db.start().await.unwrap();
        let table = db.table("items").unwrap();

        assert!(!table.exists().await.unwrap());
        assert!(table.create().await.unwrap());
        assert!(!table.create().await.unwrap());
        assert!(table.exists().await.unwrap());

        table.start().await.unwrap();
        assert!(table.delete().await.unwrap());
        assert!(!table.is_loaded());
        assert!(!table.exists().await.unwrap());
        assert!(!table.delete().await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_cascades() {
        let (session, table) = memory_table().await;
        let level = started_variable(&table, "level", VariableType::Integer, 1).await;
        let row = loaded_row(&table).await;
        let db = table.database().clone();

        session.disconnect().await.unwrap();
        assert!(!db.is_loaded());
        assert!(!table.is_loaded());
        assert!(!level.is_loaded());
        assert!(!row.is_loaded());
        assert!(table.create_row().await.unwrap_err().is_state());
    }

    #[tokio::test]
    async fn test_database_start_requires_connection() {
        let session = Session::new(SessionConfig::sqlite_in_memory()).unwrap();
        let db = session.database("game").unwrap();
        assert!(db.start().await.unwrap_err().is_state());
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    #[tokio::test]
    async fn test_file_backed_persistence_across_sessions() {
        let dir = tempfile::tempdir().unwrap();

        let key = {
            let session = connected(SessionConfig::sqlite(dir.path())).await;
            let table = started_table(&session, "game", "players").await;
            let name =
                started_variable(&table, "name", VariableType::Text(TextSize::Tiny), "anon").await;
            let row = loaded_row(&table).await;
            row.set(&name, "grace").await.unwrap();
            session.disconnect().await.unwrap();
            row.key()
        };
        assert!(dir.path().join("game.db").exists());

        let session = connected(SessionConfig::sqlite(dir.path())).await;
        let db = session.database("game").unwrap();
        assert!(db.is_loaded());
        assert_eq!(session.databases(), vec![db.clone()]);

        let table = db.table("players").unwrap();
        table.start().await.unwrap();
        let name = started_variable(&table, "name", VariableType::Text(TextSize::Tiny), "anon").await;
        assert!(!name.is_new());

        let row = table.row(key);
        row.start().await.unwrap();
        assert!(!row.is_new());
        assert_eq!(row.get(&name).unwrap(), Value::from("grace"));
    }
}
