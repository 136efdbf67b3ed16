use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use crate::catalog::{Column, ConstraintDef, DataType, ForeignKeyDef, LinkKind, ReferentialAction};
use crate::config::DatabaseConfig;
use crate::database::{Connection, Database};
use crate::error::{IntegrityViolation, StrataError, StrataResult};
use crate::expression::{BuiltinCompiler, ExpressionCompiler};
use crate::filter::FilterType;
use crate::row::{Row, RowId, Value};
use crate::storage::{ClusteredRowSet, Operation, RowEventHook, RowPersistence};
use crate::transaction::IsolationLevel;

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn create_people(db: &Database) {
    db.create_table(
        "people",
        vec![
            Column::new("id", DataType::Integer),
            Column::new("name", DataType::Text),
            Column::new("age", DataType::Integer),
        ],
    )
    .unwrap();
}

fn insert(set: &mut ClusteredRowSet, values: &[(&str, Value)]) -> StrataResult<()> {
    set.prepare_insert();
    for (column, value) in values {
        set.set(column, value.clone())?;
    }
    set.create_row(true, false)
}

fn update(set: &mut ClusteredRowSet, row_id: u32, values: &[(&str, Value)]) -> StrataResult<()> {
    assert!(set.seek(RowId(row_id)).unwrap(), "row {} not visible", row_id);
    set.prepare_update();
    for (column, value) in values {
        set.set(column, value.clone())?;
    }
    set.update_row(true)
}

fn delete(set: &mut ClusteredRowSet, row_id: u32) -> StrataResult<()> {
    assert!(set.seek(RowId(row_id)).unwrap(), "row {} not visible", row_id);
    set.delete_row(true)
}

/// Values of `column` in cursor order
fn column_values(set: &mut ClusteredRowSet, column: &str) -> Vec<Value> {
    let mut out = Vec::new();
    let mut more = set.first().unwrap();
    while more {
        out.push(set.get(column).unwrap().clone());
        more = set.next().unwrap();
    }
    out
}

fn names(set: &mut ClusteredRowSet) -> Vec<String> {
    column_values(set, "name")
        .into_iter()
        .map(|v| match v {
            Value::Text(name) => name,
            other => format!("{:?}", other),
        })
        .collect()
}

#[test]
fn test_transaction_isolation_between_connections() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);

    let a = db.connect();
    let b = db.connect();
    let mut set_a = a.open("people").unwrap();
    let mut set_b = b.open("people").unwrap();

    insert(&mut set_a, &[("name", text("ann"))]).unwrap();

    let txn = b.begin_transaction().unwrap();
    insert(&mut set_b, &[("name", text("bob"))]).unwrap();
    update(&mut set_b, 1, &[("name", text("anne"))]).unwrap();

    assert_eq!(names(&mut set_a), vec!["ann"]);
    assert_eq!(names(&mut set_b), vec!["anne", "bob"]);
    assert_eq!(set_a.row_count(), 1);
    assert_eq!(set_b.row_count(), 2);

    let conflict = update(&mut set_a, 1, &[("name", text("annie"))]);
    match conflict {
        Err(StrataError::TransactionConflict { row_id, writer, .. }) => {
            assert_eq!(row_id, RowId(1));
            assert_eq!(writer, txn);
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
    assert!(set_a.eof());

    b.commit().unwrap();
    assert_eq!(names(&mut set_a), vec!["anne", "bob"]);
    assert_eq!(set_a.row_count(), 2);

    // The superseded version is vacuumed once nothing is running
    let table = db.shared().table("people").unwrap();
    assert_eq!(table.committed_row_count(), 2);
    assert_eq!(table.directory_len(), 2);
}

#[test]
fn test_rollback_restores_rows_and_count() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let conn = db.connect();
    let mut set = conn.open("people").unwrap();

    insert(&mut set, &[("name", text("ann"))]).unwrap();
    insert(&mut set, &[("name", text("bob"))]).unwrap();

    conn.begin_transaction().unwrap();
    insert(&mut set, &[("name", text("cid"))]).unwrap();
    delete(&mut set, 1).unwrap();
    update(&mut set, 2, &[("name", text("robert"))]).unwrap();

    assert_eq!(names(&mut set), vec!["robert", "cid"]);
    assert_eq!(set.row_count(), 2);

    conn.rollback().unwrap();
    assert_eq!(names(&mut set), vec!["ann", "bob"]);
    assert_eq!(set.row_count(), 2);

    let table = db.shared().table("people").unwrap();
    assert_eq!(table.committed_row_count(), 2);
    assert_eq!(table.directory_len(), 2);
    assert!(!table.involves(conn.transaction_id()));
}

#[test]
fn test_delete_inside_transaction_is_hidden_only_from_writer() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let a = db.connect();
    let b = db.connect();
    let mut set_a = a.open("people").unwrap();
    let mut set_b = b.open("people").unwrap();

    insert(&mut set_a, &[("name", text("ann"))]).unwrap();
    insert(&mut set_a, &[("name", text("bob"))]).unwrap();

    b.begin_transaction().unwrap();
    delete(&mut set_b, 1).unwrap();
    assert_eq!(names(&mut set_b), vec!["bob"]);
    assert_eq!(set_b.row_count(), 1);
    assert_eq!(names(&mut set_a), vec!["ann", "bob"]);
    assert_eq!(set_a.row_count(), 2);

    b.commit().unwrap();
    assert_eq!(names(&mut set_a), vec!["bob"]);
    assert_eq!(set_a.row_count(), 1);
}

#[test]
fn test_snapshot_hides_later_commits() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let reader = db.connect();
    let writer = db.connect();
    let mut set_r = reader.open("people").unwrap();
    let mut set_w = writer.open("people").unwrap();

    insert(&mut set_w, &[("name", text("early"))]).unwrap();

    reader.set_isolation(IsolationLevel::Snapshot);
    reader.begin_transaction().unwrap();
    insert(&mut set_w, &[("name", text("late"))]).unwrap();
    assert_eq!(names(&mut set_r), vec!["early"]);
    reader.commit().unwrap();

    // Outside a transaction every committed row is visible again
    assert_eq!(names(&mut set_r), vec!["early", "late"]);

    reader.set_isolation(IsolationLevel::ReadCommitted);
    reader.begin_transaction().unwrap();
    insert(&mut set_w, &[("name", text("later"))]).unwrap();
    assert_eq!(names(&mut set_r), vec!["early", "late", "later"]);
    reader.rollback().unwrap();
}

#[test]
fn test_optimized_filter_tracks_changes() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let conn = db.connect();
    let mut set = conn.open("people").unwrap();

    let ages = [
        ("a", Value::Integer(25)),
        ("b", Value::Integer(35)),
        ("c", Value::Integer(45)),
        ("d", Value::Null),
    ];
    for (name, age) in ages {
        insert(&mut set, &[("name", text(name)), ("age", age)]).unwrap();
    }

    let predicate = BuiltinCompiler.compile("age > 30", set.shape()).unwrap();
    let id = set.attach_optimized_filter(predicate, 0).unwrap();
    assert_eq!(names(&mut set), vec!["b", "c"]);

    insert(&mut set, &[("name", text("e")), ("age", Value::Integer(50))]).unwrap();
    update(&mut set, 2, &[("age", Value::Integer(20))]).unwrap();
    assert_eq!(names(&mut set), vec!["c", "e"]);

    // Filtered rows cannot be sought either
    assert!(!set.seek(RowId(1)).unwrap());
    assert!(set.eof());

    let adults = BuiltinCompiler.compile("age >= 45", set.shape()).unwrap();
    let ordinary = set.attach_ordinary_filter(adults, 0).unwrap();
    assert_eq!(names(&mut set), vec!["c", "e"]);
    assert!(set.last().unwrap());
    assert_eq!(set.get("name").unwrap(), &text("e"));

    assert!(set.detach_filter(ordinary));
    assert!(set.detach_filter(id));
    assert!(!set.detach_filter(id));
    assert_eq!(names(&mut set), vec!["a", "b", "c", "d", "e"]);
}

/// Row set over `people` with a bitmap on `age > 30`
fn open_with_bitmap(conn: &Connection) -> ClusteredRowSet {
    let mut set = conn.open("people").unwrap();
    let predicate = BuiltinCompiler.compile("age > 30", set.shape()).unwrap();
    set.attach_optimized_filter(predicate, 0).unwrap();
    set
}

/// Rejects every update once the row is written
struct RejectUpdates;

impl RowEventHook for RejectUpdates {
    fn after(&mut self, operation: Operation, _row: &Row) -> Result<(), String> {
        if operation == Operation::Update {
            return Err("updates are closed".to_string());
        }
        Ok(())
    }
}

#[test]
fn test_bitmap_survives_rejected_writes() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let conn = db.connect();
    let mut setup = conn.open("people").unwrap();
    insert(&mut setup, &[("name", text("ann")), ("age", Value::Integer(40))]).unwrap();
    setup
        .create_constraint(ConstraintDef {
            name: "grown".into(),
            expression: "age > 10".into(),
            on_insert: false,
            on_update: true,
            on_delete: false,
        })
        .unwrap();
    // Delete-only: stored rows need not satisfy it
    setup
        .create_constraint(ConstraintDef {
            name: "keep".into(),
            expression: "age < 0".into(),
            on_insert: false,
            on_update: false,
            on_delete: true,
        })
        .unwrap();
    drop(setup);

    let mut set = open_with_bitmap(&conn);
    assert_eq!(names(&mut set), vec!["ann"]);

    assert!(matches!(
        update(&mut set, 1, &[("age", Value::Integer(5))]),
        Err(StrataError::ConstraintViolation {
            operation: Operation::Update,
            ..
        })
    ));
    assert_eq!(names(&mut set), vec!["ann"]);
    assert!(set.seek(RowId(1)).unwrap());
    assert_eq!(set.get("age").unwrap(), &Value::Integer(40));

    assert!(matches!(
        delete(&mut set, 1),
        Err(StrataError::ConstraintViolation {
            operation: Operation::Delete,
            ..
        })
    ));
    assert_eq!(set.row_count(), 1);
    assert_eq!(names(&mut set), vec!["ann"]);

    set.add_hook(Box::new(RejectUpdates));
    assert!(matches!(
        update(&mut set, 1, &[("age", Value::Integer(20))]),
        Err(StrataError::Vetoed { .. })
    ));
    assert_eq!(names(&mut set), vec!["ann"]);
}

#[test]
fn test_bitmap_follows_transaction_outcome() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let conn = db.connect();
    let mut set = open_with_bitmap(&conn);
    insert(&mut set, &[("name", text("ann")), ("age", Value::Integer(40))]).unwrap();
    insert(&mut set, &[("name", text("bob")), ("age", Value::Integer(50))]).unwrap();
    assert_eq!(names(&mut set), vec!["ann", "bob"]);

    conn.begin_transaction().unwrap();
    delete(&mut set, 1).unwrap();
    update(&mut set, 2, &[("age", Value::Integer(20))]).unwrap();
    assert_eq!(names(&mut set), Vec::<String>::new());
    conn.rollback().unwrap();

    assert_eq!(set.row_count(), 2);
    assert_eq!(names(&mut set), vec!["ann", "bob"]);
    assert!(set.seek(RowId(1)).unwrap());

    conn.begin_transaction().unwrap();
    update(&mut set, 2, &[("age", Value::Integer(20))]).unwrap();
    insert(&mut set, &[("name", text("cid")), ("age", Value::Integer(60))]).unwrap();
    conn.commit().unwrap();
    assert_eq!(names(&mut set), vec!["ann", "cid"]);

    conn.begin_transaction().unwrap();
    insert(&mut set, &[("name", text("dan")), ("age", Value::Integer(70))]).unwrap();
    assert_eq!(names(&mut set), vec!["ann", "cid", "dan"]);
    conn.rollback().unwrap();
    assert_eq!(names(&mut set), vec!["ann", "cid"]);
}

#[test]
fn test_snapshot_keeps_rows_changed_outside_transactions() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let reader = db.connect();
    let writer = db.connect();
    let mut set_r = reader.open("people").unwrap();
    let mut set_w = writer.open("people").unwrap();

    insert(&mut set_w, &[("name", text("ann"))]).unwrap();
    insert(&mut set_w, &[("name", text("bob"))]).unwrap();

    reader.set_isolation(IsolationLevel::Snapshot);
    reader.begin_transaction().unwrap();
    assert_eq!(names(&mut set_r), vec!["ann", "bob"]);

    update(&mut set_w, 1, &[("name", text("anne"))]).unwrap();
    delete(&mut set_w, 2).unwrap();
    assert_eq!(names(&mut set_w), vec!["anne"]);
    assert_eq!(names(&mut set_r), vec!["ann", "bob"]);

    // Superseded versions stay until the snapshot ends
    let table = db.shared().table("people").unwrap();
    assert_eq!(table.directory_len(), 2);

    reader.commit().unwrap();
    assert_eq!(names(&mut set_r), vec!["anne"]);
    assert_eq!(table.directory_len(), 1);
    assert_eq!(table.committed_row_count(), 1);
}

#[test]
fn test_failed_schema_change_leaves_catalog_alone() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let conn = db.connect();
    let mut set = conn.open("people").unwrap();
    insert(&mut set, &[("name", text("ann"))]).unwrap();

    // Break the stored row so the scan over existing values fails
    let version = set.persistence().versions(RowId(1)).unwrap()[0];
    db.shared()
        .store
        .write_cluster(version.position, b"garbage")
        .unwrap();

    assert!(matches!(
        set.create_identity("id", 1, 1),
        Err(StrataError::Corruption { .. })
    ));
    let schema = db.table_schema("people").unwrap();
    assert!(schema.identities.is_empty());
    assert_eq!(set.filters().count(FilterType::Identity), 0);
}

#[test]
fn test_scope_limits_cursor() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let conn = db.connect();
    let mut set = conn.open("people").unwrap();
    for name in ["a", "b", "c", "d"] {
        insert(&mut set, &[("name", text(name))]).unwrap();
    }

    set.set_scope(RowId(2), RowId(3));
    assert_eq!(names(&mut set), vec!["b", "c"]);
    assert!(set.last().unwrap());
    assert!(set.prev().unwrap());
    assert_eq!(set.get("name").unwrap(), &text("b"));
    assert!(!set.prev().unwrap());
    assert!(set.bof());
    assert!(!set.seek(RowId(4)).unwrap());

    set.clear_scope();
    assert_eq!(names(&mut set).len(), 4);
}

#[test]
fn test_generators_and_constraints() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    db.create_table(
        "accounts",
        vec![
            Column::new("id", DataType::Integer),
            Column::new("name", DataType::Text),
            Column::new("age", DataType::Integer),
            Column::new("created", DataType::Integer).read_only(),
        ],
    )
    .unwrap();
    let conn = db.connect();
    let mut set = conn.open("accounts").unwrap();

    set.create_identity("id", 100, 10).unwrap();
    set.create_default_value("name", "'anon'", false).unwrap();
    set.create_constraint(ConstraintDef {
        name: "adult".into(),
        expression: "age >= 18".into(),
        on_insert: true,
        on_update: true,
        on_delete: false,
    })
    .unwrap();
    assert_eq!(set.default_row().value(1), &text("anon"));

    insert(&mut set, &[("age", Value::Integer(20)), ("created", Value::Integer(1))]).unwrap();
    assert_eq!(set.current().value(0), &Value::Integer(100));
    assert_eq!(set.current().value(1), &text("anon"));

    // NULL does not violate a constraint
    insert(&mut set, &[("name", text("kid?"))]).unwrap();
    assert_eq!(set.current().value(0), &Value::Integer(110));

    match insert(&mut set, &[("age", Value::Integer(10))]) {
        Err(StrataError::ConstraintViolation {
            constraint,
            operation,
            ..
        }) => {
            assert_eq!(constraint, "adult");
            assert_eq!(operation, Operation::Insert);
        }
        other => panic!("expected a constraint violation, got {:?}", other),
    }
    assert!(set.eof());
    assert_eq!(set.row_count(), 2);

    // Explicit identities move the mark forward
    insert(&mut set, &[("id", Value::Integer(500)), ("age", Value::Integer(30))]).unwrap();
    insert(&mut set, &[("age", Value::Integer(40))]).unwrap();
    assert_eq!(set.current().value(0), &Value::Integer(510));

    assert!(matches!(
        update(&mut set, 1, &[("created", Value::Integer(2))]),
        Err(StrataError::ReadOnlyColumn { .. })
    ));
    update(&mut set, 1, &[("created", Value::Integer(1)), ("age", Value::Integer(21))]).unwrap();
    assert!(matches!(
        update(&mut set, 1, &[("age", Value::Integer(5))]),
        Err(StrataError::ConstraintViolation {
            operation: Operation::Update,
            ..
        })
    ));
    assert!(set.seek(RowId(1)).unwrap());
    assert_eq!(set.get("age").unwrap(), &Value::Integer(21));

    assert!(matches!(
        set.create_constraint(ConstraintDef {
            name: "senior".into(),
            expression: "age > 65".into(),
            on_insert: true,
            on_update: true,
            on_delete: false,
        }),
        Err(StrataError::ConstraintViolation {
            operation: Operation::None,
            ..
        })
    ));

    set.drop_constraint("adult").unwrap();
    insert(&mut set, &[("age", Value::Integer(10))]).unwrap();
    set.drop_default_value("name").unwrap();
    insert(&mut set, &[("age", Value::Integer(11))]).unwrap();
    assert_eq!(set.current().value(1), &Value::Null);
    assert!(set.drop_identity("missing").is_err());

    let schema = db.table_schema("accounts").unwrap();
    assert_eq!(schema.identities.len(), 1);
    assert!(schema.defaults.is_empty());
    assert!(schema.constraints.is_empty());
}

#[test]
fn test_identity_counts_existing_rows() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let conn = db.connect();
    let mut set = conn.open("people").unwrap();

    insert(&mut set, &[("id", Value::Integer(5))]).unwrap();
    insert(&mut set, &[("id", Value::Integer(3))]).unwrap();
    set.create_identity("id", 1, 1).unwrap();

    insert(&mut set, &[("name", text("next"))]).unwrap();
    assert_eq!(set.current().value(0), &Value::Integer(6));
    assert!(set.create_identity("id", 1, 1).is_err());
    assert!(set.create_identity("name", 1, 1).is_err());
}

struct Blocklist(&'static str);

impl RowEventHook for Blocklist {
    fn before(&mut self, operation: Operation, row: &Row) -> Result<(), String> {
        if operation == Operation::Insert && row.value(1) == &text(self.0) {
            return Err(format!("{} is not welcome", self.0));
        }
        Ok(())
    }
}

#[test]
fn test_hook_vetoes_insert() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let conn = db.connect();
    let mut set = conn.open("people").unwrap();
    set.add_hook(Box::new(Blocklist("mallory")));

    insert(&mut set, &[("name", text("alice"))]).unwrap();
    match insert(&mut set, &[("name", text("mallory"))]) {
        Err(StrataError::Vetoed { operation, reason, .. }) => {
            assert_eq!(operation, Operation::Insert);
            assert_eq!(reason, "mallory is not welcome");
        }
        other => panic!("expected a veto, got {:?}", other),
    }

    assert_eq!(names(&mut set), vec!["alice"]);
    assert_eq!(set.row_count(), 1);
    assert_eq!(db.shared().table("people").unwrap().directory_len(), 1);
}

#[test]
fn test_read_only_handle() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let conn = db.connect();
    let options = crate::storage::OpenOptions {
        read_only: true,
        ..Default::default()
    };
    let mut set = conn.open_table("people", options).unwrap();
    assert!(matches!(
        insert(&mut set, &[("name", text("x"))]),
        Err(StrataError::ReadOnly { .. })
    ));
}

fn departments_and_employees(
    db: &Database,
    kind: LinkKind,
    on_update: ReferentialAction,
    on_delete: ReferentialAction,
) {
    db.create_table(
        "dept",
        vec![
            Column::new("id", DataType::Integer).not_null(),
            Column::new("name", DataType::Text),
        ],
    )
    .unwrap();
    db.create_table(
        "emp",
        vec![
            Column::new("id", DataType::Integer),
            Column::new("name", DataType::Text),
            Column::new("dept", DataType::Integer),
        ],
    )
    .unwrap();

    let conn = db.connect();
    let mut dept = conn.open("dept").unwrap();
    insert(&mut dept, &[("id", Value::Integer(1)), ("name", text("research"))]).unwrap();
    insert(&mut dept, &[("id", Value::Integer(2)), ("name", text("sales"))]).unwrap();

    let mut emp = conn.open("emp").unwrap();
    emp.create_foreign_key(ForeignKeyDef {
        name: "emp_dept".into(),
        table: "emp".into(),
        columns: vec!["dept".into()],
        references: "dept".into(),
        referenced_columns: vec!["id".into()],
        kind,
        on_update,
        on_delete,
    })
    .unwrap();
}

fn add_employee(emp: &mut ClusteredRowSet, name: &str, dept: Value) -> StrataResult<()> {
    insert(emp, &[("name", text(name)), ("dept", dept)])
}

#[test]
fn test_cascade_update_and_delete() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    departments_and_employees(
        &db,
        LinkKind::OneToMany,
        ReferentialAction::Cascade,
        ReferentialAction::Cascade,
    );
    let conn = db.connect();
    let mut dept = conn.open("dept").unwrap();
    let mut emp = conn.open("emp").unwrap();

    add_employee(&mut emp, "ann", Value::Integer(1)).unwrap();
    add_employee(&mut emp, "bob", Value::Integer(1)).unwrap();
    add_employee(&mut emp, "cid", Value::Integer(2)).unwrap();

    update(&mut dept, 1, &[("id", Value::Integer(10))]).unwrap();
    assert_eq!(
        column_values(&mut emp, "dept"),
        vec![Value::Integer(10), Value::Integer(10), Value::Integer(2)]
    );

    delete(&mut dept, 1).unwrap();
    assert_eq!(names(&mut emp), vec!["cid"]);
    assert_eq!(emp.row_count(), 1);
    assert_eq!(dept.row_count(), 1);

    // The related partner is positioned on the matching slave
    assert!(dept.seek(RowId(2)).unwrap());
    let related = dept.related("emp_dept").unwrap();
    assert!(!related.eof());
    assert_eq!(related.get("name").unwrap(), &text("cid"));
}

#[test]
fn test_cascade_inside_transaction_rolls_back() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    departments_and_employees(
        &db,
        LinkKind::OneToMany,
        ReferentialAction::Cascade,
        ReferentialAction::Cascade,
    );
    let conn = db.connect();
    let mut dept = conn.open("dept").unwrap();
    let mut emp = conn.open("emp").unwrap();
    add_employee(&mut emp, "ann", Value::Integer(1)).unwrap();

    conn.begin_transaction().unwrap();
    delete(&mut dept, 1).unwrap();
    assert!(names(&mut emp).is_empty());
    conn.rollback().unwrap();

    assert_eq!(names(&mut emp), vec!["ann"]);
    assert_eq!(names(&mut dept), vec!["research", "sales"]);
}

#[test]
fn test_set_null_and_set_default() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    departments_and_employees(
        &db,
        LinkKind::OneToMany,
        ReferentialAction::SetDefault,
        ReferentialAction::SetNull,
    );
    let conn = db.connect();
    let mut emp = conn.open("emp").unwrap();
    emp.create_default_value("dept", "2", false).unwrap();

    add_employee(&mut emp, "ann", Value::Integer(1)).unwrap();
    add_employee(&mut emp, "bob", Value::Integer(2)).unwrap();

    let mut dept = conn.open("dept").unwrap();
    update(&mut dept, 1, &[("id", Value::Integer(7))]).unwrap();
    assert_eq!(
        column_values(&mut emp, "dept"),
        vec![Value::Integer(2), Value::Integer(2)]
    );

    delete(&mut dept, 2).unwrap();
    assert_eq!(column_values(&mut emp, "dept"), vec![Value::Null, Value::Null]);
    assert_eq!(emp.row_count(), 2);
}

#[test]
fn test_no_action_keeps_master() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    departments_and_employees(
        &db,
        LinkKind::OneToMany,
        ReferentialAction::NoAction,
        ReferentialAction::NoAction,
    );
    let conn = db.connect();
    let mut dept = conn.open("dept").unwrap();
    let mut emp = conn.open("emp").unwrap();
    add_employee(&mut emp, "ann", Value::Integer(1)).unwrap();

    match delete(&mut dept, 1) {
        Err(StrataError::ReferentialIntegrity { relation, violation, .. }) => {
            assert_eq!(relation, "emp_dept");
            assert_eq!(violation, IntegrityViolation::StillReferenced);
        }
        other => panic!("expected an integrity violation, got {:?}", other),
    }
    assert!(dept.eof());
    assert!(dept.seek(RowId(1)).unwrap());
    assert_eq!(dept.row_count(), 2);

    assert!(matches!(
        update(&mut dept, 1, &[("id", Value::Integer(9))]),
        Err(StrataError::ReferentialIntegrity {
            violation: IntegrityViolation::StillReferenced,
            ..
        })
    ));
    assert!(dept.seek(RowId(1)).unwrap());
    assert_eq!(dept.get("id").unwrap(), &Value::Integer(1));

    // Unreferenced masters can go
    delete(&mut dept, 2).unwrap();
    assert_eq!(names(&mut dept), vec!["research"]);
}

#[test]
fn test_slave_needs_master() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    departments_and_employees(
        &db,
        LinkKind::OneToMany,
        ReferentialAction::NoAction,
        ReferentialAction::NoAction,
    );
    let conn = db.connect();
    let mut emp = conn.open("emp").unwrap();

    assert!(matches!(
        add_employee(&mut emp, "ghost", Value::Integer(99)),
        Err(StrataError::ReferentialIntegrity {
            violation: IntegrityViolation::MissingPrimaryKey,
            ..
        })
    ));
    assert_eq!(emp.row_count(), 0);
    assert!(names(&mut emp).is_empty());

    // A NULL key references nothing
    add_employee(&mut emp, "floater", Value::Null).unwrap();
    add_employee(&mut emp, "ann", Value::Integer(2)).unwrap();
    assert!(matches!(
        update(&mut emp, 2, &[("dept", Value::Integer(42))]),
        Err(StrataError::ReferentialIntegrity {
            violation: IntegrityViolation::MissingPrimaryKey,
            ..
        })
    ));

    emp.relations_mut().set_active("emp_dept", false);
    add_employee(&mut emp, "unchecked", Value::Integer(99)).unwrap();
    assert_eq!(emp.row_count(), 3);
}

#[test]
fn test_foreign_key_checks_existing_rows() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    db.create_table("dept", vec![Column::new("id", DataType::Integer)]).unwrap();
    db.create_table(
        "emp",
        vec![
            Column::new("name", DataType::Text),
            Column::new("dept", DataType::Integer),
        ],
    )
    .unwrap();
    let conn = db.connect();
    let mut emp = conn.open("emp").unwrap();
    insert(&mut emp, &[("name", text("orphan")), ("dept", Value::Integer(4))]).unwrap();

    let fk = ForeignKeyDef {
        name: "emp_dept".into(),
        table: "emp".into(),
        columns: vec!["dept".into()],
        references: "dept".into(),
        referenced_columns: vec!["id".into()],
        kind: LinkKind::OneToMany,
        on_update: ReferentialAction::NoAction,
        on_delete: ReferentialAction::NoAction,
    };
    assert!(emp.create_foreign_key(fk.clone()).is_err());
    assert!(emp.relations().is_empty());
    assert!(db.table_schema("emp").unwrap().foreign_keys.is_empty());

    let mut dept = conn.open("dept").unwrap();
    insert(&mut dept, &[("id", Value::Integer(4))]).unwrap();
    emp.create_foreign_key(fk).unwrap();
    assert_eq!(emp.relations().len(), 1);
    assert!(db.drop_table("dept").is_err());

    emp.drop_foreign_key("emp_dept").unwrap();
    assert!(emp.relations().is_empty());
}

#[test]
fn test_one_to_one_requires_partner() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    departments_and_employees(
        &db,
        LinkKind::OneToOne,
        ReferentialAction::Cascade,
        ReferentialAction::Cascade,
    );
    let conn = db.connect();
    let mut dept = conn.open("dept").unwrap();
    let mut emp = conn.open("emp").unwrap();
    add_employee(&mut emp, "ann", Value::Integer(1)).unwrap();

    delete(&mut dept, 1).unwrap();
    assert!(names(&mut emp).is_empty());

    assert!(matches!(
        delete(&mut dept, 2),
        Err(StrataError::ReferentialIntegrity {
            violation: IntegrityViolation::MissingPartner,
            ..
        })
    ));
    assert_eq!(names(&mut dept), vec!["sales"]);
}

#[test]
fn test_one_to_many_master_without_slaves() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    departments_and_employees(
        &db,
        LinkKind::OneToMany,
        ReferentialAction::NoAction,
        ReferentialAction::NoAction,
    );
    let conn = db.connect();
    let mut dept = conn.open("dept").unwrap();

    update(&mut dept, 2, &[("id", Value::Integer(20))]).unwrap();
    delete(&mut dept, 2).unwrap();
    assert_eq!(names(&mut dept), vec!["research"]);
}

#[test]
fn test_one_to_zero_or_one_allows_no_partner() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    departments_and_employees(
        &db,
        LinkKind::OneToZeroOrOne,
        ReferentialAction::Cascade,
        ReferentialAction::Cascade,
    );
    let conn = db.connect();
    let mut dept = conn.open("dept").unwrap();

    delete(&mut dept, 2).unwrap();
    assert_eq!(names(&mut dept), vec!["research"]);
}

#[test]
fn test_row_lock_timeout() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let a = db.connect();
    let b = db.connect();
    a.set_lock_timeout(Duration::from_millis(100));

    let mut set_a = a.open("people").unwrap();
    let mut set_b = b.open("people").unwrap();
    insert(&mut set_b, &[("name", text("ann"))]).unwrap();

    set_b.set_postpone_unlock(true);
    update(&mut set_b, 1, &[("name", text("anne"))]).unwrap();

    assert!(matches!(
        update(&mut set_a, 1, &[("name", text("annie"))]),
        Err(StrataError::LockTimeout { .. })
    ));

    set_b.release_postponed();
    update(&mut set_a, 1, &[("name", text("annie"))]).unwrap();
    assert_eq!(names(&mut set_b), vec!["annie"]);
}

#[test]
fn test_storage_lock_blocks_other_writers() {
    let db = Database::in_memory(DatabaseConfig::default()).unwrap();
    create_people(&db);
    let a = db.connect();
    let b = db.connect();
    b.set_lock_timeout(Duration::from_millis(50));

    let set_a = a.open("people").unwrap();
    let mut set_b = b.open("people").unwrap();
    set_a.lock_storage().unwrap();
    assert!(matches!(
        insert(&mut set_b, &[("name", text("blocked"))]),
        Err(StrataError::LockTimeout { .. })
    ));
    assert_eq!(set_b.row_count(), 0);

    set_a.unlock_storage();
    insert(&mut set_b, &[("name", text("free"))]).unwrap();
    assert_eq!(set_b.row_count(), 1);
}

#[test]
fn test_interrupted_transaction_is_rolled_back_on_open() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("crash.db");

    {
        let db = Database::create(&path, DatabaseConfig::default()).unwrap();
        create_people(&db);
        let conn = db.connect();
        let mut set = conn.open("people").unwrap();
        insert(&mut set, &[("name", text("kept"))]).unwrap();

        conn.begin_transaction().unwrap();
        insert(&mut set, &[("name", text("lost"))]).unwrap();
        update(&mut set, 1, &[("name", text("changed"))]).unwrap();

        // Simulate a crash: nothing gets to roll back or close
        std::mem::forget(set);
        std::mem::forget(conn);
        std::mem::forget(db);
    }

    let db = Database::open(&path, DatabaseConfig::default()).unwrap();
    let conn = db.connect();
    let mut set = conn.open("people").unwrap();
    assert_eq!(names(&mut set), vec!["kept"]);
    assert_eq!(set.row_count(), 1);

    let table = db.shared().table("people").unwrap();
    assert_eq!(table.directory_len(), 1);
    assert!(db.shared().registry.current_version() >= table.max_version());

    insert(&mut set, &[("name", text("after"))]).unwrap();
    assert_eq!(names(&mut set), vec!["kept", "after"]);
}

#[test]
fn test_rows_survive_reopen() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("people.db");
    let long = "x".repeat(5000);

    {
        let db = Database::create(&path, DatabaseConfig::default()).unwrap();
        create_people(&db);
        let conn = db.connect();
        let mut set = conn.open("people").unwrap();
        set.create_identity("id", 1, 1).unwrap();
        set.create_default_value("age", "18", false).unwrap();

        insert(&mut set, &[("name", text("ann"))]).unwrap();
        insert(&mut set, &[("name", text(&long))]).unwrap();
        assert_eq!(set.current().extensions().len(), 1);

        conn.begin_transaction().unwrap();
        insert(&mut set, &[("name", text("cid"))]).unwrap();
        conn.commit().unwrap();
    }

    let db = Database::open(&path, DatabaseConfig::default()).unwrap();
    let conn = db.connect();
    let mut set = conn.open("people").unwrap();

    assert_eq!(set.row_count(), 3);
    assert_eq!(
        column_values(&mut set, "id"),
        vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]
    );
    assert!(set.seek(RowId(2)).unwrap());
    assert_eq!(set.get("name").unwrap(), &text(&long));
    assert_eq!(set.get("age").unwrap(), &Value::Integer(18));

    insert(&mut set, &[("name", text("dan"))]).unwrap();
    assert_eq!(set.current().value(0), &Value::Integer(4));

    // Replacing the long value releases its extension
    update(&mut set, 2, &[("name", text("bob"))]).unwrap();
    assert!(set.current().extensions().is_empty());
    assert_eq!(names(&mut set), vec!["ann", "bob", "cid", "dan"]);
}

#[test]
fn test_read_only_database() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("ro.db");
    {
        let db = Database::create(&path, DatabaseConfig::default()).unwrap();
        create_people(&db);
        let conn = db.connect();
        let mut set = conn.open("people").unwrap();
        insert(&mut set, &[("name", text("ann"))]).unwrap();
    }

    let config = DatabaseConfig {
        read_only: true,
        ..DatabaseConfig::default()
    };
    let db = Database::open(&path, config).unwrap();
    let conn = db.connect();
    let mut set = conn.open("people").unwrap();
    assert_eq!(names(&mut set), vec!["ann"]);
    assert!(matches!(
        insert(&mut set, &[("name", text("bob"))]),
        Err(StrataError::ReadOnly { .. })
    ));
    assert!(db.create_table("more", vec![Column::new("a", DataType::Integer)]).is_err());
}
