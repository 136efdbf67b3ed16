//! Strata demo executable
//!
//! Opens (or creates) a database, runs a short scripted session against it
//! and prints the resulting rows.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;
use comfy_table::{Cell, ContentArrangement, Table};
use strata_core::{
    ClusteredRowSet, Column, DataType, Database, DatabaseConfig, ForeignKeyDef, LinkKind,
    ReferentialAction, Value,
};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "strata", about = "Transactional row storage demo")]
struct Cli {
    /// Database file; created when missing
    #[arg(value_name = "FILE")]
    path: Option<PathBuf>,
    /// Use a throwaway in-memory database
    #[arg(long)]
    memory: bool,
    /// JSON configuration file
    #[arg(long, value_name = "CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    print_banner();

    let config = match &cli.config {
        Some(path) => DatabaseConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DatabaseConfig::default(),
    };

    let db = match (&cli.path, cli.memory) {
        (_, true) => Database::in_memory(config)?,
        (Some(path), false) if path.exists() => Database::open(path, config)?,
        (Some(path), false) => Database::create(path, config)?,
        (None, false) => bail!("pass a database file or --memory"),
    };

    run_session(&db)?;
    Ok(())
}

fn run_session(db: &Database) -> Result<()> {
    let tables = db.list_tables();
    let fresh = !tables.iter().any(|t| t == "accounts");
    if fresh {
        db.create_table(
            "accounts",
            vec![
                Column::new("id", DataType::Integer).not_null(),
                Column::new("owner", DataType::Text).not_null(),
                Column::new("balance", DataType::Integer),
            ],
        )?;
        db.create_table(
            "movements",
            vec![
                Column::new("account", DataType::Integer),
                Column::new("amount", DataType::Integer).read_only(),
            ],
        )?;
    }

    let conn = db.connect();
    let mut accounts = conn.open("accounts")?;
    if fresh {
        accounts.create_identity("id", 1, 1)?;
        accounts.create_default_value("balance", "0", false)?;
        let mut movements = conn.open("movements")?;
        movements.create_foreign_key(ForeignKeyDef {
            name: "movement_account".into(),
            table: "movements".into(),
            columns: vec!["account".into()],
            references: "accounts".into(),
            referenced_columns: vec!["id".into()],
            kind: LinkKind::OneToMany,
            on_update: ReferentialAction::Cascade,
            on_delete: ReferentialAction::Cascade,
        })?;
        drop(movements);
        // Pick up the new relation on the master side
        accounts = conn.open("accounts")?;
    }

    for owner in ["alice", "bob"] {
        accounts.prepare_insert();
        accounts.set("owner", Value::Text(owner.to_string()))?;
        accounts.create_row(true, false)?;
    }

    let txn = conn.begin_transaction()?;
    let mut movements = conn.open("movements")?;
    let mut more = accounts.first()?;
    while more {
        let id = accounts.get("id")?.clone();
        let balance = accounts.get("balance")?.as_integer().unwrap_or(0);

        movements.prepare_insert();
        movements.set("account", id)?;
        movements.set("amount", Value::Integer(100))?;
        movements.create_row(true, false)?;

        accounts.prepare_update();
        accounts.set("balance", Value::Integer(balance + 100))?;
        accounts.update_row(true)?;
        more = accounts.next()?;
    }
    conn.commit()?;
    info!("{} deposited into {} account(s)", txn, accounts.row_count());

    println!("{}", render(&mut accounts)?);
    println!("{}", render(&mut movements)?);
    Ok(())
}

fn render(set: &mut ClusteredRowSet) -> Result<String> {
    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS);

    let mut header = vec![Cell::new("row")];
    header.extend(
        set.shape()
            .columns()
            .iter()
            .map(|c| Cell::new(c.name.as_str())),
    );
    table.set_header(header);

    let mut more = set.first()?;
    while more {
        let row = set.current();
        let mut cells = vec![Cell::new(row.row_id())];
        cells.extend(row.values().iter().map(|v| Cell::new(display(v))));
        table.add_row(cells);
        more = set.next()?;
    }

    Ok(format!(
        "{} ({} rows)\n{}",
        set.name().bright_cyan(),
        set.row_count(),
        table
    ))
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Binary(bytes) => format!("<{} bytes>", bytes.len()),
    }
}

fn print_banner() {
    let banner = r#"
     ___ _             _
    / __| |_ _ _ __ _| |_ __ _
    \__ \  _| '_/ _` |  _/ _` |
    |___/\__|_| \__,_|\__\__,_|
        Row Storage Core v0.1.0
    "#;

    println!("{}", banner.bright_blue());
}
