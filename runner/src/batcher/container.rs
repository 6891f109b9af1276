use super::ResultRecord;
use rusqlite::{params, Connection, Transaction};
use std::path::Path;
use tracing::{debug, info};

// Shared by temporary containers and writer output containers, so aggregation is a plain
// `insert into main.x select * from temporary.x`
pub const CONTAINER_SCHEMA: [&str; 3] = [
    "create table if not exists configurations (
    serial integer not null,
    payload text not null
);",
    "create table if not exists background (
    serial integer not null,
    step integer not null,
    payload text not null
);",
    "create table if not exists records (
    serial integer not null,
    step integer not null,
    payload text not null
);",
];
pub const CONTAINER_TABLES: [&str; 3] = ["configurations", "background", "records"];

pub fn apply_schema(connection: &Connection) -> Result<(), rusqlite::Error> {
    for table in CONTAINER_SCHEMA {
        connection.execute(table, [])?;
    }

    Ok(())
}

/// staged contents of a batcher, written in one go
#[derive(Debug, Default)]
pub struct Staged {
    pub configurations: Vec<ResultRecord>,
    pub background: Vec<ResultRecord>,
    pub records: Vec<ResultRecord>,
}

impl Staged {
    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty() && self.background.is_empty() && self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.configurations.len() + self.background.len() + self.records.len()
    }
}

/// write `staged` into a fresh container at `path`, returning the number of rows
pub fn write_container(path: &Path, staged: &Staged) -> Result<usize, rusqlite::Error> {
    let mut connection = Connection::open(path)?;
    apply_schema(&connection)?;

    let tx = connection.transaction()?;
    let mut counter = 0;

    for record in staged.configurations.iter() {
        tx.prepare_cached("insert into configurations (serial, payload) values (?, ?)")?
            .execute(params![record.serial, encode(&record.values)])?;
        counter += 1;
    }
    counter += insert_rows(&tx, "background", &staged.background)?;
    counter += insert_rows(&tx, "records", &staged.records)?;

    tx.commit()?;
    debug!(path = ?path, rows = counter, "Wrote temporary container");

    if let Err((_, error)) = connection.close() {
        return Err(error);
    }
    info!("Stored {counter} entries in {}", path.to_string_lossy());

    Ok(counter)
}

fn insert_rows(
    tx: &Transaction,
    table: &str,
    records: &[ResultRecord],
) -> Result<usize, rusqlite::Error> {
    let mut statement = tx.prepare_cached(&format!(
        "insert into {table} (serial, step, payload) values (?, ?, ?)"
    ))?;

    for record in records {
        statement.execute(params![record.serial, record.step, encode(&record.values)])?;
    }

    Ok(records.len())
}

// payload column is a JSON array, the storage format of values is not our concern
fn encode(values: &[f64]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| String::from("[]"))
}

/// count the rows of one table, mostly useful to inspect containers
pub fn count_rows(path: &Path, table: &str) -> Result<usize, rusqlite::Error> {
    let connection = Connection::open(path)?;
    let count: i64 =
        connection.query_row(&format!("select count(*) from {table}"), [], |row| row.get(0))?;

    Ok(count as usize)
}
