use super::{ContentGroup, RecordKind, Store, StoreError, TaskMetadata, Writer};
use crate::{
    batcher::container::{self, CONTAINER_TABLES},
    protocol::TaskClass,
    tasks::TaskRecord,
};
use chrono::Utc;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    Connection, OptionalExtension, ToSql,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, error, info, warn};
use tracing_unwrap::OptionExt;

pub const REPOSITORY_FILE: &str = "repository.sqlite";
pub const OUTPUT_FILE: &str = "output.sqlite";

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists records (
    id integer primary key,
    kind tinyint not null,
    name text not null,
    body text not null,
    unique (kind, name)
);",
    "create table if not exists content (
    id integer primary key,
    task text not null,
    name text not null unique,
    created text not null,
    body text not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

const PRODUCT_SCHEMA: &str = "create table if not exists products (
    product text not null,
    path text not null,
    groups text not null
);";

impl ToSql for RecordKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(*self as i8))
    }
}

impl FromSql for RecordKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_i64()?;

        serde_json::from_value(serde_json::Value::from(raw))
            .map_err(|_| FromSqlError::OutOfRange(raw))
    }
}

/// Repository rooted in a directory, tasks and records live in `repository.sqlite`,
/// committed content below `output/`
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    connection: Arc<FairMutex<Connection>>,
}

impl Repository {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join("pending"))?;
        fs::create_dir_all(root.join("output"))?;

        let connection = Connection::open(root.join(REPOSITORY_FILE))?;
        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            if let Err(error) = connection.execute(table, []) {
                error!(error = ?error, table = table, "Failed to apply SQL schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                return Err(StoreError::SQLite(error));
            }
        }
        debug!(root = ?root, "Opened repository");

        Ok(Self {
            root: root.to_path_buf(),
            connection: Arc::new(FairMutex::new(connection)),
        })
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, Connection> {
        self.connection.lock_arc()
    }

    /// insert or replace a named record
    pub fn insert_record(&self, kind: RecordKind, name: &str, body: &str) -> Result<(), StoreError> {
        self.lock()
            .prepare_cached("insert or replace into records (kind, name, body) values (?, ?, ?)")?
            .execute(params![kind, name, body])?;

        info!(kind = %kind, name = name, "Stored record");

        Ok(())
    }

    pub fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let body = serde_yaml::to_string(task)?;

        self.insert_record(RecordKind::Task, &task.name, &body)
    }

    /// all record names of one kind, sorted
    pub fn list_records(&self, kind: RecordKind) -> Result<Vec<String>, StoreError> {
        let connection = self.lock();
        let names = connection
            .prepare_cached("select name from records where kind = ? order by name")?
            .query_map(params![kind], |row| row.get(0))?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<String>, StoreError>(init)
            })?;

        Ok(names)
    }

    fn content(&self, name: &str) -> Result<ContentGroup, StoreError> {
        let body: Option<String> = self
            .lock()
            .prepare_cached("select body from content where name = ?")?
            .query_row(params![name], |row| row.get(0))
            .optional()?;

        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::NotFound {
                kind: RecordKind::Content,
                name: name.to_owned(),
            }),
        }
    }

    fn new_writer(
        &self,
        task: &TaskRecord,
        tags: &[String],
        expected: TaskClass,
    ) -> Result<SqliteWriter, StoreError> {
        if task.class() != expected {
            return Err(StoreError::WrongClass {
                task: task.name.clone(),
                expected,
            });
        }

        SqliteWriter::create(self, task, tags)
    }
}

impl Store for Repository {
    type Writer = SqliteWriter;

    fn root(&self) -> &Path {
        &self.root
    }

    fn query_task(&self, name: &str) -> Result<TaskRecord, StoreError> {
        let body = self.query_record(RecordKind::Task, name)?;

        serde_yaml::from_str(&body).map_err(|source| StoreError::Malformed {
            kind: RecordKind::Task,
            name: name.to_owned(),
            source,
        })
    }

    fn query_record(&self, kind: RecordKind, name: &str) -> Result<String, StoreError> {
        if kind == RecordKind::Content {
            let group = self.content(name)?;

            return Ok(serde_yaml::to_string(&group)?);
        }

        let body: Option<String> = self
            .lock()
            .prepare_cached("select body from records where kind = ? and name = ?")?
            .query_row(params![kind, name], |row| row.get(0))
            .optional()?;

        body.ok_or_else(|| StoreError::NotFound {
            kind,
            name: name.to_owned(),
        })
    }

    fn latest_content(&self, task: &str, tags: &[String]) -> Result<ContentGroup, StoreError> {
        let connection = self.lock();
        let mut statement =
            connection.prepare_cached("select body from content where task = ? order by id desc")?;
        let mut rows = statement.query(params![task])?;

        while let Some(row) = rows.next()? {
            let body: String = row.get(0)?;
            let group: ContentGroup = serde_json::from_str(&body)?;

            if tags.iter().all(|tag| group.tags.contains(tag)) {
                return Ok(group);
            }
        }

        Err(StoreError::NoContent(task.to_owned()))
    }

    fn new_integration_writer(
        &self,
        task: &TaskRecord,
        tags: &[String],
    ) -> Result<SqliteWriter, StoreError> {
        self.new_writer(task, tags, TaskClass::Integration)
    }

    fn new_postintegration_writer(
        &self,
        task: &TaskRecord,
        tags: &[String],
    ) -> Result<SqliteWriter, StoreError> {
        self.new_writer(task, tags, TaskClass::Postintegration)
    }

    fn new_output_writer(
        &self,
        task: &TaskRecord,
        tags: &[String],
    ) -> Result<SqliteWriter, StoreError> {
        self.new_writer(task, tags, TaskClass::DerivedContent)
    }

    fn export_record(&self, kind: RecordKind, name: &str, out: &Path) -> Result<(), StoreError> {
        let body = self.query_record(kind, name)?;

        if let Some(parent) = out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(out, body)?;
        info!(kind = %kind, name = name, "Exported record to {}", out.to_string_lossy());

        Ok(())
    }

    fn commit_together(
        &self,
        mut writers: Vec<SqliteWriter>,
    ) -> Result<Vec<ContentGroup>, StoreError> {
        commit_groups(&self.connection, &mut writers)
    }
}

/// Uncommitted output group living in `pending/<group>` until it is committed
#[derive(Debug)]
pub struct SqliteWriter {
    task: String,
    class: TaskClass,
    tags: Vec<String>,
    group: String,
    pending: PathBuf,
    destination: PathBuf,
    temp_dir: PathBuf,
    log_dir: PathBuf,
    output: Option<Connection>,
    repository: Arc<FairMutex<Connection>>,
    metadata: TaskMetadata,
    committed: bool,
}

impl SqliteWriter {
    fn create(
        repository: &Repository,
        task: &TaskRecord,
        tags: &[String],
    ) -> Result<Self, StoreError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string();
        let mut group = format!("{}.{stamp}", task.name);
        let mut counter = 1;
        while repository.root.join("pending").join(&group).exists() {
            group = format!("{}.{stamp}.{counter}", task.name);
            counter += 1;
        }

        let pending = repository.root.join("pending").join(&group);
        let temp_dir = pending.join("temp");
        let log_dir = pending.join("logs");
        fs::create_dir_all(&temp_dir)?;
        fs::create_dir_all(&log_dir)?;

        let output = Connection::open(pending.join(OUTPUT_FILE))?;
        container::apply_schema(&output)?;
        output.execute(PRODUCT_SCHEMA, [])?;

        info!(task = %task.name, group = %group, "Opened writer");

        Ok(Self {
            task: task.name.clone(),
            class: task.class(),
            tags: tags.to_vec(),
            destination: repository.root.join("output").join(&task.name).join(&group),
            group,
            pending,
            temp_dir,
            log_dir,
            output: Some(output),
            repository: repository.connection.clone(),
            metadata: TaskMetadata::default(),
            committed: false,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending
    }

    fn output(&mut self) -> Result<&mut Connection, StoreError> {
        match self.output.as_mut() {
            Some(output) => Ok(output),
            None => Err(StoreError::WriterClosed(self.task.clone())),
        }
    }
}

// ATTACH cannot run inside a transaction, so attach first and copy inside one
fn copy_tables(output: &mut Connection) -> Result<usize, rusqlite::Error> {
    let tx = output.transaction()?;
    let mut rows = 0;

    for table in CONTAINER_TABLES {
        rows += tx.execute(
            &format!("insert into main.{table} select * from temporary.{table}"),
            [],
        )?;
    }
    tx.commit()?;

    Ok(rows)
}

impl Writer for SqliteWriter {
    fn task(&self) -> &str {
        &self.task
    }

    fn class(&self) -> TaskClass {
        self.class
    }

    fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    #[tracing::instrument(level = "debug", skip(self), fields(task = %self.task))]
    fn aggregate_container(&mut self, container: &Path) -> Result<usize, StoreError> {
        if !container.is_file() {
            return Err(StoreError::MissingContainer(container.to_path_buf()));
        }

        let output = self.output()?;
        output.execute(
            "attach database ? as temporary",
            params![container.to_string_lossy()],
        )?;
        let copied = copy_tables(output);
        output.execute("detach database temporary", [])?;
        let rows = copied?;

        debug!(rows = rows, "Aggregated {}", container.to_string_lossy());

        Ok(rows)
    }

    fn aggregate_product(
        &mut self,
        product: &str,
        path: &Path,
        groups: &[String],
    ) -> Result<(), StoreError> {
        if !path.is_file() {
            return Err(StoreError::MissingContainer(path.to_path_buf()));
        }

        let products = self.pending.join("products");
        fs::create_dir_all(&products)?;
        let target = match path.file_name() {
            Some(name) => products.join(name),
            None => products.join(product),
        };

        // products are written next to the pending group, a copy is only needed across devices
        if fs::rename(path, &target).is_err() {
            fs::copy(path, &target)?;
            fs::remove_file(path)?;
        }

        let groups = serde_json::to_string(groups)?;
        self.output()?
            .prepare_cached("insert into products (product, path, groups) values (?, ?, ?)")?
            .execute(params![product, target.to_string_lossy(), groups])?;

        debug!(task = %self.task, product = product, "Aggregated product");

        Ok(())
    }

    fn metadata_mut(&mut self) -> &mut TaskMetadata {
        &mut self.metadata
    }

    fn commit(mut self) -> Result<ContentGroup, StoreError> {
        let connection = self.repository.clone();
        let mut groups = commit_groups(&connection, std::slice::from_mut(&mut self))?;

        Ok(groups.pop().unwrap_or_log())
    }
}

impl SqliteWriter {
    /// close the output container and drop the scratch space, the group is ready to move
    fn seal(&mut self) -> Result<ContentGroup, StoreError> {
        if let Some(output) = self.output.take() {
            if let Err((_, error)) = output.close() {
                return Err(StoreError::SQLite(error));
            }
        }

        // scratch containers are not part of the committed group
        match fs::remove_dir_all(&self.temp_dir) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        Ok(ContentGroup {
            task: self.task.clone(),
            name: self.group.clone(),
            class: self.class,
            tags: self.tags.clone(),
            path: self.destination.clone(),
            created: Utc::now(),
            metadata: self.metadata.clone(),
        })
    }
}

/// commit `writers` as one unit, every content row is inserted and every pending group moved, or
/// none is
fn commit_groups(
    connection: &Arc<FairMutex<Connection>>,
    writers: &mut [SqliteWriter],
) -> Result<Vec<ContentGroup>, StoreError> {
    let groups = writers
        .iter_mut()
        .map(SqliteWriter::seal)
        .collect::<Result<Vec<_>, _>>()?;

    for writer in writers.iter() {
        if let Some(parent) = writer.destination.parent() {
            fs::create_dir_all(parent)?;
        }
    }

    let connection = connection.lock_arc();
    let mut tx = connection.unchecked_transaction()?;
    tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);
    for group in groups.iter() {
        tx.prepare_cached("insert into content (task, name, created, body) values (?, ?, ?, ?)")?
            .execute(params![
                group.task,
                group.name,
                group.created.to_rfc3339(),
                serde_json::to_string(group)?
            ])?;
    }

    let mut moved: Vec<&SqliteWriter> = Vec::with_capacity(writers.len());
    for writer in writers.iter() {
        if let Err(error) = fs::rename(&writer.pending, &writer.destination) {
            move_back(&moved);

            return Err(error.into());
        }
        moved.push(writer);
    }

    if let Err(error) = tx.commit() {
        move_back(&moved);

        return Err(error.into());
    }

    for writer in writers.iter_mut() {
        writer.committed = true;
    }
    for group in groups.iter() {
        info!(task = %group.task, group = %group.name, "Committed content group");
    }

    Ok(groups)
}

// undo the moves of a failed commit so the writers' drop removes their pending groups
fn move_back(moved: &[&SqliteWriter]) {
    for writer in moved.iter().rev() {
        if let Err(error) = fs::rename(&writer.destination, &writer.pending) {
            error!(error = ?error, task = %writer.task, "Failed to restore pending group {}: {error}", writer.pending.to_string_lossy());
        }
    }
}

impl Drop for SqliteWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        drop(self.output.take());

        match fs::remove_dir_all(&self.pending) {
            Ok(()) => warn!(task = %self.task, group = %self.group, "Rolled back uncommitted writer"),
            Err(error) => {
                error!(error = ?error, task = %self.task, "Failed to remove pending group {}: {error}", self.pending.to_string_lossy())
            }
        }
    }
}
