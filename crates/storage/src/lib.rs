use std::str::FromStr;
use std::time::Duration;

use sqlx::{
    migrate::MigrateError,
    sqlite::{
        SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
    Arguments, Encode, FromRow, Sqlite, SqlitePool, Transaction, Type,
};
use thiserror::Error;
use tracing::{debug, error};

use corpdir_core::types::{Company, Employee};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a SQLite connection pool for the provided connection string.
    ///
    /// Foreign key enforcement and the journal pragmas are part of the connect
    /// options so every pooled connection carries them, not just the one that
    /// happened to run a `PRAGMA` statement.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::InvalidUrl)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/` at the workspace root.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Builds a fresh unit of work scoped to one logical operation.
    pub fn unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid database url: {0}")]
    InvalidUrl(sqlx::Error),
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
}

/// Read-mode hint attached to repository queries.
///
/// `ReadOnly` marks result sets that will not be staged back; `Tracked`
/// signals the caller intends to mutate and persist the returned rows later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tracking {
    #[default]
    ReadOnly,
    Tracked,
}

impl Tracking {
    /// Canonical label used in query logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Tracked => "tracked",
        }
    }
}

/// Filter and ordering applied to a repository read.
pub struct Condition {
    clause: Option<String>,
    order: Option<&'static str>,
    arguments: SqliteArguments<'static>,
}

impl Condition {
    /// Matches every row of the table.
    pub fn all() -> Self {
        Self {
            clause: None,
            order: None,
            arguments: SqliteArguments::default(),
        }
    }

    /// Restricts the read to rows matching the given WHERE fragment.
    pub fn matching(clause: impl Into<String>) -> Self {
        Self {
            clause: Some(clause.into()),
            order: None,
            arguments: SqliteArguments::default(),
        }
    }

    /// Binds the next `?` placeholder of the WHERE fragment.
    pub fn bind<V>(mut self, value: V) -> Self
    where
        V: 'static + Send + Encode<'static, Sqlite> + Type<Sqlite>,
    {
        self.arguments.add(value);
        self
    }

    /// Appends an ORDER BY clause to the read.
    pub fn order_by(mut self, order: &'static str) -> Self {
        self.order = Some(order);
        self
    }

    fn select_sql(&self, table: &str, columns: &[&str]) -> String {
        let mut sql = format!("SELECT {} FROM {table}", columns.join(", "));
        if let Some(clause) = &self.clause {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        if let Some(order) = self.order {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        sql
    }

    fn into_arguments(self) -> SqliteArguments<'static> {
        self.arguments
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Row type persisted by the generic repository.
pub trait Entity: 'static + Send + Sync + Unpin + for<'r> FromRow<'r, SqliteRow> {
    /// Table backing the entity.
    const TABLE: &'static str;
    /// Full column list; the identity column comes first.
    const COLUMNS: &'static [&'static str];
    /// Label used in logs and persistence errors.
    const KIND: &'static str;

    fn id(&self) -> &str;

    /// Binds every column value in `COLUMNS` order.
    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;
}

const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

/// Failures surfaced by repository reads and the unit-of-work commit.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{entity} references a row that does not exist")]
    ForeignKey { entity: &'static str },
    #[error("{entity} conflicts with an existing row")]
    Conflict { entity: &'static str },
    #[error("failed to {operation} {entity}: {source}")]
    Operation {
        entity: &'static str,
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to begin transaction: {0}")]
    Begin(sqlx::Error),
    #[error("failed to commit staged changes: {0}")]
    Commit(sqlx::Error),
}

fn classify(entity: &'static str, operation: &'static str, err: sqlx::Error) -> PersistenceError {
    error!(operation, entity, error = %err, "persistence operation failed");

    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some(SQLITE_CONSTRAINT_FOREIGNKEY) => {
                return PersistenceError::ForeignKey { entity };
            }
            Some(SQLITE_CONSTRAINT_PRIMARYKEY) | Some(SQLITE_CONSTRAINT_UNIQUE) => {
                return PersistenceError::Conflict { entity };
            }
            _ => {}
        }
    }

    PersistenceError::Operation {
        entity,
        operation,
        source: err,
    }
}

enum StagedOp<T> {
    Create(T),
    Update(T),
    Delete(T),
}

/// Generic query and staging operations shared by every entity repository.
///
/// Reads run against the pool immediately; `create`/`update`/`delete` only
/// stage mutations, which become visible when the owning [`UnitOfWork`]
/// commits them.
pub struct Repository<T: Entity> {
    pool: SqlitePool,
    staged: Vec<StagedOp<T>>,
}

impl<T: Entity> Repository<T> {
    fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            staged: Vec::new(),
        }
    }

    /// Returns every row of the table; an empty store yields an empty vec.
    pub async fn find_all(&self, tracking: Tracking) -> Result<Vec<T>, PersistenceError> {
        self.find_by_condition(Condition::all(), tracking).await
    }

    /// Returns the rows matching the condition.
    pub async fn find_by_condition(
        &self,
        condition: Condition,
        tracking: Tracking,
    ) -> Result<Vec<T>, PersistenceError> {
        let sql = condition.select_sql(T::TABLE, T::COLUMNS);
        debug!(entity = T::KIND, tracking = tracking.as_str(), "running repository query");

        sqlx::query_as_with::<_, T, _>(&sql, condition.into_arguments())
            .fetch_all(&self.pool)
            .await
            .map_err(|err| classify(T::KIND, "query", err))
    }

    /// Stages an insert; nothing is written until the unit of work saves.
    pub fn create(&mut self, row: T) {
        self.staged.push(StagedOp::Create(row));
    }

    /// Stages a full-row update keyed on the identity column.
    pub fn update(&mut self, row: T) {
        self.staged.push(StagedOp::Update(row));
    }

    /// Stages a delete keyed on the identity column.
    pub fn delete(&mut self, row: T) {
        self.staged.push(StagedOp::Delete(row));
    }

    /// Number of staged mutations not yet committed.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn clear_staged(&mut self) {
        self.staged.clear();
    }

    async fn apply(&self, tx: &mut Transaction<'_, Sqlite>) -> Result<(), PersistenceError> {
        for op in &self.staged {
            match op {
                StagedOp::Create(row) => {
                    let sql = insert_sql(T::TABLE, T::COLUMNS);
                    row.bind_columns(sqlx::query(&sql))
                        .execute(&mut **tx)
                        .await
                        .map_err(|err| classify(T::KIND, "create", err))?;
                }
                StagedOp::Update(row) => {
                    let sql = update_sql(T::TABLE, T::COLUMNS);
                    row.bind_columns(sqlx::query(&sql))
                        .bind(row.id())
                        .execute(&mut **tx)
                        .await
                        .map_err(|err| classify(T::KIND, "update", err))?;
                }
                StagedOp::Delete(row) => {
                    let sql = delete_sql(T::TABLE);
                    sqlx::query(&sql)
                        .bind(row.id())
                        .execute(&mut **tx)
                        .await
                        .map_err(|err| classify(T::KIND, "delete", err))?;
                }
            }
        }

        Ok(())
    }
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

// The identity column is assigned back to itself so one binding order serves
// both inserts and updates.
fn update_sql(table: &str, columns: &[&str]) -> String {
    let assignments = columns
        .iter()
        .map(|column| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE {table} SET {assignments} WHERE id = ?")
}

fn delete_sql(table: &str) -> String {
    format!("DELETE FROM {table} WHERE id = ?")
}

/// Database row backing a company record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CompanyRow {
    pub id: String,
    pub name: String,
    pub address: String,
    pub country: String,
}

impl CompanyRow {
    pub fn from_domain(company: &Company) -> Self {
        Self {
            id: company.id.clone(),
            name: company.name.clone(),
            address: company.address.clone(),
            country: company.country.clone(),
        }
    }

    pub fn into_domain(self) -> Company {
        Company {
            id: self.id,
            name: self.name,
            address: self.address,
            country: self.country,
        }
    }
}

impl Entity for CompanyRow {
    const TABLE: &'static str = "companies";
    const COLUMNS: &'static [&'static str] = &["id", "name", "address", "country"];
    const KIND: &'static str = "company";

    fn id(&self) -> &str {
        &self.id
    }

    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(&self.id)
            .bind(&self.name)
            .bind(&self.address)
            .bind(&self.country)
    }
}

/// Repository exposing company-specific read shapes.
pub struct CompanyRepository {
    inner: Repository<CompanyRow>,
}

impl CompanyRepository {
    fn new(pool: SqlitePool) -> Self {
        Self {
            inner: Repository::new(pool),
        }
    }

    pub async fn find_all(&self, tracking: Tracking) -> Result<Vec<Company>, PersistenceError> {
        let rows = self.inner.find_all(tracking).await?;
        Ok(rows.into_iter().map(CompanyRow::into_domain).collect())
    }

    /// All companies ordered by name ascending, ties broken by identity.
    pub async fn all_ordered_by_name(
        &self,
        tracking: Tracking,
    ) -> Result<Vec<Company>, PersistenceError> {
        let rows = self
            .inner
            .find_by_condition(Condition::all().order_by("name ASC, id ASC"), tracking)
            .await?;
        Ok(rows.into_iter().map(CompanyRow::into_domain).collect())
    }

    pub async fn find_by_id(
        &self,
        id: &str,
        tracking: Tracking,
    ) -> Result<Option<Company>, PersistenceError> {
        let rows = self
            .inner
            .find_by_condition(Condition::matching("id = ?").bind(id.to_string()), tracking)
            .await?;
        Ok(rows.into_iter().next().map(CompanyRow::into_domain))
    }

    pub fn create(&mut self, company: &Company) {
        self.inner.create(CompanyRow::from_domain(company));
    }

    pub fn update(&mut self, company: &Company) {
        self.inner.update(CompanyRow::from_domain(company));
    }

    pub fn delete(&mut self, company: &Company) {
        self.inner.delete(CompanyRow::from_domain(company));
    }

    pub fn staged_len(&self) -> usize {
        self.inner.staged_len()
    }
}

/// Database row backing an employee record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EmployeeRow {
    pub id: String,
    pub name: String,
    pub age: i64,
    pub position: String,
    pub company_id: String,
}

impl EmployeeRow {
    pub fn from_domain(employee: &Employee) -> Self {
        Self {
            id: employee.id.clone(),
            name: employee.name.clone(),
            age: i64::from(employee.age),
            position: employee.position.clone(),
            company_id: employee.company_id.clone(),
        }
    }

    pub fn into_domain(self) -> Employee {
        Employee {
            id: self.id,
            name: self.name,
            age: self.age as u32,
            position: self.position,
            company_id: self.company_id,
        }
    }
}

impl Entity for EmployeeRow {
    const TABLE: &'static str = "employees";
    const COLUMNS: &'static [&'static str] = &["id", "name", "age", "position", "company_id"];
    const KIND: &'static str = "employee";

    fn id(&self) -> &str {
        &self.id
    }

    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(&self.id)
            .bind(&self.name)
            .bind(self.age)
            .bind(&self.position)
            .bind(&self.company_id)
    }
}

/// Repository exposing employee-specific read shapes.
///
/// No HTTP path reaches these yet; the plumbing stays in step with the
/// company repository so the feature can be exposed without storage changes.
pub struct EmployeeRepository {
    inner: Repository<EmployeeRow>,
}

impl EmployeeRepository {
    fn new(pool: SqlitePool) -> Self {
        Self {
            inner: Repository::new(pool),
        }
    }

    /// Employees of one company ordered by name ascending, ties broken by identity.
    pub async fn for_company(
        &self,
        company_id: &str,
        tracking: Tracking,
    ) -> Result<Vec<Employee>, PersistenceError> {
        let rows = self
            .inner
            .find_by_condition(
                Condition::matching("company_id = ?")
                    .bind(company_id.to_string())
                    .order_by("name ASC, id ASC"),
                tracking,
            )
            .await?;
        Ok(rows.into_iter().map(EmployeeRow::into_domain).collect())
    }

    pub async fn find_by_id(
        &self,
        id: &str,
        tracking: Tracking,
    ) -> Result<Option<Employee>, PersistenceError> {
        let rows = self
            .inner
            .find_by_condition(Condition::matching("id = ?").bind(id.to_string()), tracking)
            .await?;
        Ok(rows.into_iter().next().map(EmployeeRow::into_domain))
    }

    pub fn create(&mut self, employee: &Employee) {
        self.inner.create(EmployeeRow::from_domain(employee));
    }

    pub fn update(&mut self, employee: &Employee) {
        self.inner.update(EmployeeRow::from_domain(employee));
    }

    pub fn delete(&mut self, employee: &Employee) {
        self.inner.delete(EmployeeRow::from_domain(employee));
    }

    pub fn staged_len(&self) -> usize {
        self.inner.staged_len()
    }
}

/// Aggregates the entity repositories for one logical operation and owns the
/// single point where their staged mutations are committed.
///
/// One instance belongs to one request scope; staged state never crosses
/// instances, so two units of work cannot observe each other's uncommitted
/// mutations.
pub struct UnitOfWork {
    pool: SqlitePool,
    companies: Option<CompanyRepository>,
    employees: Option<EmployeeRepository>,
}

impl UnitOfWork {
    fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            companies: None,
            employees: None,
        }
    }

    /// Returns the company repository, constructing it on first access.
    pub fn companies(&mut self) -> &mut CompanyRepository {
        let pool = self.pool.clone();
        self.companies
            .get_or_insert_with(|| CompanyRepository::new(pool))
    }

    /// Returns the employee repository, constructing it on first access.
    pub fn employees(&mut self) -> &mut EmployeeRepository {
        let pool = self.pool.clone();
        self.employees
            .get_or_insert_with(|| EmployeeRepository::new(pool))
    }

    fn staged_len(&self) -> usize {
        self.companies.as_ref().map_or(0, |repo| repo.staged_len())
            + self.employees.as_ref().map_or(0, |repo| repo.staged_len())
    }

    /// Commits every staged mutation across the repositories as one
    /// transaction.
    ///
    /// A failed commit rolls the transaction back, leaving both the visible
    /// store and the staged buffers unchanged. Saving with nothing staged is a
    /// no-op.
    pub async fn save(&mut self) -> Result<(), PersistenceError> {
        if self.staged_len() == 0 {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(|err| {
            error!(operation = "begin", error = %err, "persistence operation failed");
            PersistenceError::Begin(err)
        })?;

        // Company rows land first so employees staged in the same scope can
        // reference them.
        if let Some(repo) = &self.companies {
            repo.inner.apply(&mut tx).await?;
        }
        if let Some(repo) = &self.employees {
            repo.inner.apply(&mut tx).await?;
        }

        tx.commit().await.map_err(|err| {
            error!(operation = "commit", error = %err, "persistence operation failed");
            PersistenceError::Commit(err)
        })?;

        if let Some(repo) = &mut self.companies {
            repo.inner.clear_staged();
        }
        if let Some(repo) = &mut self.employees {
            repo.inner.clear_staged();
        }

        Ok(())
    }
}
