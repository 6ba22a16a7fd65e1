use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use corpdir_core::types::{Company, Employee};
use corpdir_storage::{Database, PersistenceError, Tracking, UnitOfWork};

/// Unit of work shared by the service handles assembled for one request.
type SharedUnitOfWork = Arc<Mutex<UnitOfWork>>;

/// Facade bundling the entity services wired for a single request scope.
///
/// Assembled once, immutably; both handles share one unit of work so the
/// request sees a single persistence context.
pub struct ServiceManager {
    pub companies: CompanyService,
    /// Wired for parity with the company feature; no route reaches it yet.
    #[allow(dead_code)]
    pub employees: EmployeeService,
}

impl ServiceManager {
    pub fn new(database: &Database) -> Self {
        let unit_of_work = Arc::new(Mutex::new(database.unit_of_work()));
        Self {
            companies: CompanyService {
                unit_of_work: unit_of_work.clone(),
            },
            employees: EmployeeService { unit_of_work },
        }
    }
}

/// Errors surfaced by the service layer.
///
/// Persistence failures propagate unwrapped; the HTTP boundary matches on the
/// kind to pick a status code.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{entity} {id} was not found")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub struct CompanyService {
    unit_of_work: SharedUnitOfWork,
}

impl CompanyService {
    /// Returns every company ordered by name ascending, ties broken by identity.
    pub async fn get_all_companies(&self, tracking: Tracking) -> Result<Vec<Company>, ServiceError> {
        let mut unit_of_work = self.unit_of_work.lock().await;
        let companies = unit_of_work
            .companies()
            .all_ordered_by_name(tracking)
            .await
            .map_err(|err| persistence_failure("list_companies", "company", err))?;
        Ok(companies)
    }

    /// Looks up a single company by its identifier.
    pub async fn get_company(&self, id: &str, tracking: Tracking) -> Result<Company, ServiceError> {
        if Uuid::parse_str(id).is_err() {
            return Err(ServiceError::Validation {
                field: "id",
                reason: "must be a UUID",
            });
        }

        let mut unit_of_work = self.unit_of_work.lock().await;
        let company = unit_of_work
            .companies()
            .find_by_id(id, tracking)
            .await
            .map_err(|err| persistence_failure("get_company", "company", err))?;

        company.ok_or_else(|| ServiceError::NotFound {
            entity: "company",
            id: id.to_string(),
        })
    }
}

pub struct EmployeeService {
    unit_of_work: SharedUnitOfWork,
}

#[allow(dead_code)]
impl EmployeeService {
    /// Returns the employees of one company ordered by name ascending.
    pub async fn get_employees_for_company(
        &self,
        company_id: &str,
        tracking: Tracking,
    ) -> Result<Vec<Employee>, ServiceError> {
        if Uuid::parse_str(company_id).is_err() {
            return Err(ServiceError::Validation {
                field: "company_id",
                reason: "must be a UUID",
            });
        }

        let mut unit_of_work = self.unit_of_work.lock().await;
        let employees = unit_of_work
            .employees()
            .for_company(company_id, tracking)
            .await
            .map_err(|err| persistence_failure("list_employees", "employee", err))?;
        Ok(employees)
    }
}

fn persistence_failure(
    operation: &'static str,
    entity: &'static str,
    err: PersistenceError,
) -> ServiceError {
    counter!("persistence_failures_total", "operation" => operation, "entity" => entity)
        .increment(1);
    ServiceError::Persistence(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (Database, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("service.db").display()
        );
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        (db, dir)
    }

    async fn seed_company(db: &Database, company: &Company) {
        let mut unit = db.unit_of_work();
        unit.companies().create(company);
        unit.save().await.expect("seed commit");
    }

    #[tokio::test]
    async fn get_all_companies_passes_through_the_ordered_read() {
        let (db, _dir) = setup().await;
        seed_company(&db, &Company::new("Beta", "2 Side St", "CA")).await;
        seed_company(&db, &Company::new("Alpha", "1 Main St", "US")).await;

        let services = ServiceManager::new(&db);
        let companies = services
            .companies
            .get_all_companies(Tracking::ReadOnly)
            .await
            .expect("list");
        assert_eq!(companies.len(), 2);
        assert_eq!(companies[0].name, "Alpha");
        assert_eq!(companies[1].name, "Beta");
    }

    #[tokio::test]
    async fn get_company_maps_missing_row_to_not_found() {
        let (db, _dir) = setup().await;
        let services = ServiceManager::new(&db);

        let absent = Uuid::new_v4().to_string();
        let err = services
            .companies
            .get_company(&absent, Tracking::ReadOnly)
            .await
            .expect_err("lookup should fail");
        assert!(matches!(err, ServiceError::NotFound { entity: "company", .. }));
    }

    #[tokio::test]
    async fn get_company_rejects_malformed_identifier() {
        let (db, _dir) = setup().await;
        let services = ServiceManager::new(&db);

        let err = services
            .companies
            .get_company("not-a-uuid", Tracking::ReadOnly)
            .await
            .expect_err("lookup should fail");
        assert!(matches!(err, ServiceError::Validation { field: "id", .. }));
    }

    #[tokio::test]
    async fn employee_reads_flow_through_the_shared_unit_of_work() {
        let (db, _dir) = setup().await;
        let company = Company::new("Acme", "12 Main St", "US");
        let employee = Employee::new("Sam Doe", 34, "Engineer", company.id.clone());

        let mut unit = db.unit_of_work();
        unit.companies().create(&company);
        unit.employees().create(&employee);
        unit.save().await.expect("seed commit");

        let services = ServiceManager::new(&db);
        let employees = services
            .employees
            .get_employees_for_company(&company.id, Tracking::ReadOnly)
            .await
            .expect("list");
        assert_eq!(employees, vec![employee]);
    }
}
