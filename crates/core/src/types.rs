use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A company known to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub address: String,
    pub country: String,
}

impl Company {
    /// Builds a company with a freshly generated identity.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            address: address.into(),
            country: country.into(),
        }
    }
}

/// An employee attached to exactly one company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: String,
    pub name: String,
    pub age: u32,
    pub position: String,
    pub company_id: String,
}

impl Employee {
    /// Builds an employee with a freshly generated identity.
    pub fn new(
        name: impl Into<String>,
        age: u32,
        position: impl Into<String>,
        company_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            age,
            position: position.into(),
            company_id: company_id.into(),
        }
    }
}
