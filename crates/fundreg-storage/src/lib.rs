//! Storage seam for fundreg: the `FundStore`/`WarningStore` traits plus
//! the Postgres and in-memory backends.

use async_trait::async_trait;
use fundreg_core::{Company, FundDetail, FundManager, FundWithAliases, WarningView};
use serde::Deserialize;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "fundreg-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("the alias '{0}' is already taken")]
    AliasTaken(String),
    #[error("fund manager {0} does not exist")]
    UnknownManager(i64),
    #[error("company {0} does not exist")]
    UnknownCompany(i64),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Input for an atomic fund create: the fund row plus its aliases and
/// company links, applied in one transaction.
#[derive(Debug, Clone, Default)]
pub struct NewFund {
    pub name: String,
    pub start_year: i32,
    pub fund_manager_id: i64,
    pub aliases: Vec<String>,
    pub company_ids: Vec<i64>,
}

/// Partial fund update. `aliases`/`company_ids` present means wholesale
/// replacement of the respective association set.
#[derive(Debug, Clone, Default)]
pub struct FundUpdate {
    pub name: Option<String>,
    pub start_year: Option<i32>,
    pub fund_manager_id: Option<i64>,
    pub aliases: Option<Vec<String>>,
    pub company_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FundFilter {
    pub name: Option<String>,
    pub fund_manager_id: Option<i64>,
    pub start_year: Option<i32>,
    pub company_id: Option<i64>,
}

/// Durable store of funds, managers, companies, and aliases.
///
/// Listings and the duplicate-scan query exclude tombstoned rows; point
/// lookups for the warnings view do not (see `WarningStore`).
#[async_trait]
pub trait FundStore: Send + Sync {
    async fn create_manager(&self, name: &str) -> Result<FundManager, StoreError>;
    async fn list_managers(&self) -> Result<Vec<FundManager>, StoreError>;
    async fn delete_manager(&self, id: i64) -> Result<(), StoreError>;

    async fn create_company(&self, name: &str) -> Result<Company, StoreError>;
    async fn list_companies(&self) -> Result<Vec<Company>, StoreError>;
    async fn delete_company(&self, id: i64) -> Result<(), StoreError>;

    async fn create_fund(&self, new_fund: &NewFund) -> Result<FundDetail, StoreError>;
    async fn update_fund(&self, id: i64, update: &FundUpdate) -> Result<FundDetail, StoreError>;
    async fn delete_fund(&self, id: i64) -> Result<(), StoreError>;
    async fn fund_by_id(&self, id: i64) -> Result<Option<FundDetail>, StoreError>;
    async fn list_funds(&self, filter: &FundFilter) -> Result<Vec<FundDetail>, StoreError>;

    /// Non-tombstoned funds sharing `manager_id`, excluding
    /// `exclude_fund_id`, with aliases eagerly loaded. This feeds the
    /// duplicate scan; the tombstone filter here is correctness-critical.
    async fn list_active_funds_by_manager(
        &self,
        manager_id: i64,
        exclude_fund_id: i64,
    ) -> Result<Vec<FundWithAliases>, StoreError>;
}

/// Durable store of duplicate warnings, queryable by either-order pair
/// equality.
#[async_trait]
pub trait WarningStore: Send + Sync {
    /// True when a warning exists for the unordered pair `{a, b}`,
    /// resolved or not.
    async fn warning_exists_for_pair(&self, a: i64, b: i64) -> Result<bool, StoreError>;

    /// Insert an unresolved warning for the pair in the given order.
    /// Returns `false` when a concurrent insert for the same unordered
    /// pair already won; never produces a second row for a pair.
    async fn insert_warning(&self, fund_id_1: i64, fund_id_2: i64) -> Result<bool, StoreError>;

    async fn list_unresolved(&self) -> Result<Vec<WarningView>, StoreError>;

    async fn mark_resolved(&self, id: i64) -> Result<(), StoreError>;
}
