//! In-memory backend. Backs the test suites and mirrors the Postgres
//! backend's semantics, including alias uniqueness and the
//! one-row-per-unordered-pair warning guarantee.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundreg_core::{Alias, Company, CompanyRef, Fund, FundDetail, FundManager, FundWithAliases, WarningView};
use tokio::sync::Mutex;

use crate::{FundFilter, FundStore, FundUpdate, NewFund, StoreError, WarningStore};

#[derive(Debug, Clone)]
struct WarningRow {
    id: i64,
    fund_id_1: i64,
    fund_id_2: i64,
    resolved: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    managers: Vec<FundManager>,
    companies: Vec<Company>,
    funds: Vec<Fund>,
    aliases: Vec<Alias>,
    company_fund: Vec<(i64, i64)>,
    warnings: Vec<WarningRow>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn live_manager(&self, id: i64) -> Option<&FundManager> {
        self.managers
            .iter()
            .find(|m| m.id == id && m.deleted_at.is_none())
    }

    fn live_company(&self, id: i64) -> Option<&Company> {
        self.companies
            .iter()
            .find(|c| c.id == id && c.deleted_at.is_none())
    }

    fn alias_taken(&self, name: &str) -> bool {
        self.aliases.iter().any(|a| a.name == name)
    }

    fn fund_aliases(&self, fund_id: i64) -> Vec<String> {
        self.aliases
            .iter()
            .filter(|a| a.fund_id == fund_id)
            .map(|a| a.name.clone())
            .collect()
    }

    fn fund_companies(&self, fund_id: i64) -> Vec<CompanyRef> {
        self.company_fund
            .iter()
            .filter(|(fid, _)| *fid == fund_id)
            .filter_map(|(_, cid)| {
                self.companies.iter().find(|c| c.id == *cid).map(|c| CompanyRef {
                    id: c.id,
                    name: c.name.clone(),
                })
            })
            .collect()
    }

    /// Detail for any fund, tombstoned or not (warnings keep rendering
    /// both sides after a soft delete).
    fn detail_any(&self, fund_id: i64) -> Option<FundDetail> {
        let fund = self.funds.iter().find(|f| f.id == fund_id)?;
        let manager_name = self
            .managers
            .iter()
            .find(|m| m.id == fund.fund_manager_id)
            .map(|m| m.name.clone())
            .unwrap_or_default();
        Some(FundDetail {
            id: fund.id,
            name: fund.name.clone(),
            start_year: fund.start_year,
            fund_manager_id: fund.fund_manager_id,
            fund_manager_name: manager_name,
            aliases: self.fund_aliases(fund.id),
            companies: self.fund_companies(fund.id),
            created_at: fund.created_at,
            updated_at: fund.updated_at,
        })
    }

    /// The Postgres backend gets rollback for free from its transaction;
    /// here every check runs before the first mutation instead.
    fn check_aliases_free(&self, owner_fund_id: i64, names: &[String]) -> Result<(), StoreError> {
        for (index, name) in names.iter().enumerate() {
            let taken_elsewhere = self
                .aliases
                .iter()
                .any(|a| a.fund_id != owner_fund_id && a.name == *name);
            let duplicated_in_request = names[..index].contains(name);
            if taken_elsewhere || duplicated_in_request {
                return Err(StoreError::AliasTaken(name.clone()));
            }
        }
        Ok(())
    }

    fn check_companies_exist(&self, company_ids: &[i64]) -> Result<(), StoreError> {
        for cid in company_ids {
            if self.live_company(*cid).is_none() {
                return Err(StoreError::UnknownCompany(*cid));
            }
        }
        Ok(())
    }

    fn replace_aliases(&mut self, fund_id: i64, names: &[String]) {
        self.aliases.retain(|a| a.fund_id != fund_id);
        for name in names {
            let id = self.next_id();
            self.aliases.push(Alias {
                id,
                name: name.clone(),
                fund_id,
            });
        }
    }

    fn sync_companies(&mut self, fund_id: i64, company_ids: &[i64]) {
        self.company_fund.retain(|(fid, _)| *fid != fund_id);
        for cid in company_ids {
            if !self.company_fund.contains(&(fund_id, *cid)) {
                self.company_fund.push((fund_id, *cid));
            }
        }
    }
}

/// Mutex-guarded in-memory store. The single lock makes every
/// check-then-insert atomic, which trivially serializes warning inserts
/// per pair.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FundStore for MemoryStore {
    async fn create_manager(&self, name: &str) -> Result<FundManager, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let manager = FundManager {
            id: inner.next_id(),
            name: name.to_string(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.managers.push(manager.clone());
        Ok(manager)
    }

    async fn list_managers(&self) -> Result<Vec<FundManager>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .managers
            .iter()
            .filter(|m| m.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn delete_manager(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let manager = inner
            .managers
            .iter_mut()
            .find(|m| m.id == id && m.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;
        let now = Utc::now();
        manager.deleted_at = Some(now);
        manager.updated_at = now;
        Ok(())
    }

    async fn create_company(&self, name: &str) -> Result<Company, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let company = Company {
            id: inner.next_id(),
            name: name.to_string(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.companies.push(company.clone());
        Ok(company)
    }

    async fn list_companies(&self) -> Result<Vec<Company>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .companies
            .iter()
            .filter(|c| c.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn delete_company(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let company = inner
            .companies
            .iter_mut()
            .find(|c| c.id == id && c.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;
        let now = Utc::now();
        company.deleted_at = Some(now);
        company.updated_at = now;
        Ok(())
    }

    async fn create_fund(&self, new_fund: &NewFund) -> Result<FundDetail, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.live_manager(new_fund.fund_manager_id).is_none() {
            return Err(StoreError::UnknownManager(new_fund.fund_manager_id));
        }
        inner.check_aliases_free(0, &new_fund.aliases)?;
        inner.check_companies_exist(&new_fund.company_ids)?;
        let now = Utc::now();
        let fund_id = inner.next_id();
        inner.funds.push(Fund {
            id: fund_id,
            name: new_fund.name.clone(),
            start_year: new_fund.start_year,
            fund_manager_id: new_fund.fund_manager_id,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        });
        inner.replace_aliases(fund_id, &new_fund.aliases);
        inner.sync_companies(fund_id, &new_fund.company_ids);
        inner.detail_any(fund_id).ok_or(StoreError::NotFound)
    }

    async fn update_fund(&self, id: i64, update: &FundUpdate) -> Result<FundDetail, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner
            .funds
            .iter()
            .any(|f| f.id == id && f.deleted_at.is_none())
        {
            return Err(StoreError::NotFound);
        }
        if let Some(manager_id) = update.fund_manager_id {
            if inner.live_manager(manager_id).is_none() {
                return Err(StoreError::UnknownManager(manager_id));
            }
        }
        if let Some(aliases) = &update.aliases {
            inner.check_aliases_free(id, aliases)?;
        }
        if let Some(company_ids) = &update.company_ids {
            inner.check_companies_exist(company_ids)?;
        }
        let now = Utc::now();
        {
            let fund = inner
                .funds
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or(StoreError::NotFound)?;
            if let Some(name) = &update.name {
                fund.name = name.clone();
            }
            if let Some(start_year) = update.start_year {
                fund.start_year = start_year;
            }
            if let Some(manager_id) = update.fund_manager_id {
                fund.fund_manager_id = manager_id;
            }
            fund.updated_at = now;
        }
        if let Some(aliases) = &update.aliases {
            inner.replace_aliases(id, aliases);
        }
        if let Some(company_ids) = &update.company_ids {
            inner.sync_companies(id, company_ids);
        }
        inner.detail_any(id).ok_or(StoreError::NotFound)
    }

    async fn delete_fund(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let fund = inner
            .funds
            .iter_mut()
            .find(|f| f.id == id && f.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;
        let now = Utc::now();
        fund.deleted_at = Some(now);
        fund.updated_at = now;
        Ok(())
    }

    async fn fund_by_id(&self, id: i64) -> Result<Option<FundDetail>, StoreError> {
        let inner = self.inner.lock().await;
        let live = inner
            .funds
            .iter()
            .any(|f| f.id == id && f.deleted_at.is_none());
        Ok(if live { inner.detail_any(id) } else { None })
    }

    async fn list_funds(&self, filter: &FundFilter) -> Result<Vec<FundDetail>, StoreError> {
        let inner = self.inner.lock().await;
        let name_needle = filter.name.as_ref().map(|n| n.to_ascii_lowercase());
        let mut out = Vec::new();
        for fund in inner.funds.iter().filter(|f| f.deleted_at.is_none()) {
            if let Some(needle) = &name_needle {
                if !fund.name.to_ascii_lowercase().contains(needle) {
                    continue;
                }
            }
            if let Some(manager_id) = filter.fund_manager_id {
                if fund.fund_manager_id != manager_id {
                    continue;
                }
            }
            if let Some(start_year) = filter.start_year {
                if fund.start_year != start_year {
                    continue;
                }
            }
            if let Some(company_id) = filter.company_id {
                if !inner.company_fund.contains(&(fund.id, company_id)) {
                    continue;
                }
            }
            if let Some(detail) = inner.detail_any(fund.id) {
                out.push(detail);
            }
        }
        Ok(out)
    }

    async fn list_active_funds_by_manager(
        &self,
        manager_id: i64,
        exclude_fund_id: i64,
    ) -> Result<Vec<FundWithAliases>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .funds
            .iter()
            .filter(|f| {
                f.fund_manager_id == manager_id && f.id != exclude_fund_id && f.deleted_at.is_none()
            })
            .map(|f| FundWithAliases {
                id: f.id,
                name: f.name.clone(),
                fund_manager_id: f.fund_manager_id,
                aliases: inner.fund_aliases(f.id),
            })
            .collect())
    }
}

#[async_trait]
impl WarningStore for MemoryStore {
    async fn warning_exists_for_pair(&self, a: i64, b: i64) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.warnings.iter().any(|w| {
            (w.fund_id_1 == a && w.fund_id_2 == b) || (w.fund_id_1 == b && w.fund_id_2 == a)
        }))
    }

    async fn insert_warning(&self, fund_id_1: i64, fund_id_2: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let exists = inner.warnings.iter().any(|w| {
            (w.fund_id_1 == fund_id_1 && w.fund_id_2 == fund_id_2)
                || (w.fund_id_1 == fund_id_2 && w.fund_id_2 == fund_id_1)
        });
        if exists {
            return Ok(false);
        }
        let now = Utc::now();
        let id = inner.next_id();
        inner.warnings.push(WarningRow {
            id,
            fund_id_1,
            fund_id_2,
            resolved: false,
            created_at: now,
            updated_at: now,
        });
        Ok(true)
    }

    async fn list_unresolved(&self) -> Result<Vec<WarningView>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .warnings
            .iter()
            .filter(|w| !w.resolved)
            .map(|w| WarningView {
                id: w.id,
                fund_id_1: w.fund_id_1,
                fund_id_2: w.fund_id_2,
                resolved: w.resolved,
                created_at: w.created_at,
                updated_at: w.updated_at,
                fund1: inner.detail_any(w.fund_id_1),
                fund2: inner.detail_any(w.fund_id_2),
            })
            .collect())
    }

    async fn mark_resolved(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let warning = inner
            .warnings
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or(StoreError::NotFound)?;
        warning.resolved = true;
        warning.updated_at = Utc::now();
        Ok(())
    }
}
