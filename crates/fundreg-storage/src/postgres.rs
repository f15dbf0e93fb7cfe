//! Postgres backend on sqlx, with embedded migrations.

use async_trait::async_trait;
use fundreg_core::{Company, CompanyRef, FundDetail, FundManager, FundWithAliases, WarningView};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::info;

use crate::{FundFilter, FundStore, FundUpdate, NewFund, StoreError, WarningStore};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fund_aliases(&self, fund_id: i64) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM aliases WHERE fund_id = $1 ORDER BY id")
                .bind(fund_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }

    async fn fund_companies(&self, fund_id: i64) -> Result<Vec<CompanyRef>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.id, c.name FROM companies c \
             JOIN company_fund cf ON cf.company_id = c.id \
             WHERE cf.fund_id = $1 ORDER BY c.id",
        )
        .bind(fund_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(CompanyRef {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    async fn detail_from_row(&self, row: &PgRow) -> Result<FundDetail, StoreError> {
        let id: i64 = row.try_get("id")?;
        Ok(FundDetail {
            id,
            name: row.try_get("name")?,
            start_year: row.try_get("start_year")?,
            fund_manager_id: row.try_get("fund_manager_id")?,
            fund_manager_name: row.try_get("fund_manager_name")?,
            aliases: self.fund_aliases(id).await?,
            companies: self.fund_companies(id).await?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Detail for any fund, tombstoned or not. Warning views need detail
    /// for funds that were soft-deleted after the warning was recorded.
    async fn detail_any(&self, fund_id: i64) -> Result<Option<FundDetail>, StoreError> {
        let row = sqlx::query(
            "SELECT f.id, f.name, f.start_year, f.fund_manager_id, \
                    m.name AS fund_manager_name, f.created_at, f.updated_at \
             FROM funds f JOIN fund_managers m ON m.id = f.fund_manager_id \
             WHERE f.id = $1",
        )
        .bind(fund_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.detail_from_row(&row).await?)),
            None => Ok(None),
        }
    }
}

fn alias_insert_error(name: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::AliasTaken(name.to_string())
        }
        _ => StoreError::Database(err),
    }
}

async fn insert_aliases(
    tx: &mut Transaction<'_, Postgres>,
    fund_id: i64,
    names: &[String],
) -> Result<(), StoreError> {
    for name in names {
        sqlx::query("INSERT INTO aliases (name, fund_id) VALUES ($1, $2)")
            .bind(name)
            .bind(fund_id)
            .execute(&mut **tx)
            .await
            .map_err(|err| alias_insert_error(name, err))?;
    }
    Ok(())
}

async fn sync_companies(
    tx: &mut Transaction<'_, Postgres>,
    fund_id: i64,
    company_ids: &[i64],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM company_fund WHERE fund_id = $1")
        .bind(fund_id)
        .execute(&mut **tx)
        .await?;
    for company_id in company_ids {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM companies WHERE id = $1 AND deleted_at IS NULL)",
        )
        .bind(*company_id)
        .fetch_one(&mut **tx)
        .await?;
        if !exists {
            return Err(StoreError::UnknownCompany(*company_id));
        }
        sqlx::query(
            "INSERT INTO company_fund (fund_id, company_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(fund_id)
        .bind(*company_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn manager_is_live(
    tx: &mut Transaction<'_, Postgres>,
    manager_id: i64,
) -> Result<bool, StoreError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM fund_managers WHERE id = $1 AND deleted_at IS NULL)",
    )
    .bind(manager_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(exists)
}

fn manager_from_row(row: &PgRow) -> Result<FundManager, StoreError> {
    Ok(FundManager {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn company_from_row(row: &PgRow) -> Result<Company, StoreError> {
    Ok(Company {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl FundStore for PgStore {
    async fn create_manager(&self, name: &str) -> Result<FundManager, StoreError> {
        let row = sqlx::query(
            "INSERT INTO fund_managers (name) VALUES ($1) \
             RETURNING id, name, deleted_at, created_at, updated_at",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        manager_from_row(&row)
    }

    async fn list_managers(&self) -> Result<Vec<FundManager>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, deleted_at, created_at, updated_at \
             FROM fund_managers WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(manager_from_row).collect()
    }

    async fn delete_manager(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE fund_managers SET deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn create_company(&self, name: &str) -> Result<Company, StoreError> {
        let row = sqlx::query(
            "INSERT INTO companies (name) VALUES ($1) \
             RETURNING id, name, deleted_at, created_at, updated_at",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        company_from_row(&row)
    }

    async fn list_companies(&self) -> Result<Vec<Company>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, deleted_at, created_at, updated_at \
             FROM companies WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(company_from_row).collect()
    }

    async fn delete_company(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE companies SET deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn create_fund(&self, new_fund: &NewFund) -> Result<FundDetail, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !manager_is_live(&mut tx, new_fund.fund_manager_id).await? {
            return Err(StoreError::UnknownManager(new_fund.fund_manager_id));
        }
        let fund_id: i64 = sqlx::query_scalar(
            "INSERT INTO funds (name, start_year, fund_manager_id) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&new_fund.name)
        .bind(new_fund.start_year)
        .bind(new_fund.fund_manager_id)
        .fetch_one(&mut *tx)
        .await?;
        insert_aliases(&mut tx, fund_id, &new_fund.aliases).await?;
        sync_companies(&mut tx, fund_id, &new_fund.company_ids).await?;
        tx.commit().await?;
        self.detail_any(fund_id).await?.ok_or(StoreError::NotFound)
    }

    async fn update_fund(&self, id: i64, update: &FundUpdate) -> Result<FundDetail, StoreError> {
        let mut tx = self.pool.begin().await?;
        let live: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM funds WHERE id = $1 AND deleted_at IS NULL)",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if !live {
            return Err(StoreError::NotFound);
        }
        if let Some(manager_id) = update.fund_manager_id {
            if !manager_is_live(&mut tx, manager_id).await? {
                return Err(StoreError::UnknownManager(manager_id));
            }
        }
        sqlx::query(
            "UPDATE funds SET name = COALESCE($2, name), \
                              start_year = COALESCE($3, start_year), \
                              fund_manager_id = COALESCE($4, fund_manager_id), \
                              updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(update.name.as_deref())
        .bind(update.start_year)
        .bind(update.fund_manager_id)
        .execute(&mut *tx)
        .await?;
        if let Some(aliases) = &update.aliases {
            sqlx::query("DELETE FROM aliases WHERE fund_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            insert_aliases(&mut tx, id, aliases).await?;
        }
        if let Some(company_ids) = &update.company_ids {
            sync_companies(&mut tx, id, company_ids).await?;
        }
        tx.commit().await?;
        self.detail_any(id).await?.ok_or(StoreError::NotFound)
    }

    async fn delete_fund(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE funds SET deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn fund_by_id(&self, id: i64) -> Result<Option<FundDetail>, StoreError> {
        let live: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM funds WHERE id = $1 AND deleted_at IS NULL)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if !live {
            return Ok(None);
        }
        self.detail_any(id).await
    }

    async fn list_funds(&self, filter: &FundFilter) -> Result<Vec<FundDetail>, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT f.id, f.name, f.start_year, f.fund_manager_id, \
                    m.name AS fund_manager_name, f.created_at, f.updated_at \
             FROM funds f JOIN fund_managers m ON m.id = f.fund_manager_id \
             WHERE f.deleted_at IS NULL",
        );
        if let Some(name) = &filter.name {
            query.push(" AND f.name ILIKE ");
            query.push_bind(format!("%{name}%"));
        }
        if let Some(manager_id) = filter.fund_manager_id {
            query.push(" AND f.fund_manager_id = ");
            query.push_bind(manager_id);
        }
        if let Some(start_year) = filter.start_year {
            query.push(" AND f.start_year = ");
            query.push_bind(start_year);
        }
        if let Some(company_id) = filter.company_id {
            query.push(
                " AND EXISTS (SELECT 1 FROM company_fund cf \
                 WHERE cf.fund_id = f.id AND cf.company_id = ",
            );
            query.push_bind(company_id);
            query.push(")");
        }
        query.push(" ORDER BY f.id");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.detail_from_row(row).await?);
        }
        Ok(out)
    }

    async fn list_active_funds_by_manager(
        &self,
        manager_id: i64,
        exclude_fund_id: i64,
    ) -> Result<Vec<FundWithAliases>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, fund_manager_id FROM funds \
             WHERE fund_manager_id = $1 AND id <> $2 AND deleted_at IS NULL \
             ORDER BY id",
        )
        .bind(manager_id)
        .bind(exclude_fund_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            out.push(FundWithAliases {
                id,
                name: row.try_get("name")?,
                fund_manager_id: row.try_get("fund_manager_id")?,
                aliases: self.fund_aliases(id).await?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl WarningStore for PgStore {
    async fn warning_exists_for_pair(&self, a: i64, b: i64) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM duplicate_warnings \
             WHERE (fund_id_1 = $1 AND fund_id_2 = $2) \
                OR (fund_id_1 = $2 AND fund_id_2 = $1))",
        )
        .bind(a)
        .bind(b)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_warning(&self, fund_id_1: i64, fund_id_2: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO duplicate_warnings (fund_id_1, fund_id_2) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(fund_id_1)
        .bind(fund_id_2)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_unresolved(&self) -> Result<Vec<WarningView>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, fund_id_1, fund_id_2, resolved, created_at, updated_at \
             FROM duplicate_warnings WHERE resolved = FALSE ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let fund_id_1: i64 = row.try_get("fund_id_1")?;
            let fund_id_2: i64 = row.try_get("fund_id_2")?;
            out.push(WarningView {
                id: row.try_get("id")?,
                fund_id_1,
                fund_id_2,
                resolved: row.try_get("resolved")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
                fund1: self.detail_any(fund_id_1).await?,
                fund2: self.detail_any(fund_id_2).await?,
            });
        }
        Ok(out)
    }

    async fn mark_resolved(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE duplicate_warnings SET resolved = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
