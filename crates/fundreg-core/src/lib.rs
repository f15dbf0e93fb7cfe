//! Core domain model and duplicate-matching logic for fundreg.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundreg-core";

/// A fund manager. Soft-deletable; `deleted_at` set means tombstoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundManager {
    pub id: i64,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A portfolio company. Same lifecycle as [`FundManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An investment fund row. Aliases and company links are held separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fund {
    pub id: i64,
    pub name: String,
    pub start_year: i32,
    pub fund_manager_id: i64,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An alternate fund name. Alias names are globally unique across funds,
/// enforced by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub id: i64,
    pub name: String,
    pub fund_id: i64,
}

/// A fund with its alias names eagerly loaded, the unit the duplicate
/// scan operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundWithAliases {
    pub id: i64,
    pub name: String,
    pub fund_manager_id: i64,
    pub aliases: Vec<String>,
}

impl FundWithAliases {
    /// The fund's identifier set: its name plus every alias name.
    pub fn identifiers(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRef {
    pub id: i64,
    pub name: String,
}

/// A fund joined with everything the read surface displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundDetail {
    pub id: i64,
    pub name: String,
    pub start_year: i32,
    pub fund_manager_id: i64,
    pub fund_manager_name: String,
    pub aliases: Vec<String>,
    pub companies: Vec<CompanyRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FundDetail {
    pub fn scan_view(&self) -> FundWithAliases {
        FundWithAliases {
            id: self.id,
            name: self.name.clone(),
            fund_manager_id: self.fund_manager_id,
            aliases: self.aliases.clone(),
        }
    }
}

/// Transient detection result: two fund ids believed to name the same
/// real-world fund. The pair is in detection order; consumers treat it
/// as unordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateSignal {
    pub signal_id: Uuid,
    pub fund_id: i64,
    pub matched_fund_id: i64,
    pub detected_at: DateTime<Utc>,
}

impl DuplicateSignal {
    pub fn new(fund_id: i64, matched_fund_id: i64) -> Self {
        Self {
            signal_id: Uuid::new_v4(),
            fund_id,
            matched_fund_id,
            detected_at: Utc::now(),
        }
    }
}

/// Durable record of a detected duplicate pair, enriched with both funds'
/// detail for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningView {
    pub id: i64,
    pub fund_id_1: i64,
    pub fund_id_2: i64,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fund1: Option<FundDetail>,
    pub fund2: Option<FundDetail>,
}

/// True iff any identifier in `a` equals any identifier in `b` under
/// ASCII case-insensitive, otherwise byte-exact, comparison. No trimming
/// and no Unicode folding: `"Fund X"` matches `"FUND X"` but not
/// `"Fund  X"`.
pub fn identifier_sets_match<A, B>(a: &[A], b: &[B]) -> bool
where
    A: AsRef<str>,
    B: AsRef<str>,
{
    a.iter().any(|candidate| {
        b.iter()
            .any(|existing| candidate.as_ref().eq_ignore_ascii_case(existing.as_ref()))
    })
}
