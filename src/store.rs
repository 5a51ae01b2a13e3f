//! Collaborator seams for contracts, saved mappings and sales periods, with
//! in-memory implementations.

use crate::contract::Contract;
use crate::error::{Result, RoyaltyError};
use crate::schema::{LicenseeColumnMapping, SalesPeriod};
use crate::utils::validate_period;
use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{Mutex, RwLock};

/// Read-only contract lookup.
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn get_contract(&self, contract_id: &str) -> Result<Option<Contract>>;
}

/// Per-licensee memory of confirmed column mappings and category aliases.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get_column_mapping(&self, licensee: &str) -> Result<Option<LicenseeColumnMapping>>;

    /// Replaces the licensee's saved column mapping.
    async fn put_column_mapping(&self, mapping: LicenseeColumnMapping) -> Result<()>;

    /// Report category -> contract category aliases for the licensee.
    async fn get_category_aliases(&self, licensee: &str) -> Result<BTreeMap<String, String>>;

    /// Merges `aliases` into the licensee's saved aliases.
    async fn put_category_aliases(
        &self,
        licensee: &str,
        aliases: BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Persistence for confirmed sales periods.
#[async_trait]
pub trait SalesPeriodStore: Send + Sync {
    /// Records for `contract_id` whose range intersects `[start, end]`.
    async fn find_overlapping(
        &self,
        contract_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SalesPeriod>>;

    /// Checks for overlaps and writes `record` as one atomic step.
    ///
    /// Without `override_existing` any overlap is a `PeriodConflict`. With it,
    /// a single record covering the identical period is replaced in place
    /// (the id is kept); otherwise every overlapping record is removed and
    /// listed in `supersedes`.
    async fn commit(&self, record: SalesPeriod, override_existing: bool) -> Result<SalesPeriod>;

    async fn list(&self, contract_id: &str) -> Result<Vec<SalesPeriod>>;
}

fn licensee_key(licensee: &str) -> String {
    licensee.trim().to_lowercase()
}

#[derive(Default)]
pub struct InMemoryContractStore {
    contracts: RwLock<HashMap<String, Contract>>,
}

impl InMemoryContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, contract: Contract) {
        self.contracts
            .write()
            .await
            .insert(contract.id.clone(), contract);
    }
}

#[async_trait]
impl ContractStore for InMemoryContractStore {
    async fn get_contract(&self, contract_id: &str) -> Result<Option<Contract>> {
        Ok(self.contracts.read().await.get(contract_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryMappingStore {
    columns: RwLock<HashMap<String, LicenseeColumnMapping>>,
    aliases: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl InMemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn get_column_mapping(&self, licensee: &str) -> Result<Option<LicenseeColumnMapping>> {
        Ok(self
            .columns
            .read()
            .await
            .get(&licensee_key(licensee))
            .cloned())
    }

    async fn put_column_mapping(&self, mapping: LicenseeColumnMapping) -> Result<()> {
        let key = licensee_key(&mapping.licensee_name);
        self.columns.write().await.insert(key, mapping);
        Ok(())
    }

    async fn get_category_aliases(&self, licensee: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .aliases
            .read()
            .await
            .get(&licensee_key(licensee))
            .cloned()
            .unwrap_or_default())
    }

    async fn put_category_aliases(
        &self,
        licensee: &str,
        aliases: BTreeMap<String, String>,
    ) -> Result<()> {
        self.aliases
            .write()
            .await
            .entry(licensee_key(licensee))
            .or_default()
            .extend(aliases);
        Ok(())
    }
}

/// Sales periods keyed by contract. One lock covers check and write.
#[derive(Default)]
pub struct InMemorySalesPeriodStore {
    periods: Mutex<HashMap<String, Vec<SalesPeriod>>>,
}

impl InMemorySalesPeriodStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SalesPeriodStore for InMemorySalesPeriodStore {
    async fn find_overlapping(
        &self,
        contract_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SalesPeriod>> {
        let periods = self.periods.lock().await;
        Ok(periods
            .get(contract_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|p| p.overlaps(start, end))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, mut record: SalesPeriod, override_existing: bool) -> Result<SalesPeriod> {
        validate_period(record.period_start, record.period_end)?;

        let mut periods = self.periods.lock().await;
        let records = periods.entry(record.contract_id.clone()).or_default();
        let overlapping: Vec<&SalesPeriod> = records
            .iter()
            .filter(|p| p.overlaps(record.period_start, record.period_end))
            .collect();

        if !overlapping.is_empty() {
            if !override_existing {
                return Err(RoyaltyError::PeriodConflict {
                    contract_id: record.contract_id.clone(),
                    start: record.period_start,
                    end: record.period_end,
                    overlapping: overlapping.iter().map(|p| p.summary()).collect(),
                });
            }

            let same_period = overlapping.len() == 1
                && overlapping[0].period_start == record.period_start
                && overlapping[0].period_end == record.period_end;
            if same_period {
                record.id = overlapping[0].id;
                debug!("Replacing sales period {} in place", record.id);
            } else {
                record.supersedes = overlapping.iter().map(|p| p.id).collect();
                debug!("Superseding sales periods {:?}", record.supersedes);
            }
            let start = record.period_start;
            let end = record.period_end;
            records.retain(|p| !p.overlaps(start, end));
        }

        records.push(record.clone());
        records.sort_by_key(|p| p.period_start);
        info!(
            "Stored sales period {} for contract {} ({} to {})",
            record.id, record.contract_id, record.period_start, record.period_end
        );
        Ok(record)
    }

    async fn list(&self, contract_id: &str) -> Result<Vec<SalesPeriod>> {
        Ok(self
            .periods
            .lock()
            .await
            .get(contract_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnMapping;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(start: NaiveDate, end: NaiveDate) -> SalesPeriod {
        SalesPeriod {
            id: Uuid::new_v4(),
            contract_id: "c-1".to_string(),
            period_start: start,
            period_end: end,
            net_sales: dec!(1000),
            category_breakdown: None,
            calculated_royalty: dec!(80),
            licensee_reported_royalty: None,
            discrepancy_amount: None,
            has_discrepancy: false,
            minimum_applied: false,
            upload_id: None,
            source_filename: None,
            supersedes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_conflict_without_override() {
        let store = InMemorySalesPeriodStore::new();
        let q1 = record(date(2024, 1, 1), date(2024, 3, 31));
        store.commit(q1.clone(), false).await.unwrap();

        let err = store
            .commit(record(date(2024, 1, 1), date(2024, 3, 31)), false)
            .await
            .unwrap_err();
        match err {
            RoyaltyError::PeriodConflict { overlapping, .. } => {
                assert_eq!(overlapping.len(), 1);
                assert_eq!(overlapping[0].id, q1.id);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.list("c-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_override_same_period_keeps_id() {
        let store = InMemorySalesPeriodStore::new();
        let q1 = record(date(2024, 1, 1), date(2024, 3, 31));
        store.commit(q1.clone(), false).await.unwrap();

        let mut replacement = record(date(2024, 1, 1), date(2024, 3, 31));
        replacement.net_sales = dec!(2000);
        let stored = store.commit(replacement, true).await.unwrap();
        assert_eq!(stored.id, q1.id);
        assert!(stored.supersedes.is_empty());

        let all = store.list("c-1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].net_sales, dec!(2000));
    }

    #[tokio::test]
    async fn test_override_spanning_period_supersedes() {
        let store = InMemorySalesPeriodStore::new();
        let jan = record(date(2024, 1, 1), date(2024, 1, 31));
        let feb = record(date(2024, 2, 1), date(2024, 2, 29));
        let apr = record(date(2024, 4, 1), date(2024, 4, 30));
        for r in [&jan, &feb, &apr] {
            store.commit(r.clone(), false).await.unwrap();
        }

        let quarter = record(date(2024, 1, 1), date(2024, 3, 31));
        let quarter_id = quarter.id;
        let stored = store.commit(quarter, true).await.unwrap();
        assert_eq!(stored.id, quarter_id);
        assert_eq!(stored.supersedes, vec![jan.id, feb.id]);

        let remaining: Vec<Uuid> = store.list("c-1").await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(remaining, vec![quarter_id, apr.id]);
    }

    #[tokio::test]
    async fn test_other_contracts_do_not_conflict() {
        let store = InMemorySalesPeriodStore::new();
        store
            .commit(record(date(2024, 1, 1), date(2024, 3, 31)), false)
            .await
            .unwrap();
        let mut other = record(date(2024, 1, 1), date(2024, 3, 31));
        other.contract_id = "c-2".to_string();
        assert!(store.commit(other, false).await.is_ok());
        assert!(store
            .find_overlapping("c-2", date(2024, 2, 1), date(2024, 2, 2))
            .await
            .unwrap()
            .len()
            == 1);
    }

    #[tokio::test]
    async fn test_mapping_store_keys_by_normalized_licensee() {
        let store = InMemoryMappingStore::new();
        let mut mapping = ColumnMapping::new();
        mapping.assign("Net Rev", crate::schema::SemanticField::NetSales);
        store
            .put_column_mapping(LicenseeColumnMapping {
                licensee_name: "Acme Apparel".to_string(),
                column_mapping: mapping,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(store
            .get_column_mapping("  acme apparel ")
            .await
            .unwrap()
            .is_some());

        let mut first = BTreeMap::new();
        first.insert("Tops".to_string(), "Apparel".to_string());
        store.put_category_aliases("Acme Apparel", first).await.unwrap();
        let mut second = BTreeMap::new();
        second.insert("Kicks".to_string(), "Footwear".to_string());
        store.put_category_aliases("ACME APPAREL", second).await.unwrap();

        let aliases = store.get_category_aliases("acme apparel").await.unwrap();
        assert_eq!(aliases.len(), 2);
    }
}
