//! Purchase-code licensing.
//!
//! A purchase code is checked against an external authority (the Envato
//! market API in production). Successful checks are stored as
//! [`LicenseRecord`]s keyed by `(module, purchase_code)` and are valid for one
//! year from the moment of verification.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::marketplace::{read_fresh_cache, CACHE_TTL};
use crate::operations::write_atomic;

/// Persisted verification state for one purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub id: u64,
    pub module: String,
    pub purchase_code: String,
    /// Authority response, stored verbatim.
    pub verification_data: serde_json::Value,
    pub valid_until: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Something that can vouch for a purchase code.
pub trait PurchaseAuthority: Send + Sync {
    /// Return the authority's payload for a valid code.
    fn verify_purchase(&self, purchase_code: &str) -> Result<serde_json::Value>;

    /// Resolve a download URL for the item bought with `purchase_code`.
    fn download_url(&self, purchase_code: &str) -> Result<String>;

    /// Everything the token's owner has bought, as the authority reports it.
    fn purchases(&self) -> Result<serde_json::Value>;

    /// Catalog search by `term`, optionally narrowed to a `category`.
    fn search_items(&self, term: &str, category: Option<&str>) -> Result<serde_json::Value>;
}

/// Envato market API client.
///
/// The purchase list is cached for 24 hours in
/// `<cache_dir>/envato_purchases_<md5 of token>.json` when a cache directory
/// is set.
pub struct EnvatoClient {
    client: reqwest::blocking::Client,
    api_url: String,
    token: String,
    cache_dir: Option<PathBuf>,
}

impl EnvatoClient {
    pub fn new(api_url: &str, token: &str, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("moduledepot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            cache_dir: None,
        })
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    /// Cache file for this token's purchase list.
    pub fn purchases_cache_path(&self) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(purchases_cache_file_name(&self.token)))
    }

    fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.api_url, path);
        debug!(url = %url, "Calling Envato API");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .map_err(|e| anyhow!("Envato API request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("Envato API error ({}): {}", status, body);
        }

        response
            .json()
            .map_err(|e| anyhow!("Failed to parse Envato API response: {}", e))
    }
}

impl PurchaseAuthority for EnvatoClient {
    fn verify_purchase(&self, purchase_code: &str) -> Result<serde_json::Value> {
        self.get_json("/market/author/sale", &[("code", purchase_code)])
    }

    fn download_url(&self, purchase_code: &str) -> Result<String> {
        let sale = self.verify_purchase(purchase_code)?;
        let item_id = item_field(&sale, "id").context("Purchase has no item id")?;

        let data = self.get_json(
            "/market/buyer/download",
            &[("item_id", item_id.as_str()), ("purchase_code", purchase_code)],
        )?;
        data.get("download_url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .context("Envato returned no download URL")
    }

    fn purchases(&self) -> Result<serde_json::Value> {
        let cache_path = self.purchases_cache_path();
        if let Some(path) = &cache_path {
            if let Some(cached) = read_fresh_cache(path, CACHE_TTL) {
                debug!(path = ?path, "Using cached purchase list");
                return Ok(cached);
            }
        }

        let purchases = self.get_json("/market/buyer/purchases", &[])?;
        if let Some(path) = &cache_path {
            let contents = serde_json::to_vec_pretty(&purchases)?;
            if let Err(e) = write_atomic(path, &contents) {
                warn!(path = ?path, error = %e, "Failed to cache purchase list");
            }
        }
        Ok(purchases)
    }

    fn search_items(&self, term: &str, category: Option<&str>) -> Result<serde_json::Value> {
        let mut query = vec![("term", term)];
        if let Some(category) = category.filter(|c| !c.is_empty()) {
            query.push(("category", category));
        }
        self.get_json("/market/catalog/search", &query)
    }
}

/// `envato_purchases_<md5 of token>.json`
pub fn purchases_cache_file_name(token: &str) -> String {
    format!("envato_purchases_{:x}.json", md5::compute(token.as_bytes()))
}

/// `item.<field>` from an authority payload, numbers rendered as strings.
pub fn item_field(payload: &serde_json::Value, field: &str) -> Option<String> {
    match payload.get("item")?.get(field)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Module identifier for a marketplace item name: slugged with `_`, then
/// StudlyCased. `"Course Bundle Pro"` becomes `CourseBundlePro`; apostrophes
/// are dropped rather than splitting words (`"Bob's Forum"` is `BobsForum`).
pub fn module_name_from_item(item_name: &str) -> String {
    let cleaned = item_name.replace(['\'', '\u{2019}'], "");
    cleaned
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// End of the validity window for a check made at `now`.
pub fn valid_until_from(now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_add_months(Months::new(12))
        .unwrap_or_else(|| now + Duration::days(365))
}

/// JSON file holding every license record.
#[derive(Debug, Clone)]
pub struct LicenseStore {
    path: PathBuf,
}

impl LicenseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty store. Run once at setup.
    pub fn initialize(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        self.save(&[])
    }

    pub fn load(&self) -> Result<Vec<LicenseRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .context(format!("Failed to read license store: {:?}", self.path))?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents)
            .context(format!("Failed to parse license store: {:?}", self.path))
    }

    pub fn save(&self, records: &[LicenseRecord]) -> Result<()> {
        let content = serde_json::to_string_pretty(records)?;
        write_atomic(&self.path, content.as_bytes())
            .context(format!("Failed to save license store: {:?}", self.path))
    }

    /// Insert or refresh the record for `(module, purchase_code)`.
    pub fn upsert(
        &self,
        module: &str,
        purchase_code: &str,
        verification_data: serde_json::Value,
        valid_until: DateTime<Utc>,
    ) -> Result<LicenseRecord> {
        let mut records = self.load()?;
        let record = upsert_record(&mut records, module, purchase_code, verification_data, valid_until);
        self.save(&records)?;
        Ok(record)
    }

    pub fn find_by_module(&self, module: &str) -> Result<Option<LicenseRecord>> {
        Ok(self.load()?.into_iter().find(|r| r.module == module))
    }

    /// Drop every record for `module`, returning how many were removed.
    pub fn remove_module(&self, module: &str) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let mut records = self.load()?;
        let before = records.len();
        records.retain(|r| r.module != module);
        let removed = before - records.len();
        if removed > 0 {
            self.save(&records)?;
        }
        Ok(removed)
    }
}

fn upsert_record(
    records: &mut Vec<LicenseRecord>,
    module: &str,
    purchase_code: &str,
    verification_data: serde_json::Value,
    valid_until: DateTime<Utc>,
) -> LicenseRecord {
    let now = Utc::now();
    if let Some(existing) = records
        .iter_mut()
        .find(|r| r.module == module && r.purchase_code == purchase_code)
    {
        existing.verification_data = verification_data;
        existing.valid_until = valid_until;
        existing.updated_at = now;
        return existing.clone();
    }

    let id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
    let record = LicenseRecord {
        id,
        module: module.to_string(),
        purchase_code: purchase_code.to_string(),
        verification_data,
        valid_until,
        updated_at: now,
    };
    records.push(record.clone());
    record
}

/// A purchase the authority vouched for that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Purchase {
    pub module: String,
    pub purchase_code: String,
    pub payload: serde_json::Value,
}

/// Outcome of checking a single purchase code.
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Valid(LicenseRecord),
    Invalid { reason: String },
}

/// Per-module result of [`LicenseVerifier::verify_all`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LicenseStatus {
    Valid { valid_until: DateTime<Utc> },
    Invalid { message: String },
}

/// Checks purchase codes and keeps the license store current.
pub struct LicenseVerifier<'a> {
    authority: &'a dyn PurchaseAuthority,
    store: &'a LicenseStore,
}

impl<'a> LicenseVerifier<'a> {
    pub fn new(authority: &'a dyn PurchaseAuthority, store: &'a LicenseStore) -> Self {
        Self { authority, store }
    }

    /// Verify a purchase code and record it against the module it bought.
    pub fn verify(&self, purchase_code: &str) -> Result<Verification> {
        match self.check(purchase_code) {
            Ok(purchase) => Ok(Verification::Valid(self.record(purchase)?)),
            Err(reason) => Ok(Verification::Invalid { reason }),
        }
    }

    /// Ask the authority about a purchase code without storing anything.
    /// The error is the reason the code was refused.
    pub fn check(&self, purchase_code: &str) -> std::result::Result<Purchase, String> {
        let payload = self.authority.verify_purchase(purchase_code).map_err(|e| {
            warn!(error = %e, "Purchase verification failed");
            format!("License could not be verified: {}", e)
        })?;

        let item_name = item_field(&payload, "name")
            .ok_or_else(|| "Verification response names no item".to_string())?;
        Ok(Purchase {
            module: module_name_from_item(&item_name),
            purchase_code: purchase_code.to_string(),
            payload,
        })
    }

    /// Store a checked purchase, valid for a year from now.
    pub fn record(&self, purchase: Purchase) -> Result<LicenseRecord> {
        let record = self.store.upsert(
            &purchase.module,
            &purchase.purchase_code,
            purchase.payload,
            valid_until_from(Utc::now()),
        )?;

        info!(module = %record.module, valid_until = %record.valid_until, "Purchase verified");
        Ok(record)
    }

    /// Re-verify every stored record, carrying on past individual failures.
    pub fn verify_all(&self) -> Result<BTreeMap<String, LicenseStatus>> {
        let mut records = self.store.load()?;
        let mut results = BTreeMap::new();

        for record in records.iter_mut() {
            match self.authority.verify_purchase(&record.purchase_code) {
                Ok(payload) => {
                    let now = Utc::now();
                    record.verification_data = payload;
                    record.valid_until = valid_until_from(now);
                    record.updated_at = now;
                    results.insert(
                        record.module.clone(),
                        LicenseStatus::Valid {
                            valid_until: record.valid_until,
                        },
                    );
                }
                Err(e) => {
                    warn!(module = %record.module, error = %e, "License re-verification failed");
                    results.insert(
                        record.module.clone(),
                        LicenseStatus::Invalid {
                            message: format!("License could not be verified: {}", e),
                        },
                    );
                }
            }
        }

        self.store.save(&records)?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    struct FakeAuthority {
        failing: HashSet<String>,
    }

    impl PurchaseAuthority for FakeAuthority {
        fn verify_purchase(&self, code: &str) -> Result<serde_json::Value> {
            if self.failing.contains(code) {
                bail!("sale not found");
            }
            Ok(json!({"item": {"id": 42, "name": "Course Bundle Pro", "version": "2.0"}}))
        }

        fn download_url(&self, _code: &str) -> Result<String> {
            Ok("https://example.com/bundle.zip".to_string())
        }

        fn purchases(&self) -> Result<serde_json::Value> {
            Ok(json!({"results": []}))
        }

        fn search_items(&self, _term: &str, _category: Option<&str>) -> Result<serde_json::Value> {
            Ok(json!({"matches": []}))
        }
    }

    #[test]
    fn item_names_become_module_identifiers() {
        assert_eq!(module_name_from_item("Course Bundle Pro"), "CourseBundlePro");
        assert_eq!(module_name_from_item("zoom-meeting addon"), "ZoomMeetingAddon");
        assert_eq!(module_name_from_item("  LMS  "), "Lms");
        assert_eq!(module_name_from_item("Bob's Forum"), "BobsForum");
    }

    #[test]
    fn item_fields_accept_numbers() {
        let payload = json!({"item": {"id": 42, "name": "Blog", "blank": " "}});
        assert_eq!(item_field(&payload, "id").as_deref(), Some("42"));
        assert_eq!(item_field(&payload, "name").as_deref(), Some("Blog"));
        assert_eq!(item_field(&payload, "blank"), None);
        assert_eq!(item_field(&json!({}), "name"), None);
    }

    #[test]
    fn validity_is_one_year() {
        let now = DateTime::parse_from_rfc3339("2026-02-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            valid_until_from(now),
            DateTime::parse_from_rfc3339("2027-02-10T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
        );
    }

    #[test]
    fn upsert_is_keyed_on_module_and_code() {
        let dir = tempfile::tempdir().unwrap();
        let store = LicenseStore::new(dir.path().join("module_licenses.json"));
        store.initialize().unwrap();

        let until = valid_until_from(Utc::now());
        let first = store.upsert("Blog", "code-1", json!({"v": 1}), until).unwrap();
        let again = store.upsert("Blog", "code-1", json!({"v": 2}), until).unwrap();
        let other = store.upsert("Blog", "code-2", json!({"v": 3}), until).unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);

        let records = store.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].verification_data, json!({"v": 2}));

        assert_eq!(store.remove_module("Blog").unwrap(), 2);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn verify_records_the_purchased_module() {
        let dir = tempfile::tempdir().unwrap();
        let store = LicenseStore::new(dir.path().join("module_licenses.json"));
        let authority = FakeAuthority {
            failing: HashSet::new(),
        };

        let verifier = LicenseVerifier::new(&authority, &store);
        match verifier.verify("abc-123").unwrap() {
            Verification::Valid(record) => {
                assert_eq!(record.module, "CourseBundlePro");
                assert!(record.valid_until > Utc::now() + Duration::days(360));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(store.find_by_module("CourseBundlePro").unwrap().is_some());
    }

    #[test]
    fn rejected_code_is_invalid_and_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = LicenseStore::new(dir.path().join("module_licenses.json"));
        let authority = FakeAuthority {
            failing: ["bad".to_string()].into_iter().collect(),
        };

        let verifier = LicenseVerifier::new(&authority, &store);
        assert!(matches!(
            verifier.verify("bad").unwrap(),
            Verification::Invalid { .. }
        ));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn check_stores_nothing_until_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = LicenseStore::new(dir.path().join("module_licenses.json"));
        let authority = FakeAuthority {
            failing: HashSet::new(),
        };

        let verifier = LicenseVerifier::new(&authority, &store);
        let purchase = verifier.check("abc-123").unwrap();
        assert_eq!(purchase.module, "CourseBundlePro");
        assert!(store.load().unwrap().is_empty());

        let record = verifier.record(purchase).unwrap();
        assert_eq!(record.purchase_code, "abc-123");
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn purchases_come_from_a_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens on the discard port, so only the cache can answer.
        let client = EnvatoClient::new("http://127.0.0.1:9/v3", "token-1", std::time::Duration::from_secs(1))
            .unwrap()
            .with_cache_dir(dir.path());
        let cache = client.purchases_cache_path().unwrap();
        assert_eq!(
            cache.file_name().unwrap().to_string_lossy(),
            purchases_cache_file_name("token-1")
        );
        assert_ne!(purchases_cache_file_name("token-1"), purchases_cache_file_name("token-2"));

        fs::write(&cache, r#"{"results": [{"item": {"name": "Blog"}}]}"#).unwrap();
        let purchases = client.purchases().unwrap();
        assert_eq!(purchases["results"][0]["item"]["name"], "Blog");

        let uncached =
            EnvatoClient::new("http://127.0.0.1:9/v3", "token-1", std::time::Duration::from_secs(1))
                .unwrap();
        assert!(uncached.purchases_cache_path().is_none());
        assert!(uncached.purchases().is_err());
    }

    #[test]
    fn verify_all_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = LicenseStore::new(dir.path().join("module_licenses.json"));
        let stale = Utc::now() - Duration::days(10);
        for (module, code) in [("Blog", "c1"), ("Forum", "c2"), ("Quiz", "c3")] {
            store.upsert(module, code, json!({}), stale).unwrap();
        }

        let authority = FakeAuthority {
            failing: ["c2".to_string()].into_iter().collect(),
        };
        let results = LicenseVerifier::new(&authority, &store).verify_all().unwrap();

        assert_eq!(results.len(), 3);
        assert!(matches!(results["Blog"], LicenseStatus::Valid { .. }));
        assert!(matches!(results["Forum"], LicenseStatus::Invalid { .. }));
        assert!(matches!(results["Quiz"], LicenseStatus::Valid { .. }));

        let records = store.load().unwrap();
        let forum = records.iter().find(|r| r.module == "Forum").unwrap();
        let quiz = records.iter().find(|r| r.module == "Quiz").unwrap();
        assert_eq!(forum.valid_until, stale);
        assert!(quiz.valid_until > Utc::now());
    }
}
