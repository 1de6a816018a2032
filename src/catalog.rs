// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: catalog  —  remote firmware release catalog
//
//  Catalog JSON format (hosted at `catalog_url`):
//
//  {
//    "boards": {
//      "BLEFRIEND32": {
//        "releases": [
//          {
//            "version":        "0.7.7",
//            "firmware_url":   "https://…/blefriend32_s110_xxac_0_7_7.hex",
//            "init_url":       null,
//            "sha256":         "9f2c…",          (optional, of the firmware image)
//            "beta":           false,
//            "min_bootloader": "0.2"             (optional)
//          }
//        ]
//      }
//    }
//  }
//
//  Boards are keyed by the model number the peripheral reports. The catalog
//  is downloaded once per run and cached on disk:
//    ~/.cache/ble-dfu/catalog.json   (refreshed after catalog_cache_ttl_secs)
// ─────────────────────────────────────────────────────────────────────────────

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{DfuError, Result};
use crate::identity::DeviceIdentity;

// ─────────────────────────────────────────────────────────────────────────────
//  Data model
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub version:      String,
    pub firmware_url: String,
    #[serde(default)]
    pub init_url:     Option<String>,
    #[serde(default)]
    pub sha256:       Option<String>,
    #[serde(default)]
    pub beta:         bool,
    #[serde(default)]
    pub min_bootloader: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardReleases {
    #[serde(default)]
    pub releases: Vec<Release>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseCatalog {
    #[serde(default)]
    pub boards: BTreeMap<String, BoardReleases>,
    /// Whether beta releases are eligible. Chosen per run, never read from JSON.
    #[serde(skip)]
    pub include_beta: bool,
}

impl ReleaseCatalog {
    /// Parse catalog JSON and order every board's releases newest first.
    pub fn from_json(text: &str, include_beta: bool) -> Result<Self> {
        let mut catalog: ReleaseCatalog =
            serde_json::from_str(text).map_err(|e| DfuError::CatalogParse(e.to_string()))?;
        catalog.include_beta = include_beta;
        for board in catalog.boards.values_mut() {
            // Stable: equal versions keep their catalog order.
            board
                .releases
                .sort_by(|a, b| compare_versions(&b.version, &a.version));
        }
        Ok(catalog)
    }

    /// Releases listed for the device's model, newest first.
    pub fn releases_for(&self, identity: &DeviceIdentity) -> &[Release] {
        let Some(model) = identity.model.as_deref() else {
            return &[];
        };
        self.boards
            .get(model)
            .or_else(|| {
                self.boards
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(model))
                    .map(|(_, board)| board)
            })
            .map(|board| board.releases.as_slice())
            .unwrap_or(&[])
    }

    /// The first release this device may install, honouring the beta toggle
    /// and each release's bootloader floor.
    pub fn best_release(&self, identity: &DeviceIdentity) -> Option<&Release> {
        self.releases_for(identity)
            .iter()
            .find(|r| self.is_eligible(r, identity))
    }

    fn is_eligible(&self, release: &Release, identity: &DeviceIdentity) -> bool {
        if release.beta && !self.include_beta {
            return false;
        }
        match (&release.min_bootloader, &identity.bootloader) {
            (Some(min), Some(have)) => compare_versions(have, min) != Ordering::Less,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// True when `release` is strictly newer than what the device runs.
    /// An unknown current version never counts as older.
    pub fn is_newer(&self, release: &Release, current: Option<&str>) -> bool {
        match current {
            Some(current) => compare_versions(&release.version, current) == Ordering::Greater,
            None => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Version ordering
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Part<'a> {
    Num(u64),
    Text(&'a str),
}

fn parts(version: &str) -> Vec<Part<'_>> {
    let mut out = Vec::new();
    let bytes = version.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        if bytes[i].is_ascii_digit() {
            while i < bytes.len() && bytes[i].is_ascii_digit() { i += 1; }
            let digits = &version[start..i];
            out.push(Part::Num(digits.parse().unwrap_or(u64::MAX)));
        } else if bytes[i].is_ascii_alphabetic() {
            while i < bytes.len() && bytes[i].is_ascii_alphabetic() { i += 1; }
            out.push(Part::Text(&version[start..i]));
        } else {
            // '.', '-', '_', whitespace and anything else only separate parts
            i += 1;
        }
    }
    out
}

/// Numeric-aware version comparison.
///
/// `"0.10.0" > "0.9.1"`, `"1.0" == "1.0.0"`, `"1.0.0-beta" < "1.0.0"`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (pa, pb) = (parts(a), parts(b));
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let ord = match (pa.get(i), pb.get(i)) {
            (Some(Part::Num(x)), Some(Part::Num(y))) => x.cmp(y),
            (Some(Part::Text(x)), Some(Part::Text(y))) => x.to_ascii_lowercase().cmp(&y.to_ascii_lowercase()),
            (Some(Part::Num(_)), Some(Part::Text(_))) => Ordering::Greater,
            (Some(Part::Text(_)), Some(Part::Num(_))) => Ordering::Less,
            (Some(Part::Num(x)), None) => x.cmp(&0),
            (None, Some(Part::Num(y))) => 0.cmp(y),
            (Some(Part::Text(_)), None) => Ordering::Less,
            (None, Some(Part::Text(_))) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

// ─────────────────────────────────────────────────────────────────────────────
//  Fetching & caching
// ─────────────────────────────────────────────────────────────────────────────

/// Where the catalog comes from and how long a cached copy stays valid.
#[derive(Debug, Clone)]
pub struct CatalogSource {
    pub url:        String,
    pub cache_path: Option<PathBuf>,
    pub ttl:        Duration,
    /// Ignore a fresh cache and download anyway.
    pub refresh:    bool,
}

/// Load the catalog, preferring a fresh on-disk copy.
///
/// A failed download falls back to a stale cache when one exists.
pub fn load(source: &CatalogSource, include_beta: bool) -> Result<ReleaseCatalog> {
    load_with(source, include_beta, download)
}

/// [`load`] with the HTTP fetch supplied by the caller.
pub fn load_with<F>(source: &CatalogSource, include_beta: bool, fetch: F) -> Result<ReleaseCatalog>
where
    F: FnOnce(&str) -> Result<String>,
{
    let cache = source.cache_path.as_deref();

    if let Some(path) = cache.filter(|_| !source.refresh) {
        if let Some(age) = file_age(path) {
            if age < source.ttl {
                log::debug!("using cached catalog {} ({} s old)", path.display(), age.as_secs());
                match read_cached(path, include_beta) {
                    Ok(catalog) => return Ok(catalog),
                    Err(e) => log::warn!("ignoring unreadable catalog cache: {}", e),
                }
            }
        }
    }

    match fetch(&source.url) {
        Ok(body) => {
            let catalog = ReleaseCatalog::from_json(&body, include_beta)?;
            if let Some(path) = cache {
                if let Err(e) = write_cache(path, &body) {
                    log::warn!("could not write catalog cache {}: {}", path.display(), e);
                }
            }
            Ok(catalog)
        }
        Err(e) => match cache.filter(|p| p.exists()) {
            Some(path) => {
                log::warn!("{}; falling back to cached catalog {}", e, path.display());
                read_cached(path, include_beta)
            }
            None => Err(e),
        },
    }
}

fn download(url: &str) -> Result<String> {
    let resp = ureq::get(url).call().map_err(|e| DfuError::CatalogDownload {
        url:     url.to_owned(),
        message: e.to_string(),
    })?;

    let mut body = String::new();
    resp.into_reader()
        .read_to_string(&mut body)
        .map_err(|e| DfuError::CatalogDownload {
            url:     url.to_owned(),
            message: format!("failed to read response body: {}", e),
        })?;
    Ok(body)
}

fn read_cached(path: &Path, include_beta: bool) -> Result<ReleaseCatalog> {
    let text = fs::read_to_string(path)?;
    ReleaseCatalog::from_json(&text, include_beta)
}

fn write_cache(path: &Path, body: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, body)
}

fn file_age(path: &Path) -> Option<Duration> {
    let mtime = fs::metadata(path).ok()?.modified().ok()?;
    let mtime = mtime.duration_since(UNIX_EPOCH).ok()?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    Some(now.saturating_sub(mtime))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "boards": {
            "BLEFRIEND32": {
                "releases": [
                    { "version": "0.6.7", "firmware_url": "https://fw/0.6.7.hex" },
                    { "version": "0.7.0", "firmware_url": "https://fw/0.7.0.hex",
                      "init_url": "https://fw/0.7.0.dat", "min_bootloader": "0.2" },
                    { "version": "0.8.0-rc1", "firmware_url": "https://fw/0.8.0.hex", "beta": true }
                ]
            },
            "Feather52": { "releases": [] }
        }
    }"#;

    fn device(model: &str, software: &str, bootloader: &str) -> DeviceIdentity {
        DeviceIdentity {
            model: Some(model.to_owned()),
            software_revision: Some(software.to_owned()),
            bootloader: Some(bootloader.to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn version_ordering() {
        use Ordering::*;
        assert_eq!(compare_versions("0.10.0", "0.9.1"), Greater);
        assert_eq!(compare_versions("1.0", "1.0.0"), Equal);
        assert_eq!(compare_versions("2.0", "1.0"), Greater);
        assert_eq!(compare_versions("1.0.0-beta", "1.0.0"), Less);
        assert_eq!(compare_versions("1.0.0-beta", "1.0.0-rc"), Less);
        assert_eq!(compare_versions("0.7.0", "0.7.0"), Equal);
        assert_eq!(compare_versions("v1.2", "V1.2"), Equal);
    }

    #[test]
    fn releases_are_sorted_newest_first() {
        let catalog = ReleaseCatalog::from_json(CATALOG, true).unwrap();
        let versions: Vec<&str> = catalog.boards["BLEFRIEND32"]
            .releases
            .iter()
            .map(|r| r.version.as_str())
            .collect();
        assert_eq!(versions, vec!["0.8.0-rc1", "0.7.0", "0.6.7"]);
    }

    #[test]
    fn beta_toggle_filters_releases() {
        let id = device("BLEFRIEND32", "0.6.7", "0.2");

        let stable = ReleaseCatalog::from_json(CATALOG, false).unwrap();
        assert_eq!(stable.best_release(&id).map(|r| r.version.as_str()), Some("0.7.0"));

        let beta = ReleaseCatalog::from_json(CATALOG, true).unwrap();
        assert_eq!(beta.best_release(&id).map(|r| r.version.as_str()), Some("0.8.0-rc1"));
    }

    #[test]
    fn bootloader_floor_skips_release() {
        let catalog = ReleaseCatalog::from_json(CATALOG, false).unwrap();
        let old_bootloader = device("BLEFRIEND32", "0.6.0", "0.1");
        assert_eq!(
            catalog.best_release(&old_bootloader).map(|r| r.version.as_str()),
            Some("0.6.7")
        );
    }

    #[test]
    fn model_lookup_falls_back_to_case_insensitive() {
        let catalog = ReleaseCatalog::from_json(CATALOG, false).unwrap();
        assert_eq!(catalog.releases_for(&device("blefriend32", "0", "0.2")).len(), 3);
        assert!(catalog.releases_for(&device("Unknown", "0", "0.2")).is_empty());
        assert!(catalog.best_release(&device("Feather52", "0", "0.2")).is_none());
        assert!(catalog.releases_for(&DeviceIdentity::default()).is_empty());
    }

    #[test]
    fn newer_check() {
        let catalog = ReleaseCatalog::from_json(CATALOG, false).unwrap();
        let id = device("BLEFRIEND32", "0.6.7", "0.2");
        let best = catalog.best_release(&id).unwrap();
        assert!(catalog.is_newer(best, Some("0.6.7")));
        assert!(!catalog.is_newer(best, Some("0.7.0")));
        assert!(!catalog.is_newer(best, Some("0.9")));
        assert!(!catalog.is_newer(best, None));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            ReleaseCatalog::from_json("{ boards: ", false),
            Err(DfuError::CatalogParse(_))
        ));
    }

    fn source(cache_path: Option<PathBuf>, refresh: bool) -> CatalogSource {
        CatalogSource {
            url: "https://fw.example/catalog.json".into(),
            cache_path,
            ttl: Duration::from_secs(3600),
            refresh,
        }
    }

    fn refused(url: &str) -> Result<String> {
        Err(DfuError::CatalogDownload { url: url.to_owned(), message: "connection refused".into() })
    }

    #[test]
    fn fresh_cache_is_used_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("catalog.json");
        fs::write(&cache, CATALOG).unwrap();

        let catalog = load_with(&source(Some(cache), false), false, |url| {
            panic!("fetched {} despite a fresh cache", url)
        })
        .unwrap();
        assert!(catalog.boards.contains_key("BLEFRIEND32"));
        assert!(!catalog.include_beta);
    }

    #[test]
    fn download_is_written_to_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("nested").join("catalog.json");

        let catalog = load_with(&source(Some(cache.clone()), false), false, |url| {
            assert_eq!(url, "https://fw.example/catalog.json");
            Ok(CATALOG.to_owned())
        })
        .unwrap();
        assert_eq!(catalog.boards.len(), 2);
        assert_eq!(fs::read_to_string(&cache).unwrap(), CATALOG);
    }

    #[test]
    fn failed_refresh_falls_back_to_stale_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("catalog.json");
        fs::write(&cache, CATALOG).unwrap();

        let catalog = load_with(&source(Some(cache), true), true, refused).unwrap();
        assert!(catalog.include_beta);
    }

    #[test]
    fn download_failure_without_cache_is_an_error() {
        assert!(matches!(
            load_with(&source(None, false), false, refused),
            Err(DfuError::CatalogDownload { .. })
        ));
    }

    #[test]
    fn bad_download_keeps_old_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("catalog.json");
        fs::write(&cache, CATALOG).unwrap();

        let result = load_with(&source(Some(cache.clone()), true), false, |_| Ok("<html>".to_owned()));
        assert!(matches!(result, Err(DfuError::CatalogParse(_))));
        assert_eq!(fs::read_to_string(&cache).unwrap(), CATALOG);
    }
}
