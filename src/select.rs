// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: select  —  which firmware image gets applied
//
//  Catalog mode: the catalog's best eligible release, if it is newer than
//  what the device runs. Manual mode: whatever the operator pointed at.
//  Pure and deterministic: same identity + inputs, same answer.
// ─────────────────────────────────────────────────────────────────────────────

use std::fmt;
use std::path::PathBuf;

use crate::catalog::ReleaseCatalog;
use crate::identity::DeviceIdentity;
use crate::orchestrator::{NoUpdateReason, UpdateFailure};

/// Where an image lives before the transfer starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Path(PathBuf),
    Url(String),
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Path(p) => write!(f, "{}", p.display()),
            ImageRef::Url(u)  => f.write_str(u),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Operator,
    Catalog,
}

/// The image handed to the update supervisor. Immutable once selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateImage {
    pub firmware:   ImageRef,
    pub init:       Option<ImageRef>,
    pub version:    Option<String>,
    /// Expected SHA-256 of the firmware image, hex encoded.
    pub sha256:     Option<String>,
    pub provenance: Provenance,
}

/// Image paths supplied on the command line. `firmware` is required but
/// kept optional here so its absence surfaces as a workflow failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualImage {
    pub firmware: Option<PathBuf>,
    pub init:     Option<PathBuf>,
}

impl ManualImage {
    pub fn to_update_image(&self) -> Result<UpdateImage, UpdateFailure> {
        let firmware = self.firmware.clone().ok_or(UpdateFailure::NoImageSpecified)?;
        Ok(UpdateImage {
            firmware:   ImageRef::Path(firmware),
            init:       self.init.clone().map(ImageRef::Path),
            version:    None,
            sha256:     None,
            provenance: Provenance::Operator,
        })
    }
}

/// Decide the image for this device. A catalog, when given, takes precedence.
pub fn select(
    identity: &DeviceIdentity,
    manual: Option<&ManualImage>,
    catalog: Option<&ReleaseCatalog>,
) -> Result<UpdateImage, UpdateFailure> {
    if let Some(catalog) = catalog {
        let release = catalog
            .best_release(identity)
            .ok_or(UpdateFailure::NoUpdates(NoUpdateReason::NoRelease))?;

        if !catalog.is_newer(release, identity.current_version()) {
            return Err(UpdateFailure::NoUpdates(NoUpdateReason::UpToDate {
                latest: release.version.clone(),
            }));
        }

        return Ok(UpdateImage {
            firmware:   ImageRef::Url(release.firmware_url.clone()),
            init:       release.init_url.clone().map(ImageRef::Url),
            version:    Some(release.version.clone()),
            sha256:     release.sha256.clone(),
            provenance: Provenance::Catalog,
        });
    }

    match manual {
        Some(manual) => manual.to_update_image(),
        None => Err(UpdateFailure::NoImageSpecified),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn catalog(json: &str, include_beta: bool) -> ReleaseCatalog {
        ReleaseCatalog::from_json(json, include_beta).unwrap()
    }

    fn device(version: &str) -> DeviceIdentity {
        DeviceIdentity::from_dis(
            Some("Adafruit Industries".into()),
            Some("BLESPIFRIEND".into()),
            Some(version.into()),
            Some("S110 8.0.0, 0.2".into()),
        )
    }

    const TWO_RELEASES: &str = r#"{ "boards": { "BLESPIFRIEND": { "releases": [
        { "version": "1.0", "firmware_url": "https://fw/1.0.hex" },
        { "version": "2.0", "firmware_url": "https://fw/2.0.hex", "init_url": "https://fw/2.0.dat", "beta": true }
    ] } } }"#;

    #[test]
    fn catalog_picks_newer_release() {
        let cat = catalog(TWO_RELEASES, true);
        let image = select(&device("1.0"), None, Some(&cat)).unwrap();
        assert_eq!(
            image,
            UpdateImage {
                firmware:   ImageRef::Url("https://fw/2.0.hex".into()),
                init:       Some(ImageRef::Url("https://fw/2.0.dat".into())),
                version:    Some("2.0".into()),
                sha256:     None,
                provenance: Provenance::Catalog,
            }
        );
    }

    #[test]
    fn up_to_date_reports_latest_eligible_version() {
        let cat = catalog(TWO_RELEASES, false);
        assert_eq!(
            select(&device("2.0"), None, Some(&cat)),
            Err(UpdateFailure::NoUpdates(NoUpdateReason::UpToDate { latest: "1.0".into() }))
        );
    }

    #[test]
    fn unknown_board_has_no_release() {
        let cat = catalog(r#"{ "boards": {} }"#, true);
        assert_eq!(
            select(&device("1.0"), None, Some(&cat)),
            Err(UpdateFailure::NoUpdates(NoUpdateReason::NoRelease))
        );
    }

    #[test]
    fn catalog_mode_ignores_manual_image() {
        let cat = catalog(r#"{ "boards": {} }"#, false);
        let manual = ManualImage { firmware: Some("/tmp/x.hex".into()), init: None };
        assert!(select(&device("1.0"), Some(&manual), Some(&cat)).is_err());
    }

    #[test]
    fn selection_is_deterministic() {
        let cat = catalog(TWO_RELEASES, true);
        let id = device("1.5");
        let first = select(&id, None, Some(&cat));
        for _ in 0..10 {
            assert_eq!(select(&id, None, Some(&cat)), first);
        }
    }

    #[test]
    fn manual_mode_uses_operator_paths() {
        let manual = ManualImage {
            firmware: Some("build/app.hex".into()),
            init:     Some("build/app.dat".into()),
        };
        let image = select(&device("1.0"), Some(&manual), None).unwrap();
        assert_eq!(image.firmware, ImageRef::Path("build/app.hex".into()));
        assert_eq!(image.init, Some(ImageRef::Path("build/app.dat".into())));
        assert_eq!(image.provenance, Provenance::Operator);
        assert_eq!(image.version, None);
    }

    #[test]
    fn manual_mode_requires_firmware() {
        let manual = ManualImage { firmware: None, init: Some("app.dat".into()) };
        assert_eq!(
            select(&device("1.0"), Some(&manual), None),
            Err(UpdateFailure::NoImageSpecified)
        );
        assert_eq!(select(&device("1.0"), None, None), Err(UpdateFailure::NoImageSpecified));
    }
}
