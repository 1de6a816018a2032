// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: error
// ─────────────────────────────────────────────────────────────────────────────

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DfuError {
    #[error("Invalid configuration in {path}: {message}")]
    Config { path: String, message: String },

    #[error("Failed to download release catalog from {url}: {message}\n  Hint: check the network or pass --catalog-url")]
    CatalogDownload { url: String, message: String },

    #[error("No release catalog configured\n  Hint: set catalog_url in config.toml, BLE_DFU_CATALOG_URL or --catalog-url")]
    NoCatalogUrl,

    #[error("Release catalog is not valid JSON: {0}")]
    CatalogParse(String),

    #[error("This build has no Bluetooth radio backend\n  Hint: rebuild with `cargo build --features ble-central`")]
    NoRadioBackend,

    #[error(transparent)]
    Unavailable(#[from] crate::radio::AdapterUnavailable),

    #[error(transparent)]
    Radio(#[from] crate::radio::RadioError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DfuError>;
