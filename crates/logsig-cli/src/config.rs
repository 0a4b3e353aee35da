//! Optional TOML configuration; command-line flags win over it.
//!
//! ```toml
//! [service]
//! key_hex = "…64 hex digits…"
//! signer_id = "gateway-1"
//! clock_start = 1700000000   # fixed clock for reproducible output
//! clock_step = 1
//!
//! [verify]
//! continue_on_fail = true
//! client_id = "^gateway-[0-9]+$"
//! time_diff = 3600
//! ```

use anyhow::{bail, Context, Result};
use logsig_crypto::{Clock, LocalService};
use serde::Deserialize;
use std::path::Path;

/// Whole file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub service: ServiceConfig,
    pub verify: VerifyConfig,
}

/// `[service]`
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub key_hex: Option<String>,
    pub signer_id: String,
    pub clock_start: Option<u64>,
    pub clock_step: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            key_hex: None,
            signer_id: "logsig-local".into(),
            clock_start: None,
            clock_step: 1,
        }
    }
}

/// `[verify]`
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyConfig {
    pub continue_on_fail: bool,
    pub client_id: Option<String>,
    pub time_diff: Option<i64>,
    pub check_record_times: bool,
}

impl Config {
    /// Read `path`, or the defaults when no path was given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// The local signing service, keyed by `key_flag` (flag or
    /// `LOGSIG_KEY`) or else the configured key.
    pub fn service(&self, key_flag: Option<&str>) -> Result<LocalService> {
        let Some(key_hex) = key_flag.or(self.service.key_hex.as_deref()) else {
            bail!(logsig_core::Error::argument(
                "no signing key: pass --key, set LOGSIG_KEY or service.key_hex in the config"
            ));
        };
        let key = parse_key(key_hex)?;
        let svc = LocalService::new(key, self.service.signer_id.clone());
        Ok(match self.service.clock_start {
            Some(start) => svc.with_clock(Clock::stepping(start, self.service.clock_step)),
            None => svc,
        })
    }
}

fn parse_key(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s.trim())
        .map_err(|e| logsig_core::Error::argument(format!("signing key is not hex: {e}")))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        logsig_core::Error::argument(format!("signing key must be 32 bytes, got {len}")).into()
    })
}
