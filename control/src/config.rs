//! Configuration for the gatehouse controller
//!
//! Static settings come from `GATEHOUSE_*` environment variables. ACME
//! settings are read from the global ConfigMap on every change, so they can
//! be updated without a restart.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use tracing::warn;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Controller name, as written in IngressClass and GatewayClass objects
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// Ingress class this controller serves
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,

    /// Also serve ingresses without any class
    #[serde(default)]
    pub watch_ingress_without_class: bool,

    /// Only convert HTTPRoutes attached to this Gateway (all routes when unset)
    #[serde(default)]
    pub gateway_name: Option<String>,

    /// Read EndpointSlices instead of the legacy Endpoints API
    #[serde(default = "default_true")]
    pub use_endpoint_slices: bool,

    /// Global ConfigMap, `namespace/name`
    #[serde(default)]
    pub global_config_map: Option<String>,

    /// TCP services ConfigMap, `namespace/name`
    #[serde(default)]
    pub tcp_config_map: Option<String>,

    /// Delay between reconciliation cycles (default: 5s)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Period of the full certificate check (default: 24h)
    #[serde(default = "default_acme_check_period")]
    pub acme_check_period_secs: u64,

    /// Keep terminating pods as zero weight endpoints until they are gone
    #[serde(default)]
    pub drain_support: bool,

    /// Bind address of the ACME challenge, metrics and health server
    #[serde(default = "default_control_bind_addr")]
    pub control_bind_addr: String,

    /// Watch a Kubernetes cluster instead of running standalone
    #[serde(default)]
    pub k8s_mode: bool,
}

fn default_controller_name() -> String {
    "gatehouse.io/ingress-controller".to_string()
}

fn default_ingress_class() -> String {
    "gatehouse".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sync_interval() -> u64 {
    5
}

fn default_acme_check_period() -> u64 {
    24 * 60 * 60
}

fn default_control_bind_addr() -> String {
    "0.0.0.0:10254".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_name: default_controller_name(),
            ingress_class: default_ingress_class(),
            watch_ingress_without_class: false,
            gateway_name: None,
            use_endpoint_slices: default_true(),
            global_config_map: None,
            tcp_config_map: None,
            sync_interval_secs: default_sync_interval(),
            acme_check_period_secs: default_acme_check_period(),
            drain_support: false,
            control_bind_addr: default_control_bind_addr(),
            k8s_mode: false,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("GATEHOUSE_CONTROLLER_NAME") {
            config.controller_name = val;
        }

        if let Some(val) = lookup("GATEHOUSE_INGRESS_CLASS") {
            config.ingress_class = val;
        }

        if let Some(val) = lookup("GATEHOUSE_WATCH_INGRESS_WITHOUT_CLASS") {
            config.watch_ingress_without_class = val.parse()?;
        }

        if let Some(val) = lookup("GATEHOUSE_GATEWAY_NAME") {
            config.gateway_name = Some(val).filter(|v| !v.is_empty());
        }

        if let Some(val) = lookup("GATEHOUSE_USE_ENDPOINT_SLICES") {
            config.use_endpoint_slices = val.parse()?;
        }

        if let Some(val) = lookup("GATEHOUSE_CONFIGMAP") {
            config.global_config_map = Some(val).filter(|v| !v.is_empty());
        }

        if let Some(val) = lookup("GATEHOUSE_TCP_SERVICES_CONFIGMAP") {
            config.tcp_config_map = Some(val).filter(|v| !v.is_empty());
        }

        if let Some(val) = lookup("GATEHOUSE_SYNC_INTERVAL_SECS") {
            config.sync_interval_secs = val.parse()?;
        }

        if let Some(val) = lookup("GATEHOUSE_ACME_CHECK_PERIOD_SECS") {
            config.acme_check_period_secs = val.parse()?;
        }

        if let Some(val) = lookup("GATEHOUSE_DRAIN_SUPPORT") {
            config.drain_support = val.parse()?;
        }

        if let Some(val) = lookup("GATEHOUSE_CONTROL_BIND_ADDR") {
            config.control_bind_addr = val;
        }

        if let Some(val) = lookup("GATEHOUSE_K8S_MODE") {
            config.k8s_mode = val.parse()?;
        }

        Ok(config)
    }
}

/// Global ConfigMap key of the ACME directory endpoint
pub const ACME_ENDPOINT_KEY: &str = "acme-endpoint";
/// Global ConfigMap key of the comma separated account emails
pub const ACME_EMAILS_KEY: &str = "acme-emails";
/// Global ConfigMap key accepting the CA terms of service
pub const ACME_TERMS_AGREED_KEY: &str = "acme-terms-agreed";
/// Global ConfigMap key of the renewal window, in days
pub const ACME_EXPIRING_KEY: &str = "acme-expiring";

const DEFAULT_ACME_EXPIRING_DAYS: i64 = 30;
/// Longest accepted renewal window, ten years
const MAX_ACME_EXPIRING_DAYS: i64 = 3650;

/// ACME settings of the global ConfigMap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeSettings {
    pub endpoint: String,
    pub emails: String,
    pub terms_agreed: bool,
    pub expiring_days: i64,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            emails: String::new(),
            terms_agreed: false,
            expiring_days: DEFAULT_ACME_EXPIRING_DAYS,
        }
    }
}

impl AcmeSettings {
    /// Read the ACME keys; invalid values fall back to their defaults
    pub fn from_config_map(data: &BTreeMap<String, String>) -> Self {
        let mut settings = Self::default();

        if let Some(val) = data.get(ACME_ENDPOINT_KEY) {
            settings.endpoint = val.trim().to_string();
        }

        if let Some(val) = data.get(ACME_EMAILS_KEY) {
            settings.emails = val.trim().to_string();
        }

        if let Some(val) = data.get(ACME_TERMS_AGREED_KEY) {
            match val.trim().parse() {
                Ok(agreed) => settings.terms_agreed = agreed,
                Err(_) => warn!("ignoring invalid {}: '{}'", ACME_TERMS_AGREED_KEY, val),
            }
        }

        if let Some(val) = data.get(ACME_EXPIRING_KEY) {
            match val.trim().parse::<i64>() {
                Ok(days) if (1..=MAX_ACME_EXPIRING_DAYS).contains(&days) => {
                    settings.expiring_days = days
                }
                _ => warn!("ignoring invalid {}: '{}'", ACME_EXPIRING_KEY, val),
            }
        }

        settings
    }

    pub fn expiring(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::try_days(self.expiring_days)
            .unwrap_or_else(|| chrono::TimeDelta::days(DEFAULT_ACME_EXPIRING_DAYS))
    }
}
