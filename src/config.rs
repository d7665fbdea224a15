use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};

pub const DEFAULT_UID: i64 = 1000;
pub const ENFORCE_LABEL: &str = "pod-security.kubernetes.io/enforce";
pub const PRIVILEGED: &str = "privileged";

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_tls_cert_path() -> String {
    "/certs/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/certs/tls.key".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_uid() -> i64 {
    DEFAULT_UID
}

fn default_opt_out_label() -> String {
    ENFORCE_LABEL.to_string()
}

fn default_opt_out_value() -> String {
    PRIVILEGED.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardenerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// The externally observable policy: who opts out, and which UID is injected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_uid")]
    pub default_uid: i64,
    #[serde(default = "default_opt_out_label")]
    pub opt_out_label: String,
    #[serde(default = "default_opt_out_value")]
    pub opt_out_value: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_uid: default_uid(),
            opt_out_label: default_opt_out_label(),
            opt_out_value: default_opt_out_value(),
        }
    }
}

impl HardenerConfig {
    pub fn load(path: &str) -> Result<Self, Box<figment::Error>> {
        Self::from_figment(Figment::new().merge(Yaml::file(path)))
    }

    fn from_figment(figment: Figment) -> Result<Self, Box<figment::Error>> {
        figment
            .merge(Env::prefixed("HARDENER_").split("__"))
            .extract()
            .map_err(Box::new)
    }

    /// Replaces the port of `listen_addr`, keeping its host part.
    pub fn set_listen_port(&mut self, port: u16) {
        let host = self
            .listen_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("0.0.0.0");
        self.listen_addr = format!("{host}:{port}");
    }
}
