//! JSON configuration
//!
//! Two generations of config files exist in the field: a nested layout
//! (`server.controlPort`, `tls.certFile`) and a flat one (`controlPort`,
//! `tlsCertFile`). Both spellings are recognised; the nested one wins when
//! a field appears in both places. Validation failures are fatal at startup.

use link_control::RegistrationMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_JWT_ISSUER: &str = "his.tatbeeb.sa";
pub const DEFAULT_JWT_AUDIENCE: &str = "tatbeeb-link.tatbeeb.sa";
pub const DEFAULT_ADMIN_PORT: u16 = 9090;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing required config field: {0}")]
    MissingField(&'static str),

    #[error("Invalid tenant port range: {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// JWT verification settings (framed registration)
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
}

/// Directory notifier settings
#[derive(Debug, Clone)]
pub struct HisConfig {
    pub backend_url: String,
    pub relay_shared_secret: String,
}

/// Validated relay configuration, immutable after load
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub control_port: u16,
    pub tenant_port_start: u16,
    pub tenant_port_end: u16,
    pub max_connections_per_tenant: usize,
    pub admin_port: u16,
    pub registration_mode: RegistrationMode,
    pub tls_cert_file: PathBuf,
    pub tls_key_file: PathBuf,
    pub public_host: String,
    pub jwt: Option<JwtConfig>,
    pub his: Option<HisConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
    server: Option<RawServer>,
    tls: Option<RawTls>,
    jwt: Option<RawJwt>,
    his: Option<RawHis>,
    public_host: Option<String>,

    // Flat spellings from the older config layout
    control_port: Option<u16>,
    tenant_port_start: Option<u16>,
    tenant_port_end: Option<u16>,
    max_connections_per_tenant: Option<usize>,
    admin_port: Option<u16>,
    registration_mode: Option<String>,
    tls_cert_file: Option<String>,
    tls_key_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawServer {
    control_port: Option<u16>,
    tenant_port_start: Option<u16>,
    tenant_port_end: Option<u16>,
    max_connections_per_tenant: Option<usize>,
    admin_port: Option<u16>,
    registration_mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawTls {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawJwt {
    secret: Option<String>,
    issuer: Option<String>,
    audience: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawHis {
    backend_url: Option<String>,
    relay_shared_secret: Option<String>,
}

impl RelayConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&data)
    }

    /// Parse and validate config JSON
    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(data)?;

        let server = raw.server.unwrap_or_default();
        let tls = raw.tls.unwrap_or_default();

        let control_port = server
            .control_port
            .or(raw.control_port)
            .ok_or(ConfigError::MissingField("server.controlPort"))?;
        let tenant_port_start = server
            .tenant_port_start
            .or(raw.tenant_port_start)
            .ok_or(ConfigError::MissingField("server.tenantPortStart"))?;
        let tenant_port_end = server
            .tenant_port_end
            .or(raw.tenant_port_end)
            .ok_or(ConfigError::MissingField("server.tenantPortEnd"))?;

        if control_port == 0 {
            return Err(ConfigError::Invalid("controlPort must be nonzero".into()));
        }
        if tenant_port_start == 0 || tenant_port_start > tenant_port_end {
            return Err(ConfigError::InvalidPortRange {
                start: tenant_port_start,
                end: tenant_port_end,
            });
        }

        let tls_cert_file = tls
            .cert_file
            .or(raw.tls_cert_file)
            .ok_or(ConfigError::MissingField("tls.certFile"))?;
        let tls_key_file = tls
            .key_file
            .or(raw.tls_key_file)
            .ok_or(ConfigError::MissingField("tls.keyFile"))?;

        let registration_mode = match server
            .registration_mode
            .or(raw.registration_mode)
            .as_deref()
        {
            None | Some("framed") => RegistrationMode::Framed,
            Some("simple") => RegistrationMode::Simple,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "unknown registrationMode {:?} (expected \"framed\" or \"simple\")",
                    other
                )))
            }
        };

        let jwt = match raw.jwt {
            Some(raw_jwt) => {
                let secret = raw_jwt
                    .secret
                    .filter(|s| !s.is_empty())
                    .ok_or(ConfigError::MissingField("jwt.secret"))?;
                Some(JwtConfig {
                    secret,
                    issuer: raw_jwt
                        .issuer
                        .unwrap_or_else(|| DEFAULT_JWT_ISSUER.to_string()),
                    audience: raw_jwt
                        .audience
                        .unwrap_or_else(|| DEFAULT_JWT_AUDIENCE.to_string()),
                })
            }
            None => None,
        };

        if registration_mode == RegistrationMode::Framed && jwt.is_none() {
            return Err(ConfigError::Invalid(
                "framed registration requires jwt.secret".into(),
            ));
        }

        let public_host = match raw.public_host {
            Some(host) if !host.is_empty() => host,
            _ if registration_mode == RegistrationMode::Framed => {
                return Err(ConfigError::MissingField("publicHost"));
            }
            _ => "localhost".to_string(),
        };

        let his = match raw.his {
            Some(raw_his) => match raw_his.backend_url.filter(|s| !s.is_empty()) {
                Some(backend_url) => {
                    let relay_shared_secret = raw_his
                        .relay_shared_secret
                        .filter(|s| !s.is_empty())
                        .ok_or(ConfigError::MissingField("his.relaySharedSecret"))?;
                    Some(HisConfig {
                        backend_url,
                        relay_shared_secret,
                    })
                }
                None => None,
            },
            None => None,
        };

        Ok(Self {
            control_port,
            tenant_port_start,
            tenant_port_end,
            max_connections_per_tenant: server
                .max_connections_per_tenant
                .or(raw.max_connections_per_tenant)
                .unwrap_or(0),
            admin_port: server
                .admin_port
                .or(raw.admin_port)
                .unwrap_or(DEFAULT_ADMIN_PORT),
            registration_mode,
            tls_cert_file: PathBuf::from(tls_cert_file),
            tls_key_file: PathBuf::from(tls_key_file),
            public_host,
            jwt,
            his,
        })
    }
}
