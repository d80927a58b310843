//! `vless://` credential parsing.
//!
//! The query string carries the stream options. Absent (or empty) parameters take the
//! defaults the engines expect: plain TCP transport, TLS security, `chrome` fingerprint
//! and the server host as SNI.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::{Error, Result};

const SCHEME: &str = "vless";
const DEFAULT_PORT: u16 = 443;
const DEFAULT_FINGERPRINT: &str = "chrome";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Local SOCKS/HTTP listener driven by xray.
    Proxy,
    /// System-wide virtual interface driven by sing-box.
    #[serde(alias = "tun")]
    #[value(alias = "tun")]
    Tunnel,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Proxy => "proxy",
            Mode::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proxy" => Ok(Mode::Proxy),
            "tunnel" | "tun" => Ok(Mode::Tunnel),
            other => Err(Error::invalid(format!("unknown mode `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Ws { path: String, host: String },
    Grpc { service_name: String },
    Http { path: String, host: Vec<String> },
    HttpUpgrade { path: String, host: String },
}

impl Transport {
    /// Network name shared by both engine schemas.
    pub fn network(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ws { .. } => "ws",
            Transport::Grpc { .. } => "grpc",
            Transport::Http { .. } => "http",
            Transport::HttpUpgrade { .. } => "httpupgrade",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    pub server_name: String,
    pub fingerprint: String,
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityOptions {
    pub server_name: String,
    pub fingerprint: String,
    pub public_key: String,
    pub short_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Security {
    None,
    Tls(TlsOptions),
    Reality(RealityOptions),
}

impl Security {
    pub fn name(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls(_) => "tls",
            Security::Reality(_) => "reality",
        }
    }

    pub fn server_name(&self) -> Option<&str> {
        match self {
            Security::None => None,
            Security::Tls(tls) => Some(&tls.server_name),
            Security::Reality(reality) => Some(&reality.server_name),
        }
    }
}

/// A parsed `vless://<id>@<host>:<port>?<options>#<remark>` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub remark: Option<String>,
    pub flow: String,
    pub encryption: String,
    pub transport: Transport,
    pub security: Security,
}

impl Credential {
    pub fn parse(link: &str) -> Result<Self> {
        let url = Url::parse(link.trim()).map_err(|e| Error::invalid(e.to_string()))?;
        if url.scheme() != SCHEME {
            return Err(Error::invalid(format!(
                "unsupported scheme `{}`",
                url.scheme()
            )));
        }

        let id = decode(url.username()).trim().to_string();
        if id.is_empty() {
            return Err(Error::invalid("missing uuid"));
        }
        let host = url
            .host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::invalid("missing server"))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let remark = url
            .fragment()
            .map(decode)
            .filter(|remark| !remark.trim().is_empty());

        let params = query_map(&url);
        let transport = transport_from_params(&params, &host);
        let security = security_from_params(&params, &host);

        Ok(Self {
            flow: param(&params, "flow").unwrap_or_default().to_string(),
            encryption: param(&params, "encryption").unwrap_or("none").to_string(),
            id,
            host,
            port,
            remark,
            transport,
            security,
        })
    }

    /// Display name: the remark when present, otherwise `host:port`.
    pub fn label(&self) -> String {
        self.remark
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}

impl FromStr for Credential {
    type Err = Error;

    fn from_str(link: &str) -> Result<Self> {
        Credential::parse(link)
    }
}

fn decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.to_lowercase(), v.to_string()))
        .collect()
}

/// Non-empty parameter value; an empty value counts as absent.
fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

fn transport_from_params(params: &HashMap<String, String>, host: &str) -> Transport {
    let network = param(params, "type")
        .map(|value| value.to_lowercase())
        .unwrap_or_else(|| "tcp".to_string());
    let path = param(params, "path").unwrap_or("/").to_string();

    match network.as_str() {
        "tcp" | "raw" => Transport::Tcp,
        "ws" => Transport::Ws {
            path,
            host: param(params, "host").unwrap_or(host).to_string(),
        },
        "grpc" => Transport::Grpc {
            service_name: param(params, "servicename")
                .or_else(|| param(params, "service_name"))
                .unwrap_or_default()
                .to_string(),
        },
        "http" | "h2" => Transport::Http {
            path,
            host: param(params, "host").map(split_csv).unwrap_or_default(),
        },
        "httpupgrade" => Transport::HttpUpgrade {
            path,
            host: param(params, "host").unwrap_or(host).to_string(),
        },
        other => {
            tracing::warn!(network = other, "unsupported transport, using tcp");
            Transport::Tcp
        }
    }
}

fn security_from_params(params: &HashMap<String, String>, host: &str) -> Security {
    let security = param(params, "security")
        .map(|value| value.to_lowercase())
        .unwrap_or_else(|| "tls".to_string());
    let server_name = param(params, "sni")
        .or_else(|| param(params, "servername"))
        .unwrap_or(host)
        .to_string();
    let fingerprint = param(params, "fp")
        .or_else(|| param(params, "fingerprint"))
        .unwrap_or(DEFAULT_FINGERPRINT)
        .to_string();

    match security.as_str() {
        "none" => Security::None,
        "reality" => Security::Reality(RealityOptions {
            server_name,
            fingerprint,
            public_key: param(params, "pbk")
                .or_else(|| param(params, "publickey"))
                .or_else(|| param(params, "public_key"))
                .unwrap_or_default()
                .to_string(),
            short_id: param(params, "sid")
                .or_else(|| param(params, "shortid"))
                .or_else(|| param(params, "short_id"))
                .unwrap_or_default()
                .to_string(),
        }),
        other => {
            if other != "tls" {
                tracing::warn!(security = other, "unsupported security, using tls");
            }
            Security::Tls(TlsOptions {
                server_name,
                fingerprint,
                alpn: param(params, "alpn").map(split_csv).unwrap_or_default(),
            })
        }
    }
}
