//! Credential to engine configuration.
//!
//! Proxy mode targets the xray schema, tunnel mode the sing-box schema. Both documents
//! carry the same outbound identity and stream options; only the shape differs.

use serde_json::{json, Value};
use std::fs;
use std::path::Path;

use crate::credential::{Credential, Mode, Security, Transport};
use crate::error::{Error, Result};
use crate::settings::Settings;

const PROXY_TAG: &str = "proxy";
const DIRECT_TAG: &str = "direct";
const BLOCK_TAG: &str = "block";
const DNS_OUT_TAG: &str = "dns-out";

/// Generated engine configuration. Built once per connect attempt and never modified.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    mode: Mode,
    body: Value,
}

impl ConfigDocument {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn as_value(&self) -> &Value {
        &self.body
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.body)?)
    }

    /// Replaces whatever is at `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let content = self.to_pretty_json()?;
        fs::write(path, content).map_err(|source| Error::ConfigWrite {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub fn translate(credential: &Credential, mode: Mode, settings: &Settings) -> ConfigDocument {
    let body = match mode {
        Mode::Proxy => xray_config(credential, settings),
        Mode::Tunnel => singbox_config(credential, settings),
    };
    ConfigDocument { mode, body }
}

pub fn translate_link(link: &str, mode: Mode, settings: &Settings) -> Result<ConfigDocument> {
    let credential = Credential::parse(link)?;
    Ok(translate(&credential, mode, settings))
}

fn xray_config(credential: &Credential, settings: &Settings) -> Value {
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [
            {
                "tag": "socks",
                "port": settings.socks_port,
                "listen": settings.listen,
                "protocol": "socks",
                "settings": { "udp": true }
            },
            {
                "tag": "http",
                "port": settings.http_port,
                "listen": settings.listen,
                "protocol": "http"
            }
        ],
        "outbounds": [
            {
                "tag": PROXY_TAG,
                "protocol": "vless",
                "settings": {
                    "vnext": [{
                        "address": credential.host,
                        "port": credential.port,
                        "users": [{
                            "id": credential.id,
                            "encryption": credential.encryption,
                            "flow": credential.flow
                        }]
                    }]
                },
                "streamSettings": xray_stream_settings(credential)
            },
            { "tag": DIRECT_TAG, "protocol": "freedom" },
            { "tag": BLOCK_TAG, "protocol": "blackhole" }
        ],
        "routing": {
            "domainStrategy": "AsIs",
            "rules": [
                { "type": "field", "ip": ["geoip:private"], "outboundTag": DIRECT_TAG },
                { "type": "field", "domain": ["geosite:category-ads"], "outboundTag": BLOCK_TAG }
            ]
        }
    })
}

fn xray_stream_settings(credential: &Credential) -> Value {
    let mut stream = json!({
        "network": credential.transport.network(),
        "security": credential.security.name()
    });

    match &credential.security {
        Security::None => {}
        Security::Tls(tls) => {
            let mut settings = json!({
                "serverName": tls.server_name,
                "fingerprint": tls.fingerprint
            });
            if !tls.alpn.is_empty() {
                settings["alpn"] = json!(tls.alpn);
            }
            stream["tlsSettings"] = settings;
        }
        Security::Reality(reality) => {
            stream["realitySettings"] = json!({
                "serverName": reality.server_name,
                "fingerprint": reality.fingerprint,
                "publicKey": reality.public_key,
                "shortId": reality.short_id
            });
        }
    }

    match &credential.transport {
        Transport::Tcp => {}
        Transport::Ws { path, host } => {
            stream["wsSettings"] = json!({
                "path": path,
                "headers": { "Host": host }
            });
        }
        Transport::Grpc { service_name } => {
            stream["grpcSettings"] = json!({ "serviceName": service_name });
        }
        Transport::Http { path, host } => {
            let mut settings = json!({ "path": path });
            if !host.is_empty() {
                settings["host"] = json!(host);
            }
            stream["httpSettings"] = settings;
        }
        Transport::HttpUpgrade { path, host } => {
            stream["httpupgradeSettings"] = json!({
                "path": path,
                "host": host
            });
        }
    }

    stream
}

fn singbox_config(credential: &Credential, settings: &Settings) -> Value {
    json!({
        "log": { "level": "warn" },
        "dns": {
            "servers": [
                { "tag": "google", "address": settings.dns.remote, "detour": PROXY_TAG },
                { "tag": "local", "address": settings.dns.local, "detour": DIRECT_TAG }
            ],
            "rules": [
                { "outbound": "any", "server": "local" }
            ],
            "final": "google"
        },
        "inbounds": [
            {
                "tag": "tun-in",
                "type": "tun",
                "interface_name": settings.tun.interface_name,
                "inet4_address": settings.tun.inet4_address,
                "mtu": settings.tun.mtu,
                "auto_route": true,
                "strict_route": true,
                "stack": settings.tun.stack,
                "sniff": true,
                "sniff_override_destination": true
            }
        ],
        "outbounds": [
            singbox_outbound(credential),
            { "tag": DIRECT_TAG, "type": "direct" },
            { "tag": BLOCK_TAG, "type": "block" },
            { "tag": DNS_OUT_TAG, "type": "dns" }
        ],
        "route": {
            "auto_detect_interface": true,
            "final": PROXY_TAG,
            "rules": [
                { "protocol": "dns", "outbound": DNS_OUT_TAG },
                { "ip_is_private": true, "outbound": DIRECT_TAG }
            ]
        }
    })
}

fn singbox_outbound(credential: &Credential) -> Value {
    let mut outbound = json!({
        "tag": PROXY_TAG,
        "type": "vless",
        "server": credential.host,
        "server_port": credential.port,
        "uuid": credential.id,
        "flow": credential.flow
    });

    if let Some(tls) = singbox_tls(&credential.security) {
        outbound["tls"] = tls;
    }
    if let Some(transport) = singbox_transport(&credential.transport) {
        outbound["transport"] = transport;
    }

    outbound
}

fn singbox_tls(security: &Security) -> Option<Value> {
    match security {
        Security::None => None,
        Security::Tls(tls) => {
            let mut value = json!({
                "enabled": true,
                "server_name": tls.server_name,
                "utls": {
                    "enabled": true,
                    "fingerprint": tls.fingerprint
                }
            });
            if !tls.alpn.is_empty() {
                value["alpn"] = json!(tls.alpn);
            }
            Some(value)
        }
        Security::Reality(reality) => Some(json!({
            "enabled": true,
            "server_name": reality.server_name,
            "utls": {
                "enabled": true,
                "fingerprint": reality.fingerprint
            },
            "reality": {
                "enabled": true,
                "public_key": reality.public_key,
                "short_id": reality.short_id
            }
        })),
    }
}

fn singbox_transport(transport: &Transport) -> Option<Value> {
    match transport {
        Transport::Tcp => None,
        Transport::Ws { path, host } => Some(json!({
            "type": "ws",
            "path": path,
            "headers": { "Host": host }
        })),
        Transport::Grpc { service_name } => Some(json!({
            "type": "grpc",
            "service_name": service_name
        })),
        Transport::Http { path, host } => {
            let mut value = json!({
                "type": "http",
                "path": path
            });
            if !host.is_empty() {
                value["host"] = json!(host);
            }
            Some(value)
        }
        Transport::HttpUpgrade { path, host } => Some(json!({
            "type": "httpupgrade",
            "path": path,
            "host": host
        })),
    }
}
