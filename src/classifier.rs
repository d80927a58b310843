//! Maps raw engine output to a short user-facing explanation.
//!
//! Matching is a case-insensitive substring search over [`PATTERNS`]; the first row that
//! matches wins. Only the Reality row is lifted above the generic `invalid` row it
//! overlaps with; later overlapping rows (`uuid`, `i/o timeout`) are shadowed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Longest slice of an unrecognised line shown to the user.
const FALLBACK_CHARS: usize = 100;

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b?\[[0-9;]*m").expect("static ansi pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    RealityKeyMismatch,
    ConnectionRefused,
    IoTimeout,
    Timeout,
    Certificate,
    Handshake,
    InvalidUuid,
    InvalidConfig,
    PermissionDenied,
    AddressInUse,
    NetworkUnreachable,
    Dns,
    SocketError,
    ConnectionReset,
    Eof,
    ConnectionAborted,
    NoRoute,
    Unknown,
}

enum Pattern {
    Any(&'static [&'static str]),
    All(&'static [&'static str]),
}

impl Pattern {
    fn matches(&self, haystack: &str) -> bool {
        match self {
            Pattern::Any(needles) => needles.iter().any(|needle| haystack.contains(needle)),
            Pattern::All(needles) => needles.iter().all(|needle| haystack.contains(needle)),
        }
    }
}

struct Rule {
    pattern: Pattern,
    kind: FaultKind,
    message: &'static str,
}

const fn rule(pattern: Pattern, kind: FaultKind, message: &'static str) -> Rule {
    Rule {
        pattern,
        kind,
        message,
    }
}

// Order is significant.
static PATTERNS: [Rule; 17] = [
    rule(
        Pattern::All(&["reality", "public"]),
        FaultKind::RealityKeyMismatch,
        "Invalid public key for Reality",
    ),
    rule(
        Pattern::Any(&["connection refused"]),
        FaultKind::ConnectionRefused,
        "Server unreachable - check the address and port",
    ),
    rule(
        Pattern::Any(&["timeout", "deadline exceeded"]),
        FaultKind::Timeout,
        "Connection timed out - the server is not responding",
    ),
    rule(
        Pattern::Any(&["certificate"]),
        FaultKind::Certificate,
        "TLS certificate error - check the SNI",
    ),
    rule(
        Pattern::Any(&["handshake"]),
        FaultKind::Handshake,
        "TLS handshake failed - check the security settings",
    ),
    rule(
        Pattern::Any(&["invalid"]),
        FaultKind::InvalidConfig,
        "Invalid key or configuration format",
    ),
    rule(
        Pattern::Any(&["permission", "access denied"]),
        FaultKind::PermissionDenied,
        "Access denied - run the application as administrator",
    ),
    rule(
        Pattern::Any(&["address already in use"]),
        FaultKind::AddressInUse,
        "Port is already in use by another application",
    ),
    rule(
        Pattern::Any(&["network unreachable"]),
        FaultKind::NetworkUnreachable,
        "Network unreachable - check the internet connection",
    ),
    rule(
        Pattern::Any(&["dns"]),
        FaultKind::Dns,
        "DNS error - cannot resolve the server address",
    ),
    rule(
        Pattern::Any(&["uuid"]),
        FaultKind::InvalidUuid,
        "Invalid UUID in the key",
    ),
    rule(
        Pattern::Any(&["wsasend", "wsarecv"]),
        FaultKind::SocketError,
        "Connection dropped - Windows network error",
    ),
    rule(
        Pattern::Any(&["connection reset"]),
        FaultKind::ConnectionReset,
        "Connection reset by the server",
    ),
    rule(
        Pattern::Any(&["eof"]),
        FaultKind::Eof,
        "Connection closed by the server",
    ),
    rule(
        Pattern::Any(&["established connection was aborted"]),
        FaultKind::ConnectionAborted,
        "An established connection was aborted",
    ),
    rule(
        Pattern::Any(&["no route to host"]),
        FaultKind::NoRoute,
        "No route to the server",
    ),
    rule(
        Pattern::Any(&["i/o timeout"]),
        FaultKind::IoTimeout,
        "I/O timeout - the connection is too slow",
    ),
];

const UNKNOWN_MESSAGE: &str = "Unknown error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnosis {
    pub kind: FaultKind,
    pub message: String,
}

pub fn strip_ansi(raw: &str) -> String {
    ANSI_ESCAPE.replace_all(raw, "").into_owned()
}

pub fn classify(raw: &str) -> Diagnosis {
    let cleaned = strip_ansi(raw);
    let lowered = cleaned.to_lowercase();

    if let Some(rule) = PATTERNS.iter().find(|rule| rule.pattern.matches(&lowered)) {
        return Diagnosis {
            kind: rule.kind,
            message: rule.message.to_string(),
        };
    }

    let trimmed = cleaned.trim();
    let message = if trimmed.is_empty() {
        UNKNOWN_MESSAGE.to_string()
    } else {
        trimmed.chars().take(FALLBACK_CHARS).collect()
    };
    Diagnosis {
        kind: FaultKind::Unknown,
        message,
    }
}
