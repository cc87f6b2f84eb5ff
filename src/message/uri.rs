use crate::error::{Error, Result};

/// Canonical SIP URI, built on `rsip::Uri`. We reuse it only for the
/// `scheme://user@host:port` grammar; the surrounding header grammar
/// (display name, `<...>`, trailing `;params`) is parsed by [`super::addr`]
/// since that part is specific to *header* values rather than the URI
/// itself.
pub type Uri = rsip::Uri;

pub fn parse_uri(s: &str) -> Result<Uri> {
    rsip::Uri::try_from(s.trim()).map_err(|e| Error::ParseError(format!("invalid URI '{s}': {e}")))
}

/// Extension helpers the rest of this crate needs that aren't `rsip::Uri`
/// itself: the Address-of-Record string and NAT host/port rewriting.
pub trait UriExt {
    /// `scheme:user@host` with the user compared case-sensitively and the
    /// host lowercased (3, Address-of-Record).
    fn aor(&self) -> String;
    fn host_str(&self) -> String;
    fn port_or(&self, default: u16) -> u16;
    fn with_host_port(&self, host: &str, port: u16) -> Self;
    /// The URI's user part, empty for a host-only URI (CDR caller/callee
    /// fields, 4.8).
    fn user_str(&self) -> String;
}

impl UriExt for Uri {
    fn aor(&self) -> String {
        let scheme = self
            .scheme
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "sip".to_string());
        let user = self
            .auth
            .as_ref()
            .map(|a| a.user.clone())
            .unwrap_or_default();
        let host = self.host_str().to_ascii_lowercase();
        if user.is_empty() {
            format!("{scheme}:{host}")
        } else {
            format!("{scheme}:{user}@{host}")
        }
    }

    fn host_str(&self) -> String {
        self.host_with_port.host.to_string()
    }

    fn port_or(&self, default: u16) -> u16 {
        self.host_with_port
            .port
            .as_ref()
            .map(|p| p.value().to_owned() as u16)
            .unwrap_or(default)
    }

    fn with_host_port(&self, host: &str, port: u16) -> Self {
        let mut uri = self.clone();
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            uri.host_with_port.host = ip.into();
        } else {
            uri.host_with_port.host = rsip::Host::Domain(host.to_string().into());
        }
        uri.host_with_port.port = Some(port.into());
        uri
    }

    fn user_str(&self) -> String {
        self.auth.as_ref().map(|a| a.user.clone()).unwrap_or_default()
    }
}
