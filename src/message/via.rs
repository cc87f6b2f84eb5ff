//! Structured `Via` values: `SIP/2.0/UDP host:port;branch=...;received=...;rport`.

use crate::error::{Error, Result};
use crate::message::params::ParamList;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaValue {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: ParamList,
}

impl ViaValue {
    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch").flatten()
    }

    pub fn received(&self) -> Option<&str> {
        self.params.get("received").flatten()
    }

    pub fn has_rport(&self) -> bool {
        self.params.has("rport")
    }

    /// Numeric `rport` value once the proxy has filled it in; `None` while
    /// it's still the bare flag sent by the client.
    pub fn rport_value(&self) -> Option<u16> {
        self.params.get("rport").flatten().and_then(|v| v.parse().ok())
    }

    pub fn set_received(&mut self, addr: &str) {
        self.params.set("received", Some(addr.to_string()));
    }

    pub fn set_rport(&mut self, port: u16) {
        self.params.set("rport", Some(port.to_string()));
    }

    pub fn sent_by(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{}", self.host, p),
            None => self.host.clone(),
        }
    }
}

pub fn parse_via(raw: &str) -> Result<ViaValue> {
    let raw = raw.trim();
    let (proto, rest) = raw
        .split_once(char::is_whitespace)
        .ok_or_else(|| Error::ParseError(format!("malformed Via: '{raw}'")))?;
    let mut proto_parts = proto.splitn(3, '/');
    let _sip = proto_parts.next();
    let _version = proto_parts.next();
    let transport = proto_parts
        .next()
        .ok_or_else(|| Error::ParseError(format!("malformed Via protocol: '{proto}'")))?
        .to_string();

    let rest = rest.trim_start();
    let mut split = crate::message::params::split_top_level(rest, ';').into_iter();
    let sent_by = split
        .next()
        .ok_or_else(|| Error::ParseError("empty Via sent-by".to_string()))?
        .trim();
    let params_str: String = split.map(|p| format!(";{p}")).collect();
    let params = ParamList::parse(&params_str);

    let (host, port) = match sent_by.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
            (h.to_string(), p.parse::<u16>().ok())
        }
        _ => (sent_by.to_string(), None),
    };

    Ok(ViaValue {
        transport,
        host,
        port,
        params,
    })
}

pub fn format_via(via: &ViaValue) -> String {
    let mut s = format!("SIP/2.0/{} {}", via.transport, via.sent_by());
    s.push_str(&via.params.format());
    s
}
