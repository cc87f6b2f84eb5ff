//! SIP message model: parsing, serialization, and the structural accessors
//! the routing/dialog/registrar layers need (4.1).
//!
//! The wire grammar (start line, header folding, compact forms, the
//! comma-separated multi-value rule) is owned by this module rather than
//! delegated wholesale to a third-party message type, so every rule in the
//! parser design can be pointed at a specific line of code. Embedded SIP
//! URIs inside header values are the one place we lean on an external
//! parser (`rsip::Uri`, see [`uri`]) since the URI grammar itself is
//! orthogonal to header folding and not worth re-deriving.

pub mod addr;
pub mod headers;
pub mod params;
pub mod uri;
pub mod via;

pub use addr::{format_addr_header, parse_addr_header, AddrHeaderValue};
pub use headers::{HeaderField, HeaderName, Method};
pub use uri::{parse_uri, Uri, UriExt};
pub use via::{format_via, parse_via, ViaValue};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri_raw: String },
    Response { status_code: u16, reason: String },
}

/// A parsed SIP message: the start line plus an ordered header list and an
/// opaque body. Headers keep their wire order (important for Via stacks and
/// Record-Route chains); callers that need "the first Via" or "all Route
/// headers" use the accessor methods below rather than re-scanning by hand.
#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: Vec<HeaderField>,
    pub body: Vec<u8>,
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start_line, StartLine::Response { .. })
    }

    pub fn method(&self) -> Option<Method> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(*method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status_code, .. } => Some(*status_code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri_raw, .. } => Some(uri_raw.as_str()),
            StartLine::Response { .. } => None,
        }
    }

    pub fn set_request_uri(&mut self, uri: String) {
        if let StartLine::Request { uri_raw, .. } = &mut self.start_line {
            *uri_raw = uri;
        }
    }

    /// Every header value whose name matches `name`, in wire order.
    pub fn header_values<'a>(&'a self, name: &HeaderName) -> Vec<&'a str> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    pub fn first_header(&self, name: &HeaderName) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn push_header_front(&mut self, field: HeaderField) {
        self.headers.insert(0, field);
    }

    pub fn push_header(&mut self, field: HeaderField) {
        self.headers.push(field);
    }

    pub fn remove_headers(&mut self, name: &HeaderName) {
        self.headers.retain(|h| !h.name.eq_ignore_case(name));
    }

    /// Replaces every existing occurrence of `name` with a single new value
    /// (used for recomputed Content-Length and rewritten top Via).
    pub fn replace_single(&mut self, name: HeaderName, value: impl Into<String>) {
        self.remove_headers(&name);
        self.headers.push(HeaderField::new(name, value));
    }

    pub fn call_id(&self) -> Option<&str> {
        self.first_header(&HeaderName::CallId)
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        let raw = self.first_header(&HeaderName::CSeq)?;
        let (num, method) = raw.trim().split_once(char::is_whitespace)?;
        Some((num.trim().parse().ok()?, Method::parse(method.trim())?))
    }

    pub fn max_forwards(&self) -> Option<u8> {
        self.first_header(&HeaderName::MaxForwards)?.trim().parse().ok()
    }

    pub fn set_max_forwards(&mut self, value: u8) {
        self.replace_single(HeaderName::MaxForwards, value.to_string());
    }

    pub fn content_length(&self) -> Option<usize> {
        self.first_header(&HeaderName::ContentLength)?.trim().parse().ok()
    }

    pub fn to_value(&self) -> Result<AddrHeaderValue> {
        let raw = self
            .first_header(&HeaderName::To)
            .ok_or(Error::MissingHeader("To"))?;
        parse_addr_header(raw)
    }

    pub fn from_value(&self) -> Result<AddrHeaderValue> {
        let raw = self
            .first_header(&HeaderName::From)
            .ok_or(Error::MissingHeader("From"))?;
        parse_addr_header(raw)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to_value().ok().and_then(|v| v.tag().map(|s| s.to_string()))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.from_value().ok().and_then(|v| v.tag().map(|s| s.to_string()))
    }

    pub fn top_via(&self) -> Option<Result<ViaValue>> {
        self.first_header(&HeaderName::Via).map(parse_via)
    }

    pub fn vias(&self) -> Result<Vec<ViaValue>> {
        self.header_values(&HeaderName::Via)
            .into_iter()
            .map(parse_via)
            .collect()
    }

    pub fn routes(&self) -> Result<Vec<AddrHeaderValue>> {
        self.header_values(&HeaderName::Route)
            .into_iter()
            .map(parse_addr_header)
            .collect()
    }

    pub fn record_routes(&self) -> Result<Vec<AddrHeaderValue>> {
        self.header_values(&HeaderName::RecordRoute)
            .into_iter()
            .map(parse_addr_header)
            .collect()
    }

    pub fn contacts(&self) -> Result<Vec<AddrHeaderValue>> {
        self.header_values(&HeaderName::Contact)
            .into_iter()
            .map(parse_addr_header)
            .collect()
    }
}

/// AOR derivation shared by the registrar and dialog layers: `scheme:user@host`
/// with the user compared case-sensitively and the host lowercased (3).
pub fn aor_of(addr: &AddrHeaderValue) -> String {
    addr.uri.aor()
}

const CANONICAL_ORDER: &[fn(&HeaderName) -> bool] = &[
    |n| matches!(n, HeaderName::Via),
    |n| matches!(n, HeaderName::RecordRoute),
    |n| matches!(n, HeaderName::Route),
    |n| matches!(n, HeaderName::From),
    |n| matches!(n, HeaderName::To),
    |n| matches!(n, HeaderName::CallId),
    |n| matches!(n, HeaderName::CSeq),
    |n| matches!(n, HeaderName::MaxForwards),
    |n| matches!(n, HeaderName::Contact),
];

/// Parses a datagram payload into a [`SipMessage`] (4.1).
///
/// Tolerates both CRLF and bare-LF line endings, expands compact header
/// forms, and splits a single comma-joined header line into repeated
/// entries for every header that allows a comma-separated list — so callers
/// never need to special-case "Via might be one line with two commas".
pub fn parse(bytes: &[u8]) -> Result<SipMessage> {
    let text = std::str::from_utf8(bytes).map_err(|e| Error::ParseError(e.to_string()))?;
    let normalized = text.replace("\r\n", "\n");

    let header_end = normalized
        .find("\n\n")
        .ok_or_else(|| Error::ParseError("missing header/body separator".to_string()))?;
    let header_block = &normalized[..header_end];
    let body = normalized[header_end + 2..].as_bytes().to_vec();

    let mut lines = unfold(header_block);
    if lines.is_empty() {
        return Err(Error::ParseError("empty message".to_string()));
    }
    let start_line = parse_start_line(&lines.remove(0))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (name_raw, value_raw) = line
            .split_once(':')
            .ok_or_else(|| Error::ParseError(format!("malformed header line: '{line}'")))?;
        let name = HeaderName::parse(name_raw.trim());
        let value = value_raw.trim();
        if name.allows_comma_list() {
            for part in params::split_top_level(value, ',') {
                let part = part.trim();
                if !part.is_empty() {
                    headers.push(HeaderField::new(name.clone(), part));
                }
            }
        } else {
            headers.push(HeaderField::new(name, value));
        }
    }

    let msg = SipMessage {
        start_line,
        headers,
        body,
    };
    validate(&msg)?;
    Ok(msg)
}

fn validate(msg: &SipMessage) -> Result<()> {
    for (name, label) in [
        (HeaderName::Via, "Via"),
        (HeaderName::From, "From"),
        (HeaderName::To, "To"),
        (HeaderName::CallId, "Call-ID"),
        (HeaderName::CSeq, "CSeq"),
    ] {
        if msg.first_header(&name).is_none() {
            return Err(Error::MissingHeader(match label {
                "Via" => "Via",
                "From" => "From",
                "To" => "To",
                "Call-ID" => "Call-ID",
                _ => "CSeq",
            }));
        }
    }
    if let Some(mf) = msg.first_header(&HeaderName::MaxForwards) {
        if mf.trim().parse::<u8>().is_err() {
            return Err(Error::ParseError(format!("invalid Max-Forwards: '{mf}'")));
        }
    }
    if let Some(cl) = msg.first_header(&HeaderName::ContentLength) {
        if cl.trim().parse::<usize>().is_err() {
            return Err(Error::ParseError(format!("invalid Content-Length: '{cl}'")));
        }
    }
    if let Some(cseq) = msg.first_header(&HeaderName::CSeq) {
        let num = cseq.split_whitespace().next().unwrap_or("");
        if num.parse::<u32>().is_err() {
            return Err(Error::ParseError(format!("invalid CSeq: '{cseq}'")));
        }
    }
    Ok(())
}

fn unfold(block: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in block.split('\n') {
        if (line.starts_with(' ') || line.starts_with('\t')) && !out.is_empty() {
            let last = out.last_mut().unwrap();
            last.push(' ');
            last.push_str(line.trim_start());
        } else {
            out.push(line.trim_end_matches('\r').to_string());
        }
    }
    out
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    let line = line.trim_end_matches('\r');
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let code = parts
            .next()
            .ok_or_else(|| Error::ParseError("missing status code".to_string()))?;
        let status_code: u16 = code
            .parse()
            .map_err(|_| Error::ParseError(format!("invalid status code: '{code}'")))?;
        let reason = parts.next().unwrap_or("").to_string();
        return Ok(StartLine::Response { status_code, reason });
    }
    let mut parts = line.split(' ');
    let method_raw = parts
        .next()
        .ok_or_else(|| Error::ParseError("empty request line".to_string()))?;
    let uri_raw = parts
        .next()
        .ok_or_else(|| Error::ParseError(format!("malformed request line: '{line}'")))?
        .to_string();
    let version = parts.next().unwrap_or("");
    if version != "SIP/2.0" {
        return Err(Error::ParseError(format!("unsupported version: '{version}'")));
    }
    let method = Method::parse(method_raw)
        .ok_or_else(|| Error::ParseError(format!("unknown method: '{method_raw}'")))?;
    Ok(StartLine::Request { method, uri_raw })
}

/// Serializes a message back to wire form (4.1): canonical header ordering,
/// a recomputed Content-Length, and CRLF line endings throughout.
pub fn serialize(msg: &SipMessage) -> Vec<u8> {
    let mut out = String::new();
    match &msg.start_line {
        StartLine::Request { method, uri_raw } => {
            out.push_str(&format!("{} {} SIP/2.0\r\n", method, uri_raw));
        }
        StartLine::Response { status_code, reason } => {
            out.push_str(&format!("SIP/2.0 {} {}\r\n", status_code, reason));
        }
    }

    let mut remaining: Vec<&HeaderField> = msg.headers.iter().collect();
    let mut ordered: Vec<&HeaderField> = Vec::with_capacity(msg.headers.len());
    for matcher in CANONICAL_ORDER {
        let mut i = 0;
        while i < remaining.len() {
            if matcher(&remaining[i].name) {
                ordered.push(remaining.remove(i));
            } else {
                i += 1;
            }
        }
    }
    for h in remaining {
        if !matches!(h.name, HeaderName::ContentLength) {
            ordered.push(h);
        }
    }

    for h in ordered {
        out.push_str(&format!("{}: {}\r\n", h.name, h.value));
    }
    out.push_str(&format!("Content-Length: {}\r\n", msg.body.len()));
    out.push_str("\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&msg.body);
    bytes
}
