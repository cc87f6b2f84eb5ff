//! Header name grammar: the compact-form table and the tagged set of names
//! the routing/dialog/registrar layers care about structurally. Everything
//! else passes through as [`HeaderName::Other`].

use std::fmt;

/// A SIP header name, normalized to its long form. Comparison is
/// case-insensitive per RFC 3261 §7.3.1, so this type carries its own
/// `PartialEq`/`Hash` rather than deriving them from the inner string.
#[derive(Debug, Clone)]
pub enum HeaderName {
    Via,
    From,
    To,
    Contact,
    CallId,
    CSeq,
    MaxForwards,
    ContentLength,
    ContentType,
    Expires,
    Route,
    RecordRoute,
    Authorization,
    WwwAuthenticate,
    ProxyAuthenticate,
    ProxyAuthorization,
    Supported,
    Require,
    UserAgent,
    Allow,
    Other(String),
}

impl HeaderName {
    /// Expands a compact form (`v`, `f`, `t`, `m`, `i`, `l`, `s`, `c`, `k`) or
    /// long form into a [`HeaderName`], per §4.1's compact-form table.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "v" | "via" => HeaderName::Via,
            "f" | "from" => HeaderName::From,
            "t" | "to" => HeaderName::To,
            "m" | "contact" => HeaderName::Contact,
            "i" | "call-id" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "max-forwards" => HeaderName::MaxForwards,
            "l" | "content-length" => HeaderName::ContentLength,
            "c" | "content-type" => HeaderName::ContentType,
            "expires" => HeaderName::Expires,
            "route" => HeaderName::Route,
            "record-route" => HeaderName::RecordRoute,
            "authorization" => HeaderName::Authorization,
            "www-authenticate" => HeaderName::WwwAuthenticate,
            "proxy-authenticate" => HeaderName::ProxyAuthenticate,
            "proxy-authorization" => HeaderName::ProxyAuthorization,
            "k" | "supported" => HeaderName::Supported,
            "require" => HeaderName::Require,
            "user-agent" => HeaderName::UserAgent,
            "allow" => HeaderName::Allow,
            _ => HeaderName::Other(raw.to_string()),
        }
    }

    pub fn eq_ignore_case(&self, other: &HeaderName) -> bool {
        match (self, other) {
            (HeaderName::Other(a), HeaderName::Other(b)) => a.eq_ignore_ascii_case(b),
            (HeaderName::Other(_), _) | (_, HeaderName::Other(_)) => false,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }

    /// Whether commas inside this header's value separate independent
    /// header instances (RFC 3261 §7.3.1) rather than being part of a
    /// single grammar (e.g. the quoted display name in `To`/`From`, which
    /// never repeats, so it's excluded even though commas could appear in
    /// the quoted string — the parser never splits inside quotes anyway).
    pub fn allows_comma_list(&self) -> bool {
        !matches!(
            self,
            HeaderName::CallId
                | HeaderName::CSeq
                | HeaderName::MaxForwards
                | HeaderName::ContentLength
                | HeaderName::ContentType
                | HeaderName::To
                | HeaderName::From
                | HeaderName::Expires
                | HeaderName::UserAgent
                | HeaderName::Authorization
                | HeaderName::WwwAuthenticate
                | HeaderName::ProxyAuthenticate
                | HeaderName::ProxyAuthorization
        )
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::Contact => "Contact",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::ContentType => "Content-Type",
            HeaderName::Expires => "Expires",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::Authorization => "Authorization",
            HeaderName::WwwAuthenticate => "WWW-Authenticate",
            HeaderName::ProxyAuthenticate => "Proxy-Authenticate",
            HeaderName::ProxyAuthorization => "Proxy-Authorization",
            HeaderName::Supported => "Supported",
            HeaderName::Require => "Require",
            HeaderName::UserAgent => "User-Agent",
            HeaderName::Allow => "Allow",
            HeaderName::Other(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

/// One header line as stored on [`super::SipMessage`]: already split out of
/// any comma-joined original so each structural header (Via, Route, etc.)
/// has exactly one value per entry.
#[derive(Debug, Clone)]
pub struct HeaderField {
    pub name: HeaderName,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: HeaderName, value: impl Into<String>) -> Self {
        HeaderField {
            name,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Message,
    Prack,
    Update,
    Refer,
    Notify,
    Subscribe,
    Info,
    Publish,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "MESSAGE" => Method::Message,
            "PRACK" => Method::Prack,
            "UPDATE" => Method::Update,
            "REFER" => Method::Refer,
            "NOTIFY" => Method::Notify,
            "SUBSCRIBE" => Method::Subscribe,
            "INFO" => Method::Info,
            "PUBLISH" => Method::Publish,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Message => "MESSAGE",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Refer => "REFER",
            Method::Notify => "NOTIFY",
            Method::Subscribe => "SUBSCRIBE",
            Method::Info => "INFO",
            Method::Publish => "PUBLISH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
