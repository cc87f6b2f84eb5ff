//! `"Display Name" <sip:user@host;uri-params>;hdr-params` — shared shape of
//! To, From, Contact, Route and Record-Route values.

use crate::error::{Error, Result};
use crate::message::params::{split_top_level, ParamList};
use crate::message::uri::{parse_uri, Uri};

#[derive(Debug, Clone)]
pub struct AddrHeaderValue {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: ParamList,
}

impl AddrHeaderValue {
    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag").flatten()
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.params.set("tag", Some(tag.to_string()));
    }

    pub fn expires(&self) -> Option<u32> {
        self.params.get("expires").flatten().and_then(|v| v.parse().ok())
    }
}

/// Parses a single address value. Accepts both the name-addr form
/// (`<sip:...>`) and the bare addr-spec form (`sip:...`) that Contact/To/From
/// allow when there are no header parameters to attach.
pub fn parse_addr_header(raw: &str) -> Result<AddrHeaderValue> {
    let raw = raw.trim();
    if let Some(lt) = raw.find('<') {
        let display_name = {
            let dn = raw[..lt].trim();
            if dn.is_empty() {
                None
            } else {
                Some(unquote_display_name(dn))
            }
        };
        let gt = raw
            .rfind('>')
            .ok_or_else(|| Error::ParseError(format!("unterminated name-addr: '{raw}'")))?;
        let uri = parse_uri(&raw[lt + 1..gt])?;
        let params = ParamList::parse(raw[gt + 1..].trim_start_matches(';'));
        Ok(AddrHeaderValue {
            display_name,
            uri,
            params,
        })
    } else {
        // addr-spec;params, no angle brackets, no display name.
        let mut parts = split_top_level(raw, ';').into_iter();
        let uri_part = parts
            .next()
            .ok_or_else(|| Error::ParseError("empty address header value".to_string()))?;
        let rest: String = parts.map(|p| format!(";{p}")).collect();
        Ok(AddrHeaderValue {
            display_name: None,
            uri: parse_uri(uri_part)?,
            params: ParamList::parse(&rest),
        })
    }
}

pub fn format_addr_header(addr: &AddrHeaderValue) -> String {
    let mut s = String::new();
    if let Some(dn) = &addr.display_name {
        s.push('"');
        s.push_str(dn);
        s.push_str("\" ");
    }
    s.push('<');
    s.push_str(&addr.uri.to_string());
    s.push('>');
    s.push_str(&addr.params.format());
    s
}

fn unquote_display_name(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
