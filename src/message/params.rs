//! Generic `;name=value` parameter lists shared by Via, Route, Record-Route
//! and Contact header values (and by URI parameters).

/// An ordered list of `name[=value]` pairs. Order is preserved because some
/// peers are picky about it in Record-Route/Route chains; lookups are
/// case-insensitive on the name, per RFC 3261 token comparison rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamList(pub Vec<(String, Option<String>)>);

impl ParamList {
    pub fn new() -> Self {
        ParamList(Vec::new())
    }

    pub fn parse(s: &str) -> Self {
        let mut params = Vec::new();
        for part in split_top_level(s, ';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((k, v)) => params.push((k.trim().to_string(), Some(unquote(v.trim())))),
                None => params.push((part.to_string(), None)),
            }
        }
        ParamList(params)
    }

    pub fn format(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!(";{}={}", k, v),
                None => format!(";{}", k),
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn set(&mut self, name: &str, value: Option<String>) {
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            slot.1 = value;
        } else {
            self.0.push((name.to_string(), value));
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.0.len() != before
    }

    pub fn push_front(&mut self, name: &str, value: Option<String>) {
        self.0.insert(0, (name.to_string(), value));
    }
}

fn unquote(v: &str) -> String {
    if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        v[1..v.len() - 1].to_string()
    } else {
        v.to_string()
    }
}

/// Splits `s` on `sep` but never inside a `<...>` or `"..."` span — needed
/// because Contact/Route/Record-Route values look like
/// `"Alice" <sip:alice@host;transport=tcp>;tag=abc` where the URI's own
/// `;transport=tcp` must not be confused with the header's own params.
pub fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth_angle = 0i32;
    let mut in_quotes = false;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth_angle += 1,
            '>' if !in_quotes => depth_angle -= 1,
            c if c == sep && !in_quotes && depth_angle == 0 => {
                out.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}
