// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Ordered header multimap.
//!
//! Header names are matched case-insensitively and compact forms (RFC 3261
//! §7.3.3) resolve to the same canonical name, so `v:` and `Via:` are the same
//! header. Insertion order is kept for serialization and every occurrence of a
//! repeated header is retained as its own value.

use std::slice::Iter;

use smol_str::SmolStr;

/// Compact form to canonical long form.
const COMPACT_FORMS: &[(char, &str)] = &[
    ('a', "Accept-Contact"),
    ('b', "Referred-By"),
    ('c', "Content-Type"),
    ('d', "Request-Disposition"),
    ('e', "Content-Encoding"),
    ('f', "From"),
    ('i', "Call-ID"),
    ('j', "Reject-Contact"),
    ('k', "Supported"),
    ('l', "Content-Length"),
    ('m', "Contact"),
    ('o', "Event"),
    ('r', "Refer-To"),
    ('s', "Subject"),
    ('t', "To"),
    ('u', "Allow-Events"),
    ('v', "Via"),
    ('x', "Session-Expires"),
    ('y', "Identity"),
];

/// Long names whose conventional spelling is not plain title case.
const WELL_KNOWN: &[&str] = &[
    "Call-ID",
    "CSeq",
    "WWW-Authenticate",
    "RSeq",
    "RAck",
    "MIME-Version",
    "SIP-ETag",
    "SIP-If-Match",
    "P-Asserted-Identity",
    "P-Preferred-Identity",
];

/// Returns the canonical spelling for a header name.
///
/// Compact forms expand to their long form, known names get their
/// conventional capitalisation and anything else is title-cased per
/// hyphen-separated word.
pub fn canonical_name(name: &str) -> SmolStr {
    let name = name.trim();
    if name.len() == 1 {
        let c = name.as_bytes()[0].to_ascii_lowercase() as char;
        if let Some((_, long)) = COMPACT_FORMS.iter().find(|(short, _)| *short == c) {
            return SmolStr::new(long);
        }
    }
    if let Some(known) = WELL_KNOWN.iter().find(|k| k.eq_ignore_ascii_case(name)) {
        return SmolStr::new(known);
    }
    if let Some((_, long)) = COMPACT_FORMS
        .iter()
        .find(|(_, long)| long.eq_ignore_ascii_case(name))
    {
        return SmolStr::new(long);
    }
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch.to_ascii_lowercase());
        }
        upper = ch == '-';
    }
    SmolStr::new(out)
}

/// Returns the compact form for a canonical header name, if one exists.
pub fn compact_form(name: &str) -> Option<char> {
    COMPACT_FORMS
        .iter()
        .find(|(_, long)| long.eq_ignore_ascii_case(name))
        .map(|(short, _)| *short)
}

fn same_header(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || canonical_name(a).eq_ignore_ascii_case(&canonical_name(b))
}

/// Represents a single SIP header field as a name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmolStr,
    pub value: SmolStr,
}

/// Collection of SIP headers preserving insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, normalising the name to its canonical form.
    pub fn push(&mut self, name: impl AsRef<str>, value: impl Into<SmolStr>) {
        self.0.push(Header {
            name: canonical_name(name.as_ref()),
            value: value.into(),
        });
    }

    /// Inserts a header in front of every existing header of the same name.
    ///
    /// Used for Via, where the topmost value is the one that matters.
    pub fn push_front(&mut self, name: impl AsRef<str>, value: impl Into<SmolStr>) {
        let name = canonical_name(name.as_ref());
        let at = self
            .0
            .iter()
            .position(|h| same_header(&h.name, &name))
            .unwrap_or(0);
        self.0.insert(
            at,
            Header {
                name,
                value: value.into(),
            },
        );
    }

    pub fn iter(&self) -> Iter<'_, Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the first value stored under `name` (compact aliases included).
    pub fn get(&self, name: &str) -> Option<&SmolStr> {
        self.0
            .iter()
            .find(|h| same_header(&h.name, name))
            .map(|h| &h.value)
    }

    /// Returns every value stored under `name`, one per header occurrence.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SmolStr> + 'a {
        self.0
            .iter()
            .filter(move |h| same_header(&h.name, name))
            .map(|h| &h.value)
    }

    /// Counts occurrences of `name`.
    pub fn count(&self, name: &str) -> usize {
        self.get_all(name).count()
    }

    /// Returns all occurrences joined into one comma-separated value.
    pub fn combined(&self, name: &str) -> Option<String> {
        let mut values = self.get_all(name).peekable();
        values.peek()?;
        Some(values.map(SmolStr::as_str).collect::<Vec<_>>().join(", "))
    }

    /// Returns the individual list elements for `name`.
    ///
    /// Each occurrence is split on commas that are outside quoted strings and
    /// angle brackets, so `Via: a, b` and two separate Via lines give the same
    /// result.
    pub fn list(&self, name: &str) -> Vec<SmolStr> {
        self.get_all(name)
            .flat_map(|value| split_list(value))
            .collect()
    }

    /// Replaces the first value for `name`, appending when absent.
    pub fn set(&mut self, name: &str, value: impl Into<SmolStr>) {
        match self.0.iter_mut().find(|h| same_header(&h.name, name)) {
            Some(header) => header.value = value.into(),
            None => self.push(name, value),
        }
    }

    /// Removes every occurrence of `name`, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|h| !same_header(&h.name, name));
        before - self.0.len()
    }

    pub fn into_inner(self) -> Vec<Header> {
        self.0
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Splits a header value on top-level commas.
pub fn split_list(value: &str) -> Vec<SmolStr> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut angle = 0usize;
    let mut escaped = false;
    let mut start = 0;
    for (idx, ch) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            '<' if !quoted => angle += 1,
            '>' if !quoted => angle = angle.saturating_sub(1),
            ',' if !quoted && angle == 0 => {
                let part = value[start..idx].trim();
                if !part.is_empty() {
                    parts.push(SmolStr::new(part));
                }
                start = idx + 1;
            }
            _ => {}
        }
    }
    let tail = value[start..].trim();
    if !tail.is_empty() {
        parts.push(SmolStr::new(tail));
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_names_resolve_to_long_form() {
        assert_eq!(canonical_name("v"), "Via");
        assert_eq!(canonical_name("I"), "Call-ID");
        assert_eq!(canonical_name("call-id"), "Call-ID");
        assert_eq!(canonical_name("cseq"), "CSeq");
        assert_eq!(canonical_name("x-custom-thing"), "X-Custom-Thing");
        assert_eq!(compact_form("Content-Length"), Some('l'));
        assert_eq!(compact_form("CSeq"), None);
    }

    #[test]
    fn lookup_ignores_case_and_compact_aliases() {
        let mut headers = Headers::new();
        headers.push("v", "SIP/2.0/UDP a;branch=z9hG4bK1");
        headers.push("VIA", "SIP/2.0/UDP b;branch=z9hG4bK2");
        assert_eq!(headers.count("Via"), 2);
        assert_eq!(
            headers.get("v").map(SmolStr::as_str),
            Some("SIP/2.0/UDP a;branch=z9hG4bK1")
        );
        assert!(headers.iter().all(|h| h.name == "Via"));
    }

    #[test]
    fn combined_view_joins_occurrences() {
        let mut headers = Headers::new();
        headers.push("Supported", "timer");
        headers.push("k", "100rel");
        assert_eq!(headers.combined("Supported").as_deref(), Some("timer, 100rel"));
        assert_eq!(headers.combined("Require"), None);
    }

    #[test]
    fn list_splits_outside_quotes_and_brackets() {
        let mut headers = Headers::new();
        headers.push(
            "Contact",
            "\"Doe, John\" <sip:j@a.com;x=1,2>, <sip:k@b.com>",
        );
        let items = headers.list("m");
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], "<sip:k@b.com>");
    }

    #[test]
    fn push_front_places_before_existing_occurrences() {
        let mut headers = Headers::new();
        headers.push("Call-ID", "x");
        headers.push("Via", "second");
        headers.push_front("Via", "first");
        let vias: Vec<_> = headers.get_all("Via").collect();
        assert_eq!(vias, vec!["first", "second"]);
        assert_eq!(headers.iter().next().map(|h| h.name.as_str()), Some("Call-ID"));
    }

    #[test]
    fn set_and_remove() {
        let mut headers = Headers::new();
        headers.push("Content-Length", "10");
        headers.set("l", "0");
        assert_eq!(headers.get("Content-Length").map(SmolStr::as_str), Some("0"));
        headers.push("Route", "<sip:a>");
        headers.push("Route", "<sip:b>");
        assert_eq!(headers.remove("route"), 2);
        assert_eq!(headers.len(), 1);
    }
}
