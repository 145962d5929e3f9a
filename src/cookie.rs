/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Cookie handling for requests and replies.

use crate::http1::protocol::HeaderList;

/// Parses all `Cookie` request headers into name/value pairs, in order.
/// A cookie without `=` has an empty value.
pub fn parse_request_cookies(headers: &HeaderList) -> Vec<(String, String)> {
    let mut out = Vec::new();

    for value in headers.find_all("cookie") {
        let mut s = value;

        loop {
            s = s.trim_start();
            if s.is_empty() {
                break;
            }

            let name_end = s
                .find(|c: char| c == '=' || c == ';' || c == ',')
                .unwrap_or(s.len());
            let name = &s[..name_end];
            s = &s[name_end..];

            let mut val = "";

            if let Some(rest) = s.strip_prefix('=') {
                let val_end = rest
                    .find(|c: char| c == ' ' || c == '\t' || c == ';' || c == ',')
                    .unwrap_or(rest.len());

                val = &rest[..val_end];
                s = &rest[val_end..];
            }

            if !name.is_empty() {
                out.push((name.to_string(), val.to_string()));
            }

            s = s.trim_start_matches(|c: char| c == ' ' || c == '\t' || c == ';' || c == ',');
        }
    }

    out
}

/// Looks up a single request cookie by exact name.
pub fn find_request_cookie(headers: &HeaderList, name: &str) -> Option<String> {
    parse_request_cookies(headers)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v)
}

/// Extracts an attribute such as `path` or `domain` from a Set-Cookie value.
/// Attributes start after the first `;`. Quoted values are unquoted.
pub fn parse_attr<'a>(value: &'a str, attr: &str) -> Option<&'a str> {
    let mut parts = value.split(';');

    // skip the name=value portion
    parts.next();

    for part in parts {
        let part = part.trim_start();

        let matches = part
            .get(..attr.len())
            .map_or(false, |p| p.eq_ignore_ascii_case(attr));

        if !matches {
            continue;
        }

        let rest = part[attr.len()..].trim_start();

        let rest = match rest.strip_prefix('=') {
            Some(rest) => rest.trim_start(),
            None => continue,
        };

        if let Some(quoted) = rest.strip_prefix('"') {
            return Some(match quoted.find('"') {
                Some(end) => &quoted[..end],
                None => quoted,
            });
        }

        let end = rest
            .find(|c: char| c.is_ascii_whitespace() || c == ';')
            .unwrap_or(rest.len());

        return Some(&rest[..end]);
    }

    None
}

fn attrs_match(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
}

/// Cookies to be sent with a reply.
#[derive(Debug, Clone, Default)]
pub struct CookieList {
    cookies: Vec<SetCookie>,
}

impl CookieList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a cookie, replacing an existing one with the same name, path
    /// and domain. `value` may carry attributes, e.g. `abc; path=/`.
    pub fn set(&mut self, name: &str, value: &str) {
        let path = parse_attr(value, "path");
        let domain = parse_attr(value, "domain");

        let existing = self.cookies.iter_mut().find(|c| {
            c.name == name
                && attrs_match(parse_attr(&c.value, "path"), path)
                && attrs_match(parse_attr(&c.value, "domain"), domain)
        });

        match existing {
            Some(c) => c.value = value.to_string(),
            None => self.cookies.push(SetCookie {
                name: name.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SetCookie> {
        self.cookies.iter()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Returns the `Set-Cookie` header lines, without line terminators.
    pub fn header_lines(&self) -> Vec<String> {
        self.cookies
            .iter()
            .map(|c| format!("Set-Cookie: {}={}", c.name, c.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_cookies() {
        let headers = HeaderList::parse(
            "Cookie: a=1; b=two,c\r\n\
             Host: x\r\n\
             cookie: d=\r\n",
        );

        let cookies = parse_request_cookies(&headers);

        assert_eq!(
            cookies,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string()),
                ("c".to_string(), "".to_string()),
                ("d".to_string(), "".to_string()),
            ]
        );

        assert_eq!(find_request_cookie(&headers, "b"), Some("two".to_string()));
        assert_eq!(find_request_cookie(&headers, "B"), None);
    }

    #[test]
    fn test_parse_attr() {
        let v = "abc; Path=/app; domain = \"example.com\"; Secure";

        assert_eq!(parse_attr(v, "path"), Some("/app"));
        assert_eq!(parse_attr(v, "domain"), Some("example.com"));
        assert_eq!(parse_attr(v, "expires"), None);
        assert_eq!(parse_attr("path=/", "path"), None);

        // multi-byte characters straddling the attribute length
        assert_eq!(parse_attr("form-data; abcé=1; name=\"x\"", "name"), Some("x"));
        assert_eq!(parse_attr("a; é=1", "p"), None);
    }

    #[test]
    fn test_set_replaces_matching() {
        let mut cookies = CookieList::new();

        cookies.set("sid", "1; path=/");
        cookies.set("sid", "2; path=/other");
        cookies.set("sid", "3; PATH=/");
        cookies.set("theme", "dark");

        assert_eq!(cookies.len(), 3);
        assert_eq!(
            cookies.header_lines(),
            vec![
                "Set-Cookie: sid=3; PATH=/",
                "Set-Cookie: sid=2; path=/other",
                "Set-Cookie: theme=dark",
            ]
        );

        // different domain is a distinct cookie
        cookies.set("theme", "light; domain=example.com");
        assert_eq!(cookies.len(), 4);
    }
}
