// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request-line / header / urlencoded-body parser.
//!
//! Consumes complete CRLF-terminated lines out of a [`Buffer`](crate::buffer::Buffer)
//! as they arrive, so a request split across several `read_from_fd` calls
//! resumes exactly where the last call left off.

use crate::buffer::Buffer;
use crate::error::ParseError;
use crate::http::method::Method;
use crate::http::version::Version;

/// Paths that get a bare `.html` suffix appended rather than being served
/// as-is, mirroring the original's `DEFAULT_HTML` set.
const DEFAULT_HTML: &[&str] = &["/index", "/register", "/login", "/welcome", "/video", "/picture"];

/// Endpoint tag for the two POST targets that trigger credential checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointTag {
    Register,
    Login,
}

fn endpoint_tag(path: &str) -> Option<EndpointTag> {
    match path {
        "/register.html" => Some(EndpointTag::Register),
        "/login.html" => Some(EndpointTag::Login),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// An in-flight (or completed) request, reused across a connection's
/// keep-alive lifetime via [`Request::reset`].
#[derive(Debug)]
pub struct Request {
    state: ParseState,
    method: Option<Method>,
    path: String,
    version: Option<Version>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    post: Vec<(String, String)>,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: None,
            path: String::new(),
            version: None,
            headers: Vec::new(),
            body: Vec::new(),
            post: Vec::new(),
        }
    }

    /// Resets all fields to their construction-time values, for reuse on
    /// the next pipelined or keep-alive request.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method = None;
        self.path.clear();
        self.version = None;
        self.headers.clear();
        self.body.clear();
        self.post.clear();
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Overwrites the resolved path, used to rewrite `/login.html` or
    /// `/register.html` to `/welcome.html`/`/error.html` once the endpoint's
    /// DB-backed verification outcome is known.
    pub fn set_path(&mut self, path: String) {
        self.path = path;
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Looks up a header by exact (case-sensitive) name, as received on
    /// the wire.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn post(&self, key: &str) -> Option<&str> {
        self.post.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive") && self.version == Some(Version::Http11)
    }

    /// Consumes as many complete lines as are currently buffered, advancing
    /// through request-line, headers, and body. Returns `Ok(true)` once
    /// `state == Finish`, `Ok(false)` if more bytes are needed, or an error
    /// on a malformed request line.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<bool, ParseError> {
        if buf.readable_bytes() == 0 {
            return Ok(false);
        }

        while buf.readable_bytes() > 0 && self.state != ParseState::Finish {
            let readable = buf.peek();
            let Some(line_end) = find_crlf(readable) else { break };
            let line = readable[..line_end].to_vec();
            let consumed = line_end + 2;

            match self.state {
                ParseState::RequestLine => {
                    self.parse_request_line(&line)?;
                    self.canonicalize_path();
                }
                ParseState::Headers => {
                    if !self.parse_header_line(&line) {
                        self.state = ParseState::Body;
                    }
                    // A blank line with nothing buffered after it is the
                    // end of a bodyless request (no Content-Length to wait
                    // on): finish immediately rather than waiting in Body
                    // for a line that will never arrive.
                    if buf.readable_bytes() <= 2 {
                        self.state = ParseState::Finish;
                    }
                }
                ParseState::Body => {
                    self.body = line;
                    self.parse_post();
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => unreachable!(),
            }

            buf.retrieve(consumed);
        }

        Ok(self.state == ParseState::Finish)
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let mut parts = line.splitn(3, |&b| b == b' ');
        let method = parts.next().ok_or(ParseError::Method)?;
        let target = parts.next().ok_or(ParseError::Target)?;
        let version = parts.next().ok_or(ParseError::Version)?;

        self.method = Some(Method::parse(method)?);
        self.path = std::str::from_utf8(target).map_err(|_| ParseError::Target)?.to_string();
        let version_tail = version.strip_prefix(b"HTTP/").ok_or(ParseError::Version)?;
        self.version = Some(Version::parse(version_tail)?);
        self.state = ParseState::Headers;
        Ok(())
    }

    fn canonicalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// Returns `false` (and does not modify `headers`) if `line` has no
    /// `name: value` form, signaling the header section has ended.
    fn parse_header_line(&mut self, line: &[u8]) -> bool {
        let Some(colon) = line.iter().position(|&b| b == b':') else { return false };
        let name = String::from_utf8_lossy(&line[..colon]).into_owned();
        let mut value = &line[colon + 1..];
        if value.first() == Some(&b' ') {
            value = &value[1..];
        }
        let value = String::from_utf8_lossy(value).into_owned();
        self.headers.push((name, value));
        true
    }

    fn parse_post(&mut self) {
        if self.method != Some(Method::Post) {
            return;
        }
        if self.header("Content-Type") != Some("application/x-www-form-urlencoded") {
            return;
        }

        self.post = parse_urlencoded(&self.body);
    }

    /// Whether this request targets a fixed login/register endpoint, and
    /// which one. The actual credential check needs a `DbHandle`, so it
    /// lives on the connection/worker side; this just exposes the decoded
    /// username/password and which table entry matched.
    pub fn endpoint(&self) -> Option<(EndpointTag, &str, &str)> {
        let tag = endpoint_tag(&self.path)?;
        let username = self.post("username")?;
        let password = self.post("password")?;
        Some((tag, username, password))
    }
}

/// Finds the offset of the first `\r\n` in `data`, if any.
fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Decodes an `application/x-www-form-urlencoded` body into ordered
/// key/value pairs. `+` becomes a space, `%HH` becomes the byte the two hex
/// nibbles encode, `=` separates key from value, and `&` separates pairs; a
/// trailing pair with no terminating `&` is still captured.
fn parse_urlencoded(body: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if body.is_empty() {
        return pairs;
    }

    let mut decoded = Vec::with_capacity(body.len());
    let mut i = 0;
    let mut key: Option<Vec<u8>> = None;
    let mut field_start = 0;

    while i < body.len() {
        match body[i] {
            b'=' if key.is_none() => {
                key = Some(decoded[field_start..].to_vec());
                field_start = decoded.len();
                i += 1;
            }
            b'&' => {
                let value = decoded[field_start..].to_vec();
                field_start = decoded.len();
                if let Some(k) = key.take() {
                    pairs.push((
                        String::from_utf8_lossy(&k).into_owned(),
                        String::from_utf8_lossy(&value).into_owned(),
                    ));
                }
                i += 1;
            }
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < body.len() => {
                if let (Some(hi), Some(lo)) = (hex_val(body[i + 1]), hex_val(body[i + 2])) {
                    decoded.push(hi * 16 + lo);
                    i += 3;
                } else {
                    decoded.push(body[i]);
                    i += 1;
                }
            }
            b => {
                decoded.push(b);
                i += 1;
            }
        }
    }

    if let Some(k) = key {
        let value = decoded[field_start..].to_vec();
        pairs.push((
            String::from_utf8_lossy(&k).into_owned(),
            String::from_utf8_lossy(&value).into_owned(),
        ));
    }

    pairs
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(req: &mut Request, buf: &mut Buffer, data: &[u8]) -> Result<bool, ParseError> {
        buf.append(data);
        req.parse(buf)
    }

    #[test]
    fn parses_simple_get_request() {
        let mut req = Request::new();
        let mut buf = Buffer::new(64);
        let done = feed(&mut req, &mut buf, b"GET /index HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(done);
        assert_eq!(req.method(), Some(Method::Get));
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), Some(Version::Http11));
        assert!(req.is_keep_alive());
    }

    #[test]
    fn root_path_becomes_index_html() {
        let mut req = Request::new();
        let mut buf = Buffer::new(64);
        feed(&mut req, &mut buf, b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/index.html");
    }

    #[test]
    fn arbitrary_path_is_not_suffixed() {
        let mut req = Request::new();
        let mut buf = Buffer::new(64);
        feed(&mut req, &mut buf, b"GET /style.css HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/style.css");
    }

    #[test]
    fn malformed_request_line_is_an_error() {
        let mut req = Request::new();
        let mut buf = Buffer::new(64);
        buf.append(b"NOT A REQUEST LINE AT ALL\r\n");
        assert!(req.parse(&mut buf).is_err());
    }

    #[test]
    fn incomplete_request_waits_for_more_bytes() {
        let mut req = Request::new();
        let mut buf = Buffer::new(64);
        buf.append(b"GET /index HTTP/1.1\r\n");
        assert_eq!(req.parse(&mut buf).unwrap(), false);
        buf.append(b"\r\n");
        assert_eq!(req.parse(&mut buf).unwrap(), true);
    }

    #[test]
    fn post_login_decodes_urlencoded_body() {
        let mut req = Request::new();
        let mut buf = Buffer::new(128);
        feed(
            &mut req,
            &mut buf,
            b"POST /login.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nusername=alice&password=hunter2\r\n",
        )
        .unwrap();
        assert_eq!(req.post("username"), Some("alice"));
        assert_eq!(req.post("password"), Some("hunter2"));
        let (tag, user, pass) = req.endpoint().unwrap();
        assert_eq!(tag, EndpointTag::Login);
        assert_eq!(user, "alice");
        assert_eq!(pass, "hunter2");
    }

    #[test]
    fn percent_and_plus_decode_correctly() {
        let decoded = parse_urlencoded(b"q=a%20b+c");
        assert_eq!(decoded, vec![("q".to_string(), "a b c".to_string())]);
    }

    #[test]
    fn trailing_pair_without_ampersand_is_captured() {
        let decoded = parse_urlencoded(b"a=1&b=2");
        assert_eq!(decoded, vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]);
    }

    #[test]
    fn reset_clears_every_field() {
        let mut req = Request::new();
        let mut buf = Buffer::new(64);
        feed(&mut req, &mut buf, b"GET /index HTTP/1.1\r\n\r\n").unwrap();
        req.reset();
        assert_eq!(req.method(), None);
        assert_eq!(req.path(), "");
        assert!(req.header("Connection").is_none());
    }
}
