// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental HTTP/1.x request-head parser.
//!
//! A single-pass state machine over octets. Feeding bytes yields one of
//! three outcomes: `Good` (a complete, valid head was consumed), `Bad`
//! (protocol violation) or `Indeterminate` (more input needed). The parser
//! never looks past the prefix it reports as consumed.
//!
//! Bounds: method <= 10 bytes, URI <= 2048 bytes, cumulative header bytes
//! <= 8192, HTTP version within [1.0, 1.1].

use std::mem;

const MAX_METHOD_LEN: usize = 10;
const MAX_URI_LEN: usize = 2048;
const MAX_HEADERS_LEN: usize = 8192;

const MIN_VERSION: (u32, u32) = (1, 0);
const MAX_VERSION: (u32, u32) = (1, 1);

/// Outcome of feeding bytes to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Complete request head consumed and valid.
    Good,
    /// The input violates the grammar or a bound.
    Bad,
    /// Valid so far, needs more input.
    Indeterminate,
}

/// A parsed request head. Header names keep their wire spelling; repeated
/// headers keep their arrival order.
#[derive(Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub headers: Vec<(String, String)>,
}

/// Errors raised by typed header accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    NotUnique,
    BadFormat,
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::NotUnique => write!(f, "header occurs more than once"),
            HeaderError::BadFormat => write!(f, "header value is malformed"),
        }
    }
}

impl std::error::Error for HeaderError {}

impl HttpRequest {
    /// A header that must occur at most once.
    pub fn unique_header(&self, name: &str) -> Result<Option<&str>, HeaderError> {
        let mut found = None;
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case(name) {
                if found.is_some() {
                    return Err(HeaderError::NotUnique);
                }
                found = Some(value.as_str());
            }
        }
        Ok(found)
    }

    /// All values of a repeated header, comma-joined in arrival order.
    pub fn header_list(&self, name: &str) -> Option<String> {
        let mut joined: Option<String> = None;
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case(name) {
                match joined {
                    Some(ref mut list) => {
                        list.push_str(", ");
                        list.push_str(value);
                    }
                    None => joined = Some(value.clone()),
                }
            }
        }
        joined
    }

    pub fn content_length(&self) -> Result<Option<usize>, HeaderError> {
        match self.unique_header("Content-Length")? {
            Some(value) => value
                .parse::<usize>()
                .map(Some)
                .map_err(|_| HeaderError::BadFormat),
            None => Ok(None),
        }
    }

    /// `Content-Type` split into its `"; "`-separated parts.
    pub fn content_type(&self) -> Result<Option<Vec<String>>, HeaderError> {
        match self.unique_header("Content-Type")? {
            Some(value) => Ok(Some(value.split("; ").map(str::to_owned).collect())),
            None => Ok(None),
        }
    }

    /// True when `Connection` lists the `keep-alive` token (exact spelling).
    pub fn keep_alive(&self) -> bool {
        match self.header_list("Connection") {
            Some(list) => list.split(", ").any(|item| item == "keep-alive"),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    MethodStart,
    Method,
    Uri,
    VersionH,
    VersionT1,
    VersionT2,
    VersionP,
    VersionSlash,
    VersionMajorStart,
    VersionMajor,
    VersionMinorStart,
    VersionMinor,
    ExpectingNewline1,
    HeaderLineStart,
    HeaderLws,
    HeaderName,
    SpaceBeforeHeaderValue,
    HeaderValue,
    HeaderValueFolded,
    ExpectingNewline2,
    ExpectingNewline3,
}

/// The head parser proper. Reusable across requests via [`RequestParser::reset`].
#[derive(Debug)]
pub struct RequestParser {
    state: State,
    method: String,
    uri: String,
    version_major: u32,
    version_minor: u32,
    header_name: String,
    header_value: String,
    total_header_bytes: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: State::MethodStart,
            method: String::new(),
            uri: String::new(),
            version_major: 0,
            version_minor: 0,
            header_name: String::new(),
            header_value: String::new(),
            total_header_bytes: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::MethodStart;
        self.method.clear();
        self.uri.clear();
        self.version_major = 0;
        self.version_minor = 0;
        self.header_name.clear();
        self.header_value.clear();
        self.total_header_bytes = 0;
    }

    /// Feed a buffer. Returns the outcome and how many bytes were consumed.
    /// On `Good` or `Bad` the unconsumed suffix belongs to the body (or the
    /// next request) and is untouched.
    pub fn parse(&mut self, req: &mut HttpRequest, input: &[u8]) -> (ParseOutcome, usize) {
        for (pos, &byte) in input.iter().enumerate() {
            match self.consume(req, byte) {
                ParseOutcome::Indeterminate => {}
                outcome => return (outcome, pos + 1),
            }
        }
        (ParseOutcome::Indeterminate, input.len())
    }

    fn consume(&mut self, req: &mut HttpRequest, input: u8) -> ParseOutcome {
        use ParseOutcome::{Bad, Good, Indeterminate};

        match self.state {
            State::MethodStart => {
                if !is_token_char(input) {
                    return Bad;
                }
                self.method.push(input as char);
                self.state = State::Method;
                Indeterminate
            }

            State::Method => {
                if input == b' ' {
                    req.method = mem::take(&mut self.method);
                    self.state = State::Uri;
                    return Indeterminate;
                }
                if !is_token_char(input) || self.method.len() == MAX_METHOD_LEN {
                    return Bad;
                }
                self.method.push(input as char);
                Indeterminate
            }

            State::Uri => {
                if input == b' ' {
                    if self.uri.is_empty() {
                        return Bad;
                    }
                    req.uri = mem::take(&mut self.uri);
                    self.state = State::VersionH;
                    return Indeterminate;
                }
                if is_ctl(input) || self.uri.len() == MAX_URI_LEN {
                    return Bad;
                }
                self.uri.push(input as char);
                Indeterminate
            }

            State::VersionH => self.expect(input, b'H', State::VersionT1),
            State::VersionT1 => self.expect(input, b'T', State::VersionT2),
            State::VersionT2 => self.expect(input, b'T', State::VersionP),
            State::VersionP => self.expect(input, b'P', State::VersionSlash),
            State::VersionSlash => self.expect(input, b'/', State::VersionMajorStart),

            State::VersionMajorStart => {
                let Some(digit) = to_digit(input) else {
                    return Bad;
                };
                if digit == 0 || digit > MAX_VERSION.0 {
                    return Bad;
                }
                self.version_major = digit;
                self.state = State::VersionMajor;
                Indeterminate
            }

            State::VersionMajor => {
                if input == b'.' {
                    if self.version_major < MIN_VERSION.0 {
                        return Bad;
                    }
                    self.state = State::VersionMinorStart;
                    return Indeterminate;
                }
                match to_digit(input) {
                    Some(digit) if bounded_add_digit(&mut self.version_major, digit, MAX_VERSION.0) => {
                        Indeterminate
                    }
                    _ => Bad,
                }
            }

            State::VersionMinorStart => {
                let Some(digit) = to_digit(input) else {
                    return Bad;
                };
                if self.version_major == MAX_VERSION.0 && digit > MAX_VERSION.1 {
                    return Bad;
                }
                self.version_minor = digit;
                self.state = State::VersionMinor;
                Indeterminate
            }

            State::VersionMinor => {
                if input == b'\r' {
                    if self.version_major == MIN_VERSION.0 && self.version_minor < MIN_VERSION.1 {
                        return Bad;
                    }
                    req.version_major = self.version_major;
                    req.version_minor = self.version_minor;
                    self.state = State::ExpectingNewline1;
                    return Indeterminate;
                }
                let max_minor = if self.version_major == MAX_VERSION.0 {
                    MAX_VERSION.1
                } else {
                    u32::MAX
                };
                match to_digit(input) {
                    Some(digit) if bounded_add_digit(&mut self.version_minor, digit, max_minor) => {
                        Indeterminate
                    }
                    _ => Bad,
                }
            }

            State::ExpectingNewline1 => self.expect(input, b'\n', State::HeaderLineStart),

            State::HeaderLineStart => {
                if input == b'\r' {
                    self.state = State::ExpectingNewline3;
                    return Indeterminate;
                }
                if (input == b' ' || input == b'\t') && !req.headers.is_empty() {
                    self.state = State::HeaderLws;
                    return Indeterminate;
                }
                if !is_token_char(input) {
                    return Bad;
                }
                if !self.count_header_byte() {
                    return Bad;
                }
                self.header_name.push(input as char);
                self.state = State::HeaderName;
                Indeterminate
            }

            State::HeaderLws => {
                if input == b'\r' {
                    self.state = State::ExpectingNewline2;
                    return Indeterminate;
                }
                if input == b' ' || input == b'\t' {
                    return Indeterminate;
                }
                if is_ctl(input) {
                    return Bad;
                }
                // Folded line: the byte continues the previous header's value.
                if !self.count_header_byte() {
                    return Bad;
                }
                if let Some((_, value)) = req.headers.last_mut() {
                    value.push(input as char);
                }
                self.state = State::HeaderValueFolded;
                Indeterminate
            }

            State::HeaderValueFolded => {
                if input == b'\r' {
                    self.state = State::ExpectingNewline2;
                    return Indeterminate;
                }
                if is_ctl(input) || !self.count_header_byte() {
                    return Bad;
                }
                if let Some((_, value)) = req.headers.last_mut() {
                    value.push(input as char);
                }
                Indeterminate
            }

            State::HeaderName => {
                if input == b':' {
                    self.state = State::SpaceBeforeHeaderValue;
                    return Indeterminate;
                }
                if !is_token_char(input) || !self.count_header_byte() {
                    return Bad;
                }
                self.header_name.push(input as char);
                Indeterminate
            }

            State::SpaceBeforeHeaderValue => self.expect(input, b' ', State::HeaderValue),

            State::HeaderValue => {
                if input == b'\r' {
                    self.state = State::ExpectingNewline2;
                    return Indeterminate;
                }
                if is_ctl(input) || !self.count_header_byte() {
                    return Bad;
                }
                self.header_value.push(input as char);
                Indeterminate
            }

            State::ExpectingNewline2 => {
                if input == b'\n' {
                    if !self.header_name.is_empty() {
                        req.headers.push((
                            mem::take(&mut self.header_name),
                            mem::take(&mut self.header_value),
                        ));
                    }
                    self.state = State::HeaderLineStart;
                    return Indeterminate;
                }
                Bad
            }

            State::ExpectingNewline3 => {
                if input == b'\n' {
                    Good
                } else {
                    Bad
                }
            }
        }
    }

    fn expect(&mut self, input: u8, wanted: u8, next: State) -> ParseOutcome {
        if input == wanted {
            self.state = next;
            ParseOutcome::Indeterminate
        } else {
            ParseOutcome::Bad
        }
    }

    fn count_header_byte(&mut self) -> bool {
        if self.total_header_bytes == MAX_HEADERS_LEN {
            return false;
        }
        self.total_header_bytes += 1;
        true
    }
}

const fn is_ctl(byte: u8) -> bool {
    byte <= 31 || byte == 127
}

const fn is_tspecial(byte: u8) -> bool {
    matches!(
        byte,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

/// CHAR minus CTLs and tspecials: what may appear in methods and header names.
const fn is_token_char(byte: u8) -> bool {
    byte <= 127 && !is_ctl(byte) && !is_tspecial(byte)
}

const fn to_digit(byte: u8) -> Option<u32> {
    if byte.is_ascii_digit() {
        Some((byte - b'0') as u32)
    } else {
        None
    }
}

/// `value = value * 10 + digit` unless that would exceed `max`.
fn bounded_add_digit(value: &mut u32, digit: u32, max: u32) -> bool {
    if max / 10 < *value {
        return false;
    }
    let scaled = *value * 10;
    if max - digit < scaled {
        return false;
    }
    *value = scaled + digit;
    true
}
