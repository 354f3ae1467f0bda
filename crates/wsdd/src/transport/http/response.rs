// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Canned HTTP responses and reply serialization.

/// Status codes the endpoint can emit. Anything unknown serializes as 500.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 200,
    BadRequest = 400,
    NotFound = 404,
    InternalServerError = 500,
}

struct StatusRecord {
    code: u16,
    line: &'static str,
    body: &'static str,
}

static STATUSES: &[StatusRecord] = &[
    StatusRecord {
        code: 200,
        line: "HTTP/1.0 200 OK\r\n",
        body: "",
    },
    StatusRecord {
        code: 400,
        line: "HTTP/1.0 400 Bad Request\r\n",
        body: "<html>\
               <head><title>Bad Request</title></head>\
               <body><h1>400 Bad Request</h1></body>\
               </html>",
    },
    StatusRecord {
        code: 404,
        line: "HTTP/1.0 404 Not Found\r\n",
        body: "<html>\
               <head><title>Not Found</title></head>\
               <body><h1>404 Not Found</h1></body>\
               </html>",
    },
    StatusRecord {
        code: 500,
        line: "HTTP/1.0 500 Internal Server Error\r\n",
        body: "<html>\
               <head><title>Internal Server Error</title></head>\
               <body><h1>500 Internal Server Error</h1></body>\
               </html>",
    },
];

fn find_record(status: Status) -> &'static StatusRecord {
    let code = status as u16;
    STATUSES
        .iter()
        .find(|record| record.code == code)
        .unwrap_or_else(|| &STATUSES[STATUSES.len() - 1])
}

/// A fully serialized response, ready to be written to the socket.
#[derive(Debug, Default)]
pub struct HttpResponse {
    bytes: Vec<u8>,
}

impl HttpResponse {
    /// A stock error/status page with `Content-Type: text/html`.
    pub fn stock(status: Status) -> Self {
        let record = find_record(status);
        let mut bytes = Vec::with_capacity(record.line.len() + record.body.len() + 64);
        bytes.extend_from_slice(record.line.as_bytes());
        bytes.extend_from_slice(format!("Content-Length: {}\r\n", record.body.len()).as_bytes());
        bytes.extend_from_slice(b"Content-Type: text/html\r\n\r\n");
        bytes.extend_from_slice(record.body.as_bytes());
        Self { bytes }
    }

    /// A `200 OK` carrying a SOAP payload.
    pub fn soap_reply(payload: &[u8]) -> Self {
        let record = find_record(Status::Ok);
        let mut bytes = Vec::with_capacity(record.line.len() + payload.len() + 64);
        bytes.extend_from_slice(record.line.as_bytes());
        bytes.extend_from_slice(format!("Content-Length: {}\r\n", payload.len()).as_bytes());
        bytes.extend_from_slice(b"Content-Type: application/soap+xml\r\n\r\n");
        bytes.extend_from_slice(payload);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_400_has_correct_framing() {
        let resp = HttpResponse::stock(Status::BadRequest);
        let text = String::from_utf8(resp.into_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.0 400 Bad Request\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        let declared: usize = text
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, body.len());
    }

    #[test]
    fn soap_reply_declares_payload_length() {
        let resp = HttpResponse::soap_reply(b"<x/>");
        let text = String::from_utf8(resp.into_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.contains("Content-Type: application/soap+xml\r\n"));
        assert!(text.ends_with("<x/>"));
    }
}
