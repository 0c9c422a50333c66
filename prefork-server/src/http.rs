//! Just enough HTTP/1.1 for a benchmark endpoint: find the end of a request
//! head, read the request line, and encode fixed responses. Request headers
//! and bodies are ignored.

use std::io::Write;

use chrono::Utc;
use serde::Serialize;

use crate::config::ResponseConfig;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("malformed request line")]
    MalformedRequestLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: &'a str,
    pub path: &'a str,
}

/// Parse one request head from the front of `buf`.
///
/// Returns `Ok(None)` while the head is incomplete, otherwise the request and
/// the number of bytes it occupied.
pub fn parse_head(buf: &[u8]) -> Result<Option<(Request<'_>, usize)>, HttpError> {
    let Some(end) = buf
        .windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
    else {
        return Ok(None);
    };
    let head = buf.get(..end).ok_or(HttpError::MalformedRequestLine)?;
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = head
        .get(..line_end)
        .and_then(|line| std::str::from_utf8(line).ok())
        .ok_or(HttpError::MalformedRequestLine)?;

    let mut parts = line.split(' ');
    let (Some(method), Some(path), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpError::MalformedRequestLine);
    };
    if method.is_empty() || !path.starts_with('/') || !version.starts_with("HTTP/1.") {
        return Err(HttpError::MalformedRequestLine);
    }
    Ok(Some((Request { method, path }, end + HEAD_TERMINATOR.len())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
}

impl Status {
    fn line(self) -> &'static str {
        match self {
            Self::Ok => "200 OK",
            Self::BadRequest => "400 Bad Request",
            Self::NotFound => "404 Not Found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: Status, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(Status::NotFound, "text/plain", "Not Found")
    }

    pub fn bad_request() -> Self {
        Self::new(Status::BadRequest, "text/plain", "Bad Request")
    }

    /// Append the wire form to `out`.
    pub fn encode(&self, server: &str, date: Option<&str>, out: &mut Vec<u8>) {
        // Writes into a Vec cannot fail.
        let _ = write!(out, "HTTP/1.1 {}\r\nServer: {server}\r\n", self.status.line());
        if let Some(date) = date {
            let _ = write!(out, "Date: {date}\r\n");
        }
        let _ = write!(
            out,
            "Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
            self.content_type,
            self.body.len()
        );
        out.extend_from_slice(&self.body);
    }
}

/// `Date` header value for the current time (RFC 9110 IMF-fixdate).
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Serialize)]
struct Message<'a> {
    message: &'a str,
}

/// Routes `/plaintext` and `/json`; everything else is 404.
#[derive(Debug, Clone)]
pub struct Responder {
    plaintext: Vec<u8>,
    json: Vec<u8>,
}

impl Responder {
    pub fn new(config: &ResponseConfig) -> serde_json::Result<Self> {
        Ok(Self {
            plaintext: config.plaintext.clone().into_bytes(),
            json: serde_json::to_vec(&Message {
                message: &config.json_message,
            })?,
        })
    }

    pub fn respond(&self, request: &Request<'_>) -> Response {
        let path = request.path.split('?').next().unwrap_or(request.path);
        match path {
            "/plaintext" => Response::new(Status::Ok, "text/plain", self.plaintext.clone()),
            "/json" => Response::new(Status::Ok, "application/json", self.json.clone()),
            _ => Response::not_found(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_head_needs_more_data() {
        assert_eq!(parse_head(b"GET /plaintext HTTP/1.1\r\nHost: x\r\n"), Ok(None));
        assert_eq!(parse_head(b""), Ok(None));
    }

    #[test]
    fn parses_request_line_and_length() {
        let buf = b"GET /json HTTP/1.1\r\nHost: x\r\n\r\nGET /next";
        let (request, used) = parse_head(buf).unwrap().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/json");
        assert_eq!(&buf[used..], b"GET /next");
    }

    #[test]
    fn head_without_headers() {
        let (request, used) = parse_head(b"HEAD / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert_eq!(request.method, "HEAD");
        assert_eq!(request.path, "/");
        assert_eq!(used, 19);
    }

    #[test]
    fn rejects_malformed_request_lines() {
        for head in [
            &b"GET\r\n\r\n"[..],
            b"GET /a\r\n\r\n",
            b"GET a HTTP/1.1\r\n\r\n",
            b"GET /a SPDY/3\r\n\r\n",
            b"GET /a HTTP/1.1 extra\r\n\r\n",
            b"\xff\xfe /a HTTP/1.1\r\n\r\n",
        ] {
            assert_eq!(
                parse_head(head),
                Err(HttpError::MalformedRequestLine),
                "{:?}",
                String::from_utf8_lossy(head)
            );
        }
    }

    #[test]
    fn routes() {
        let responder = Responder::new(&ResponseConfig::default()).unwrap();
        let plain = responder.respond(&Request {
            method: "GET",
            path: "/plaintext",
        });
        assert_eq!(plain.status, Status::Ok);
        assert_eq!(plain.body, b"Hello, World!");

        let json = responder.respond(&Request {
            method: "GET",
            path: "/json?pretty=1",
        });
        assert_eq!(json.content_type, "application/json");
        let value: serde_json::Value = serde_json::from_slice(&json.body).unwrap();
        assert_eq!(value, serde_json::json!({"message": "Hello, World!"}));

        let missing = responder.respond(&Request {
            method: "GET",
            path: "/nope",
        });
        assert_eq!(missing.status, Status::NotFound);
    }

    #[test]
    fn encodes_status_headers_and_body() {
        let mut out = Vec::new();
        Response::new(Status::Ok, "text/plain", "hi").encode(
            "prefork",
            Some("Thu, 01 Jan 1970 00:00:00 GMT"),
            &mut out,
        );
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 200 OK\r\nServer: prefork\r\nDate: Thu, 01 Jan 1970 00:00:00 GMT\r\n\
             Content-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi"
        );
    }

    #[test]
    fn encode_without_date() {
        let mut out = Vec::new();
        Response::not_found().encode("s", None, &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\nServer: s\r\nContent-Type"));
        assert!(!text.contains("Date:"));
    }

    #[test]
    fn http_date_format() {
        let date = http_date();
        assert!(date.ends_with(" GMT"), "{date}");
        assert_eq!(date.len(), "Thu, 01 Jan 1970 00:00:00 GMT".len());
    }
}
