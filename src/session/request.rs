use std::fmt;

use crate::error::{Error, Result};

/// A parsed RTSP request (RFC 2326 §6).
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub version: String,
    /// Headers as received; lookups are case-insensitive per RFC 2326 §4.2.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Request {
    /// Parse the head of a request: request line plus header lines. The
    /// body is read separately once `Content-Length` is known.
    pub fn parse(head: &str) -> Result<Request> {
        let mut lines = head.lines();
        let request_line = lines.next().ok_or(Error::ErrRequestMalformed)?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(Error::ErrRequestMalformed)?.to_owned();
        let url = parts.next().ok_or(Error::ErrRequestMalformed)?.to_owned();
        let version = parts.next().ok_or(Error::ErrRequestMalformed)?.to_owned();

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            let colon = line.find(':').ok_or(Error::ErrRequestMalformed)?;
            headers.push((
                line[..colon].trim().to_owned(),
                line[colon + 1..].trim().to_owned(),
            ));
        }

        Ok(Request {
            method,
            url,
            version,
            headers,
            body: String::new(),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> &str {
        self.header("CSeq").unwrap_or("")
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.url, self.version)?;
        for (name, value) in &self.headers {
            write!(f, "{name}: {value}\r\n")?;
        }
        write!(f, "\r\n")?;
        if !self.body.is_empty() {
            write!(f, "{}", self.body)?;
        }
        Ok(())
    }
}
