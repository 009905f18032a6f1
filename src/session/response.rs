use std::fmt;

use crate::error::{Error, Result};

pub const RTSP_VERSION: &str = "RTSP/1.0";

/// An RTSP response under construction (server side) or parsed off the
/// wire (client side).
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, reason: &str, cseq: &str, session_id: &str) -> Response {
        let mut headers = Vec::new();
        if !cseq.is_empty() {
            headers.push(("CSeq".to_owned(), cseq.to_owned()));
        }
        if !session_id.is_empty() {
            headers.push(("Session".to_owned(), session_id.to_owned()));
        }
        Response {
            status,
            reason: reason.to_owned(),
            headers,
            body: String::new(),
        }
    }

    pub fn set_status(&mut self, status: u16, reason: impl Into<String>) {
        self.status = status;
        self.reason = reason.into();
    }

    /// Set or replace a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (key, existing) in self.headers.iter_mut() {
            if key.eq_ignore_ascii_case(name) {
                *existing = value;
                return;
            }
        }
        self.headers.push((name.to_owned(), value));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Attach a body and maintain Content-Length.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
        self.set_header("Content-Length", self.body.len().to_string());
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Parse the head of a response: status line plus header lines. The
    /// body is read separately once `Content-Length` is known.
    pub fn parse(head: &str) -> Result<Response> {
        let mut lines = head.lines();
        let status_line = lines.next().ok_or(Error::ErrResponseMalformed)?;
        let mut parts = status_line.splitn(3, ' ');
        let _version = parts.next().ok_or(Error::ErrResponseMalformed)?;
        let status = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or(Error::ErrResponseMalformed)?;
        let reason = parts.next().unwrap_or("").to_owned();

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            if let Some(colon) = line.find(':') {
                headers.push((
                    line[..colon].trim().to_owned(),
                    line[colon + 1..].trim().to_owned(),
                ));
            }
        }

        Ok(Response {
            status,
            reason,
            headers,
            body: String::new(),
        })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", RTSP_VERSION, self.status, self.reason)?;
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
