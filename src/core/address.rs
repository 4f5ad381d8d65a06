//! Endpoint addresses.
//!
//! An address names a queue endpoint by transport kind plus an IP/port pair, a
//! named pipe, or both. The text form is what the record codec stores in the
//! `from` field; the fingerprint is the short, filename-safe tail of a store key.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::core::{Error, Result};

const FIELD_SEP: char = '|';
const LOCAL_SERVER: &str = ".";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Np,
    Both,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Np => "np",
            TransportKind::Both => "both",
        }
    }

    pub fn has_tcp(self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Both)
    }

    pub fn has_pipe(self) -> bool {
        matches!(self, TransportKind::Np | TransportKind::Both)
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "np" => Ok(TransportKind::Np),
            "both" => Ok(TransportKind::Both),
            other => Err(Error::InvalidAddress(format!("unknown transport {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub transport: TransportKind,
    pub server_name: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub pipe_name: Option<String>,
}

impl Address {
    /// A TCP endpoint; the server name is the IP's text form.
    pub fn tcp(ip: IpAddr, port: u16) -> Self {
        Self {
            transport: TransportKind::Tcp,
            server_name: ip.to_string(),
            ip: Some(ip),
            port,
            pipe_name: None,
        }
    }

    /// A named pipe on the local machine.
    pub fn pipe(pipe_name: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Np,
            server_name: LOCAL_SERVER.to_string(),
            ip: None,
            port: 0,
            pipe_name: Some(pipe_name.into()),
        }
    }

    /// An endpoint reachable over both TCP and a named pipe.
    pub fn both(
        server_name: impl Into<String>,
        ip: IpAddr,
        port: u16,
        pipe_name: impl Into<String>,
    ) -> Self {
        Self {
            transport: TransportKind::Both,
            server_name: server_name.into(),
            ip: Some(ip),
            port,
            pipe_name: Some(pipe_name.into()),
        }
    }

    /// Checks the invariants the text form depends on.
    pub fn validate(&self) -> Result<()> {
        if self.transport.has_tcp() && self.ip.is_none() {
            return Err(Error::InvalidAddress(format!(
                "{} address without ip",
                self.transport.as_str()
            )));
        }
        if self.transport.has_pipe() && self.pipe_name.as_deref().map_or(true, str::is_empty) {
            return Err(Error::InvalidAddress(format!(
                "{} address without pipe name",
                self.transport.as_str()
            )));
        }
        for part in [Some(self.server_name.as_str()), self.pipe_name.as_deref()]
            .into_iter()
            .flatten()
        {
            if part.contains(|c: char| c == FIELD_SEP || c == '\t' || c == '\n' || c == '\r') {
                return Err(Error::InvalidAddress(format!(
                    "reserved character in {part:?}"
                )));
            }
        }
        Ok(())
    }

    /// Filename-safe encoding used to disambiguate same-millisecond keys.
    ///
    /// `10.42.24.155:8746` becomes `010-042-024-155-08746`; pipe names keep
    /// their ASCII alphanumerics with everything else mapped to `_`.
    pub fn fingerprint(&self) -> String {
        let mut parts = Vec::new();
        if self.transport.has_tcp() {
            match self.ip {
                Some(IpAddr::V4(ip)) => {
                    parts.extend(ip.octets().iter().map(|octet| format!("{octet:03}")));
                }
                Some(IpAddr::V6(ip)) => {
                    parts.extend(ip.segments().iter().map(|seg| format!("{seg:04x}")));
                }
                None => {}
            }
            parts.push(format!("{:05}", self.port));
        }
        if self.transport.has_pipe() {
            if let Some(pipe) = &self.pipe_name {
                parts.push(sanitize(pipe));
            }
        }
        parts.join("-")
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = self.ip.map(|ip| ip.to_string()).unwrap_or_default();
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}{sep}{}",
            self.transport.as_str(),
            self.server_name,
            ip,
            self.port,
            self.pipe_name.as_deref().unwrap_or(""),
            sep = FIELD_SEP
        )
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(FIELD_SEP).collect();
        let [transport, server_name, ip, port, pipe] = parts.as_slice() else {
            return Err(Error::InvalidAddress(format!("malformed address {s:?}")));
        };
        let ip = if ip.is_empty() {
            None
        } else {
            Some(
                ip.parse::<IpAddr>()
                    .map_err(|_| Error::InvalidAddress(format!("bad ip in {s:?}")))?,
            )
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidAddress(format!("bad port in {s:?}")))?;
        let address = Address {
            transport: transport.parse()?,
            server_name: server_name.to_string(),
            ip,
            port,
            pipe_name: (!pipe.is_empty()).then(|| pipe.to_string()),
        };
        address.validate()?;
        Ok(address)
    }
}
