//! Transport endpoint addresses.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Environment variable naming the default endpoint.
pub const ENV_ENDPOINT: &str = "HVRPC_ENDPOINT";

/// Vsock CID of the host, as seen from a guest.
pub const HOST_CID: u32 = 2;

/// Port the reference host listens on.
pub const DEFAULT_PORT: u32 = 1024;

/// Where the host side of the channel lives.
///
/// Parses from and prints as `unix:<path>` or `vsock:<cid>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Endpoint {
    /// A Unix stream socket, typically a hypervisor-mapped vsock port.
    Unix(PathBuf),
    /// An `AF_VSOCK` address.
    Vsock {
        /// Context id of the peer.
        cid: u32,
        /// Port on the peer.
        port: u32,
    },
}

impl Endpoint {
    /// Reads [`ENV_ENDPOINT`], falling back to the host's default port.
    pub fn from_env() -> Result<Self, ParseEndpointError> {
        Self::from_setting(std::env::var(ENV_ENDPOINT).ok().as_deref())
    }

    /// Parses an optional setting, falling back to the default when unset
    /// or blank.
    pub fn from_setting(value: Option<&str>) -> Result<Self, ParseEndpointError> {
        match value.map(str::trim) {
            Some(s) if !s.is_empty() => s.parse(),
            _ => Ok(Self::default()),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Vsock {
            cid: HOST_CID,
            port: DEFAULT_PORT,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
        }
    }
}

/// An endpoint string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint {input:?}: expected unix:<path> or vsock:<cid>:<port>")]
pub struct ParseEndpointError {
    /// The rejected input.
    input: String,
}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseEndpointError {
            input: s.to_owned(),
        };
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(err());
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        let rest = s.strip_prefix("vsock:").ok_or_else(err)?;
        let (cid, port) = rest.split_once(':').ok_or_else(err)?;
        Ok(Self::Vsock {
            cid: cid.parse().map_err(|_| err())?,
            port: port.parse().map_err(|_| err())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_forms() {
        assert_eq!(
            "unix:/run/hvrpc.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/run/hvrpc.sock"))
        );
        assert_eq!(
            "vsock:3:5000".parse::<Endpoint>().unwrap(),
            Endpoint::Vsock { cid: 3, port: 5000 }
        );
    }

    #[test]
    fn display_parses_back() {
        for s in ["unix:/tmp/a b", "vsock:2:1024"] {
            assert_eq!(s.parse::<Endpoint>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn rejects_malformed() {
        for s in ["", "unix:", "vsock:2", "vsock:x:1", "tcp:1.2.3.4:5", "/tmp/sock"] {
            assert!(s.parse::<Endpoint>().is_err(), "{s}");
        }
    }

    #[test]
    fn unset_setting_uses_default() {
        assert_eq!(Endpoint::from_setting(None).unwrap(), Endpoint::default());
        assert_eq!(Endpoint::from_setting(Some("  ")).unwrap(), Endpoint::default());
        assert_eq!(
            Endpoint::from_setting(Some("unix:/x")).unwrap(),
            Endpoint::Unix(PathBuf::from("/x"))
        );
        assert!(Endpoint::from_setting(Some("bogus")).is_err());
    }
}
