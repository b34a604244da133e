use std::str::FromStr;

use crate::errors::WsError;

const DEFAULT_PORT: u16 = 80;

/// a parsed, validated `ws://host[:port]/path[?query]` target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUri {
    /// host component, required
    pub host: String,
    /// port, defaulted to 80 when absent
    pub port: u16,
    /// request-target path plus query string, defaulted to `/`
    pub path_and_query: String,
}

impl WsUri {
    /// parse and validate a client connect target
    ///
    /// only the `ws` scheme is accepted; this core never terminates TLS (see
    /// crate docs), so `wss` is rejected rather than silently downgraded.
    pub fn parse(uri: &str) -> Result<Self, WsError> {
        let parsed =
            http::Uri::from_str(uri).map_err(|e| WsError::ConfigInvalid(format!("invalid uri: {e}")))?;

        match parsed.scheme_str() {
            Some("ws") => {}
            Some(other) => {
                return Err(WsError::ConfigInvalid(format!(
                    "unsupported scheme `{other}`, expected `ws`"
                )))
            }
            None => return Err(WsError::ConfigInvalid("uri is missing a scheme".into())),
        }

        let host = parsed
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| WsError::ConfigInvalid("uri is missing a host".into()))?
            .to_string();

        let port = parsed.port_u16().unwrap_or(DEFAULT_PORT);

        let path_and_query = parsed
            .path_and_query()
            .map(|pq| pq.to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            host,
            port,
            path_and_query,
        })
    }

    /// the value of the `Host` header: `host` alone iff the port is the default
    pub fn host_header(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_port_and_path() {
        let uri = WsUri::parse("ws://example.com").unwrap();
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, 80);
        assert_eq!(uri.path_and_query, "/");
        assert_eq!(uri.host_header(), "example.com");
    }

    #[test]
    fn keeps_explicit_port_and_path() {
        let uri = WsUri::parse("ws://example.com:9001/chat?x=1").unwrap();
        assert_eq!(uri.port, 9001);
        assert_eq!(uri.path_and_query, "/chat?x=1");
        assert_eq!(uri.host_header(), "example.com:9001");
    }

    #[test]
    fn rejects_non_ws_scheme() {
        assert!(WsUri::parse("wss://example.com").is_err());
        assert!(WsUri::parse("http://example.com").is_err());
    }

    #[test]
    fn rejects_missing_host() {
        assert!(WsUri::parse("ws:///path").is_err());
    }
}
