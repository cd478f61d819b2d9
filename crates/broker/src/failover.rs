//! ActiveMQ-style failover URIs.
//!
//! Accepted forms:
//!
//! - `tcp://host:port`
//! - `failover:tcp://h1:61613,tcp://h2:61613`
//! - `failover:(tcp://h1:61613,tcp://h2:61613)?randomize=false`
//!
//! Only the `randomize` option is interpreted. Other transport options
//! (reconnect delays, attempt limits) are accepted and ignored; the
//! dispatcher owns its reconnect policy.

use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;

use crate::error::BrokerError;

/// Port used when an endpoint omits one.
pub const DEFAULT_STOMP_PORT: u16 = 61613;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = BrokerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let rest = raw
            .strip_prefix("tcp://")
            .ok_or_else(|| BrokerError::InvalidUri(format!("unsupported transport in {raw:?}")))?;
        let rest = rest.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| BrokerError::InvalidUri(format!("unclosed IPv6 host in {raw:?}")))?;
            (host, after.strip_prefix(':'))
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(BrokerError::InvalidUri(format!("missing host in {raw:?}")));
        }

        let port = match port {
            Some(p) => p
                .parse()
                .map_err(|_| BrokerError::InvalidUri(format!("invalid port in {raw:?}")))?,
            None => DEFAULT_STOMP_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverUri {
    pub endpoints: Vec<Endpoint>,
    /// Try endpoints in random order. ActiveMQ defaults this to `true`.
    pub randomize: bool,
}

impl FailoverUri {
    /// Endpoints in the order they should be tried for one connect attempt.
    pub fn connect_order(&self) -> Vec<Endpoint> {
        let mut endpoints = self.endpoints.clone();
        if self.randomize {
            endpoints.shuffle(&mut rand::rng());
        }
        endpoints
    }
}

impl FromStr for FailoverUri {
    type Err = BrokerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();

        let Some(rest) = raw.strip_prefix("failover:") else {
            return Ok(Self {
                endpoints: vec![raw.parse()?],
                randomize: false,
            });
        };

        let (list, query) = if let Some(inner) = rest.strip_prefix('(') {
            let (list, after) = inner
                .split_once(')')
                .ok_or_else(|| BrokerError::InvalidUri(format!("unbalanced parentheses in {raw:?}")))?;
            (list, after.strip_prefix('?'))
        } else {
            match rest.split_once('?') {
                Some((list, query)) => (list, Some(query)),
                None => (rest, None),
            }
        };

        let endpoints = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Endpoint>, _>>()?;
        if endpoints.is_empty() {
            return Err(BrokerError::InvalidUri(format!("no endpoints in {raw:?}")));
        }

        let mut randomize = true;
        for option in query.into_iter().flat_map(|q| q.split('&')) {
            let Some((key, value)) = option.split_once('=') else {
                continue;
            };
            match key.trim() {
                "randomize" => {
                    randomize = value.trim().parse().map_err(|_| {
                        BrokerError::InvalidUri(format!("randomize must be true or false in {raw:?}"))
                    })?;
                }
                other => {
                    tracing::debug!(option = other, "Ignoring failover transport option");
                }
            }
        }

        Ok(Self {
            endpoints,
            randomize,
        })
    }
}
