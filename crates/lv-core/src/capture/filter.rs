//! Capture filter construction.
//!
//! The filter scopes capture to one guest and strips the two management
//! channels out of it:
//!
//! ```text
//! host G and not (host G and port P) and not (host R and port Q)
//! ```
//!
//! where `P` is the guest control port and `R:Q` the result server. tcpdump
//! receives the expression as separate argument tokens, so no shell quoting is
//! involved.

use serde::Serialize;
use std::fmt;

/// A host/port pair excluded from capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host {} and port {}", self.host, self.port)
    }
}

/// One conjoined term of the filter expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterClause {
    /// Traffic to or from this host.
    Host { host: String },
    /// Anything that is not this endpoint.
    Exclude(Endpoint),
}

impl FilterClause {
    fn tokens(&self) -> Vec<String> {
        match self {
            FilterClause::Host { host } => vec!["host".to_string(), host.clone()],
            FilterClause::Exclude(endpoint) => vec![
                "not".to_string(),
                "(".to_string(),
                "host".to_string(),
                endpoint.host.clone(),
                "and".to_string(),
                "port".to_string(),
                endpoint.port.to_string(),
                ")".to_string(),
            ],
        }
    }
}

impl fmt::Display for FilterClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterClause::Host { host } => write!(f, "host {host}"),
            FilterClause::Exclude(endpoint) => write!(f, "not ({endpoint})"),
        }
    }
}

/// Filter expression for one guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureFilter {
    guest_host: String,
    exclusions: Vec<Endpoint>,
}

impl CaptureFilter {
    /// Scope to `guest` and exclude its control channel and the result server.
    pub fn for_guest(
        guest: impl Into<String>,
        control_port: u16,
        result_host: impl Into<String>,
        result_port: u16,
    ) -> Self {
        let guest = guest.into();
        Self {
            exclusions: vec![
                Endpoint::new(guest.clone(), control_port),
                Endpoint::new(result_host, result_port),
            ],
            guest_host: guest,
        }
    }

    pub fn guest_host(&self) -> &str {
        &self.guest_host
    }

    pub fn exclusions(&self) -> &[Endpoint] {
        &self.exclusions
    }

    /// The guest scope first, then one exclusion per endpoint.
    pub fn clauses(&self) -> Vec<FilterClause> {
        std::iter::once(FilterClause::Host {
            host: self.guest_host.clone(),
        })
        .chain(self.exclusions.iter().cloned().map(FilterClause::Exclude))
        .collect()
    }

    /// Argument tokens for tcpdump, clauses joined with `and`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (i, clause) in self.clauses().iter().enumerate() {
            if i > 0 {
                args.push("and".to_string());
            }
            args.extend(clause.tokens());
        }
        args
    }
}

impl fmt::Display for CaptureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.clauses().iter().map(|c| c.to_string()).collect();
        write!(f, "{}", rendered.join(" and "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CaptureFilter {
        CaptureFilter::for_guest("10.0.0.5", 8000, "10.0.0.1", 2042)
    }

    #[test]
    fn test_expression() {
        assert_eq!(
            sample().to_string(),
            "host 10.0.0.5 and not (host 10.0.0.5 and port 8000) and not (host 10.0.0.1 and port 2042)"
        );
    }

    #[test]
    fn test_three_clauses_in_order() {
        assert_eq!(
            sample().clauses(),
            vec![
                FilterClause::Host {
                    host: "10.0.0.5".into()
                },
                FilterClause::Exclude(Endpoint::new("10.0.0.5", 8000)),
                FilterClause::Exclude(Endpoint::new("10.0.0.1", 2042)),
            ]
        );
    }

    #[test]
    fn test_tokens_are_conjoined() {
        let args = sample().to_args();
        assert_eq!(
            args,
            vec![
                "host", "10.0.0.5", //
                "and", "not", "(", "host", "10.0.0.5", "and", "port", "8000", ")", //
                "and", "not", "(", "host", "10.0.0.1", "and", "port", "2042", ")",
            ]
        );

        // Every top-level boundary between clauses is an `and`, and each
        // exclusion is negated as a whole group.
        let mut depth = 0i32;
        let top_level: Vec<&str> = args
            .iter()
            .filter_map(|t| {
                let at_top = depth == 0;
                match t.as_str() {
                    "(" => depth += 1,
                    ")" => depth -= 1,
                    _ => {}
                }
                at_top.then_some(t.as_str())
            })
            .collect();
        assert_eq!(
            top_level,
            vec!["host", "10.0.0.5", "and", "not", "(", "and", "not", "("]
        );
        assert_eq!(depth, 0);
    }

    #[test]
    fn test_accessors() {
        let filter = sample();
        assert_eq!(filter.guest_host(), "10.0.0.5");
        assert_eq!(filter.exclusions().len(), 2);
        assert_eq!(filter.exclusions()[1].to_string(), "host 10.0.0.1 and port 2042");
    }
}
