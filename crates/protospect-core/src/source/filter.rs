//! Capture filter for file sources.
//!
//! File sources have no packet-filter engine underneath, so they support a
//! small expression subset: `tcp`, `udp`, and disjunctions of the two. That
//! covers the default filter (`tcp or udp`) and the protocol pre-selection
//! the pipeline needs; anything richer is rejected at open time. Live
//! sources hand their filter string to the capture library instead and
//! never go through this parser.

use thiserror::Error;

use crate::addr::Proto;

/// Default filter applied when a source spec carries none.
pub const DEFAULT_FILTER: &str = "tcp or udp";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("unsupported capture filter expression: {0:?}")]
    Unsupported(String),
    #[error("empty capture filter term")]
    EmptyTerm,
}

/// Compiled protocol filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFilter {
    tcp: bool,
    udp: bool,
}

impl CaptureFilter {
    /// Filter accepting both transport protocols.
    pub fn all() -> Self {
        CaptureFilter {
            tcp: true,
            udp: true,
        }
    }

    /// Compiles a filter expression. `None` or blank means the default
    /// (`tcp or udp`).
    pub fn compile(expr: Option<&str>) -> Result<Self, FilterError> {
        let expr = match expr {
            Some(e) if !e.trim().is_empty() => e,
            _ => DEFAULT_FILTER,
        };

        let mut tcp = false;
        let mut udp = false;
        let mut expect_term = true;
        for token in expr.split_whitespace() {
            let token = token.to_ascii_lowercase();
            if expect_term {
                match token.as_str() {
                    "tcp" => tcp = true,
                    "udp" => udp = true,
                    _ => return Err(FilterError::Unsupported(expr.to_string())),
                }
            } else if token != "or" {
                return Err(FilterError::Unsupported(expr.to_string()));
            }
            expect_term = !expect_term;
        }
        if expect_term {
            // expression ended with a dangling "or" or was all whitespace
            return Err(FilterError::EmptyTerm);
        }

        Ok(CaptureFilter { tcp, udp })
    }

    pub fn accepts(&self, proto: Proto) -> bool {
        match proto {
            Proto::Tcp => self.tcp,
            Proto::Udp => self.udp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CaptureFilter, FilterError};
    use crate::addr::Proto;

    #[test]
    fn default_accepts_both() {
        let f = CaptureFilter::compile(None).unwrap();
        assert!(f.accepts(Proto::Tcp));
        assert!(f.accepts(Proto::Udp));
    }

    #[test]
    fn single_proto() {
        let f = CaptureFilter::compile(Some("udp")).unwrap();
        assert!(!f.accepts(Proto::Tcp));
        assert!(f.accepts(Proto::Udp));

        let f = CaptureFilter::compile(Some("TCP")).unwrap();
        assert!(f.accepts(Proto::Tcp));
        assert!(!f.accepts(Proto::Udp));
    }

    #[test]
    fn disjunction_any_order() {
        for expr in ["tcp or udp", "udp or tcp", "udp or udp"] {
            assert!(CaptureFilter::compile(Some(expr)).is_ok(), "{expr}");
        }
    }

    #[test]
    fn rich_expressions_are_rejected() {
        assert!(matches!(
            CaptureFilter::compile(Some("tcp and port 80")),
            Err(FilterError::Unsupported(_))
        ));
        assert!(matches!(
            CaptureFilter::compile(Some("icmp")),
            Err(FilterError::Unsupported(_))
        ));
        assert!(matches!(
            CaptureFilter::compile(Some("tcp or")),
            Err(FilterError::EmptyTerm)
        ));
    }
}
