//! Parsing of the `ssh-endpoint` startup banner.
//!
//! The first stdout line of `cdswctl ssh-endpoint` is a space-separated status
//! line whose fourth field is the local port, e.g.
//! `Forwarding local port 4321 to port 2222 on session ...`. There is no
//! version tag, so this is the only place that knows the shape.

use thiserror::Error;

/// Zero-based index of the port field.
pub const PORT_FIELD: usize = 3;

/// Why a banner line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BannerError {
    #[error("expected at least {} space-separated fields, got {found}", PORT_FIELD + 1)]
    TooFewFields { found: usize },

    #[error("field {} is not a decimal port number: {field:?}", PORT_FIELD)]
    NotNumeric { field: String },

    #[error("port {field} is outside 1-65535")]
    OutOfRange { field: String },
}

/// Extract the port from a banner line.
///
/// Surrounding whitespace is trimmed, then the line is split on single
/// spaces. Field [`PORT_FIELD`] must consist of ASCII digits only and name a
/// port in `1..=65535`.
pub fn parse_banner(line: &str) -> Result<u16, BannerError> {
    let fields: Vec<&str> = line.trim().split(' ').collect();
    let Some(field) = fields.get(PORT_FIELD) else {
        return Err(BannerError::TooFewFields {
            found: fields.len(),
        });
    };
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BannerError::NotNumeric {
            field: (*field).to_string(),
        });
    }
    match field.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(BannerError::OutOfRange {
            field: (*field).to_string(),
        }),
    }
}
