//! Address string parsing

use thiserror::Error;

/// Address parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("missing port in address: {0}")]
    MissingPort(String),

    #[error("invalid port in address: {0}")]
    InvalidPort(String),

    #[error("empty host in address: {0}")]
    EmptyHost(String),

    #[error("unclosed bracket in address: {0}")]
    UnclosedBracket(String),
}

/// Split an address of the form `host:port` or `[host]:port` into its host
/// and port parts. IPv6 literals must use the bracketed form.
pub fn parse_address(address: &str) -> Result<(String, u16), AddressError> {
    let address = address.trim();

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| AddressError::UnclosedBracket(address.to_string()))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| AddressError::MissingPort(address.to_string()))?;
        (host, port)
    } else {
        address
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(address.to_string()))?
    };

    if host.is_empty() {
        return Err(AddressError::EmptyHost(address.to_string()));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(address.to_string()))?;

    Ok((host.to_string(), port))
}
