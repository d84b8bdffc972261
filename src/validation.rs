//! Centralized validation functions for curfew.
//!
//! This module provides unified validation for:
//! - IPv4 target addresses (including the `0.0.0.0` wildcard)
//! - Wall-clock times of day (`HH:MM`)
//! - MQTT topics and client identifiers

use chrono::NaiveTime;
use std::net::Ipv4Addr;

use crate::error::CurfewError;

/// Address that stands for "every target in the registry".
pub const WILDCARD: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Protocols a blocking rule may match on.
pub const VALID_PROTOCOLS: &[&str] = &["udp", "tcp"];

/// Maximum MQTT topic length in bytes (MQTT 3.1.1, section 1.5.3).
const MAX_TOPIC_LEN: usize = 65_535;

/// Validate an IPv4 address string and return the parsed address.
///
/// Surrounding whitespace is ignored. IPv6 addresses are rejected.
///
/// # Examples
/// ```
/// use curfew::validation::validate_ipv4;
/// assert!(validate_ipv4("192.168.1.20").is_ok());
/// assert!(validate_ipv4(" 10.0.0.5 ").is_ok());
/// assert!(validate_ipv4("::1").is_err());
/// assert!(validate_ipv4("10.0.0").is_err());
/// ```
pub fn validate_ipv4(ip_str: &str) -> Result<Ipv4Addr, CurfewError> {
    ip_str
        .trim()
        .parse()
        .map_err(|_| CurfewError::InvalidIp(ip_str.to_string()))
}

/// Whether an address is the wildcard sentinel.
#[inline]
pub fn is_wildcard(addr: Ipv4Addr) -> bool {
    addr == WILDCARD
}

/// Parse a 24-hour `HH:MM` time of day.
///
/// # Examples
/// ```
/// use curfew::validation::parse_time_of_day;
/// assert!(parse_time_of_day("00:00").is_ok());
/// assert!(parse_time_of_day("23:59").is_ok());
/// assert!(parse_time_of_day("24:00").is_err());
/// assert!(parse_time_of_day("7pm").is_err());
/// ```
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, CurfewError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| {
        CurfewError::Parse(format!("Invalid time of day '{}'. Use 24-hour HH:MM", s))
    })
}

/// Validate a topic we subscribe to.
pub fn validate_topic(topic: &str) -> Result<(), CurfewError> {
    if topic.is_empty() {
        return Err(CurfewError::Config("Topic must not be empty".to_string()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(CurfewError::Config(format!(
            "Topic is too long ({} bytes, max {})",
            topic.len(),
            MAX_TOPIC_LEN
        )));
    }
    if topic.contains('\0') {
        return Err(CurfewError::Config(
            "Topic must not contain NUL characters".to_string(),
        ));
    }
    Ok(())
}

/// Validate an MQTT client identifier.
///
/// Brokers are free to reject exotic identifiers, so only printable ASCII
/// without whitespace is accepted.
pub fn validate_client_id(client_id: &str) -> Result<(), CurfewError> {
    if client_id.is_empty() {
        return Err(CurfewError::Config("Client ID must not be empty".to_string()));
    }
    if !client_id.chars().all(|c| c.is_ascii_graphic()) {
        return Err(CurfewError::Config(format!(
            "Client ID '{}' contains invalid characters",
            client_id
        )));
    }
    Ok(())
}

/// Validate a rule protocol name.
pub fn validate_protocol(proto: &str) -> Result<(), CurfewError> {
    if VALID_PROTOCOLS.contains(&proto) {
        Ok(())
    } else {
        Err(CurfewError::Config(format!(
            "Invalid protocol '{}'. Valid values: {}",
            proto,
            VALID_PROTOCOLS.join(", ")
        )))
    }
}
