//! Small validators used by configuration loading.
use std::ops::RangeInclusive;

/// Validates if a given u16 value is a valid port number.
/// By type, the port is already within the 0-65535 range.
/// This function checks that the port is not 0, which is reserved.
pub fn is_valid_port(port: u16) -> Result<(), &'static str> {
    if port > 0 {
        Ok(())
    } else {
        Err("Port number must be greater than 0")
    }
}

/// Validates if a given string is a usable file path.
pub fn is_valid_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("File path cannot be empty");
    }
    if path.contains('\0') {
        return Err("File path cannot contain null bytes");
    }
    Ok(())
}

/// Validates if a given value is within a specified numeric range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates if a given string is not empty.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if value.trim().is_empty() {
        Err("Value cannot be empty")
    } else {
        Ok(())
    }
}

/// Validates a sampling/reporting interval pair, both in minutes.
///
/// The reporting interval must be a positive integer multiple of the sampling
/// interval so that every reporting boundary is also a sampling boundary.
pub fn is_interval_multiple(sampling: u32, reporting: u32) -> Result<(), String> {
    if sampling == 0 {
        return Err("sampling_interval must be greater than 0".to_string());
    }
    if reporting == 0 {
        return Err("reporting_interval must be greater than 0".to_string());
    }
    if reporting % sampling != 0 {
        return Err(format!(
            "reporting_interval ({reporting} min) must be a multiple of sampling_interval ({sampling} min)"
        ));
    }
    Ok(())
}
