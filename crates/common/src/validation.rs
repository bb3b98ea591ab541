//! Input validation for configuration that reaches the filesystem or a
//! subprocess command line.
//!
//! Ids and prefixes end up as path components, source URLs end up as ffmpeg
//! arguments, and numeric bounds drive timers. Everything here fails with a
//! descriptive error instead of panicking.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum length for resource ids (stream id, recording id, key id)
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum length for source URIs
pub const MAX_URI_LENGTH: usize = 4096;

/// Maximum length for file paths
pub const MAX_PATH_LENGTH: usize = 4096;

// ============================================================================
// String Validation
// ============================================================================

pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

/// Validate an id that is used as a single path component
pub fn validate_id(id: &str, field_name: &str) -> Result<()> {
    validate_non_empty(id, field_name)?;
    validate_length(id, MAX_ID_LENGTH, field_name)?;

    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(anyhow!(
            "{} contains invalid characters (no path separators or '..' allowed)",
            field_name
        ));
    }

    Ok(())
}

/// Validate a source URI before it is handed to a media subprocess
pub fn validate_uri(uri: &str, field_name: &str) -> Result<()> {
    validate_non_empty(uri, field_name)?;
    validate_length(uri, MAX_URI_LENGTH, field_name)?;

    let dangerous_chars = ['`', '$', ';', '|', '&', '\n', '\r'];
    if uri.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!(
            "{} contains dangerous shell metacharacters",
            field_name
        ));
    }

    Ok(())
}

// ============================================================================
// Path Validation
// ============================================================================

/// Validate file path without requiring it to exist (for new files)
pub fn validate_path_components(path: &Path, base_dir: Option<&Path>, field_name: &str) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("{} contains invalid UTF-8", field_name))?;

    validate_length(path_str, MAX_PATH_LENGTH, field_name)?;

    for component in path.components() {
        if component.as_os_str() == ".." {
            return Err(anyhow!(
                "{} contains '..' component (path traversal attempt)",
                field_name
            ));
        }
    }

    if let Some(base) = base_dir {
        let combined = base.join(path);
        if !combined.starts_with(base) {
            return Err(anyhow!(
                "{} attempts to escape base directory",
                field_name
            ));
        }
        Ok(combined)
    } else {
        Ok(path.to_path_buf())
    }
}

// ============================================================================
// Numeric Validation
// ============================================================================

/// Seconds (or any magnitude) that may be zero but not negative
pub fn validate_non_negative_secs(value: f64, field_name: &str) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("{} must be a non-negative number, got {}", field_name, value));
    }
    Ok(())
}

/// Shortest period accepted for a periodic timer
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Longest period accepted for a periodic timer; keeps `Instant + period` in range
pub const MAX_PERIOD: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Parse a timer period given in seconds, bounded by [`MIN_PERIOD`] and [`MAX_PERIOD`].
pub fn validate_period_secs(value: f64, field_name: &str) -> Result<Duration> {
    let period = Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("{} must be a positive number of seconds, got {}", field_name, value))?;
    if period < MIN_PERIOD || period > MAX_PERIOD {
        return Err(anyhow!(
            "{} must be between {}s and {}s, got {}",
            field_name,
            MIN_PERIOD.as_secs_f64(),
            MAX_PERIOD.as_secs(),
            value
        ));
    }
    Ok(period)
}

/// Same as [`validate_period_secs`], except that 0 disables the timer
pub fn validate_optional_period_secs(value: f64, field_name: &str) -> Result<Option<Duration>> {
    if value == 0.0 {
        return Ok(None);
    }
    validate_period_secs(value, field_name).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id_rejects_traversal() {
        assert!(validate_id("cam-1", "stream_id").is_ok());
        assert!(validate_id("../etc", "stream_id").is_err());
        assert!(validate_id("a/b", "stream_id").is_err());
        assert!(validate_id("  ", "stream_id").is_err());

        let oversized = "A".repeat(MAX_ID_LENGTH + 1);
        let err = validate_id(&oversized, "stream_id").unwrap_err().to_string();
        assert!(err.contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_uri_rejects_shell_metacharacters() {
        assert!(validate_uri("rtsp://cam.local/stream?x=1", "url").is_ok());
        assert!(validate_uri("rtsp://cam.local/$(reboot)", "url").is_err());
        assert!(validate_uri("file.mp4; rm -rf /", "url").is_err());
        assert!(validate_uri("", "url").is_err());
    }

    #[test]
    fn test_validate_path_components() {
        assert!(validate_path_components(Path::new("/data/recordings"), None, "dir").is_ok());
        assert!(validate_path_components(Path::new("/data/../etc"), None, "dir").is_err());

        let joined = validate_path_components(Path::new("cam1"), Some(Path::new("/data")), "dir").unwrap();
        assert_eq!(joined, PathBuf::from("/data/cam1"));
    }

    #[test]
    fn test_numeric_bounds() {
        assert!(validate_non_negative_secs(0.0, "d").is_ok());
        assert!(validate_non_negative_secs(-1.0, "d").is_err());
        assert!(validate_non_negative_secs(f64::NAN, "d").is_err());
    }

    #[test]
    fn test_period_bounds() {
        assert_eq!(validate_period_secs(0.5, "p").unwrap(), Duration::from_millis(500));
        assert!(validate_period_secs(0.001, "p").is_ok());
        assert!(validate_period_secs(0.0, "p").is_err());
        assert!(validate_period_secs(-2.0, "p").is_err());
        assert!(validate_period_secs(f64::INFINITY, "p").is_err());
        // rounds to a zero-length period
        assert!(validate_period_secs(1e-12, "p").is_err());
        // overflows Duration
        assert!(validate_period_secs(1e20, "p").is_err());
        assert!(validate_period_secs(MAX_PERIOD.as_secs_f64() * 2.0, "p").is_err());

        assert_eq!(validate_optional_period_secs(0.0, "p").unwrap(), None);
        assert!(validate_optional_period_secs(1e-12, "p").is_err());
        assert!(validate_optional_period_secs(1e20, "p").is_err());
    }
}
