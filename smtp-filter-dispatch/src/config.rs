//! Loads the process-wide, immutable filter configuration.

use std::{path::PathBuf, str::FromStr, time::Duration};

/// Which backend the dispatcher should use for the data phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterType {
    Pipe,
    File,
    Smtp,
    Reject,
}

impl FromStr for FilterType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<FilterType, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "pipe" => Ok(FilterType::Pipe),
            "file" => Ok(FilterType::File),
            "smtp" => Ok(FilterType::Smtp),
            "reject" => Ok(FilterType::Reject),
            other => Err(ConfigError::UnknownFilterType(other.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read configuration file {0:?}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("unknown configuration key {0:?}")]
    UnknownKey(String),

    #[error("unknown FilterType {0:?}, expected one of pipe, file, smtp, reject")]
    UnknownFilterType(String),

    #[error("FilterTimeout must be a positive integer, got {0:?}")]
    InvalidTimeout(String),

    #[error("malformed configuration line: {0:?}")]
    MalformedLine(String),
}

/// Process-wide, immutable-after-load configuration for the filter
/// dispatcher.
#[derive(Clone, Debug)]
pub struct FilterConfig {
    pub filter_type: FilterType,
    pub command: Option<String>,
    pub reject: String,
    pub timeout: Duration,
    pub directory: PathBuf,
    pub header: Option<String>,
    pub debug_files: bool,
}

impl Default for FilterConfig {
    fn default() -> FilterConfig {
        FilterConfig {
            filter_type: FilterType::Pipe,
            command: None,
            reject: "530 Email Rejected".to_owned(),
            timeout: Duration::from_secs(30),
            directory: std::env::temp_dir(),
            header: None,
            debug_files: false,
        }
    }
}

impl FilterConfig {
    /// Parses a simple `Key = Value`-per-line configuration file, with
    /// case-insensitive keys, as documented for the `FilterCommand` /
    /// `FilterType` / `FilterReject` / `FilterTimeout` / `TempDirectory` /
    /// `Header` / `DebugFiles` keys.
    pub fn parse(text: &str) -> Result<FilterConfig, ConfigError> {
        let mut cfg = FilterConfig::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedLine(line.to_owned()))?;
            let key = key.trim();
            let value = value.trim();
            match key.to_ascii_lowercase().as_str() {
                "filtercommand" => cfg.command = Some(value.to_owned()),
                "filtertype" => cfg.filter_type = value.parse()?,
                "filterreject" => cfg.reject = value.to_owned(),
                "filtertimeout" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidTimeout(value.to_owned()))?;
                    if secs == 0 {
                        return Err(ConfigError::InvalidTimeout(value.to_owned()));
                    }
                    cfg.timeout = Duration::from_secs(secs);
                }
                "tempdirectory" => cfg.directory = PathBuf::from(value),
                "header" => cfg.header = if value.is_empty() { None } else { Some(value.to_owned()) },
                "debugfiles" => {
                    cfg.debug_files = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
                }
                _ => return Err(ConfigError::UnknownKey(key.to_owned())),
            }
        }
        Ok(cfg)
    }

    pub fn load(path: &std::path::Path) -> Result<FilterConfig, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_owned(), e))?;
        FilterConfig::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = FilterConfig::default();
        assert_eq!(cfg.filter_type, FilterType::Pipe);
        assert_eq!(cfg.reject, "530 Email Rejected");
        assert_eq!(cfg.timeout, Duration::from_secs(30));
    }

    #[test]
    fn parses_basic_file() {
        let cfg = FilterConfig::parse(
            "FilterType = pipe\nFilterCommand = /usr/bin/scan\nFilterTimeout = 10\n",
        )
        .unwrap();
        assert_eq!(cfg.filter_type, FilterType::Pipe);
        assert_eq!(cfg.command.as_deref(), Some("/usr/bin/scan"));
        assert_eq!(cfg.timeout, std::time::Duration::from_secs(10));
    }

    #[test]
    fn case_insensitive_keys() {
        let cfg = FilterConfig::parse("filtertype = REJECT\n").unwrap();
        assert_eq!(cfg.filter_type, FilterType::Reject);
    }

    #[test]
    fn zero_timeout_is_an_error() {
        assert!(FilterConfig::parse("FilterTimeout = 0\n").is_err());
    }

    #[test]
    fn unknown_key_is_an_error() {
        assert!(FilterConfig::parse("NotAKey = foo\n").is_err());
    }

    #[test]
    fn empty_header_disables_it() {
        let cfg = FilterConfig::parse("Header = \n").unwrap();
        assert_eq!(cfg.header, None);
    }
}
