//! Address-string parsing.
//!
//! Strings are of the form `[<class>+]<protocol>[://[<host string>]]`.
//! The parsed triple is only used to select and initialize a plugin; it is
//! not retained afterwards.

use crate::error::{Error, Result};

/// Parsed address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// Optional plugin class name (the part before `+`).
    pub class_name: Option<String>,
    /// Protocol name, plugin-defined.
    pub protocol_name: String,
    /// Optional host string (the part after `://`), plugin-defined.
    pub host_name: Option<String>,
}

impl AddrInfo {
    /// Parse an address string.
    ///
    /// A missing class is permitted, as is `://` followed by nothing. Any
    /// other malformed separator fails with
    /// [`Error::ProtocolNotSupported`].
    pub fn parse(info_string: &str) -> Result<AddrInfo> {
        if info_string.is_empty() {
            return Err(Error::InvalidArg);
        }

        // First part of the string is "class+protocol" or "protocol".
        let (first, rest) = match info_string.split_once(':') {
            Some((first, rest)) => (first, Some(rest)),
            None => (info_string, None),
        };

        let (class_name, protocol_name) = match first.split_once('+') {
            Some((class, protocol)) => (Some(class.to_string()), protocol.to_string()),
            None => (None, first.to_string()),
        };
        if protocol_name.is_empty() {
            return Err(Error::ProtocolNotSupported);
        }

        let host_name = match rest {
            None | Some("") => None,
            Some(rest) => {
                // Only "://" may follow the protocol.
                let host = rest
                    .strip_prefix("//")
                    .ok_or(Error::ProtocolNotSupported)?;
                if host.is_empty() {
                    None
                } else {
                    Some(host.to_string())
                }
            }
        };

        Ok(AddrInfo {
            class_name,
            protocol_name,
            host_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_only() {
        let info = AddrInfo::parse("sm").unwrap();
        assert_eq!(info.class_name, None);
        assert_eq!(info.protocol_name, "sm");
        assert_eq!(info.host_name, None);
    }

    #[test]
    fn class_and_protocol() {
        let info = AddrInfo::parse("na+sm").unwrap();
        assert_eq!(info.class_name.as_deref(), Some("na"));
        assert_eq!(info.protocol_name, "sm");
    }

    #[test]
    fn full_string() {
        let info = AddrInfo::parse("na+sm://12345/0").unwrap();
        assert_eq!(info.class_name.as_deref(), Some("na"));
        assert_eq!(info.protocol_name, "sm");
        assert_eq!(info.host_name.as_deref(), Some("12345/0"));
    }

    #[test]
    fn empty_host_permitted() {
        let info = AddrInfo::parse("sm://").unwrap();
        assert_eq!(info.host_name, None);
        let info = AddrInfo::parse("sm:").unwrap();
        assert_eq!(info.host_name, None);
    }

    #[test]
    fn bad_separator_rejected() {
        assert!(matches!(
            AddrInfo::parse("sm:/oops"),
            Err(Error::ProtocolNotSupported)
        ));
        assert!(matches!(
            AddrInfo::parse("sm:oops"),
            Err(Error::ProtocolNotSupported)
        ));
    }

    #[test]
    fn empty_inputs_rejected() {
        assert!(matches!(AddrInfo::parse(""), Err(Error::InvalidArg)));
        assert!(matches!(
            AddrInfo::parse("+sm"),
            Ok(AddrInfo { class_name: Some(c), .. }) if c.is_empty()
        ));
        assert!(matches!(
            AddrInfo::parse("na+"),
            Err(Error::ProtocolNotSupported)
        ));
    }
}
