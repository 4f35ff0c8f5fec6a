//! SSH identification banner (RFC 4253 Section 4.2).
//!
//! Before any binary packet, both sides send one line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may precede its banner with arbitrary non-`SSH-` lines; those
//! are skipped by the reader, not parsed here. Only protocol versions
//! "2.0" and "1.99" are accepted.

use skiff_platform::{SkiffError, SkiffResult};

/// Maximum accepted banner line length.
pub const MAX_BANNER_LENGTH: usize = 255;

/// A parsed SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a local banner with protocol version 2.0.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// The default Skiff banner.
    pub fn default_skiff() -> Self {
        Self::new(&format!("Skiff_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses a remote banner line.
    ///
    /// # Errors
    ///
    /// [`SkiffError::Protocol`] when the line is overlong, contains a null
    /// byte, lacks the `SSH-` prefix, or names an unsupported protocol
    /// version.
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_BANNER_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "Banner too long: {} bytes (max {})",
                line.len(),
                MAX_BANNER_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(SkiffError::Protocol(
                "Banner contains null byte".to_string(),
            ));
        }
        if !line.starts_with("SSH-") {
            return Err(SkiffError::Protocol(format!(
                "Invalid SSH banner: '{}'",
                line
            )));
        }

        // Comments are split off at the first space and kept verbatim.
        let (ident, comments) = match line.find(' ') {
            Some(i) => (&line[..i], Some(line[i + 1..].to_string())),
            None => (line, None),
        };

        let parts: Vec<&str> = ident.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(SkiffError::Protocol(format!(
                "Invalid SSH banner: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SkiffError::Protocol(format!(
                "Incompatible protocol version ({} instead of 2.0)",
                proto_version
            )));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version: parts[2].to_string(),
            comments,
        })
    }

    /// Protocol version ("2.0" or "1.99").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Software identification.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Banner comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Wire form, with the trailing CR LF.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_wire_format() {
        let v = Version::new("Skiff_0.1.0", None);
        assert_eq!(v.to_string(), "SSH-2.0-Skiff_0.1.0");
        assert_eq!(v.to_wire_format(), b"SSH-2.0-Skiff_0.1.0\r\n");
    }

    #[test]
    fn test_parse_plain() {
        let v = Version::parse("SSH-2.0-OpenSSH_9.6\r\n").unwrap();
        assert_eq!(v.proto_version(), "2.0");
        assert_eq!(v.software(), "OpenSSH_9.6");
        assert_eq!(v.comments(), None);
    }

    #[test]
    fn test_parse_with_comments() {
        let v = Version::parse("SSH-2.0-OpenSSH_9.6 Ubuntu-3ubuntu13").unwrap();
        assert_eq!(v.software(), "OpenSSH_9.6");
        assert_eq!(v.comments(), Some("Ubuntu-3ubuntu13"));
    }

    #[test]
    fn test_parse_legacy_199() {
        let v = Version::parse("SSH-1.99-Legacy").unwrap();
        assert_eq!(v.proto_version(), "1.99");
    }

    #[test]
    fn test_parse_rejects_ssh1() {
        let r = Version::parse("SSH-1.5-OldServer");
        assert!(matches!(r, Err(SkiffError::Protocol(_))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::parse("HTTP/1.1 400 Bad Request").is_err());
        assert!(Version::parse("SSH-2.0").is_err());
        assert!(Version::parse(&format!("SSH-2.0-{}", "x".repeat(300))).is_err());
        assert!(Version::parse("SSH-2.0-Bad\0Banner").is_err());
    }

    #[test]
    fn test_round_trip() {
        let v = Version::default_skiff();
        let parsed = Version::parse(&v.to_string()).unwrap();
        assert_eq!(parsed, v);
    }
}
