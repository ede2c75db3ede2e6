//! `anchor serve` configuration file
//!
//! Every field is optional; command-line flags take precedence.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// YAML configuration for `anchor serve`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServeFile {
    /// ACME directory URL
    pub directory_url: Option<String>,

    /// Hostname to obtain certificates for
    pub server_name: Option<String>,

    /// TLS listen address (e.g. ":443")
    pub listen: Option<String>,

    /// tcp, tcp4 or tcp6
    pub network: Option<String>,

    /// Address answering HTTP-01 challenges
    pub http_listen: Option<String>,

    /// Upper bound on certificate provisioning, in seconds
    pub provision_timeout_secs: Option<u64>,

    #[serde(default)]
    pub alpn: Vec<String>,

    pub eab: Option<EabFile>,
}

/// External account binding credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EabFile {
    pub key_id: String,
    /// base64url HMAC key
    pub key: String,
}

impl ServeFile {
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;

        Self::parse(&yaml).context(format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_file() {
        let file = ServeFile::parse(
            r#"
directory_url: https://acme.example.test/directory
server_name: example.test
listen: ":8443"
network: tcp4
http_listen: ":8080"
provision_timeout_secs: 120
alpn: [h2, http/1.1]
eab:
  key_id: kid-1
  key: aGVsbG8
"#,
        )
        .unwrap();

        assert_eq!(
            file.directory_url.as_deref(),
            Some("https://acme.example.test/directory")
        );
        assert_eq!(file.server_name.as_deref(), Some("example.test"));
        assert_eq!(file.network.as_deref(), Some("tcp4"));
        assert_eq!(file.provision_timeout_secs, Some(120));
        assert_eq!(file.alpn, vec!["h2".to_string(), "http/1.1".to_string()]);
        assert_eq!(
            file.eab,
            Some(EabFile {
                key_id: "kid-1".to_string(),
                key: "aGVsbG8".to_string(),
            })
        );
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(ServeFile::parse("{}").unwrap(), ServeFile::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(ServeFile::parse("server_names: [a, b]").is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "server_name: example.test").unwrap();

        let file = ServeFile::load(tmp.path()).unwrap();
        assert_eq!(file.server_name.as_deref(), Some("example.test"));
    }
}
