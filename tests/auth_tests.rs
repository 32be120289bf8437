//! End-to-end authentication tests
//!
//! Tests the inbound key flow from configuration to caller identity:
//! - literal, `env:` and pre-hashed `sha256:` keys
//! - public paths
//! - rejection of empty and unknown keys

use std::io::Write;

use gdp_mcp_gateway::Error;
use gdp_mcp_gateway::config::{ApiKeyConfig, AuthConfig, Config, GdpConfig};
use gdp_mcp_gateway::credentials::{Credentials, digest_key};
use gdp_mcp_gateway::gateway::InboundGuard;
use pretty_assertions::assert_eq;

fn gdp() -> GdpConfig {
    GdpConfig {
        host: "gdp.local".to_string(),
        external_host: String::new(),
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        username: String::new(),
        password: String::new(),
        ..GdpConfig::default()
    }
}

fn guard(auth: &AuthConfig) -> InboundGuard {
    let credentials = Credentials::from_config(&gdp(), auth).unwrap();
    InboundGuard::from_credentials(&credentials, auth.public_paths.clone())
}

/// Guard built from config accepts configured keys and names the caller
#[test]
fn test_config_keys_resolve_to_callers() {
    let auth = AuthConfig {
        api_keys: vec![
            ApiKeyConfig {
                key: "literal-key".to_string(),
                name: "Literal Client".to_string(),
            },
            ApiKeyConfig {
                key: format!("sha256:{}", hex::encode(digest_key("hashed-key"))),
                name: "Hashed Client".to_string(),
            },
            ApiKeyConfig {
                key: "anonymous-key".to_string(),
                name: String::new(),
            },
        ],
        ..AuthConfig::default()
    };
    let guard = guard(&auth);

    assert_eq!(guard.key_count(), 3);
    assert_eq!(guard.validate("literal-key").unwrap().name, "Literal Client");
    assert_eq!(guard.validate("hashed-key").unwrap().name, "Hashed Client");
    assert_eq!(guard.validate("anonymous-key").unwrap().name, "key-3");
}

/// The pre-hashed form never accepts the digest itself as a key
#[test]
fn test_digest_is_not_a_key() {
    let digest = hex::encode(digest_key("hashed-key"));
    let auth = AuthConfig {
        api_keys: vec![ApiKeyConfig {
            key: format!("sha256:{digest}"),
            name: "Hashed Client".to_string(),
        }],
        ..AuthConfig::default()
    };
    let guard = guard(&auth);

    assert!(matches!(guard.validate(&digest), Err(Error::Unauthorized)));
    assert!(matches!(
        guard.validate(&format!("sha256:{digest}")),
        Err(Error::Unauthorized)
    ));
}

/// Fingerprints identify keys in logs without revealing them
#[test]
fn test_fingerprint_is_stable_and_short() {
    let auth = AuthConfig {
        api_keys: vec![ApiKeyConfig {
            key: "literal-key".to_string(),
            name: "Literal Client".to_string(),
        }],
        ..AuthConfig::default()
    };
    let guard = guard(&auth);

    let first = guard.validate("literal-key").unwrap();
    let second = guard.validate("literal-key").unwrap();
    assert_eq!(first, second);
    assert_eq!(first.fingerprint.len(), 8);
    assert!(!first.fingerprint.contains("literal"));
}

/// Empty and malformed key entries fail at startup
#[test]
fn test_invalid_key_entries_are_config_errors() {
    for key in ["", "sha256:not-hex", "sha256:abcd"] {
        let auth = AuthConfig {
            api_keys: vec![ApiKeyConfig {
                key: key.to_string(),
                name: "broken".to_string(),
            }],
            ..AuthConfig::default()
        };
        assert!(
            matches!(Credentials::from_config(&gdp(), &auth), Err(Error::Config(_))),
            "{key:?} should be rejected"
        );
    }
}

/// Default public paths only cover the health endpoint
#[test]
fn test_default_public_paths() {
    let guard = guard(&AuthConfig::default());
    assert_eq!(guard.key_count(), 0);
    assert!(guard.is_public_path("/health"));
    assert!(!guard.is_public_path("/mcp"));
    assert!(guard.validate("anything").is_err());
}

/// Keys loaded from a YAML file through the full config loader
#[test]
fn test_keys_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
env_files: []
gdp:
  host: gdp.example
  client_id: client
  client_secret: secret
auth:
  api_keys:
    - name: ops
      key: "sha256:{}"
  public_paths: ["/health", "/status"]
"#,
        hex::encode(digest_key("ops-key"))
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    let guard = guard(&config.auth);

    assert_eq!(guard.validate("ops-key").unwrap().name, "ops");
    assert!(guard.is_public_path("/status"));
}
