use serde::Deserialize;
use tracing::debug;

use console_core::ProbeError;
use console_core::types::ClusterVersion;

use crate::generation::Connector;

#[derive(Debug, Deserialize)]
struct VersionPayload {
    etcdserver: String,
}

/// Ask each endpoint in turn for its version; the first answer wins.
pub async fn probe_version(
    connector: &dyn Connector,
    endpoints: &[String],
) -> Result<ClusterVersion, ProbeError> {
    let mut last = None;
    for endpoint in endpoints {
        match connector.fetch_version(endpoint).await {
            Ok(body) => {
                let version = parse_version_payload(&body)?;
                debug!("{endpoint} reports etcd {version}");
                return Ok(version);
            }
            Err(e) => {
                debug!("Version probe of {endpoint} failed: {e}");
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| ProbeError::Unreachable("no endpoints configured".into())))
}

pub fn parse_version_payload(body: &[u8]) -> Result<ClusterVersion, ProbeError> {
    let payload: VersionPayload =
        serde_json::from_slice(body).map_err(|e| ProbeError::Malformed(e.to_string()))?;
    parse_server_version(&payload.etcdserver)
}

/// Parse a server version, retrying a fixed series of normalisations.
pub fn parse_server_version(raw: &str) -> Result<ClusterVersion, ProbeError> {
    normalisations(raw)
        .iter()
        .find_map(|candidate| semver::Version::parse(candidate).ok())
        .map(|v| ClusterVersion::new(v.major, v.minor, v.patch))
        .ok_or_else(|| ProbeError::Unparseable(raw.to_string()))
}

fn normalisations(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let unprefixed = trimmed.trim_start_matches(['v', 'V']);
    let core = unprefixed
        .split(['-', '+'])
        .next()
        .unwrap_or(unprefixed);
    vec![
        trimmed.to_string(),
        unprefixed.to_string(),
        pad_components(unprefixed),
        pad_components(core),
    ]
}

/// `3` -> `3.0.0`, `3.4` -> `3.4.0`; a pre-release suffix stays on the last part.
fn pad_components(version: &str) -> String {
    let (numbers, suffix) = match version.find(['-', '+']) {
        Some(at) => version.split_at(at),
        None => (version, ""),
    };
    let mut parts: Vec<&str> = numbers.split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    format!("{}{suffix}", parts.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_payload() {
        let v = parse_version_payload(br#"{"etcdserver":"3.4.0","etcdcluster":"3.4.0"}"#).unwrap();
        assert_eq!(v, ClusterVersion::new(3, 4, 0));
    }

    #[test]
    fn legacy_payload() {
        let v = parse_version_payload(br#"{"etcdserver":"2.3.8","etcdcluster":"2.3.0"}"#).unwrap();
        assert_eq!(v.major, 2);
    }

    #[test]
    fn normalised_forms() {
        assert_eq!(parse_server_version("v3.5.9").unwrap(), ClusterVersion::new(3, 5, 9));
        assert_eq!(parse_server_version("3.4").unwrap(), ClusterVersion::new(3, 4, 0));
        assert_eq!(parse_server_version("3").unwrap(), ClusterVersion::new(3, 0, 0));
        assert_eq!(
            parse_server_version("3.6.0-rc.1").unwrap(),
            ClusterVersion::new(3, 6, 0)
        );
        assert_eq!(
            parse_server_version("v3.4-alpha").unwrap(),
            ClusterVersion::new(3, 4, 0)
        );
    }

    #[test]
    fn unparseable_version() {
        assert!(matches!(
            parse_server_version("banana"),
            Err(ProbeError::Unparseable(_))
        ));
        assert!(matches!(
            parse_server_version(""),
            Err(ProbeError::Unparseable(_))
        ));
    }

    #[test]
    fn malformed_payload() {
        assert!(matches!(
            parse_version_payload(b"<html>"),
            Err(ProbeError::Malformed(_))
        ));
        assert!(matches!(
            parse_version_payload(br#"{"etcdcluster":"3.4.0"}"#),
            Err(ProbeError::Malformed(_))
        ));
    }
}
