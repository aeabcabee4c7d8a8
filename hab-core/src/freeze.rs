// The freeze codec.
//
// A freeze is a self contained snapshot of a resolved config for every
// supported platform, encoded as an opaque `vN:` prefixed string so it can
// be stored in the `HAB_FREEZE` environment variable and rehydrated later,
// possibly on another host or platform.
//
// Version 1 base64 encodes the canonical json. Version 2, the default,
// compresses with zlib before the base64 step. Before encoding, any string
// starting with a `platform_path_maps` directory is rewritten to the
// mapping's `{name}` sigil so the freeze can roam across platforms.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::errors::{HabError, Result};
use crate::platform::Platform;
use crate::site::Site;

/// Freeze format used when neither the caller nor the site pins one.
pub const DEFAULT_VERSION: u32 = 2;

/// Encode a freeze payload into its opaque string form.
///
/// The version comes from the argument, then `site.freeze_version`, then
/// the default.
pub fn encode(data: &Value, version: Option<u32>, site: Option<&Site>) -> Result<String> {
    let version = version
        .or_else(|| site.and_then(Site::freeze_version))
        .unwrap_or(DEFAULT_VERSION);

    let data = match site {
        Some(site) => map_strings(data, &|text| site.path_to_sigil(text)),
        None => data.clone(),
    };
    // serde_json sorts object keys, giving a canonical payload
    let text = serde_json::to_string(&data).map_err(|err| {
        HabError::FreezeDecode(format!("Unable to serialize the freeze: {err}"))
    })?;

    let encoded = match version {
        1 => BASE64.encode(text.as_bytes()),
        2 => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(text.as_bytes())?;
            BASE64.encode(encoder.finish()?)
        }
        other => {
            return Err(HabError::FreezeDecode(format!(
                "Freeze version {other} is not supported."
            )))
        }
    };
    Ok(format!("v{version}:{encoded}"))
}

/// Decode an opaque freeze string back into its payload.
///
/// When a site is given, path sigils expand to the values for `platform`.
pub fn decode(text: &str, site: Option<&Site>, platform: Platform) -> Result<Value> {
    let Some((version, body)) = text.split_once(':') else {
        return Err(HabError::FreezeDecode(
            "Missing freeze version information in format `v0:...`".to_string(),
        ));
    };
    let Some(version) = version.strip_prefix('v') else {
        return Err(HabError::FreezeDecode(
            "Missing freeze version information in format `v0:...`".to_string(),
        ));
    };
    let version: u32 = version.parse().map_err(|_| {
        HabError::FreezeDecode(format!("Version {version} is not valid."))
    })?;

    let raw = BASE64
        .decode(body.trim())
        .map_err(|err| HabError::FreezeDecode(format!("Invalid freeze encoding: {err}")))?;

    let text = match version {
        1 => String::from_utf8(raw)
            .map_err(|err| HabError::FreezeDecode(format!("Invalid freeze payload: {err}")))?,
        2 => {
            let mut decoder = ZlibDecoder::new(raw.as_slice());
            let mut out = String::new();
            decoder.read_to_string(&mut out).map_err(|err| {
                HabError::FreezeDecode(format!("Invalid freeze payload: {err}"))
            })?;
            out
        }
        other => {
            return Err(HabError::FreezeDecode(format!(
                "Freeze version {other} is not supported."
            )))
        }
    };

    let data: Value = serde_json::from_str(&text)
        .map_err(|err| HabError::FreezeDecode(format!("Invalid freeze json: {err}")))?;

    match site {
        Some(site) => Ok(map_strings(&data, &|text| {
            site.path_from_sigil(text, platform)
        })),
        None => Ok(data),
    }
}

/// Apply a transform to every string in a json tree.
fn map_strings(value: &Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(text) => Value::String(f(text)),
        Value::Array(items) => Value::Array(items.iter().map(|v| map_strings(v, f)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), map_strings(v, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "name": "child",
            "uri": "not_set/child",
            "versions": [["maya2020", "2020.1"]],
            "environment": {
                "linux": {"TEST": ["case"]},
                "windows": {"TEST": ["case"]}
            }
        })
    }

    #[test]
    fn test_round_trip_both_versions() {
        let data = payload();
        for version in [1, 2] {
            let text = encode(&data, Some(version), None).unwrap();
            assert!(text.starts_with(&format!("v{version}:")));
            let decoded = decode(&text, None, Platform::Linux).unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn test_default_version() {
        let text = encode(&payload(), None, None).unwrap();
        assert!(text.starts_with("v2:"));
    }

    #[test]
    fn test_decode_errors() {
        let text = encode(&payload(), Some(1), None).unwrap();
        let body = text.strip_prefix("v1:").unwrap();

        let err = decode(body, None, Platform::Linux).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing freeze version information in format `v0:...`"
        );

        let err = decode(&format!("1:{body}"), None, Platform::Linux).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing freeze version information in format `v0:...`"
        );

        let err = decode(&format!("vINVALID:{body}"), None, Platform::Linux).unwrap_err();
        assert_eq!(err.to_string(), "Version INVALID is not valid.");

        let err = decode(&format!("v3:{body}"), None, Platform::Linux).unwrap_err();
        assert_eq!(err.to_string(), "Freeze version 3 is not supported.");

        // Zero padded versions are accepted
        assert!(decode(&format!("v01:{body}"), None, Platform::Linux).is_ok());
    }

    #[test]
    fn test_encode_unsupported_version() {
        assert!(encode(&payload(), Some(3), None).is_err());
    }
}
