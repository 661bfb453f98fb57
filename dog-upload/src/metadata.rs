//! `Upload-Metadata` header codec.
//!
//! The header is a comma separated list of `key base64(value)` pairs. The value
//! may be omitted, in which case it decodes to an empty string.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::{MetaData, ProtocolError, UploadResult};

/// Parse an `Upload-Metadata` header value
pub fn parse_upload_metadata(header: &str) -> UploadResult<MetaData> {
    let mut metadata = MetaData::new();

    for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default();
        let encoded = parts.next().map(str::trim).unwrap_or_default();

        if key.is_empty() {
            return Err(invalid("empty key").into());
        }
        if encoded.contains(' ') {
            return Err(invalid(format!("unexpected space in value for {key}")).into());
        }

        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| invalid(format!("value for {key} is not base64: {e}")))?;
        let value = String::from_utf8(bytes)
            .map_err(|_| invalid(format!("value for {key} is not UTF-8")))?;

        metadata.insert(key.to_string(), value);
    }

    Ok(metadata)
}

/// Encode metadata into an `Upload-Metadata` header value
pub fn encode_upload_metadata(metadata: &MetaData) -> String {
    metadata
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{} {}", key, STANDARD.encode(value))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn invalid<S: Into<String>>(reason: S) -> ProtocolError {
    ProtocolError::InvalidMetadata {
        reason: reason.into(),
    }
}
