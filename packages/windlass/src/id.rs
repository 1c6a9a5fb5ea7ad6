//! Identifier validation and the awakeable id codec.
//!
//! Every identifier that reaches a storage lookup (job ids, task names,
//! worker ids, entity names, object keys) passes [`validate_id`] first.
//! Awakeable ids encode their origin invocation so external resolvers need
//! no extra lookup context: `prom_1` + url-safe base64 of
//! `"<job_id>:<entry_index>"`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{Result, WindlassError};

/// Prefix for every awakeable id on the wire.
pub const AWAKEABLE_PREFIX: &str = "prom_1";

/// Maximum serialized payload size accepted for journal inputs/outputs and
/// awakeable payloads. Oversize payloads are rejected, never truncated.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Validate an identifier against `^[A-Za-z0-9_.\-]+$`.
///
/// Failure is a programmer error, not a recoverable condition; nothing that
/// fails validation reaches the store layer.
pub fn validate_id(kind: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(WindlassError::Validation(format!("{kind} must not be empty")));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
    {
        return Err(WindlassError::Validation(format!(
            "{kind} {value:?} contains characters outside [A-Za-z0-9_.-]"
        )));
    }
    Ok(())
}

/// Validate a queue name: one or two `:`-separated identifier segments
/// (`agent:claude`, `default`).
pub fn validate_queue(value: &str) -> Result<()> {
    let mut segments = 0;
    for segment in value.split(':') {
        validate_id("queue segment", segment)?;
        segments += 1;
    }
    if segments > 2 {
        return Err(WindlassError::Validation(format!(
            "queue name {value:?} has more than two segments"
        )));
    }
    Ok(())
}

/// Reject payloads above [`MAX_PAYLOAD_BYTES`].
pub fn validate_payload(kind: &'static str, payload: &serde_json::Value) -> Result<()> {
    let size = serde_json::to_vec(payload)?.len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(WindlassError::Validation(format!(
            "{kind} payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}"
        )));
    }
    Ok(())
}

/// Generate the awakeable id for a journal entry.
pub fn generate_awakeable_id(job_id: &str, entry_index: i64) -> String {
    let body = URL_SAFE_NO_PAD.encode(format!("{job_id}:{entry_index}"));
    format!("{AWAKEABLE_PREFIX}{body}")
}

/// Parse an awakeable id back to its origin `(job_id, entry_index)`.
///
/// Strict: rejects a malformed prefix, missing body, invalid base64, missing
/// colon, a non-numeric index, and job ids that would not have passed
/// [`validate_id`].
pub fn parse_awakeable_id(id: &str) -> Result<(String, i64)> {
    let body = id
        .strip_prefix(AWAKEABLE_PREFIX)
        .ok_or_else(|| WindlassError::Validation(format!("awakeable id {id:?} missing prom_1 prefix")))?;
    if body.is_empty() {
        return Err(WindlassError::Validation(format!("awakeable id {id:?} has no body")));
    }
    let raw = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| WindlassError::Validation(format!("awakeable id {id:?}: invalid base64: {e}")))?;
    let decoded = String::from_utf8(raw)
        .map_err(|_| WindlassError::Validation(format!("awakeable id {id:?}: body is not UTF-8")))?;
    let (job_id, index) = decoded
        .rsplit_once(':')
        .ok_or_else(|| WindlassError::Validation(format!("awakeable id {id:?}: body has no colon")))?;
    let entry_index: i64 = index
        .parse()
        .map_err(|_| WindlassError::Validation(format!("awakeable id {id:?}: entry index {index:?} is not numeric")))?;
    if entry_index < 0 {
        return Err(WindlassError::Validation(format!(
            "awakeable id {id:?}: entry index is negative"
        )));
    }
    validate_id("job id", job_id)?;
    Ok((job_id.to_string(), entry_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids_pass() {
        for id in ["j1", "verify", "agent-01", "a.b_c-d", "X9"] {
            assert!(validate_id("id", id).is_ok(), "{id} should pass");
        }
    }

    #[test]
    fn invalid_ids_rejected() {
        for id in ["", "has space", "semi;colon", "slash/", "colon:here", "ü"] {
            assert!(validate_id("id", id).is_err(), "{id:?} should fail");
        }
    }

    #[test]
    fn queue_names_allow_one_colon() {
        assert!(validate_queue("agent:claude").is_ok());
        assert!(validate_queue("default").is_ok());
        assert!(validate_queue("a:b:c").is_err());
        assert!(validate_queue("agent:").is_err());
    }

    #[test]
    fn awakeable_id_round_trips() {
        for (job, index) in [("j1", 0), ("job-42", 7), ("a.b_c", 123456)] {
            let id = generate_awakeable_id(job, index);
            assert!(id.starts_with(AWAKEABLE_PREFIX));
            assert!(!id.contains('+'));
            assert!(!id.contains('/'));
            assert!(!id.contains('='));
            let (parsed_job, parsed_index) = parse_awakeable_id(&id).unwrap();
            assert_eq!(parsed_job, job);
            assert_eq!(parsed_index, index);
        }
    }

    #[test]
    fn parse_rejects_foreign_ids() {
        // Wrong prefix.
        assert!(parse_awakeable_id("prom_2abc").is_err());
        // No body.
        assert!(parse_awakeable_id("prom_1").is_err());
        // Invalid base64.
        assert!(parse_awakeable_id("prom_1!!!").is_err());
        // Valid base64 but no colon.
        let no_colon = format!("{AWAKEABLE_PREFIX}{}", URL_SAFE_NO_PAD.encode("nocolon"));
        assert!(parse_awakeable_id(&no_colon).is_err());
        // Non-numeric index.
        let bad_index = format!("{AWAKEABLE_PREFIX}{}", URL_SAFE_NO_PAD.encode("j1:abc"));
        assert!(parse_awakeable_id(&bad_index).is_err());
        // Job id that fails validation.
        let bad_job = format!("{AWAKEABLE_PREFIX}{}", URL_SAFE_NO_PAD.encode("bad job:3"));
        assert!(parse_awakeable_id(&bad_job).is_err());
    }

    #[test]
    fn oversize_payload_rejected() {
        let big = serde_json::Value::String("x".repeat(MAX_PAYLOAD_BYTES + 1));
        assert!(validate_payload("test", &big).is_err());
        let small = serde_json::json!({"ok": true});
        assert!(validate_payload("test", &small).is_ok());
    }
}
