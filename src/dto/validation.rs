//! Validation helpers for DTOs and hub frames.

use validator::ValidationError;

/// Longest accepted device identifier.
const MAX_DEVICE_ID_LEN: usize = 64;

/// Validates that a device ID is 1 to 64 ASCII letters, digits, `-` or `_`.
pub fn validate_device_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id.len() > MAX_DEVICE_ID_LEN {
        let mut err = ValidationError::new("device_id_length");
        err.message = Some(
            format!(
                "Device ID must be between 1 and {MAX_DEVICE_ID_LEN} characters (got {})",
                id.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        let mut err = ValidationError::new("device_id_format");
        err.message = Some("Device ID may only contain ASCII letters, digits, '-' and '_'".into());
        return Err(err);
    }

    Ok(())
}

/// Validates a hub channel name: `session:{uuid}` or `presence:{uuid}`.
pub fn validate_channel(name: &str) -> Result<(), ValidationError> {
    let valid = name
        .split_once(':')
        .filter(|(kind, _)| matches!(*kind, "session" | "presence"))
        .is_some_and(|(_, id)| uuid::Uuid::parse_str(id).is_ok());

    if valid {
        Ok(())
    } else {
        let mut err = ValidationError::new("channel_name");
        err.message = Some(format!("unsupported channel `{name}`").into());
        Err(err)
    }
}
