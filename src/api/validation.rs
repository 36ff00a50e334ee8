use super::ApiError;

const MAX_VM_ID_LEN: usize = 128;

/// Unwraps a required request field, rejecting absent or blank values.
pub fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ApiError::validation(format!("{field} is required"))),
    }
}

pub fn validate_vm_id(vm_id: &str) -> Result<&str, ApiError> {
    let trimmed = vm_id.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("VM id cannot be empty"));
    }

    if trimmed.len() > MAX_VM_ID_LEN {
        return Err(ApiError::validation(format!(
            "VM id must be {MAX_VM_ID_LEN} characters or less"
        )));
    }

    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(ApiError::validation(
            "VM id can only contain letters, numbers, hyphens, underscores, dots and colons",
        ));
    }

    Ok(trimmed)
}
