//! Input validation for federated payloads
//!
//! Every event payload runs its fields through these checks before a handler
//! sees it, so replicas never store values the owning domain would reject.

use crate::models::user_domain;

/// Validates a federated user address (`name@domain`)
///
/// Requirements:
/// - 1-64 character local part: alphanumeric, underscore, hyphen or dot
/// - Non-empty domain without whitespace, at most 253 characters
pub fn validate_user_id(user_id: &str) -> Result<(), String> {
    let Some(domain) = user_domain(user_id) else {
        return Err(format!("User id {:?} must have the form name@domain", user_id));
    };
    let name = &user_id[..user_id.len() - domain.len() - 1];

    if name.len() > 64 {
        return Err("User name must not exceed 64 characters".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(
            "User name can only contain alphanumeric characters, dots, underscores, and hyphens"
                .to_string(),
        );
    }

    validate_domain(domain)
}

/// Validates a domain (`host` or `host:port`)
pub fn validate_domain(domain: &str) -> Result<(), String> {
    if domain.is_empty() {
        return Err("Domain cannot be empty".to_string());
    }

    if domain.len() > 253 {
        return Err("Domain must not exceed 253 characters".to_string());
    }

    if domain
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '@')
    {
        return Err(format!("Domain {:?} contains invalid characters", domain));
    }

    Ok(())
}

/// Validates an opaque identifier (group, role, channel, category, event ids)
///
/// Requirements:
/// - 1-128 characters
/// - No whitespace or control characters
pub fn validate_identifier(kind: &str, id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err(format!("{} cannot be empty", kind));
    }

    if id.len() > 128 {
        return Err(format!("{} must not exceed 128 characters", kind));
    }

    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("{} cannot contain whitespace", kind));
    }

    Ok(())
}

/// Validates group name format
///
/// Requirements:
/// - 1-100 characters after trimming
pub fn validate_group_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err("Group name cannot be empty".to_string());
    }

    if trimmed.len() > 100 {
        return Err("Group name must not exceed 100 characters".to_string());
    }

    Ok(())
}

/// Validates group description length
pub fn validate_description(description: &str) -> Result<(), String> {
    if description.len() > 1000 {
        return Err("Description must not exceed 1000 characters".to_string());
    }

    Ok(())
}

/// Validates channel name format
///
/// Requirements:
/// - 1-100 characters
/// - Lowercase alphanumeric characters plus hyphens only
pub fn validate_channel_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Channel name cannot be empty".to_string());
    }

    if name.len() > 100 {
        return Err("Channel name must not exceed 100 characters".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(
            "Channel name can only contain lowercase alphanumeric characters and hyphens"
                .to_string(),
        );
    }

    Ok(())
}

/// Validates role and category names: 1-64 characters after trimming
pub fn validate_label(kind: &str, name: &str) -> Result<(), String> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(format!("{} name cannot be empty", kind));
    }

    if trimmed.len() > 64 {
        return Err(format!("{} name must not exceed 64 characters", kind));
    }

    Ok(())
}

/// Validates a role color (`#RRGGBB`)
pub fn validate_color(color: &str) -> Result<(), String> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());

    if !valid {
        return Err(format!("Color {:?} must be in #RRGGBB form", color));
    }

    Ok(())
}
