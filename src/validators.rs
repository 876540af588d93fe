//! Input validation and sanitization functions for unifw
//!
//! Everything an operator supplies ends up in a native argv, so each field is
//! checked here before any command is built.

use ipnetwork::IpNetwork;

/// Strips a comment down to characters every backend accepts verbatim.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use unifw::validators::sanitize_comment;
///
/// assert_eq!(sanitize_comment("Web server"), "Web server");
///
/// let safe = sanitize_comment("Test\nNewline\"Quote");
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':' | '/'))
        .take(64)
        .collect()
}

/// Validates a rule comment.
///
/// # Errors
///
/// Returns `Err` if the comment exceeds 64 characters or contains anything
/// [`sanitize_comment`] would strip.
pub fn validate_comment(input: &str) -> Result<String, String> {
    if input.len() > 64 {
        return Err("Comment too long (max 64 characters)".to_string());
    }

    let sanitized = sanitize_comment(input);
    if sanitized != input {
        return Err(format!(
            "Comment contains unsupported characters (allowed: letters, digits, space, - _ . : /); \
             try '{sanitized}'"
        ));
    }

    Ok(sanitized)
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name is empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a container id or name as Docker accepts them: alphanumeric
/// first, then alphanumerics, `_`, `.` or `-`.
///
/// # Errors
///
/// Returns `Err` for empty or overlong references and other characters.
pub fn validate_container_ref(name: &str) -> Result<String, String> {
    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(format!("Invalid container reference '{name}'"));
    }
    if name.len() > 128 {
        return Err("Container reference too long (max 128 characters)".to_string());
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(format!("Container reference '{name}' contains invalid characters"));
    }
    Ok(name.to_string())
}

/// Validates an application profile / service name (`OpenSSH`, `Nginx Full`, `http`).
///
/// # Errors
///
/// Returns `Err` for empty names, names over 64 characters, or characters
/// outside letters, digits, space, dash, dot, underscore and plus.
pub fn validate_app_name(name: &str) -> Result<String, String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Application profile name is empty".to_string());
    }
    if trimmed.len() > 64 {
        return Err("Application profile name too long (max 64 characters)".to_string());
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '+'))
    {
        return Err(format!(
            "Application profile '{trimmed}' contains invalid characters"
        ));
    }
    Ok(trimmed.to_string())
}

/// Validates a CIDR or bare address.
///
/// # Errors
///
/// Returns `Err` when `input` does not parse as an IPv4/IPv6 network.
pub fn validate_network(input: &str) -> Result<IpNetwork, String> {
    input
        .trim()
        .parse::<IpNetwork>()
        .map_err(|e| format!("Invalid network '{input}': {e}"))
}

/// Validates a routing table reference: `main`, `local`, `default`, a
/// numeric id, or a name from `rt_tables`.
///
/// # Errors
///
/// Returns `Err` for empty or overlong names and unsafe characters.
pub fn validate_table(table: &str) -> Result<String, String> {
    if table.is_empty() {
        return Err("Routing table is empty".to_string());
    }
    if table.len() > 32 {
        return Err("Routing table name too long (max 32 characters)".to_string());
    }
    if !table
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(format!("Routing table '{table}' contains invalid characters"));
    }
    Ok(table.to_string())
}

/// Validates a firewall mark: decimal or hex, optionally with a `/mask`.
///
/// # Errors
///
/// Returns `Err` when either part is not a valid 32-bit unsigned integer.
pub fn validate_fwmark(mark: &str) -> Result<String, String> {
    fn parse_u32(s: &str) -> Option<u32> {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    }

    let (value, mask) = match mark.split_once('/') {
        Some((v, m)) => (v, Some(m)),
        None => (mark, None),
    };
    if parse_u32(value).is_none() || mask.is_some_and(|m| parse_u32(m).is_none()) {
        return Err(format!("Invalid firewall mark '{mark}'"));
    }
    Ok(mark.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_comment_normal() {
        assert_eq!(sanitize_comment("Allow SSH"), "Allow SSH");
    }

    #[test]
    fn test_sanitize_comment_removes_control_chars() {
        let result = sanitize_comment("Test\nNewline\tTab");
        assert!(!result.contains('\n'));
        assert!(!result.contains('\t'));
    }

    #[test]
    fn test_sanitize_comment_removes_shell_metacharacters() {
        let result = sanitize_comment("Test$(whoami)`id`;rm");
        assert_eq!(result, "Testwhoamiidrm");
    }

    #[test]
    fn test_sanitize_comment_length_limit() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_comment(&long).len(), 64);
    }

    #[test]
    fn test_validate_comment() {
        assert_eq!(validate_comment("api gateway").unwrap(), "api gateway");
        assert!(validate_comment("x'; DROP").is_err());
        assert!(validate_comment(&"a".repeat(65)).is_err());
        assert!(validate_comment("").is_ok());
    }

    #[test]
    fn test_validate_port_zero() {
        assert!(validate_port(0).is_err());
        assert_eq!(validate_port(22).unwrap(), 22);
    }

    #[test]
    fn test_validate_port_range() {
        assert_eq!(validate_port_range(1000, 2000).unwrap(), (1000, 2000));
        assert!(validate_port_range(2000, 1000).is_err());
        assert!(validate_port_range(0, 10).is_err());
    }

    #[test]
    fn test_validate_interface() {
        assert!(validate_interface("eth0").is_ok());
        assert!(validate_interface("br-1a2b3c4d5e6f").is_ok());
        assert!(validate_interface("").is_err());
        assert!(validate_interface("..").is_err());
        assert!(validate_interface("eth0; rm").is_err());
        assert!(validate_interface("a_very_long_interface").is_err());
    }

    #[test]
    fn test_validate_app_name() {
        assert_eq!(validate_app_name("Nginx Full").unwrap(), "Nginx Full");
        assert!(validate_app_name("ssh").is_ok());
        assert!(validate_app_name("").is_err());
        assert!(validate_app_name("bad\"name").is_err());
    }

    #[test]
    fn test_validate_network() {
        assert!(validate_network("10.0.0.0/8").is_ok());
        assert!(validate_network("2001:db8::/32").is_ok());
        assert!(validate_network("10.0.0.0/33").is_err());
        assert!(validate_network("not-a-network").is_err());
    }

    #[test]
    fn test_validate_fwmark() {
        assert!(validate_fwmark("1").is_ok());
        assert!(validate_fwmark("0x10/0xff").is_ok());
        assert!(validate_fwmark("0xzz").is_err());
        assert!(validate_fwmark("1/").is_err());
    }

    #[test]
    fn test_validate_table() {
        assert!(validate_table("main").is_ok());
        assert!(validate_table("100").is_ok());
        assert!(validate_table("vpn table").is_err());
    }
}
