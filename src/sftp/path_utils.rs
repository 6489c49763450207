//! Remote path helpers
//!
//! SFTP paths always use `/`, whatever the server's platform.

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if is_absolute_remote_path(component) {
        component.to_string()
    } else if base.is_empty() {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Resolve `.` and `..` segments of an absolute path lexically.
/// `..` above the root stays at the root.
pub fn normalize_remote_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Parent of an absolute path; the root is its own parent
pub fn parent_remote_path(path: &str) -> String {
    let normalized = normalize_remote_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_absolute_remote_path() {
        assert!(is_absolute_remote_path("/home/user"));
        assert!(!is_absolute_remote_path("relative"));
        assert!(!is_absolute_remote_path(""));
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home", "user"), "/home/user");
        assert_eq!(join_remote_path("/home/", "user"), "/home/user");
        assert_eq!(join_remote_path("/", "etc"), "/etc");
        assert_eq!(join_remote_path("/home", "/etc"), "/etc");
        assert_eq!(join_remote_path("", "ls"), "ls");
    }

    #[test]
    fn test_normalize_remote_path() {
        assert_eq!(normalize_remote_path("/home/test/./ls"), "/home/test/ls");
        assert_eq!(normalize_remote_path("/home/test/../x"), "/home/x");
        assert_eq!(normalize_remote_path("/.."), "/");
        assert_eq!(normalize_remote_path("//a//b/"), "/a/b");
    }

    #[test]
    fn test_parent_remote_path() {
        assert_eq!(parent_remote_path("/home/test"), "/home");
        assert_eq!(parent_remote_path("/home"), "/");
        assert_eq!(parent_remote_path("/"), "/");
    }
}
