//! Store Path Layout
//!
//! Every app lives under `<root>/<app>`; election uses `<root>/<app>/leader`
//! and discovery uses `<root>/<app>/discovery`, with one child per member
//! named after the member's address.

/// Segment used for leader election
pub const LEADER_SEGMENT: &str = "leader";

/// Segment used for member discovery
pub const DISCOVERY_SEGMENT: &str = "discovery";

/// Path layout for one app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLayout {
    root: String,
    app: String,
}

impl PathLayout {
    /// Create a layout; the root is normalised to a leading `/` and no trailing `/`
    pub fn new(root: &str, app: &str) -> Self {
        let trimmed = root.trim_matches('/');
        let root = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        };

        Self {
            root,
            app: app.to_string(),
        }
    }

    /// `<root>/<app>`
    pub fn app_path(&self) -> String {
        format!("{}/{}", self.root, self.app)
    }

    /// `<root>/<app>/leader`
    pub fn leader_path(&self) -> String {
        format!("{}/{}", self.app_path(), LEADER_SEGMENT)
    }

    /// `<root>/<app>/discovery`
    pub fn discovery_path(&self) -> String {
        format!("{}/{}", self.app_path(), DISCOVERY_SEGMENT)
    }
}

/// `<base>/<address>`
pub fn member_path(base: &str, address: &str) -> String {
    format!("{}/{}", base, address)
}

/// Last segment of a path
pub fn child_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// True when `path` sits exactly one level below `parent`
pub fn is_direct_child(parent: &str, path: &str) -> bool {
    match path.strip_prefix(parent).and_then(|rest| rest.strip_prefix('/')) {
        Some(name) => !name.is_empty() && !name.contains('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let layout = PathLayout::new("/rallypoint/common/", "billing");
        assert_eq!(layout.app_path(), "/rallypoint/common/billing");
        assert_eq!(layout.leader_path(), "/rallypoint/common/billing/leader");
        assert_eq!(layout.discovery_path(), "/rallypoint/common/billing/discovery");
        assert_eq!(
            member_path(&layout.discovery_path(), "10.0.0.1:80"),
            "/rallypoint/common/billing/discovery/10.0.0.1:80"
        );

        let bare = PathLayout::new("", "billing");
        assert_eq!(bare.leader_path(), "/billing/leader");
    }

    #[test]
    fn test_children() {
        assert_eq!(child_name("/a/discovery/10.0.0.1"), "10.0.0.1");
        assert!(is_direct_child("/a/discovery", "/a/discovery/10.0.0.1"));
        assert!(!is_direct_child("/a/discovery", "/a/discovery/10.0.0.1/x"));
        assert!(!is_direct_child("/a/discovery", "/a/discoveryx/10.0.0.1"));
        assert!(!is_direct_child("/a/discovery", "/a/discovery"));
        assert!(!is_direct_child("/a/discovery", "/a/discovery/"));
    }
}
