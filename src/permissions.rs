//! Permission resolution
//!
//! Maps a request path and method to a (resource, access) pair through a
//! fixed route table, then checks the matching capability flag. Every input
//! yields a decision; unrecognized routes are denied.

use hyper::Method;
use std::fmt;

use crate::credentials::{Access, Capabilities, Resource};

/// Route prefixes, longest first
pub const ROUTE_TABLE: [(&str, Resource); 4] = [
    ("/medical-records/", Resource::MedicalRecords),
    ("/appointments/", Resource::Appointments),
    ("/patients/", Resource::Patients),
    ("/pharmacy/", Resource::Pharmacy),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Path outside the mount or not in the route table
    UnknownRoute,
    MissingCapability(Resource, Access),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::UnknownRoute => f.write_str("unknown route"),
            DenyReason::MissingCapability(resource, Access::Read) => {
                write!(f, "no read access to {}", resource)
            }
            DenyReason::MissingCapability(resource, Access::Write) => {
                write!(f, "no write access to {}", resource)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allowed(Resource, Access),
    Denied(DenyReason),
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PermissionDecision::Allowed(..))
    }
}

/// Safe methods read, everything else writes
pub fn access_for_method(method: &Method) -> Access {
    match *method {
        Method::GET | Method::HEAD | Method::OPTIONS => Access::Read,
        _ => Access::Write,
    }
}

fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.replace("%2e", ".").replace("%2E", ".");
    decoded == "." || decoded == ".."
}

/// Canonical form of a request path relative to `mount_prefix`.
///
/// Strips the prefix, collapses repeated slashes and always ends in `/`.
/// Returns `None` for paths outside the mount or containing dot segments.
pub fn normalize_path(path: &str, mount_prefix: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }

    let prefix = mount_prefix.trim_end_matches('/');
    let relative = if prefix.is_empty() {
        path
    } else {
        let rest = path.strip_prefix(prefix)?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        rest
    };

    let mut normalized = String::with_capacity(relative.len() + 1);
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        if is_dot_segment(segment) {
            return None;
        }
        normalized.push('/');
        normalized.push_str(segment);
    }
    normalized.push('/');
    Some(normalized)
}

/// Resource family owning a normalized path
pub fn resource_for_path(normalized: &str) -> Option<Resource> {
    ROUTE_TABLE
        .iter()
        .find(|(prefix, _)| normalized.starts_with(prefix))
        .map(|(_, resource)| *resource)
}

/// Decide whether `capabilities` permit `method` on a normalized path
pub fn resolve(normalized: &str, method: &Method, capabilities: &Capabilities) -> PermissionDecision {
    let resource = match resource_for_path(normalized) {
        Some(resource) => resource,
        None => return PermissionDecision::Denied(DenyReason::UnknownRoute),
    };
    let access = access_for_method(method);

    if capabilities.allows(resource, access) {
        PermissionDecision::Allowed(resource, access)
    } else {
        PermissionDecision::Denied(DenyReason::MissingCapability(resource, access))
    }
}

/// Normalize then resolve; paths that fail to normalize are denied
pub fn resolve_raw(
    path: &str,
    mount_prefix: &str,
    method: &Method,
    capabilities: &Capabilities,
) -> PermissionDecision {
    match normalize_path(path, mount_prefix) {
        Some(normalized) => resolve(&normalized, method, capabilities),
        None => PermissionDecision::Denied(DenyReason::UnknownRoute),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MOUNT: &str = "/api/external";

    #[test]
    fn test_route_table_longest_first() {
        for pair in ROUTE_TABLE.windows(2) {
            assert!(pair[0].0.len() >= pair[1].0.len());
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path("/api/external/patients/42", MOUNT).as_deref(),
            Some("/patients/42/")
        );
        assert_eq!(
            normalize_path("/api/external//patients///42/", MOUNT).as_deref(),
            Some("/patients/42/")
        );
        assert_eq!(normalize_path("/api/external", MOUNT).as_deref(), Some("/"));
        assert_eq!(normalize_path("/patients/42/", "").as_deref(), Some("/patients/42/"));
        assert_eq!(normalize_path("/patients/42/", "/").as_deref(), Some("/patients/42/"));
    }

    #[test]
    fn test_normalize_rejects_outside_mount_and_dot_segments() {
        assert_eq!(normalize_path("/patients/42/", MOUNT), None);
        assert_eq!(normalize_path("/api/externalpatients/", MOUNT), None);
        assert_eq!(normalize_path("/api/external/patients/../pharmacy/", MOUNT), None);
        assert_eq!(normalize_path("/api/external/./patients/", MOUNT), None);
        assert_eq!(normalize_path("/api/external/patients/%2E%2E/pharmacy/", MOUNT), None);
        assert_eq!(normalize_path("patients/", ""), None);
    }

    #[test]
    fn test_access_for_method() {
        assert_eq!(access_for_method(&Method::GET), Access::Read);
        assert_eq!(access_for_method(&Method::HEAD), Access::Read);
        assert_eq!(access_for_method(&Method::OPTIONS), Access::Read);
        assert_eq!(access_for_method(&Method::POST), Access::Write);
        assert_eq!(access_for_method(&Method::PUT), Access::Write);
        assert_eq!(access_for_method(&Method::PATCH), Access::Write);
        assert_eq!(access_for_method(&Method::DELETE), Access::Write);
    }

    #[test]
    fn test_read_only_appointments() {
        let caps = Capabilities {
            can_read_appointments: true,
            ..Capabilities::default()
        };

        assert_eq!(
            resolve("/appointments/7/", &Method::GET, &caps),
            PermissionDecision::Allowed(Resource::Appointments, Access::Read)
        );
        assert_eq!(
            resolve("/appointments/7/", &Method::POST, &caps),
            PermissionDecision::Denied(DenyReason::MissingCapability(
                Resource::Appointments,
                Access::Write
            ))
        );
    }

    #[test]
    fn test_each_resource_maps_to_its_flags() {
        for resource in Resource::ALL {
            let path = ROUTE_TABLE
                .iter()
                .find(|(_, r)| *r == resource)
                .map(|(p, _)| *p)
                .unwrap();
            let mut caps = Capabilities::default();
            caps.set(resource, Access::Write, true);

            assert!(!resolve(path, &Method::GET, &caps).is_allowed(), "{}", path);
            assert!(resolve(path, &Method::DELETE, &caps).is_allowed(), "{}", path);
        }
    }

    #[test]
    fn test_unknown_routes_denied() {
        let caps = Capabilities::all();
        assert_eq!(
            resolve("/billing/", &Method::GET, &caps),
            PermissionDecision::Denied(DenyReason::UnknownRoute)
        );
        assert!(!resolve("/patients-export/", &Method::GET, &caps).is_allowed());
        assert!(!resolve("/", &Method::GET, &caps).is_allowed());
        assert!(!resolve_raw("/patients/", MOUNT, &Method::GET, &caps).is_allowed());
        assert!(resolve_raw("/api/external/patients", MOUNT, &Method::GET, &caps).is_allowed());
    }

    proptest! {
        #[test]
        fn prop_resolution_is_total_and_fails_closed(
            path in "[/a-z.%0-9-]{0,48}",
            method in "(GET|POST|PUT|PATCH|DELETE|HEAD|OPTIONS|TRACE)",
        ) {
            let method = Method::from_bytes(method.as_bytes()).unwrap();
            let decision = resolve_raw(&path, MOUNT, &method, &Capabilities::default());
            prop_assert!(!decision.is_allowed());
        }
    }
}
