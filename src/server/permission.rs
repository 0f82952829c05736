//! Privilege checks for sensor access
//!
//! The actual privilege oracle lives outside this daemon; it is consumed
//! through the `PermissionChecker` trait. A sensor's privilege string may
//! carry several `;`-separated tokens and access requires every one of
//! them, checked before any state changes on behalf of the caller.

use crate::error::{Error, Result};
use crate::sensor::info::SensorInfo;
use std::os::unix::io::RawFd;

/// Asks whether the peer behind a connection holds one privilege token
pub trait PermissionChecker: Send + Sync {
    fn has_privilege(&self, peer_fd: RawFd, privilege: &str) -> bool;
}

/// Grants everything; the default when no oracle is wired in
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn has_privilege(&self, _peer_fd: RawFd, _privilege: &str) -> bool {
        true
    }
}

/// Every privilege token of `info` must be granted to `peer_fd`
pub fn check_access(
    checker: &dyn PermissionChecker,
    peer_fd: RawFd,
    info: &SensorInfo,
) -> Result<()> {
    for privilege in info.privileges() {
        if !checker.has_privilege(peer_fd, privilege) {
            return Err(Error::PermissionDenied(privilege.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::info::SensorType;

    struct GrantSet(Vec<&'static str>);

    impl PermissionChecker for GrantSet {
        fn has_privilege(&self, _peer_fd: RawFd, privilege: &str) -> bool {
            self.0.contains(&privilege)
        }
    }

    fn info_with(privilege: &str) -> SensorInfo {
        SensorInfo {
            sensor_type: SensorType::Pedometer,
            uri: "http://example.org/sensor/healthinfo/pedometer/mock".into(),
            model: "m".into(),
            vendor: "v".into(),
            min_range: 0.0,
            max_range: 1.0,
            resolution: 1.0,
            min_interval: 0,
            max_batch_count: 0,
            wakeup_supported: false,
            privilege: privilege.into(),
        }
    }

    #[test]
    fn test_all_tokens_required() {
        let checker = GrantSet(vec!["healthinfo"]);
        assert!(check_access(&checker, 0, &info_with("healthinfo")).is_ok());
        assert!(check_access(&checker, 0, &info_with("healthinfo;location")).is_err());

        let both = GrantSet(vec!["healthinfo", "location"]);
        assert!(check_access(&both, 0, &info_with("healthinfo;location")).is_ok());
    }

    #[test]
    fn test_unrestricted_sensor_always_passes() {
        let checker = GrantSet(vec![]);
        assert!(check_access(&checker, 0, &info_with("")).is_ok());
    }
}
