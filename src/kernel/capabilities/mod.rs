//! Linux capability management for the payload process.
//!
//! The bounding and ambient sets are emptied while the process still holds
//! CAP_SETPCAP; the process sets are zeroed after the uid transition.

mod drop;

pub use drop::{
    check_no_new_privs, clear_process_capabilities, restrict_bounding_set, set_no_new_privs,
};

/// Highest capability number probed when emptying the bounding set
pub(crate) const MAX_CAP: u32 = 63;

pub(crate) const PR_CAPBSET_READ: libc::c_int = 23;
pub(crate) const PR_CAPBSET_DROP: libc::c_int = 24;
pub(crate) const PR_CAP_AMBIENT: libc::c_int = 47;
pub(crate) const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_ulong = 4;
pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Capabilities still present in the bounding set of the calling thread
pub fn bounding_set() -> Vec<u32> {
    (0..=MAX_CAP)
        .filter(|cap| unsafe { libc::prctl(PR_CAPBSET_READ, *cap as libc::c_ulong, 0, 0, 0) } == 1)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_set_is_readable() {
        let caps = bounding_set();
        assert!(caps.iter().all(|cap| *cap <= MAX_CAP));
    }
}
