//! Guest resource release plumbing.
//!
//! Every successfully parsed command owns a [`ReleaseHandle`]; dropping
//! the last clone of the command dispatches the release back to the
//! device exactly once. A failed parse never constructs a handle, so the
//! caller keeps ownership of the guest resource.

use std::fmt;
use std::sync::Arc;

/// Identifies one guest resource to hand back to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub id: u64,
    pub group_id: u32,
}

/// Device-side sink for released guest resources.
pub trait ResourceReleaser: Send + Sync {
    fn release_resource(&self, info: ReleaseInfo);
}

pub struct ReleaseHandle {
    releaser: Arc<dyn ResourceReleaser>,
    info: ReleaseInfo,
}

impl ReleaseHandle {
    pub fn new(releaser: Arc<dyn ResourceReleaser>, info: ReleaseInfo) -> Self {
        Self { releaser, info }
    }

    pub fn info(&self) -> ReleaseInfo {
        self.info
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        self.releaser.release_resource(self.info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingReleaser(AtomicUsize);

    impl ResourceReleaser for CountingReleaser {
        fn release_resource(&self, _info: ReleaseInfo) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_fires_exactly_once() {
        let releaser = Arc::new(CountingReleaser::default());
        let handle = ReleaseHandle::new(
            releaser.clone(),
            ReleaseInfo {
                id: 42,
                group_id: 0,
            },
        );
        let shared = Arc::new(handle);
        let clone = shared.clone();
        drop(shared);
        assert_eq!(releaser.0.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(releaser.0.load(Ordering::SeqCst), 1);
    }
}
