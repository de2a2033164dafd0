// Domain error kinds for the renderer/presenter boundary.
//
// This is the "fatal vs recoverable vs logged-and-continue" triage from
// the error handling design: `SwapchainOutOfDate`/`Timeout` are caught
// and retried by the presenter, `InvalidId`/`InvalidAction` are counted
// and logged, everything else is fatal and surfaces through the
// installable error callback.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DvzError {
    #[error("id {0} is not present in the object map")]
    InvalidId(crate::idmap::Id),

    #[error("no router entry for action {action:?} on object type {object_type:?}")]
    InvalidAction {
        action: crate::request::Action,
        object_type: crate::request::ObjectType,
    },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("device lost")]
    DeviceLost,

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("shader compilation failed: {0}")]
    ShaderCompileError(String),

    #[error("swapchain out of date")]
    SwapchainOutOfDate,

    #[error("timeout waiting on {0}")]
    Timeout(String),

    #[error("buffer type mismatch: expected {expected:?}, got {actual:?}")]
    BufferTypeMismatch {
        expected: crate::request::BufferType,
        actual: crate::request::BufferType,
    },

    /// P4: `sum(attr.item_size) > binding.stride` for some vertex binding.
    #[error("vertex attributes overrun their binding's stride")]
    InvalidStride,

    #[error("required Vulkan extensions/features are not available on this device")]
    MissingRequiredExtensions,

    #[error("{0}")]
    Other(String),
}

impl DvzError {
    /// True for the two kinds the presenter is expected to catch and
    /// retry/resize around rather than propagate.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DvzError::SwapchainOutOfDate | DvzError::Timeout(_))
    }

    /// True for the kinds that only increment an error counter and log;
    /// rendering continues with the last-valid state.
    pub fn is_logged_only(&self) -> bool {
        matches!(self, DvzError::InvalidId(_) | DvzError::InvalidAction { .. })
    }

    /// True for the kinds that are fatal: the app must refuse further
    /// rendering and surface this to the caller's error callback.
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable() && !self.is_logged_only()
    }
}

pub type Result<T> = std::result::Result<T, DvzError>;

/// A user-installable callback receiving a human-readable message for
/// every fatal error. Threaded explicitly through `Host`/`App` state
/// rather than kept as a module-level global (design notes, "Global
/// state").
pub type ErrorCallback = Box<dyn Fn(&DvzError) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triage_partitions_all_kinds() {
        let kinds = [
            DvzError::InvalidId(1),
            DvzError::InvalidAction {
                action: crate::request::Action::Create,
                object_type: crate::request::ObjectType::Canvas,
            },
            DvzError::ResourceExhausted("pool".to_string()),
            DvzError::DeviceLost,
            DvzError::UnsupportedFeature("x".to_string()),
            DvzError::ShaderCompileError("x".to_string()),
            DvzError::SwapchainOutOfDate,
            DvzError::Timeout("fence".to_string()),
            DvzError::BufferTypeMismatch {
                expected: crate::request::BufferType::Vertex,
                actual: crate::request::BufferType::Index,
            },
            DvzError::InvalidStride,
            DvzError::MissingRequiredExtensions,
            DvzError::Other("x".to_string()),
        ];

        for e in &kinds {
            let flags = (e.is_recoverable(), e.is_logged_only(), e.is_fatal());
            // Exactly one of the three triage buckets should hold.
            assert_eq!(
                [flags.0, flags.1, flags.2].iter().filter(|b| **b).count(),
                1,
                "{e:?} landed in {} buckets",
                [flags.0, flags.1, flags.2].iter().filter(|b| **b).count()
            );
        }
    }

    #[test]
    fn recoverable_kinds() {
        assert!(DvzError::SwapchainOutOfDate.is_recoverable());
        assert!(DvzError::Timeout("x".to_string()).is_recoverable());
        assert!(!DvzError::DeviceLost.is_recoverable());
    }

    #[test]
    fn logged_only_kinds() {
        assert!(DvzError::InvalidId(5).is_logged_only());
        assert!(!DvzError::InvalidId(5).is_fatal());
    }
}
