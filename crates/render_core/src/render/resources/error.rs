//! Error taxonomy of the resource-management core

use crate::foundation::collections::HandleError;
use crate::render::api::BackendError;
use thiserror::Error;

/// Errors returned by the buffer arena, descriptor allocator and command buffer manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Stale handle, double free or exhausted handle index space
    #[error(transparent)]
    Handle(#[from] HandleError),

    /// The backend could not create a native object
    #[error("Failed to create {resource}: {source}")]
    ResourceExhausted {
        /// Kind of object that could not be created
        resource: &'static str,
        /// Backend failure
        source: BackendError,
    },

    /// The caller broke an API precondition
    #[error("Usage precondition violated: {reason}")]
    UsagePrecondition {
        /// What was wrong with the call
        reason: String,
    },

    /// A fence could not be queried or waited on; the frame must be abandoned
    #[error("Fence wait failed: {source}")]
    FenceWait {
        /// Backend failure
        source: BackendError,
    },

    /// A backend call other than object creation failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Result type for resource-management operations
pub type ResourceResult<T> = Result<T, ResourceError>;

impl ResourceError {
    /// Creation failure of `resource`
    pub fn exhausted(resource: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| {
            log::error!("Failed to create {}: {}", resource, source);
            Self::ResourceExhausted { resource, source }
        }
    }

    /// Precondition violation, logged as it is built
    pub fn precondition(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        log::warn!("Usage precondition violated: {}", reason);
        Self::UsagePrecondition { reason }
    }

    /// Fence status or wait failure
    pub fn fence_wait(source: BackendError) -> Self {
        log::error!("Fence wait failed: {}", source);
        Self::FenceWait { source }
    }

    /// Whether the error is a refused handle misuse
    pub fn is_handle_misuse(&self) -> bool {
        matches!(
            self,
            Self::Handle(HandleError::StaleHandle { .. } | HandleError::DoubleFree { .. })
        )
    }
}
