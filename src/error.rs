//! Crate error type: one variant per §7 error category.

use thiserror::Error;

/// Errors surfaced by the backend. Fatal categories (everything except
/// [`RhiError::SwapchainOutOfDate`], [`RhiError::SwapchainSuboptimal`] and
/// [`RhiError::Recoverable`]) are meant to be propagated to the top of the
/// embedding application and aborted on; the scheduler never attempts to
/// recover from them itself.
#[derive(Debug, Error)]
pub enum RhiError {
    /// A required device feature or extension is absent.
    #[error("required capability missing: {0}")]
    FatalCapability(String),

    /// Instance/device/allocator/pipeline/render-pass creation failed.
    #[error("creation failed: {0}")]
    FatalCreate(String),

    /// Shader reflection produced a contradiction across files (push-constant
    /// size mismatch, multi-dimensional array binding, missing wrapper struct).
    #[error("shader reflection error in '{file}': {reason}")]
    FatalShader { file: String, reason: String },

    /// Detected on fence wait or queue submit.
    #[error("device lost{}", .dump_status.as_ref().map(|s| format!(" (crash dump: {s})")).unwrap_or_default())]
    DeviceLost { dump_status: Option<String> },

    /// `vkAcquireNextImageKHR` / `vkQueuePresentKHR` returned `VK_ERROR_OUT_OF_DATE_KHR`.
    #[error("swapchain out of date")]
    SwapchainOutOfDate,

    /// `vkQueuePresentKHR` returned `VK_SUBOPTIMAL_KHR`.
    #[error("swapchain suboptimal")]
    SwapchainSuboptimal,

    /// Non-fatal: logged by the caller, operation simply didn't happen.
    #[error("recoverable error: {0}")]
    Recoverable(String),

    /// The caller violated an API contract (no bound index buffer, ray
    /// tracing used without the capability, indirect buffer untagged, etc).
    #[error("logic assertion failed at {site}: {message}")]
    LogicAssertion { site: String, message: String },

    /// A raw Vulkan API failure not otherwise categorised above.
    #[cfg(feature = "vulkan")]
    #[error("vulkan error: {0:?}")]
    Vulkan(#[from] ash::vk::Result),
}

pub type RhiResult<T> = Result<T, RhiError>;

impl RhiError {
    pub fn logic(site: impl Into<String>, message: impl Into<String>) -> Self {
        RhiError::LogicAssertion { site: site.into(), message: message.into() }
    }
}
