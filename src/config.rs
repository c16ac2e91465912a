//! Backend configuration. Plain Rust struct, no config-file crate —
//! the teacher's device init takes parameters and an env var
//! (`LUME_VALIDATION`); this crate follows the same shape with
//! `RHI_VALIDATION`.

/// Optional capabilities a caller may request; unsupported ones are
/// silently downgraded and reported back through
/// [`crate::Backend::has_active_capability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionalCapability {
    RayTracing,
    MeshShading,
    Shader16BitFloat,
    ShaderBarycentrics,
    OpacityMicromaps,
    Upscaling,
}

pub const ALL_OPTIONAL_CAPABILITIES: &[OptionalCapability] = &[
    OptionalCapability::RayTracing,
    OptionalCapability::MeshShading,
    OptionalCapability::Shader16BitFloat,
    OptionalCapability::ShaderBarycentrics,
    OptionalCapability::OpacityMicromaps,
    OptionalCapability::Upscaling,
];

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Enable validation layers. Also respects `RHI_VALIDATION=0/1` at runtime.
    pub validation: bool,
    /// Optional capabilities to request during device negotiation.
    pub requested_capabilities: Vec<OptionalCapability>,
    /// Number of in-flight frame contexts in the scheduler's ring (§4.G). Spec default is 2.
    pub frames_in_flight: u32,
    /// Path the pipeline cache blob is persisted to / loaded from.
    pub pipeline_cache_path: std::path::PathBuf,
    /// Query the memory budget every N frames (§4.H telemetry).
    pub telemetry_interval_frames: u32,
    /// Application name passed to `VkApplicationInfo`.
    pub app_name: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            requested_capabilities: Vec::new(),
            frames_in_flight: 2,
            pipeline_cache_path: std::path::PathBuf::from("assets/.cache/pipeline-cache.bin"),
            telemetry_interval_frames: 10,
            app_name: "rhi-core".to_string(),
        }
    }
}

/// Resolves whether validation should actually be enabled, honouring the
/// `RHI_VALIDATION` env var override the same way the teacher's
/// `LUME_VALIDATION` does.
pub fn resolve_validation_enabled(requested: bool) -> bool {
    match std::env::var("RHI_VALIDATION") {
        Ok(v) if v == "0" || v.eq_ignore_ascii_case("false") => false,
        Ok(v) if v == "1" || v.eq_ignore_ascii_case("true") => true,
        _ => requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_frames_in_flight_is_two() {
        assert_eq!(BackendConfig::default().frames_in_flight, 2);
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("RHI_VALIDATION", "0");
        assert!(!resolve_validation_enabled(true));
        std::env::set_var("RHI_VALIDATION", "1");
        assert!(resolve_validation_enabled(false));
        std::env::remove_var("RHI_VALIDATION");
        assert!(resolve_validation_enabled(true));
    }
}
