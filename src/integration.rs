//! External-feature plug points (§4.H). The backend owns feature objects but
//! knows nothing about their internals — DLSS, denoisers, RenderDoc capture
//! and similar vendor SDKs implement this trait out of tree.

use crate::{ResourceId, RhiResult};
use std::any::Any;
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalFeatureKind {
    Upscaling,
    Denoiser,
    FrameCapture,
}

/// Parameter bundle an upscaling/denoising feature evaluates against, per
/// §4.H. Resource fields are left as `ResourceId`s; the concrete feature
/// resolves them against the backend's live object table.
#[derive(Debug, Clone)]
pub struct FeatureEvalParams {
    pub input_color: ResourceId,
    pub output_color: ResourceId,
    pub depth: ResourceId,
    pub velocity: ResourceId,
    pub exposure: Option<ResourceId>,
    pub jitter_offset: (f32, f32),
    pub render_scale: f32,
    pub pre_exposure: f32,
    pub reset_history: bool,
}

/// A feature's self-reported preferences; the caller decides whether to
/// honour them.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeaturePreferences {
    pub preferred_render_resolution: Option<(u32, u32)>,
    pub sharpening: Option<f32>,
    pub mip_bias: Option<f32>,
}

pub trait ExternalFeature: Debug {
    fn kind(&self) -> ExternalFeatureKind;
    /// Evaluated as a command-list operation by the concrete backend, which
    /// downcasts both `self` and the active command list to their backend
    /// type via `as_any`.
    fn evaluate(&self, params: &FeatureEvalParams) -> RhiResult<()>;
    fn preferences(&self) -> FeaturePreferences {
        FeaturePreferences::default()
    }
    fn as_any(&self) -> &dyn Any;
}

/// Debug-label passthrough plus a frame-capture toggle, both backed by the
/// debug-utils extension when present. The scheduler owns one instance.
pub trait DebugCapture {
    fn push_label(&self, name: &str);
    fn pop_label(&self);
    fn set_capture_next_frame(&self, armed: bool);
}
