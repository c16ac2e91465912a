//! Capability negotiation (§4.A): the required-feature checklist every
//! adapter must satisfy, and the optional-capability set negotiated on top.

use crate::config::OptionalCapability;
use crate::{RhiError, RhiResult};
use std::collections::HashSet;

/// Required device features; missing any of these is `FatalCapability`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredFeatures {
    pub shader_draw_parameters: bool,
    pub descriptor_indexing_non_uniform: bool,
    pub runtime_descriptor_array_update_after_bind: bool,
    pub scalar_block_layout: bool,
    pub draw_indirect_count: bool,
    pub imageless_framebuffer: bool,
    pub bc_texture_compression: bool,
    pub synchronization2: bool,
    pub maintenance4: bool,
    /// Required iff ray tracing or debug-capture integration is requested.
    pub buffer_device_address: bool,
}

impl RequiredFeatures {
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.shader_draw_parameters {
            missing.push("shaderDrawParameters");
        }
        if !self.descriptor_indexing_non_uniform {
            missing.push("shaderSampledImageArrayNonUniformIndexing");
        }
        if !self.runtime_descriptor_array_update_after_bind {
            missing.push("descriptorBindingSampledImageUpdateAfterBind");
        }
        if !self.scalar_block_layout {
            missing.push("scalarBlockLayout");
        }
        if !self.draw_indirect_count {
            missing.push("drawIndirectCount");
        }
        if !self.imageless_framebuffer {
            missing.push("imagelessFramebuffer");
        }
        if !self.bc_texture_compression {
            missing.push("textureCompressionBC");
        }
        if !self.synchronization2 {
            missing.push("synchronization2");
        }
        if !self.maintenance4 {
            missing.push("maintenance4");
        }
        missing
    }

    pub fn check(&self) -> RhiResult<()> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RhiError::FatalCapability(missing.join(", ")))
        }
    }
}

/// Negotiation result (§4.A): which optional capabilities ended up active
/// after probing the adapter, independent of what the caller requested.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    active: HashSet<OptionalCapability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self, cap: OptionalCapability) {
        self.active.insert(cap);
    }

    pub fn is_active(&self, cap: OptionalCapability) -> bool {
        self.active.contains(&cap)
    }

    /// Intersects a caller's requested set with what the adapter actually
    /// supports; capabilities that didn't make it are silently downgraded,
    /// per §4.A ("unsupported optional capabilities downgrade the feature
    /// silently").
    pub fn negotiate(requested: &[OptionalCapability], supported: &HashSet<OptionalCapability>) -> Self {
        let mut set = Self::new();
        for cap in requested {
            if supported.contains(cap) {
                set.activate(*cap);
            } else {
                log::warn!("optional capability {cap:?} requested but not supported, downgrading");
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_features_report_missing() {
        let features = RequiredFeatures { synchronization2: true, ..Default::default() };
        let missing = features.missing();
        assert!(missing.contains(&"scalarBlockLayout"));
        assert!(!missing.contains(&"synchronization2"));
        assert!(features.check().is_err());
    }

    #[test]
    fn negotiate_downgrades_unsupported() {
        let mut supported = HashSet::new();
        supported.insert(OptionalCapability::RayTracing);
        let set = CapabilitySet::negotiate(
            &[OptionalCapability::RayTracing, OptionalCapability::MeshShading],
            &supported,
        );
        assert!(set.is_active(OptionalCapability::RayTracing));
        assert!(!set.is_active(OptionalCapability::MeshShading));
    }
}
