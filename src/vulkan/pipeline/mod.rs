mod compute;
mod graphics;
pub mod raytracing;

pub use compute::VulkanComputePipeline;
pub use graphics::VulkanGraphicsPipeline;
pub use raytracing::VulkanRayTracingPipeline;
