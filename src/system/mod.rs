//! Host introspection

mod gpu;

pub use gpu::{detect_gpu, ComputeCapability, GpuInfo};

/// Hardware and platform facts, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct HostFacts {
    /// OS family as reported by `std::env::consts::OS`
    pub platform: String,
    pub gpu: Option<GpuInfo>,
}

impl HostFacts {
    /// Probe the current host
    pub fn detect() -> Self {
        let gpu = detect_gpu();
        match &gpu {
            Some(info) => tracing::info!(
                "GPU: {} ({:.1} GB, compute capability {})",
                info.name,
                info.vram_gb(),
                info.compute_capability
                    .map(|cc| cc.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
            None => tracing::warn!("No CUDA GPU detected; inference will be slow or fail"),
        }
        Self {
            platform: std::env::consts::OS.to_string(),
            gpu,
        }
    }

    pub fn compute_capability(&self) -> Option<ComputeCapability> {
        self.gpu.as_ref().and_then(|g| g.compute_capability)
    }
}
