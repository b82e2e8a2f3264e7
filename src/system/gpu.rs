//! GPU detection
//!
//! Best-effort snapshot taken once at startup. Only NVIDIA devices are
//! queried; everything else reports "no GPU".

use std::fmt;
use std::process::Command;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// CUDA compute capability (major.minor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ComputeCapability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid compute capability '{s}'"))
        };
        Ok(Self::new(parse(major)?, parse(minor)?))
    }
}

impl TryFrom<String> for ComputeCapability {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ComputeCapability> for String {
    fn from(value: ComputeCapability) -> Self {
        value.to_string()
    }
}

/// GPU information
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInfo {
    pub name: String,
    pub vram_total_mb: u64,
    pub compute_capability: Option<ComputeCapability>,
    pub device_count: usize,
}

impl GpuInfo {
    /// Total VRAM in GB, rounded to one decimal
    pub fn vram_gb(&self) -> f64 {
        (self.vram_total_mb as f64 / 1024.0 * 10.0).round() / 10.0
    }
}

/// Detect the first NVIDIA GPU (None if no driver or no device)
pub fn detect_gpu() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,compute_cap",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        tracing::debug!("nvidia-smi exited with {}", output.status);
        return None;
    }

    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    let parts: Vec<&str> = lines.first()?.split(',').map(|s| s.trim()).collect();
    if parts.len() < 2 {
        return None;
    }

    Some(GpuInfo {
        name: parts[0].to_string(),
        vram_total_mb: parts[1].parse().ok()?,
        // Older drivers don't know the compute_cap field and print "[N/A]".
        compute_capability: parts.get(2).and_then(|cc| cc.parse().ok()),
        device_count: lines.len(),
    })
}
