//! Compiled kernel table and variant selection
//!
//! The table lists every kernel instance built for this crate, keyed by
//! direction, hardware class, dtype, head dimension and mask mode. It is
//! generated once from the offload arch list fixed at build time and never
//! mutated afterwards. Engines take an arch-filtered copy and select from it.

use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::backend::{DataType, GfxArch};
use crate::error::{FlashError, FlashResult};

/// Offload archs baked in by build.rs
const COMPILED_ARCHS: &str = env!("ROCFLASH_COMPILED_ARCHS");

/// Head dims with dedicated instances
const EXACT_HEAD_DIMS: [usize; 3] = [32, 64, 128];

/// Largest head dim the generic instances handle (register budget)
pub const MAX_GENERIC_HEAD_DIM: usize = 128;

/// Generic instances pad the head dim to this granularity
pub const GENERIC_HEAD_DIM_MULTIPLE: usize = 8;

static COMPILED_TABLE: Lazy<KernelTable> = Lazy::new(|| {
    let archs = KernelTable::compiled_archs();
    let table = KernelTable::generate(&archs);
    tracing::debug!(
        "KernelTable: {} variants for archs {:?}",
        table.len(),
        archs
    );
    table
});

/// Pass a kernel implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Fwd,
    Bwd,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Fwd => "fwd",
            Direction::Bwd => "bwd",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fwd" | "forward" => Ok(Direction::Fwd),
            "bwd" | "backward" => Ok(Direction::Bwd),
            _ => Err(FlashError::InvalidConfiguration(format!(
                "unknown direction {:?}",
                s
            ))),
        }
    }
}

/// Head dims a variant accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadDimSupport {
    Exact(usize),
    UpTo { max: usize, multiple_of: usize },
}

impl HeadDimSupport {
    pub fn covers(&self, head_dim: usize) -> bool {
        match *self {
            HeadDimSupport::Exact(d) => d == head_dim,
            HeadDimSupport::UpTo { max, multiple_of } => {
                head_dim > 0 && head_dim <= max && head_dim % multiple_of == 0
            }
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, HeadDimSupport::Exact(_))
    }
}

/// Tiling parameters of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelTraits {
    /// Query rows per tile
    pub block_m: usize,
    /// Key rows per tile
    pub block_n: usize,
    /// Tiles run concurrently and rescales are skipped when the running
    /// max is unchanged. Unfused variants run tiles in order and always
    /// rescale.
    pub fused: bool,
}

/// One compiled kernel instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelVariant {
    pub name: String,
    pub direction: Direction,
    pub arch: GfxArch,
    pub dtype: DataType,
    pub head_dim: HeadDimSupport,
    pub is_causal: bool,
    pub traits: KernelTraits,
}

/// Lookup key for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub direction: Direction,
    pub arch: GfxArch,
    pub dtype: DataType,
    pub head_dim: usize,
    pub is_causal: bool,
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} head_dim={} dtype={} causal={} arch={}",
            self.direction, self.head_dim, self.dtype, self.is_causal, self.arch
        )
    }
}

/// Read-only registry of compiled variants
#[derive(Debug, Clone, Default)]
pub struct KernelTable {
    variants: Vec<KernelVariant>,
}

impl KernelTable {
    /// The table built for this binary
    pub fn compiled() -> &'static KernelTable {
        &COMPILED_TABLE
    }

    /// Archs the crate was built for
    pub fn compiled_archs() -> Vec<GfxArch> {
        COMPILED_ARCHS
            .split(';')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// Instances for `archs`
    pub fn generate(archs: &[GfxArch]) -> Self {
        let mut variants = Vec::new();
        for &arch in archs {
            for direction in [Direction::Fwd, Direction::Bwd] {
                for is_causal in [false, true] {
                    for dtype in [DataType::F16, DataType::Bf16] {
                        for head_dim in EXACT_HEAD_DIMS {
                            let support = HeadDimSupport::Exact(head_dim);
                            for fused in [true, false] {
                                variants.push(variant(direction, arch, dtype, support, is_causal, fused));
                            }
                        }
                        let generic = HeadDimSupport::UpTo {
                            max: MAX_GENERIC_HEAD_DIM,
                            multiple_of: GENERIC_HEAD_DIM_MULTIPLE,
                        };
                        for fused in [true, false] {
                            variants.push(variant(direction, arch, dtype, generic, is_causal, fused));
                        }
                    }
                    // fp32 is a reference path: generic and unfused only
                    let generic = HeadDimSupport::UpTo {
                        max: MAX_GENERIC_HEAD_DIM,
                        multiple_of: GENERIC_HEAD_DIM_MULTIPLE,
                    };
                    variants.push(variant(direction, arch, DataType::F32, generic, is_causal, false));
                }
            }
        }
        KernelTable { variants }
    }

    pub fn variants(&self) -> &[KernelVariant] {
        &self.variants
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Copy of the variants matching `keep`
    pub fn filter<F>(&self, keep: F) -> KernelTable
    where
        F: Fn(&KernelVariant) -> bool,
    {
        KernelTable {
            variants: self.variants.iter().filter(|v| keep(v)).cloned().collect(),
        }
    }

    /// Copy restricted to one direction on one hardware class
    pub fn for_engine(&self, direction: Direction, arch: GfxArch) -> KernelTable {
        self.filter(|v| v.direction == direction && v.arch == arch)
    }

    /// Most specific variant for `key`.
    ///
    /// Exact head-dim instances beat generic ones. Among equally specific
    /// candidates the unfused one wins when `prefer_unfused`, the fused one
    /// otherwise.
    pub fn select(&self, key: &KernelKey, prefer_unfused: bool) -> FlashResult<&KernelVariant> {
        self.variants
            .iter()
            .filter(|v| {
                v.direction == key.direction
                    && v.arch == key.arch
                    && v.dtype == key.dtype
                    && v.is_causal == key.is_causal
                    && v.head_dim.covers(key.head_dim)
            })
            .min_by_key(|v| (!v.head_dim.is_exact(), v.traits.fused == prefer_unfused))
            .ok_or_else(|| {
                FlashError::UnsupportedConfiguration(format!("no compiled kernel for {}", key))
            })
    }
}

fn variant(
    direction: Direction,
    arch: GfxArch,
    dtype: DataType,
    head_dim: HeadDimSupport,
    is_causal: bool,
    fused: bool,
) -> KernelVariant {
    let (block_m, block_n) = match (direction, head_dim) {
        (Direction::Fwd, HeadDimSupport::Exact(d)) if d <= 64 => (128, 64),
        (Direction::Fwd, HeadDimSupport::Exact(_)) => (128, 32),
        (Direction::Fwd, HeadDimSupport::UpTo { .. }) => (64, 32),
        (Direction::Bwd, HeadDimSupport::Exact(d)) if d <= 64 => (64, 64),
        (Direction::Bwd, HeadDimSupport::Exact(_)) => (64, 32),
        (Direction::Bwd, HeadDimSupport::UpTo { .. }) => (32, 32),
    };
    let hdim = match head_dim {
        HeadDimSupport::Exact(d) => format!("hdim{}", d),
        HeadDimSupport::UpTo { max, .. } => format!("hdim{}x", max),
    };
    let name = format!(
        "flash_{}_{}_{}_{}{}_{}",
        direction,
        hdim,
        dtype,
        if is_causal { "causal" } else { "nocausal" },
        if fused { "" } else { "_unfused" },
        arch
    );
    KernelVariant {
        name,
        direction,
        arch,
        dtype,
        head_dim,
        is_causal,
        traits: KernelTraits {
            block_m,
            block_n,
            fused,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(direction: Direction, dtype: DataType, head_dim: usize, is_causal: bool) -> KernelKey {
        KernelKey {
            direction,
            arch: GfxArch::Gfx90a,
            dtype,
            head_dim,
            is_causal,
        }
    }

    fn table() -> KernelTable {
        KernelTable::generate(&[GfxArch::Gfx90a, GfxArch::Gfx942])
    }

    #[test]
    fn test_compiled_archs_default() {
        let archs = KernelTable::compiled_archs();
        assert!(!archs.is_empty());
        assert!(KernelTable::compiled().len() > 0);
    }

    #[test]
    fn test_exact_beats_generic() {
        let table = table();
        let v = table
            .select(&key(Direction::Fwd, DataType::F16, 64, true), false)
            .unwrap();
        assert_eq!(v.name, "flash_fwd_hdim64_fp16_causal_gfx90a");
        assert!(v.traits.fused);

        let v = table
            .select(&key(Direction::Fwd, DataType::F16, 96, true), false)
            .unwrap();
        assert_eq!(v.head_dim, HeadDimSupport::UpTo { max: 128, multiple_of: 8 });
    }

    #[test]
    fn test_unit_test_mode_prefers_unfused() {
        let table = table();
        let v = table
            .select(&key(Direction::Bwd, DataType::Bf16, 128, false), true)
            .unwrap();
        assert_eq!(v.name, "flash_bwd_hdim128_bf16_nocausal_unfused_gfx90a");
        assert!(!v.traits.fused);
        assert!(v.head_dim.is_exact());
    }

    #[test]
    fn test_fp32_only_generic_unfused() {
        let table = table();
        let v = table
            .select(&key(Direction::Fwd, DataType::F32, 64, false), false)
            .unwrap();
        assert!(!v.traits.fused);
        assert!(!v.head_dim.is_exact());
    }

    #[test]
    fn test_unsupported_head_dims() {
        let table = table();
        for head_dim in [160, 256, 12] {
            for direction in [Direction::Fwd, Direction::Bwd] {
                let err = table
                    .select(&key(direction, DataType::F16, head_dim, false), false)
                    .unwrap_err();
                assert!(matches!(err, FlashError::UnsupportedConfiguration(_)));
            }
        }
    }

    #[test]
    fn test_unsupported_arch() {
        let table = table();
        let mut k = key(Direction::Fwd, DataType::F16, 64, false);
        k.arch = GfxArch::Gfx1100;
        assert!(table.select(&k, false).is_err());
    }

    #[test]
    fn test_for_engine_filters() {
        let fwd = table().for_engine(Direction::Fwd, GfxArch::Gfx942);
        assert!(!fwd.is_empty());
        assert!(fwd
            .variants()
            .iter()
            .all(|v| v.direction == Direction::Fwd && v.arch == GfxArch::Gfx942));
        // 2 masks x (2 dtypes x 4 head-dim classes x 2 fusions + 1 fp32)
        assert_eq!(fwd.len(), 2 * (2 * 4 * 2 + 1));
    }

    #[test]
    fn test_variant_serializes() {
        let table = table();
        let json = serde_json::to_value(&table.variants()[0]).unwrap();
        assert_eq!(json["direction"], "fwd");
        assert_eq!(json["arch"], "gfx90a");
        assert_eq!(json["dtype"], "fp16");
    }
}
