//! Attention parameter descriptors
//!
//! [`FlashFwdParams`] and [`FlashBwdParams`] are plain records built by the
//! calling framework before each call. Shape fields are signed, exactly as
//! frameworks hand them over; [`FlashFwdParams::validate`] turns a descriptor
//! into a checked [`FwdProblem`] (unsigned extents, verified strides and
//! buffer sizes) or rejects it with `InvalidParameters`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::backend::{DataType, HipBuffer};
use crate::error::{FlashError, FlashResult};
use crate::invalid_params;

/// Logical attention problem shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttentionShape {
    pub batch_size: i64,
    pub num_heads: i64,
    /// K/V heads; `num_heads` for MHA, fewer for MQA/GQA
    pub num_heads_k: i64,
    pub seqlen_q: i64,
    pub seqlen_k: i64,
    pub head_dim: i64,
}

impl AttentionShape {
    pub fn new(batch_size: i64, num_heads: i64, seqlen_q: i64, seqlen_k: i64, head_dim: i64) -> Self {
        AttentionShape {
            batch_size,
            num_heads,
            num_heads_k: num_heads,
            seqlen_q,
            seqlen_k,
            head_dim,
        }
    }

    pub fn with_num_heads_k(mut self, num_heads_k: i64) -> Self {
        self.num_heads_k = num_heads_k;
        self
    }

    /// Elements of a dense Q (or O, dO) tensor
    pub fn q_numel(&self) -> usize {
        dense_numel(&[self.batch_size, self.num_heads, self.seqlen_q, self.head_dim])
    }

    /// Elements of a dense K (or V) tensor
    pub fn k_numel(&self) -> usize {
        dense_numel(&[self.batch_size, self.num_heads_k, self.seqlen_k, self.head_dim])
    }

    /// f32 elements of the saved statistics buffer (max plane + sum plane)
    pub fn stats_numel(&self) -> usize {
        2 * dense_numel(&[self.batch_size, self.num_heads, self.seqlen_q])
    }
}

fn dense_numel(dims: &[i64]) -> usize {
    dims.iter()
        .map(|&d| usize::try_from(d).unwrap_or(0))
        .product()
}

/// Element strides of a `[batch, head, seq, head_dim]` tensor.
/// The head-dim stride is always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorStrides {
    pub batch: i64,
    pub head: i64,
    pub seq: i64,
}

impl TensorStrides {
    pub fn new(batch: i64, head: i64, seq: i64) -> Self {
        TensorStrides { batch, head, seq }
    }

    /// Contiguous `[b, h, s, d]`
    pub fn bhsd(num_heads: i64, seqlen: i64, head_dim: i64) -> Self {
        TensorStrides {
            batch: num_heads * seqlen * head_dim,
            head: seqlen * head_dim,
            seq: head_dim,
        }
    }

    /// Contiguous `[b, s, h, d]`
    pub fn bshd(num_heads: i64, seqlen: i64, head_dim: i64) -> Self {
        TensorStrides {
            batch: seqlen * num_heads * head_dim,
            head: head_dim,
            seq: num_heads * head_dim,
        }
    }
}

/// Dense memory layouts the descriptor constructors understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
    #[default]
    Bhsd,
    Bshd,
}

impl TensorLayout {
    pub fn strides(&self, num_heads: i64, seqlen: i64, head_dim: i64) -> TensorStrides {
        match self {
            TensorLayout::Bhsd => TensorStrides::bhsd(num_heads, seqlen, head_dim),
            TensorLayout::Bshd => TensorStrides::bshd(num_heads, seqlen, head_dim),
        }
    }
}

/// Forward descriptor
#[derive(Debug, Clone)]
pub struct FlashFwdParams {
    pub batch_size: i64,
    pub num_heads: i64,
    pub num_heads_k: i64,
    pub seqlen_q: i64,
    pub seqlen_k: i64,
    pub head_dim: i64,
    pub dtype: DataType,

    pub q: HipBuffer,
    pub k: HipBuffer,
    pub v: HipBuffer,
    pub out: HipBuffer,
    /// Two f32 planes of `batch * num_heads * seqlen_q`: row max, then row sum
    pub softmax_stats: HipBuffer,

    pub q_strides: TensorStrides,
    pub k_strides: TensorStrides,
    pub v_strides: TensorStrides,
    pub out_strides: TensorStrides,

    pub softmax_scale: f32,
    pub is_causal: bool,
    pub dropout_p: f32,
    pub philox_seed: u64,
    pub philox_offset: u64,
}

impl FlashFwdParams {
    /// Descriptor over dense BHSD tensors, no mask, no dropout and the
    /// conventional `1/sqrt(head_dim)` scale
    pub fn new(
        shape: AttentionShape,
        dtype: DataType,
        q: HipBuffer,
        k: HipBuffer,
        v: HipBuffer,
        out: HipBuffer,
        softmax_stats: HipBuffer,
    ) -> Self {
        let softmax_scale = if shape.head_dim > 0 {
            1.0 / (shape.head_dim as f32).sqrt()
        } else {
            1.0
        };
        let mut params = FlashFwdParams {
            batch_size: shape.batch_size,
            num_heads: shape.num_heads,
            num_heads_k: shape.num_heads_k,
            seqlen_q: shape.seqlen_q,
            seqlen_k: shape.seqlen_k,
            head_dim: shape.head_dim,
            dtype,
            q,
            k,
            v,
            out,
            softmax_stats,
            q_strides: TensorStrides::new(0, 0, 0),
            k_strides: TensorStrides::new(0, 0, 0),
            v_strides: TensorStrides::new(0, 0, 0),
            out_strides: TensorStrides::new(0, 0, 0),
            softmax_scale,
            is_causal: false,
            dropout_p: 0.0,
            philox_seed: 0,
            philox_offset: 0,
        };
        params.set_layout(TensorLayout::Bhsd);
        params
    }

    /// Dense strides of `layout` for all four tensors
    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.set_layout(layout);
        self
    }

    fn set_layout(&mut self, layout: TensorLayout) {
        self.q_strides = layout.strides(self.num_heads, self.seqlen_q, self.head_dim);
        self.out_strides = self.q_strides;
        self.k_strides = layout.strides(self.num_heads_k, self.seqlen_k, self.head_dim);
        self.v_strides = self.k_strides;
    }

    pub fn with_q_strides(mut self, strides: TensorStrides) -> Self {
        self.q_strides = strides;
        self
    }

    pub fn with_k_strides(mut self, strides: TensorStrides) -> Self {
        self.k_strides = strides;
        self
    }

    pub fn with_v_strides(mut self, strides: TensorStrides) -> Self {
        self.v_strides = strides;
        self
    }

    pub fn with_out_strides(mut self, strides: TensorStrides) -> Self {
        self.out_strides = strides;
        self
    }

    pub fn with_softmax_scale(mut self, softmax_scale: f32) -> Self {
        self.softmax_scale = softmax_scale;
        self
    }

    pub fn with_causal(mut self, is_causal: bool) -> Self {
        self.is_causal = is_causal;
        self
    }

    pub fn with_dropout(mut self, dropout_p: f32, philox_seed: u64, philox_offset: u64) -> Self {
        self.dropout_p = dropout_p;
        self.philox_seed = philox_seed;
        self.philox_offset = philox_offset;
        self
    }

    pub fn shape(&self) -> AttentionShape {
        AttentionShape {
            batch_size: self.batch_size,
            num_heads: self.num_heads,
            num_heads_k: self.num_heads_k,
            seqlen_q: self.seqlen_q,
            seqlen_k: self.seqlen_k,
            head_dim: self.head_dim,
        }
    }

    /// Identity of the computation this descriptor describes. Written onto
    /// the stats buffer by the forward engine and checked on backward entry.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.shape().hash(&mut hasher);
        self.dtype.hash(&mut hasher);
        self.q_strides.hash(&mut hasher);
        self.k_strides.hash(&mut hasher);
        self.v_strides.hash(&mut hasher);
        self.out_strides.hash(&mut hasher);
        self.softmax_scale.to_bits().hash(&mut hasher);
        self.is_causal.hash(&mut hasher);
        self.dropout_p.to_bits().hash(&mut hasher);
        self.philox_seed.hash(&mut hasher);
        self.philox_offset.hash(&mut hasher);
        for buffer in [&self.q, &self.k, &self.v, &self.out] {
            buffer.id().hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Check every field and produce the problem the kernels execute
    pub fn validate(&self) -> FlashResult<FwdProblem> {
        let batch_size = positive("batch_size", self.batch_size)?;
        let num_heads = positive("num_heads", self.num_heads)?;
        let num_heads_k = positive("num_heads_k", self.num_heads_k)?;
        let seqlen_q = positive("seqlen_q", self.seqlen_q)?;
        let seqlen_k = positive("seqlen_k", self.seqlen_k)?;
        let head_dim = positive("head_dim", self.head_dim)?;

        if num_heads % num_heads_k != 0 {
            return Err(invalid_params!(
                "num_heads ({}) must be a multiple of num_heads_k ({})",
                num_heads,
                num_heads_k
            ));
        }
        if !self.softmax_scale.is_finite() || self.softmax_scale <= 0.0 {
            return Err(invalid_params!(
                "softmax_scale must be finite and positive, got {}",
                self.softmax_scale
            ));
        }
        if !self.dropout_p.is_finite() || !(0.0..1.0).contains(&self.dropout_p) {
            return Err(invalid_params!(
                "dropout_p must lie in [0, 1), got {}",
                self.dropout_p
            ));
        }

        let q_dims = [batch_size, num_heads, seqlen_q, head_dim];
        let k_dims = [batch_size, num_heads_k, seqlen_k, head_dim];
        let q_layout = tensor_layout("q", q_dims, self.q_strides, &self.q, self.dtype)?;
        let k_layout = tensor_layout("k", k_dims, self.k_strides, &self.k, self.dtype)?;
        let v_layout = tensor_layout("v", k_dims, self.v_strides, &self.v, self.dtype)?;
        let out_layout = tensor_layout("out", q_dims, self.out_strides, &self.out, self.dtype)?;

        let rows = checked_product("softmax_stats", &[batch_size, num_heads, seqlen_q])?;
        let stats_len = rows
            .checked_mul(2)
            .ok_or_else(|| invalid_params!("softmax_stats size overflows"))?;
        if self.softmax_stats.dtype() != DataType::F32 {
            return Err(invalid_params!(
                "softmax_stats must be fp32, got {}",
                self.softmax_stats.dtype()
            ));
        }
        if self.softmax_stats.len() < stats_len {
            return Err(invalid_params!(
                "softmax_stats holds {} elements, {} required",
                self.softmax_stats.len(),
                stats_len
            ));
        }

        check_disjoint(&[
            ("q", &self.q),
            ("k", &self.k),
            ("v", &self.v),
            ("out", &self.out),
            ("softmax_stats", &self.softmax_stats),
        ])?;

        Ok(FwdProblem {
            batch_size,
            num_heads,
            num_heads_k,
            seqlen_q,
            seqlen_k,
            head_dim,
            dtype: self.dtype,
            q_layout,
            k_layout,
            v_layout,
            out_layout,
            softmax_scale: self.softmax_scale,
            is_causal: self.is_causal,
            dropout_p: self.dropout_p,
            philox_seed: self.philox_seed,
            philox_offset: self.philox_offset,
            _validated: (),
        })
    }
}

/// Backward descriptor: the forward descriptor of the call being
/// differentiated plus the gradient buffers
#[derive(Debug, Clone)]
pub struct FlashBwdParams {
    /// Exactly the descriptor used for the forward call. Its `out` is the
    /// forward output and its `softmax_stats` the saved statistics.
    pub fwd: FlashFwdParams,

    pub dout: HipBuffer,
    pub dq: HipBuffer,
    pub dk: HipBuffer,
    pub dv: HipBuffer,

    pub dout_strides: TensorStrides,
    pub dq_strides: TensorStrides,
    pub dk_strides: TensorStrides,
    pub dv_strides: TensorStrides,
}

impl FlashBwdParams {
    /// Gradient tensors laid out like their forward counterparts
    pub fn new(
        fwd: FlashFwdParams,
        dout: HipBuffer,
        dq: HipBuffer,
        dk: HipBuffer,
        dv: HipBuffer,
    ) -> Self {
        FlashBwdParams {
            dout_strides: fwd.out_strides,
            dq_strides: fwd.q_strides,
            dk_strides: fwd.k_strides,
            dv_strides: fwd.v_strides,
            fwd,
            dout,
            dq,
            dk,
            dv,
        }
    }

    /// Dense strides of `layout` for the four gradient tensors
    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        let f = &self.fwd;
        self.dq_strides = layout.strides(f.num_heads, f.seqlen_q, f.head_dim);
        self.dout_strides = self.dq_strides;
        self.dk_strides = layout.strides(f.num_heads_k, f.seqlen_k, f.head_dim);
        self.dv_strides = self.dk_strides;
        self
    }

    pub fn validate(&self) -> FlashResult<BwdProblem> {
        let fwd = self.fwd.validate()?;

        let q_dims = [fwd.batch_size, fwd.num_heads, fwd.seqlen_q, fwd.head_dim];
        let k_dims = [fwd.batch_size, fwd.num_heads_k, fwd.seqlen_k, fwd.head_dim];
        let dtype = fwd.dtype;
        let dout_layout = tensor_layout("dout", q_dims, self.dout_strides, &self.dout, dtype)?;
        let dq_layout = tensor_layout("dq", q_dims, self.dq_strides, &self.dq, dtype)?;
        let dk_layout = tensor_layout("dk", k_dims, self.dk_strides, &self.dk, dtype)?;
        let dv_layout = tensor_layout("dv", k_dims, self.dv_strides, &self.dv, dtype)?;

        // Gradient outputs must not alias anything else the kernel touches
        let f = &self.fwd;
        check_disjoint(&[
            ("dq", &self.dq),
            ("dk", &self.dk),
            ("dv", &self.dv),
            ("q", &f.q),
            ("k", &f.k),
            ("v", &f.v),
            ("out", &f.out),
            ("softmax_stats", &f.softmax_stats),
        ])?;
        for (name, buffer) in [("dq", &self.dq), ("dk", &self.dk), ("dv", &self.dv)] {
            if buffer.same_allocation(&self.dout) {
                return Err(invalid_params!("{} aliases dout", name));
            }
        }

        match f.softmax_stats.tag()? {
            Some(tag) if tag != f.fingerprint() => {
                return Err(invalid_params!(
                    "softmax_stats buffer {} was produced by a different forward descriptor",
                    f.softmax_stats.id()
                ));
            }
            Some(_) => {}
            None => tracing::debug!(
                "FlashBwdParams::validate: softmax_stats buffer {} carries no forward fingerprint",
                f.softmax_stats.id()
            ),
        }

        Ok(BwdProblem {
            fwd,
            dout_layout,
            dq_layout,
            dk_layout,
            dv_layout,
            _validated: (),
        })
    }
}

/// Validated strides of one tensor (head-dim stride 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridedLayout {
    pub batch: usize,
    pub head: usize,
    pub seq: usize,
}

impl StridedLayout {
    /// Element offset of `(b, h, s, 0)`
    #[inline]
    pub fn offset(&self, b: usize, h: usize, s: usize) -> usize {
        b * self.batch + h * self.head + s * self.seq
    }
}

/// A forward problem whose descriptor passed validation
#[derive(Debug, Clone)]
pub struct FwdProblem {
    pub batch_size: usize,
    pub num_heads: usize,
    pub num_heads_k: usize,
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub head_dim: usize,
    pub dtype: DataType,
    pub q_layout: StridedLayout,
    pub k_layout: StridedLayout,
    pub v_layout: StridedLayout,
    pub out_layout: StridedLayout,
    pub softmax_scale: f32,
    pub is_causal: bool,
    pub dropout_p: f32,
    pub philox_seed: u64,
    pub philox_offset: u64,
    _validated: (),
}

impl FwdProblem {
    /// Query heads sharing one K/V head
    pub fn head_group(&self) -> usize {
        self.num_heads / self.num_heads_k
    }

    /// K/V head read by query head `h`
    #[inline]
    pub fn kv_head(&self, h: usize) -> usize {
        h / self.head_group()
    }

    /// Rows of each statistics plane
    pub fn stats_rows(&self) -> usize {
        self.batch_size * self.num_heads * self.seqlen_q
    }

    /// Index of `(b, h, i)` within a statistics plane
    #[inline]
    pub fn stats_row(&self, b: usize, h: usize, i: usize) -> usize {
        (b * self.num_heads + h) * self.seqlen_q + i
    }

    /// Last key visible to query `i`, exclusive
    #[inline]
    pub fn key_limit(&self, i: usize) -> usize {
        if self.is_causal {
            (i + 1).min(self.seqlen_k)
        } else {
            self.seqlen_k
        }
    }
}

/// A backward problem whose descriptor passed validation
#[derive(Debug, Clone)]
pub struct BwdProblem {
    pub fwd: FwdProblem,
    pub dout_layout: StridedLayout,
    pub dq_layout: StridedLayout,
    pub dk_layout: StridedLayout,
    pub dv_layout: StridedLayout,
    _validated: (),
}

fn positive(name: &str, value: i64) -> FlashResult<usize> {
    if value <= 0 {
        return Err(invalid_params!("{} must be positive, got {}", name, value));
    }
    usize::try_from(value).map_err(|_| invalid_params!("{} = {} does not fit in usize", name, value))
}

fn checked_product(name: &str, dims: &[usize]) -> FlashResult<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| invalid_params!("{} extent overflows", name))
}

/// Validate one tensor's strides against its dims and buffer.
///
/// Dimensions of size 1 never step, so their stride is unconstrained beyond
/// being positive. The others, sorted by stride, must each start past the
/// furthest element reachable through the smaller ones.
fn tensor_layout(
    name: &str,
    dims: [usize; 4],
    strides: TensorStrides,
    buffer: &HipBuffer,
    dtype: DataType,
) -> FlashResult<StridedLayout> {
    let raw = [strides.batch, strides.head, strides.seq];
    let mut layout = [0usize; 3];
    for (slot, (axis, &stride)) in layout
        .iter_mut()
        .zip(["batch", "head", "seq"].iter().zip(raw.iter()))
    {
        if stride <= 0 {
            return Err(invalid_params!(
                "{} {} stride must be positive, got {}",
                name,
                axis,
                stride
            ));
        }
        *slot = usize::try_from(stride)
            .map_err(|_| invalid_params!("{} {} stride {} does not fit in usize", name, axis, stride))?;
    }

    let mut axes: Vec<(usize, usize)> = vec![
        (dims[0], layout[0]),
        (dims[1], layout[1]),
        (dims[2], layout[2]),
        (dims[3], 1),
    ];
    axes.retain(|&(size, _)| size > 1);
    axes.sort_by_key(|&(_, stride)| stride);

    let overflow = || invalid_params!("{} extent overflows", name);
    let mut max_offset = 0usize;
    for &(size, stride) in &axes {
        if stride <= max_offset {
            return Err(invalid_params!(
                "{} strides {:?} overlap for dims {:?}",
                name,
                raw,
                dims
            ));
        }
        let reach = stride.checked_mul(size - 1).ok_or_else(overflow)?;
        max_offset = max_offset.checked_add(reach).ok_or_else(overflow)?;
    }
    let required = max_offset.checked_add(1).ok_or_else(overflow)?;

    if buffer.dtype() != dtype {
        return Err(invalid_params!(
            "{} buffer is {}, descriptor dtype is {}",
            name,
            buffer.dtype(),
            dtype
        ));
    }
    if buffer.len() < required {
        return Err(invalid_params!(
            "{} buffer holds {} elements, layout needs {}",
            name,
            buffer.len(),
            required
        ));
    }

    Ok(StridedLayout {
        batch: layout[0],
        head: layout[1],
        seq: layout[2],
    })
}

/// Reject two named buffers sharing an allocation unless both are
/// read-only attention inputs
fn check_disjoint(buffers: &[(&str, &HipBuffer)]) -> FlashResult<()> {
    for (i, (name_a, a)) in buffers.iter().enumerate() {
        for (name_b, b) in &buffers[i + 1..] {
            if a.same_allocation(b) && !(is_input(name_a) && is_input(name_b)) {
                return Err(FlashError::InvalidParameters(format!(
                    "{} and {} share buffer {}",
                    name_a,
                    name_b,
                    a.id()
                )));
            }
        }
    }
    Ok(())
}

fn is_input(name: &str) -> bool {
    matches!(name, "q" | "k" | "v")
}
