//! Execution engine of the dynamically quantized attention.
//!
//! An execution runs in three stages:
//!
//! 1. every `(batch, head)` pair packs its key in the `AB16a4b` layout and
//!    requantizes its value per column in the `BA16b4a` layout,
//! 2. every tile of 16 query rows computes `softmax(QK^T * scales + mask)` for all
//!    the heads of its batch into the scratch region of the running thread,
//! 3. the same tile multiplies the probabilities with the packed values and
//!    writes the int8 output together with one scale per row.
//!
//! Stages 2 and 3 run back to back on the same worker so the probabilities never
//! leave the thread scratch. The tiles of all the batches form one index space
//! cut into at most one share per thread, each share configures the tiles of its
//! thread once.
//!
//! The scratch region of a thread holds the u8 probabilities of a tile followed
//! by the row buffers of the two fused matmuls.
use std::marker::PhantomData;
use std::sync::Arc;

use candle_dq_kernels::{
    ComputePrimitive, MmDynamicQuantArgs, MmDynamicQuantBatch, MmDynamicQuantParam,
    MmSoftmaxArgs, MmSoftmaxBatch, MmSoftmaxParam, PackKey, PackKeyArgs, PackKeyParam,
    PackValueQuant, PackValueQuantArgs, TileConfig, TileConfigure, TileParam, TileScope,
    TILE_ROWS,
};
use rayon::prelude::*;

use crate::kernel_desc::{KernelDesc, ProblemDims};
use crate::runtime::MhaArgs;
use crate::utils::pad_to;
use crate::workspace::{ProblemShape, WorkspaceLayout, WorkspaceRegions};
use crate::Result;

/// Bias of the padded key positions, large enough for their softmax weight to
/// vanish.
pub const MASK_PADDING: f32 = -1000.;

pub struct DynamicQuantMha {
    kd: Arc<KernelDesc>,
    dims: ProblemDims,
    pool: rayon::ThreadPool,
    tile_cfg: TileConfig,
    tile: TileConfigure,
    pack_key: PackKey,
    pack_value: PackValueQuant,
    qk_softmax: MmSoftmaxBatch,
    av_quant: MmDynamicQuantBatch,
    span: tracing::Span,
    span_pack: tracing::Span,
    span_attn: tracing::Span,
}

impl std::fmt::Debug for DynamicQuantMha {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicQuantMha")
            .field("dims", &self.dims)
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

impl DynamicQuantMha {
    /// Builds the primitives and the worker pool for a descriptor. The
    /// descriptor is checked again, building fails on the first unmet
    /// requirement.
    pub fn new(kd: Arc<KernelDesc>) -> Result<Self> {
        let dims = kd.check()?;
        let tile_cfg = TileConfig::new(TileParam::FULL_INT8)?;
        let tile = TileConfigure::build(())?;
        let pack_key = PackKey::build(PackKeyParam { pad_n: 64 })?;
        let pack_value = PackValueQuant::build(())?;
        let qk_softmax = MmSoftmaxBatch::build(MmSoftmaxParam {
            pre_tile: Some(TileParam::FULL_INT8),
        })?;
        let av_quant = MmDynamicQuantBatch::build(MmDynamicQuantParam {
            pre_tile: Some(TileParam::FULL_INT8),
        })?;
        let num_threads = kd.config().num_threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("dq-mha-{i}"))
            .build()?;
        tracing::debug!(
            ?dims,
            num_threads,
            primitives = ?[
                TileConfigure::NAME,
                PackKey::NAME,
                PackValueQuant::NAME,
                MmSoftmaxBatch::NAME,
                MmDynamicQuantBatch::NAME,
            ],
            "built dynamic quant mha"
        );
        Ok(Self {
            kd,
            dims,
            pool,
            tile_cfg,
            tile,
            pack_key,
            pack_value,
            qk_softmax,
            av_quant,
            span: tracing::span!(tracing::Level::TRACE, "dq-mha"),
            span_pack: tracing::span!(tracing::Level::TRACE, "dq-mha-pack"),
            span_attn: tracing::span!(tracing::Level::TRACE, "dq-mha-attn"),
        })
    }

    pub fn kernel_desc(&self) -> &KernelDesc {
        &self.kd
    }

    pub fn problem_dims(&self) -> ProblemDims {
        self.dims
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Workspace bytes needed to run `shape` with this engine.
    pub fn workspace_size(&self, shape: &ProblemShape) -> usize {
        crate::workspace::workspace_size(shape, self.num_threads())
    }

    /// Workspace bytes when all the dimensions are static.
    pub fn static_workspace_size(&self) -> Option<usize> {
        self.dims.as_static().map(|s| self.workspace_size(&s))
    }

    /// Runs the attention. Errors are only returned for buffers or dynamic sizes
    /// that do not match the descriptor, in which case nothing has been written.
    pub fn execute(&self, args: MhaArgs<'_>) -> Result<()> {
        let _enter = self.span.enter();
        let shape = self.dims.resolve(&args.sizes)?;
        let layout = WorkspaceLayout::new(&shape, self.num_threads());
        args.check(&shape, &layout)?;
        let MhaArgs {
            query,
            key,
            value,
            mask,
            query_scale,
            key_scale,
            value_scale,
            output,
            output_scale,
            workspace,
            sizes: _,
        } = args;
        let WorkspaceRegions {
            mask: ws_mask,
            key: ws_key,
            value: ws_value,
            value_scale: ws_value_scale,
            threads,
        } = layout.split(workspace)?;
        tracing::trace!(?shape, workspace = layout.size_in_bytes(), "execute");

        self.pool.install(|| {
            {
                let _enter = self.span_pack.enter();
                self.pack_key_value(
                    &shape,
                    &layout,
                    KeyValue {
                        key,
                        value,
                        value_scale,
                    },
                    PackedKeyValue {
                        key: &mut *ws_key,
                        value: &mut *ws_value,
                        value_scale: &mut *ws_value_scale,
                    },
                );
            }
            let mask = pad_mask(&shape, layout.mask_stride, mask, ws_mask);
            let _enter = self.span_attn.enter();
            self.attention(
                &shape,
                &layout,
                AttnInputs {
                    query,
                    query_scale,
                    key_scale,
                    mask,
                    key: ws_key,
                    value: ws_value,
                    value_scale: ws_value_scale,
                },
                &mut output[..shape.query_elem_count()],
                &mut output_scale[..shape.batch_size * shape.m],
                ThreadScratch::new(threads, layout.thread_size / 4),
            )
        });
        Ok(())
    }

    fn pack_key_value(
        &self,
        shape: &ProblemShape,
        layout: &WorkspaceLayout,
        src: KeyValue<'_>,
        dst: PackedKeyValue<'_>,
    ) {
        let &ProblemShape {
            head_num,
            n,
            head_size,
            ..
        } = shape;
        let ld_src = head_num * head_size;
        let n_pad64 = pad_to(n, 64);
        let d_pad64 = pad_to(head_size, 64);
        let v_block = TILE_ROWS * n_pad64;
        let v_block_written = TILE_ROWS * pad_to(n, 4);

        // SAFETY: `par_chunks_mut` hands out non-overlapping slices, one head of
        // each packed buffer per job.
        dst.key
            .par_chunks_mut(layout.head_kv_size)
            .zip(dst.value.par_chunks_mut(layout.head_kv_size))
            .zip(dst.value_scale.par_chunks_mut(layout.head_v_scale_size))
            .enumerate()
            .for_each(|(idx, ((packed_k, packed_v), packed_vs))| {
                let (ibs, ihn) = (idx / head_num, idx % head_num);
                let head_offset = ibs * n * ld_src + ihn * head_size;

                let key = &src.key[head_offset..];
                for j in (0..n).step_by(TILE_ROWS) {
                    self.pack_key.call(PackKeyArgs {
                        src: &key[j * ld_src..],
                        dst: &mut packed_k[j * d_pad64..],
                        ld_src,
                        rows: (n - j).min(TILE_ROWS),
                        cols: head_size,
                    });
                }

                let value = &src.value[head_offset..];
                let value_scale = &src.value_scale[ibs * n..][..n];
                for j in (0..head_size).step_by(TILE_ROWS) {
                    let block = &mut packed_v[j * n_pad64..][..v_block];
                    self.pack_value.call(PackValueQuantArgs {
                        src: &value[j..],
                        dst: &mut *block,
                        src_scale: value_scale,
                        dst_scale: &mut packed_vs[j..],
                        ld_src,
                        rows: n,
                        cols: (head_size - j).min(TILE_ROWS),
                    });
                    block[v_block_written..].fill(0);
                }
            });
    }

    fn attention(
        &self,
        shape: &ProblemShape,
        layout: &WorkspaceLayout,
        src: AttnInputs<'_>,
        output: &mut [i8],
        output_scale: &mut [f32],
        scratch: ThreadScratch<'_>,
    ) {
        let &ProblemShape {
            head_num,
            m,
            n,
            head_size,
            ..
        } = shape;
        let ld_q = head_num * head_size;
        let n_pad16 = layout.mask_stride;
        let n_pad64 = pad_to(n, 64);
        let d_pad64 = pad_to(head_size, 64);
        let batch_kv = head_num * layout.head_kv_size;
        let batch_vs = head_num * layout.head_v_scale_size;
        let probs_head = TILE_ROWS * n_pad64;

        let tiles_per_batch = m.div_ceil(TILE_ROWS);
        let mut tiles = Vec::with_capacity(shape.batch_size * tiles_per_batch);
        for (out_b, scale_b) in output.chunks_mut(m * ld_q).zip(output_scale.chunks_mut(m)) {
            tiles.extend(
                out_b
                    .chunks_mut(TILE_ROWS * ld_q)
                    .zip(scale_b.chunks_mut(TILE_ROWS)),
            );
        }
        let share = tiles.len().div_ceil(self.num_threads()).max(1);
        let scratch_split = ScratchSplit {
            probs: head_num * probs_head / 4,
            softmax_acc: n_pad16,
        };

        // SAFETY: the output tiles do not overlap, the probabilities go to the
        // scratch region owned by the running thread.
        tiles
            .into_par_iter()
            .enumerate()
            .with_min_len(share)
            .for_each_init(
                || Worker::enter(self, &scratch, scratch_split),
                |worker, (idx, (out, out_scale))| {
                    let (ibs, i) = (idx / tiles_per_batch, (idx % tiles_per_batch) * TILE_ROWS);
                    let rows = out_scale.len();
                    self.qk_softmax.call(MmSoftmaxArgs {
                        src0: &src.query[(ibs * m + i) * ld_q..],
                        src1: &src.key[ibs * batch_kv..][..batch_kv],
                        scale_src0: &src.query_scale[ibs * m + i..][..rows],
                        scale_src1: &src.key_scale[ibs * n..][..n],
                        src_bias: &src.mask[ibs * n_pad16..][..n_pad16],
                        dst: &mut *worker.probs,
                        acc: &mut *worker.softmax_acc,
                        m: rows,
                        k: head_size,
                        n,
                        ld_src0: ld_q,
                        ld_src1: TILE_ROWS * d_pad64,
                        ld_dst: n_pad64,
                        batch_size: head_num,
                        batchstep_src0: head_size,
                        batchstep_src0scale: 0,
                        batchstep_src1: layout.head_kv_size,
                        batchstep_src1scale: 0,
                        batchstep_dst: probs_head,
                    });
                    self.av_quant.call(MmDynamicQuantArgs {
                        src0: &*worker.probs,
                        src1: &src.value[ibs * batch_kv..][..batch_kv],
                        scale_src1: &src.value_scale[ibs * batch_vs..][..batch_vs],
                        dst: out,
                        dst_scale: out_scale,
                        acc: &mut *worker.row_acc,
                        m: rows,
                        k: n,
                        n: head_size,
                        ld_src0: n_pad64,
                        ld_src1: TILE_ROWS * n_pad64,
                        ld_dst: ld_q,
                        batch_size: head_num,
                        batchstep_src0: probs_head,
                        batchstep_src1: layout.head_kv_size,
                        batchstep_src1scale: layout.head_v_scale_size,
                        batchstep_dst: head_size,
                    });
                },
            );
    }
}

struct KeyValue<'a> {
    key: &'a [i8],
    value: &'a [i8],
    value_scale: &'a [f32],
}

struct PackedKeyValue<'a> {
    key: &'a mut [i8],
    value: &'a mut [i8],
    value_scale: &'a mut [f32],
}

struct AttnInputs<'a> {
    query: &'a [i8],
    query_scale: &'a [f32],
    key_scale: &'a [f32],
    mask: &'a [f32],
    key: &'a [i8],
    value: &'a [i8],
    value_scale: &'a [f32],
}

/// Returns the mask with rows of `stride` entries. When `n` is already a
/// multiple of 16 the caller buffer is used as is, otherwise it is copied to the
/// workspace with the padded positions set to [`MASK_PADDING`].
fn pad_mask<'a>(
    shape: &ProblemShape,
    stride: usize,
    mask: &'a [f32],
    padded: &'a mut [f32],
) -> &'a [f32] {
    let n = shape.n;
    if n == stride {
        return &mask[..shape.batch_size * n];
    }
    for (src, dst) in mask
        .chunks_exact(n)
        .zip(padded.chunks_exact_mut(stride))
    {
        dst[..n].copy_from_slice(src);
        dst[n..].fill(MASK_PADDING);
    }
    padded
}

/// Per-thread regions of the workspace, indexed by the rayon worker index.
struct ThreadScratch<'a> {
    ptr: *mut f32,
    stride: usize,
    count: usize,
    _marker: PhantomData<&'a mut [f32]>,
}

// SAFETY: a region is only handed to the worker thread with the matching index.
unsafe impl Send for ThreadScratch<'_> {}
unsafe impl Sync for ThreadScratch<'_> {}

impl<'a> ThreadScratch<'a> {
    fn new(buf: &'a mut [f32], stride: usize) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            stride,
            count: buf.len() / stride.max(1),
            _marker: PhantomData,
        }
    }

    /// # Safety
    ///
    /// No other borrow of region `idx` can be alive.
    unsafe fn region(&self, idx: usize) -> &'a mut [f32] {
        assert!(idx < self.count, "no scratch region for thread {idx}");
        std::slice::from_raw_parts_mut(self.ptr.add(idx * self.stride), self.stride)
    }
}

/// Number of floats of a thread region going to the probabilities and to the
/// softmax row, the rest is the row buffer of the output quantization.
#[derive(Debug, Clone, Copy)]
struct ScratchSplit {
    probs: usize,
    softmax_acc: usize,
}

/// State of a worker for its share of the tiles: the tile configuration of the
/// thread and its scratch region.
struct Worker<'a> {
    probs: &'a mut [u8],
    softmax_acc: &'a mut [f32],
    row_acc: &'a mut [f32],
    _tile: TileScope<'a>,
}

impl<'a> Worker<'a> {
    fn enter(mha: &'a DynamicQuantMha, scratch: &ThreadScratch<'a>, split: ScratchSplit) -> Self {
        let idx = rayon::current_thread_index().expect("attention runs on the engine pool");
        // SAFETY: a rayon thread runs the shares it picks one after the other and
        // the worker state is dropped at the end of each share, so at most one
        // borrow of the region of this thread is alive.
        let region = unsafe { scratch.region(idx) };
        let (probs, rest) = region.split_at_mut(split.probs);
        let (softmax_acc, row_acc) = rest.split_at_mut(split.softmax_acc.min(rest.len()));
        tracing::trace!(thread = idx, "configuring tiles");
        Self {
            probs: bytemuck::cast_slice_mut(probs),
            softmax_acc,
            row_acc,
            _tile: mha.tile.scope(&mha.tile_cfg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{mha_op_desc, workspace, MhaInputs};
    use crate::KernelConfig;

    #[test]
    fn tiles_configured_once_per_share() -> Result<()> {
        // Four batches of five tiles each.
        let shape = ProblemShape::new(4, 1, 80, 20, 16);
        let inputs = MhaInputs::random(shape, 1);
        for num_threads in [1, 3] {
            let cfg = KernelConfig::default().with_num_threads(num_threads);
            let kd = KernelDesc::with_config(mha_op_desc(&shape), cfg);
            let mha = DynamicQuantMha::new(Arc::new(kd))?;
            let mut output = vec![0i8; shape.query_elem_count()];
            let mut output_scale = vec![0f32; shape.batch_size * shape.m];
            let mut ws = workspace(mha.workspace_size(&shape));
            for run in 1..=2 {
                mha.execute(inputs.args(
                    &mut output,
                    &mut output_scale,
                    bytemuck::cast_slice_mut(&mut ws),
                ))?;
                let configurations = mha.tile.configurations();
                assert!(configurations >= run, "{num_threads}: {configurations}");
                assert!(
                    configurations <= run * num_threads,
                    "{num_threads}: {configurations}"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn mask_stride_drives_padding() {
        let shape = ProblemShape::new(2, 1, 16, 20, 16);
        let layout = WorkspaceLayout::new(&shape, 1);
        let mask: Vec<f32> = (0..40).map(|v| v as f32).collect();
        let mut padded = vec![0f32; 2 * layout.mask_stride];
        let got = pad_mask(&shape, layout.mask_stride, &mask, &mut padded);
        assert_eq!(got.len(), 64);
        assert_eq!(got[..20], mask[..20]);
        assert_eq!(got[32..52], mask[20..]);
        assert!(got[20..32].iter().chain(&got[52..]).all(|&v| v == MASK_PADDING));

        let shape = ProblemShape::new(2, 1, 16, 32, 16);
        let layout = WorkspaceLayout::new(&shape, 1);
        let mask = vec![1f32; 64];
        let mut unused: [f32; 0] = [];
        let got = pad_mask(&shape, layout.mask_stride, &mask, &mut unused);
        assert_eq!(got.as_ptr(), mask.as_ptr());
    }
}
