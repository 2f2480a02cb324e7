use std::sync::Arc;

use anyhow::{bail, Result};
use candle_dq_mha::test_utils::{dequantize_output, mha_op_desc, workspace, MhaInputs};
use candle_dq_mha::{
    dequantize_per_row, quantize_per_row, DynamicQuantMha, Isa, KernelConfig, KernelDesc,
    ProblemShape,
};
use clap::Parser;
use rand::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    #[arg(long, default_value_t = 12)]
    head_num: usize,

    /// Number of query tokens.
    #[arg(long, default_value_t = 128)]
    seq_len: usize,

    /// Number of key/value tokens, defaults to the query length.
    #[arg(long)]
    kv_len: Option<usize>,

    #[arg(long, default_value_t = 64)]
    head_size: usize,

    /// Worker threads, defaults to `CANDLE_DQ_MHA_NUM_THREADS` or the cpu count.
    #[arg(long)]
    threads: Option<usize>,

    /// Refuse to run unless the host supports this isa, e.g. `amx_int8`.
    #[arg(long)]
    isa: Option<Isa>,

    #[arg(long, default_value_t = 10)]
    iters: usize,

    #[arg(long, default_value_t = 299792458)]
    seed: u64,
}

/// Gaussian-ish activations in `[-2, 2]`, quantized per token.
fn random_tokens(rng: &mut StdRng, len: usize, row_len: usize) -> Result<(Vec<i8>, Vec<f32>)> {
    let xs: Vec<f32> = (0..len)
        .map(|_| (0..4).map(|_| rng.random_range(-0.5f32..0.5)).sum())
        .collect();
    Ok(quantize_per_row(&xs, row_len)?)
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();

    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };

    let shape = ProblemShape::new(
        args.batch_size,
        args.head_num,
        args.seq_len,
        args.kv_len.unwrap_or(args.seq_len),
        args.head_size,
    );
    let mut cfg = KernelConfig::from_env()?;
    if let Some(threads) = args.threads {
        cfg = cfg.with_num_threads(threads);
    }
    if args.isa.is_some() {
        cfg = cfg.with_required_isa(args.isa);
    }
    println!("{shape:?} {cfg:?}");

    let kd = KernelDesc::with_config(mha_op_desc(&shape), cfg);
    if !kd.validate() {
        bail!("the descriptor is not supported: {:?}", kd.check().err())
    }
    let start = std::time::Instant::now();
    let mha = DynamicQuantMha::new(Arc::new(kd))?;
    println!("built the kernel in {:?}", start.elapsed());

    let mut rng = StdRng::seed_from_u64(args.seed);
    let row_len = shape.head_num * shape.head_size;
    let (query, query_scale) = random_tokens(&mut rng, shape.query_elem_count(), row_len)?;
    let (key, key_scale) = random_tokens(&mut rng, shape.key_elem_count(), row_len)?;
    let (value, value_scale) = random_tokens(&mut rng, shape.key_elem_count(), row_len)?;
    let inputs = MhaInputs {
        shape,
        query,
        key,
        value,
        mask: vec![0f32; shape.batch_size * shape.n],
        query_scale,
        key_scale,
        value_scale,
    };

    let mut output = vec![0i8; shape.query_elem_count()];
    let mut output_scale = vec![0f32; shape.batch_size * shape.m];
    let mut ws = workspace(mha.workspace_size(&shape));
    println!(
        "workspace: {} bytes for {} threads",
        mha.workspace_size(&shape),
        mha.num_threads()
    );

    let start = std::time::Instant::now();
    for _ in 0..args.iters.max(1) {
        mha.execute(inputs.args(
            &mut output,
            &mut output_scale,
            bytemuck::cast_slice_mut(&mut ws),
        ))?;
    }
    let per_iter = start.elapsed() / args.iters.max(1) as u32;
    let macs = 2 * shape.batch_size * shape.head_num * shape.m * shape.n * shape.head_size;
    println!(
        "{per_iter:?} per run, {:.2} GMAC/s",
        macs as f64 / per_iter.as_secs_f64() / 1e9
    );

    let got = dequantize_output(&shape, &output, &output_scale);
    let expected = inputs.reference();
    let max_err = got
        .iter()
        .zip(&expected)
        .map(|(g, e)| (g - e).abs())
        .fold(0f64, f64::max);
    let max_out = expected.iter().map(|v| v.abs()).fold(0f64, f64::max);
    println!("max abs error {max_err:.5} (max abs output {max_out:.5})");

    let first_row = dequantize_per_row(&output[..row_len], &output_scale[..1])?;
    println!("first output token, head 0: {:?}", &first_row[..shape.head_size.min(8)]);
    Ok(())
}
