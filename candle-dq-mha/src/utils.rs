use std::str::FromStr;

pub fn get_num_threads() -> usize {
    // Respond to the same environment variable as rayon.
    match std::env::var("RAYON_NUM_THREADS")
        .ok()
        .and_then(|s| usize::from_str(&s).ok())
    {
        Some(x) if x > 0 => x,
        Some(_) | None => num_cpus::get(),
    }
}

/// Rounds `x` up to the next multiple of `n`.
#[inline]
pub const fn pad_to(x: usize, n: usize) -> usize {
    candle_dq_kernels::pad_to(x, n)
}
