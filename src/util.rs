use std::f64::consts::PI;

///the frequency w_u of cosine term `index` on a grid of `m` bins, in bin units
pub fn calc_w(index: usize, m: usize) -> f64 {
    PI * (index as f64) / (m as f64)
}

/// Index range of the bins of size `size` starting at `origin` that `[lo, hi)` touches.
pub fn bin_range(lo: f64, hi: f64, origin: f64, size: f64, count: usize) -> std::ops::Range<usize> {
    // the casts saturate, so anything left of the origin lands in bin 0
    let start = ((lo - origin) / size).floor().max(0.0) as usize;
    let end = ((hi - origin) / size).ceil().max(0.0) as usize;
    start.min(count)..end.min(count)
}

///length of the overlap of [a_lo, a_hi) and [b_lo, b_hi), zero when disjoint
pub fn overlap(a_lo: f64, a_hi: f64, b_lo: f64, b_hi: f64) -> f64 {
    (a_hi.min(b_hi) - a_lo.max(b_lo)).max(0.0)
}
