//! Pooled chunk statistics.
//!
//! Validation runs in fixed-size chunks; combining the per-chunk means and
//! standard deviations must reproduce the statistics of the concatenated
//! data exactly, not average the stds. Per chunk the raw second moment is
//! recovered as `E[x²] = (n-1)·s²/n + m²`, pooled by size, and the overall
//! sample variance rebuilt with the `N/(N-1)` correction.

/// Mean and sample standard deviation of one chunk of `len` values.
#[derive(Debug, Clone, Copy)]
pub struct ChunkStats {
    pub len: usize,
    pub mean: f64,
    pub std: f64,
}

/// Exact pooled mean and sample standard deviation across chunks.
///
/// Returns `None` when the chunks cover no data at all, so a degenerate
/// (empty) validation pass never divides by zero.
pub fn pool(chunks: &[ChunkStats]) -> Option<(f64, f64)> {
    let total: usize = chunks.iter().map(|c| c.len).sum();
    if total == 0 {
        return None;
    }
    let n = total as f64;

    let mean = chunks.iter().map(|c| c.len as f64 * c.mean).sum::<f64>() / n;

    if total == 1 {
        return Some((mean, 0.0));
    }

    let second_moment = chunks
        .iter()
        .filter(|c| c.len > 0)
        .map(|c| {
            let b = c.len as f64;
            b * ((b - 1.0) * c.std * c.std / b + c.mean * c.mean)
        })
        .sum::<f64>()
        / n;

    // Float noise can push the variance a hair below zero
    let variance = ((second_moment - mean * mean) * n / (n - 1.0)).max(0.0);
    Some((mean, variance.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_stats(data: &[f64]) -> (f64, f64) {
        let n = data.len() as f64;
        let mean = data.iter().sum::<f64>() / n;
        if data.len() < 2 {
            return (mean, 0.0);
        }
        let var = data.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
        (mean, var.sqrt())
    }

    fn chunk(data: &[f64]) -> ChunkStats {
        let (mean, std) = direct_stats(data);
        ChunkStats {
            len: data.len(),
            mean,
            std,
        }
    }

    const DATA: [f64; 8] = [1.0, 4.0, -2.0, 8.5, 0.25, 3.0, -7.0, 2.5];

    #[test]
    fn single_chunk_reproduces_direct_stats() {
        let (mean, std) = pool(&[chunk(&DATA)]).unwrap();
        let (dm, ds) = direct_stats(&DATA);
        assert!((mean - dm).abs() < 1e-12);
        assert!((std - ds).abs() < 1e-12);
    }

    #[test]
    fn two_uneven_chunks_reproduce_direct_stats() {
        let (mean, std) = pool(&[chunk(&DATA[..3]), chunk(&DATA[3..])]).unwrap();
        let (dm, ds) = direct_stats(&DATA);
        assert!((mean - dm).abs() < 1e-10);
        assert!((std - ds).abs() < 1e-10);
    }

    #[test]
    fn singleton_chunks_reproduce_direct_stats() {
        let chunks: Vec<ChunkStats> = DATA.iter().map(|&x| chunk(&[x])).collect();
        let (mean, std) = pool(&chunks).unwrap();
        let (dm, ds) = direct_stats(&DATA);
        assert!((mean - dm).abs() < 1e-10);
        assert!((std - ds).abs() < 1e-10);
    }

    #[test]
    fn empty_partition_pools_to_none() {
        assert!(pool(&[]).is_none());
        assert!(pool(&[ChunkStats {
            len: 0,
            mean: 0.0,
            std: 0.0
        }])
        .is_none());
    }

    #[test]
    fn single_value_has_zero_std() {
        let (mean, std) = pool(&[chunk(&[42.0])]).unwrap();
        assert_eq!(mean, 42.0);
        assert_eq!(std, 0.0);
    }
}
