//! Built-in intensity normalizers.

use crate::app::ports::Normalizer;
use crate::error::{PreprocessError, Result};
use crate::volume::Volume;

/// Maps the `[lower_percentile, upper_percentile]` intensity range onto
/// `[lower_limit, upper_limit]`, clipping everything outside it.
#[derive(Debug, Clone, PartialEq)]
pub struct PercentileNormalizer {
    lower_percentile: f64,
    upper_percentile: f64,
    lower_limit: f32,
    upper_limit: f32,
}

impl Default for PercentileNormalizer {
    fn default() -> Self {
        Self { lower_percentile: 0.0, upper_percentile: 100.0, lower_limit: 0.0, upper_limit: 1.0 }
    }
}

impl PercentileNormalizer {
    pub fn new(
        lower_percentile: f64,
        upper_percentile: f64,
        lower_limit: f32,
        upper_limit: f32,
    ) -> Result<Self> {
        if !(0.0..=100.0).contains(&lower_percentile)
            || !(0.0..=100.0).contains(&upper_percentile)
            || lower_percentile >= upper_percentile
        {
            return Err(PreprocessError::config(format!(
                "percentiles must satisfy 0 <= lower < upper <= 100, got {lower_percentile} and {upper_percentile}"
            )));
        }
        Ok(Self { lower_percentile, upper_percentile, lower_limit, upper_limit })
    }
}

/// Percentile with linear interpolation between closest ranks
fn percentile(sorted: &[f32], q: f64) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let below = rank.floor() as usize;
    let above = rank.ceil() as usize;
    let weight = (rank - below as f64) as f32;
    sorted[below] + (sorted[above] - sorted[below]) * weight
}

impl Normalizer for PercentileNormalizer {
    fn name(&self) -> &str {
        "percentile"
    }

    fn normalize(&self, image: &Volume) -> anyhow::Result<Volume> {
        let mut sorted: Vec<f32> = image.data().iter().copied().filter(|v| !v.is_nan()).collect();
        sorted.sort_by(f32::total_cmp);

        let low = percentile(&sorted, self.lower_percentile);
        let high = percentile(&sorted, self.upper_percentile);
        let range = high - low;
        let span = self.upper_limit - self.lower_limit;
        let lower_limit = self.lower_limit;

        // only a truly flat image has no range to stretch
        if range <= 0.0 {
            return Ok(image.map(move |_| lower_limit));
        }
        Ok(image.map(move |v| ((v - low) / range).clamp(0.0, 1.0) * span + lower_limit))
    }
}

/// Clips intensities to `center ± width / 2`
#[derive(Debug, Clone, PartialEq)]
pub struct WindowingNormalizer {
    center: f32,
    width: f32,
}

impl WindowingNormalizer {
    pub fn new(center: f32, width: f32) -> Result<Self> {
        if width <= 0.0 {
            return Err(PreprocessError::config(format!("window width must be positive, got {width}")));
        }
        Ok(Self { center, width })
    }
}

impl Normalizer for WindowingNormalizer {
    fn name(&self) -> &str {
        "windowing"
    }

    fn normalize(&self, image: &Volume) -> anyhow::Result<Volume> {
        let min = self.center - self.width / 2.0;
        let max = self.center + self.width / 2.0;
        Ok(image.map(move |v| v.clamp(min, max)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Geometry;
    use ndarray::Array3;

    fn ramp() -> Volume {
        // 0, 1, ..., 7
        let data = Array3::from_shape_fn((2, 2, 2), |(x, y, z)| (x * 4 + y * 2 + z) as f32);
        Volume::new(data, Geometry::with_dims([2, 2, 2])).unwrap()
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [0.0, 10.0, 20.0, 30.0];
        assert_eq!(percentile(&sorted, 0.0), 0.0);
        assert_eq!(percentile(&sorted, 100.0), 30.0);
        assert!((percentile(&sorted, 50.0) - 15.0).abs() < 1e-5);
    }

    #[test]
    fn test_percentile_normalizer_scales_into_limits() {
        let normalizer = PercentileNormalizer::new(0.0, 100.0, 0.0, 2.0).unwrap();
        let out = normalizer.normalize(&ramp()).unwrap();
        assert_eq!(out.data()[[0, 0, 0]], 0.0);
        assert!((out.data()[[1, 1, 1]] - 2.0).abs() < 1e-5);
        assert_eq!(out.geometry(), ramp().geometry());
    }

    #[test]
    fn test_percentile_normalizer_clips_outliers() {
        let normalizer = PercentileNormalizer::new(10.0, 90.0, 0.0, 1.0).unwrap();
        let out = normalizer.normalize(&ramp()).unwrap();
        assert!(out.data().iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(out.data()[[0, 0, 0]], 0.0);
        assert_eq!(out.data()[[1, 1, 1]], 1.0);
    }

    #[test]
    fn test_percentile_normalizer_stretches_tiny_ranges() {
        // intensities of order 1e-8, as in probability or rescaled maps
        let tiny = ramp().map(|v| v * 1e-8);
        let normalizer = PercentileNormalizer::new(0.0, 100.0, 0.0, 1.0).unwrap();
        let out = normalizer.normalize(&tiny).unwrap();
        assert_eq!(out.data()[[0, 0, 0]], 0.0);
        assert!((out.data()[[1, 1, 1]] - 1.0).abs() < 1e-4);
        assert!((out.data()[[0, 1, 1]] - 3.0 / 7.0).abs() < 1e-4);
    }

    #[test]
    fn test_percentile_normalizer_flat_image() {
        let flat = Volume::new(Array3::from_elem((2, 2, 2), 5.0), Geometry::with_dims([2, 2, 2])).unwrap();
        let out = PercentileNormalizer::new(0.0, 100.0, -1.0, 1.0).unwrap().normalize(&flat).unwrap();
        assert!(out.data().iter().all(|v| *v == -1.0));
    }

    #[test]
    fn test_percentile_normalizer_rejects_bad_percentiles() {
        assert!(PercentileNormalizer::new(50.0, 50.0, 0.0, 1.0).is_err());
        assert!(PercentileNormalizer::new(-1.0, 99.0, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_windowing_clamps_to_window() {
        let out = WindowingNormalizer::new(4.0, 4.0).unwrap().normalize(&ramp()).unwrap();
        assert_eq!(out.data()[[0, 0, 0]], 2.0);
        assert_eq!(out.data()[[0, 1, 1]], 3.0);
        assert_eq!(out.data()[[1, 1, 1]], 6.0);
        assert!(WindowingNormalizer::new(0.0, 0.0).is_err());
    }
}
