//! Per-frame focus and exposure indicators.
//!
//! Both figures are computed on the central region of interest, rows and
//! columns `2/5 .. 3/5` of the frame:
//!
//! - luminance: mean pixel value;
//! - sharpness: mean squared 5-point Laplacian of the mean-subtracted region,
//!   borders handled by repeating the edge pixel. Normalising by the standard
//!   deviation would reward blur (out of focus frames have a smaller spread),
//!   so it is not done.

use serde::Serialize;

use super::Frame;

/// Luminance and sharpness of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ImageStats {
    /// Mean pixel value over the region of interest
    pub luminance: f64,
    /// Mean squared Laplacian over the region of interest
    pub sharpness: f64,
}

/// Row and column ranges of the central region of interest.
pub fn central_roi(frame: &Frame) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
    let rows = (2 * frame.height / 5)..(3 * frame.height / 5);
    let cols = (2 * frame.width / 5)..(3 * frame.width / 5);
    (rows, cols)
}

/// Compute [`ImageStats`] for `frame`. An empty region yields zeros.
pub fn image_stats(frame: &Frame) -> ImageStats {
    let (rows, cols) = central_roi(frame);
    let h = rows.len();
    let w = cols.len();
    if h == 0 || w == 0 {
        return ImageStats {
            luminance: 0.0,
            sharpness: 0.0,
        };
    }

    let roi: Vec<f64> = rows
        .clone()
        .flat_map(|y| cols.clone().map(move |x| (y, x)))
        .map(|(y, x)| f64::from(frame.at(y, x)))
        .collect();
    let luminance = roi.iter().sum::<f64>() / roi.len() as f64;

    let value = |y: usize, x: usize| roi[y * w + x] - luminance;
    let mut sum_sq = 0.0;
    for y in 0..h {
        for x in 0..w {
            let up = value(y.saturating_sub(1), x);
            let down = value((y + 1).min(h - 1), x);
            let left = value(y, x.saturating_sub(1));
            let right = value(y, (x + 1).min(w - 1));
            let laplacian = up + down + left + right - 4.0 * value(y, x);
            sum_sq += laplacian * laplacian;
        }
    }

    ImageStats {
        luminance,
        sharpness: sum_sq / (h * w) as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: usize, height: usize, f: impl Fn(usize, usize) -> u16) -> Frame {
        let pixels = (0..height)
            .flat_map(|y| (0..width).map(move |x| (y, x)))
            .map(|(y, x)| f(y, x))
            .collect();
        Frame::new(width, height, pixels, 255).unwrap()
    }

    #[test]
    fn test_uniform_frame_has_no_sharpness() {
        let stats = image_stats(&frame(10, 10, |_, _| 80));
        assert_eq!(stats.luminance, 80.0);
        assert_eq!(stats.sharpness, 0.0);
    }

    #[test]
    fn test_roi_ignores_borders() {
        // Bright border, dark centre: the ROI (rows/cols 4..6) sees only the centre
        let stats = image_stats(&frame(10, 10, |y, x| {
            if (4..6).contains(&y) && (4..6).contains(&x) {
                10
            } else {
                250
            }
        }));
        assert_eq!(stats.luminance, 10.0);
    }

    #[test]
    fn test_checkerboard_is_sharper_than_gradient() {
        let checker = image_stats(&frame(20, 20, |y, x| if (x + y) % 2 == 0 { 0 } else { 200 }));
        let gradient = image_stats(&frame(20, 20, |_, x| (x * 10) as u16));
        assert!(checker.sharpness > gradient.sharpness);
        assert!(checker.sharpness > 0.0);
    }

    #[test]
    fn test_tiny_frame() {
        let stats = image_stats(&frame(1, 1, |_, _| 5));
        assert_eq!(stats.luminance, 0.0);
        assert_eq!(stats.sharpness, 0.0);
    }
}
