//! PNG curves and slice panels, behind the `plots` feature.

use std::path::{Path, PathBuf};

use ndarray::{s, Array2, ArrayView4};

use crate::history::TrainingHistory;

pub type PlotResult<T> = Result<T, Box<dyn std::error::Error>>;

/// One grayscale 2D image with its caption.
#[derive(Debug, Clone)]
pub struct SlicePanel {
    pub title: String,
    pub pixels: Array2<f32>,
}

/// Axial slice `z` (clamped to the volume depth) of every channel of a
/// `[C, X, Y, Z]` volume, titled `"{prefix} channel {c}"`.
pub fn axial_panels(prefix: &str, volume: ArrayView4<'_, f32>, z: usize) -> Vec<SlicePanel> {
    let (channels, _, _, depth) = volume.dim();
    if depth == 0 {
        return Vec::new();
    }
    let z = z.min(depth - 1);
    (0..channels)
        .map(|c| SlicePanel {
            title: format!("{prefix} channel {c}"),
            pixels: volume.slice(s![c, .., .., z]).to_owned(),
        })
        .collect()
}

/// Validation epochs are every `val_interval`-th epoch, 1-based.
#[cfg_attr(not(feature = "plots"), allow(dead_code))]
fn validation_points(values: &[f32], val_interval: usize) -> Vec<(f32, f32)> {
    let interval = val_interval.max(1);
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (((i + 1) * interval) as f32, *v))
        .collect()
}

#[cfg_attr(not(feature = "plots"), allow(dead_code))]
fn epoch_points(values: &[f32]) -> Vec<(f32, f32)> {
    validation_points(values, 1)
}

/// Writes `train_loss_dice.png` and `train_regions.png` into `out_dir`.
#[cfg(feature = "plots")]
pub fn plot_training_curves<P: AsRef<Path>>(
    out_dir: P,
    history: &TrainingHistory,
    val_interval: usize,
) -> PlotResult<Vec<PathBuf>> {
    use plotters::prelude::*;

    let out_dir = out_dir.as_ref();
    let loss_dice = out_dir.join("train_loss_dice.png");
    {
        let root = BitMapBackend::new(&loss_dice, (1200, 480)).into_drawing_area();
        root.fill(&WHITE)?;
        let (left, right) = root.split_horizontally(600);
        draw_line_chart(&left, "Epoch Average Loss", &epoch_points(&history.epoch_loss), &RED)?;
        draw_line_chart(
            &right,
            "Val Mean Dice",
            &validation_points(&history.metric_values, val_interval),
            &GREEN,
        )?;
        root.present()?;
    }

    let regions = out_dir.join("train_regions.png");
    {
        let root = BitMapBackend::new(&regions, (1800, 480)).into_drawing_area();
        root.fill(&WHITE)?;
        let areas = root.split_evenly((1, 3));
        let series = [
            ("Val Mean Dice TC", &history.metric_values_tc, RGBColor(31, 119, 180)),
            ("Val Mean Dice WT", &history.metric_values_wt, RGBColor(140, 86, 75)),
            ("Val Mean Dice ET", &history.metric_values_et, RGBColor(148, 103, 189)),
        ];
        for (area, (caption, values, color)) in areas.iter().zip(series.iter()) {
            draw_line_chart(area, caption, &validation_points(values, val_interval), color)?;
        }
        root.present()?;
    }

    Ok(vec![loss_dice, regions])
}

#[cfg(feature = "plots")]
fn draw_line_chart(
    area: &plotters::drawing::DrawingArea<plotters::prelude::BitMapBackend<'_>, plotters::coord::Shift>,
    caption: &str,
    points: &[(f32, f32)],
    color: &plotters::style::RGBColor,
) -> PlotResult<()> {
    use plotters::prelude::*;

    let x_max = points.last().map_or(1.0, |p| p.0).max(1.0);
    let (mut y_min, mut y_max) = points
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| (lo.min(p.1), hi.max(p.1)));
    if !y_min.is_finite() || !y_max.is_finite() {
        (y_min, y_max) = (0.0, 1.0);
    }
    if (y_max - y_min).abs() < 1e-6 {
        y_max = y_min + 1.0;
    }
    let mut chart = ChartBuilder::on(area)
        .margin(20)
        .caption(caption, ("sans-serif", 22))
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0.0f32..x_max, y_min..y_max)?;
    chart.configure_mesh().x_desc("epoch").draw()?;
    chart.draw_series(LineSeries::new(points.iter().copied(), color))?;
    Ok(())
}

#[cfg(not(feature = "plots"))]
pub fn plot_training_curves<P: AsRef<Path>>(
    _out_dir: P,
    _history: &TrainingHistory,
    _val_interval: usize,
) -> PlotResult<Vec<PathBuf>> {
    Err("plots feature is not enabled".into())
}

/// Grayscale panels side by side, each stretched to its own min/max.
#[cfg(feature = "plots")]
pub fn plot_slices_png<P: AsRef<Path>>(path: P, panels: &[SlicePanel]) -> PlotResult<()> {
    use plotters::prelude::*;

    let cell = 240u32;
    let n = panels.len().max(1);
    let root = BitMapBackend::new(path.as_ref(), (cell * n as u32, cell + 30)).into_drawing_area();
    root.fill(&WHITE)?;
    for (area, panel) in root.split_evenly((1, n)).iter().zip(panels) {
        let area = area.titled(&panel.title, ("sans-serif", 16))?;
        let (sx, sy) = panel.pixels.dim();
        if sx == 0 || sy == 0 {
            continue;
        }
        let (lo, hi) = panel
            .pixels
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        let range = if hi > lo { hi - lo } else { 1.0 };
        let (w, h) = area.dim_in_pixel();
        for px in 0..w {
            for py in 0..h {
                // Rows run top to bottom, so y is flipped to put anterior up.
                let i = (px as usize * sx / w as usize).min(sx - 1);
                let j = sy - 1 - (py as usize * sy / h as usize).min(sy - 1);
                let v = ((panel.pixels[(i, j)] - lo) / range * 255.0).clamp(0.0, 255.0) as u8;
                area.draw_pixel((px as i32, py as i32), &RGBColor(v, v, v))?;
            }
        }
    }
    root.present()?;
    Ok(())
}

#[cfg(not(feature = "plots"))]
pub fn plot_slices_png<P: AsRef<Path>>(_path: P, _panels: &[SlicePanel]) -> PlotResult<()> {
    Err("plots feature is not enabled".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn axial_panels_take_one_slice_per_channel() {
        let volume = Array4::from_shape_fn((3, 4, 5, 6), |(c, x, y, z)| (c * 1000 + x * 100 + y * 10 + z) as f32);
        let panels = axial_panels("label", volume.view(), 70);
        assert_eq!(panels.len(), 3);
        assert_eq!(panels[2].title, "label channel 2");
        assert_eq!(panels[1].pixels.dim(), (4, 5));
        // Slice index is clamped to the last plane.
        assert_eq!(panels[1].pixels[(3, 4)], 1345.0);
    }

    #[test]
    fn validation_points_follow_the_interval() {
        let points = validation_points(&[0.2, 0.4], 2);
        assert_eq!(points, vec![(2.0, 0.2), (4.0, 0.4)]);
        assert_eq!(epoch_points(&[1.0]), vec![(1.0, 1.0)]);
    }

    #[cfg(not(feature = "plots"))]
    #[test]
    fn plotting_without_the_feature_reports_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(plot_training_curves(dir.path(), &TrainingHistory::default(), 1).is_err());
    }

    #[cfg(feature = "plots")]
    #[test]
    fn curves_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = TrainingHistory::default();
        history.record_loss(0.9);
        history.record_loss(0.7);
        history.record_validation(0.3, &[0.2, 0.5, 0.1]);
        let files = plot_training_curves(dir.path(), &history, 2).unwrap();
        assert!(files.iter().all(|f| f.exists()));
    }
}
