use std::path::Path;

use ndarray::{s, Array2, Array3};
use plotters::prelude::*;
use tracing::debug;

use crate::error::{AnalysisError, Result};

const PLOT_FONT_SCALE: f64 = 1.2;

fn scaled_font_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

fn scaled_area_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

fn plot_error<E: std::fmt::Display>(err: E) -> AnalysisError {
    AnalysisError::Plot(err.to_string())
}

/// Blue (low) to red (high).
fn colormap(value: f64, min: f64, max: f64) -> HSLColor {
    let t = if max > min { ((value - min) / (max - min)).clamp(0.0, 1.0) } else { 0.5 };
    HSLColor((1.0 - t) * 240.0 / 360.0, 1.0, 0.5)
}

fn central_slices(array: &Array3<f64>) -> [(Array2<f64>, &'static str, &'static str, &'static str); 3] {
    let (nz, ny, nx) = array.dim();
    [
        (array.slice(s![nz / 2, .., ..]).to_owned(), "XY slice", "x", "y"),
        (array.slice(s![.., ny / 2, ..]).to_owned(), "XZ slice", "x", "z"),
        (array.slice(s![.., .., nx / 2]).to_owned(), "YZ slice", "y", "z"),
    ]
}

/// Saves the three central slices of `array` side by side as a PNG.
pub fn plot_central_slices(array: &Array3<f64>, title: &str, filename: &Path) -> Result<()> {
    if array.is_empty() {
        return Err(AnalysisError::Plot("no data to plot".to_string()));
    }
    let finite = array.iter().cloned().filter(|v| v.is_finite());
    let min = finite.clone().fold(f64::INFINITY, f64::min);
    let max = finite.fold(f64::NEG_INFINITY, f64::max);

    let root = BitMapBackend::new(filename, (1800, 720)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;
    let root = root
        .titled(title, ("sans-serif", scaled_font_size(32)).into_font())
        .map_err(plot_error)?;
    let panels = root.split_evenly((1, 3));

    for (panel, (slice, caption, x_label, y_label)) in panels.iter().zip(central_slices(array)) {
        let (rows, cols) = slice.dim();
        let mut chart = ChartBuilder::on(panel)
            .caption(caption, ("sans-serif", scaled_font_size(24)).into_font())
            .margin(10)
            .x_label_area_size(scaled_area_size(40))
            .y_label_area_size(scaled_area_size(50))
            .build_cartesian_2d(0..cols as i32, 0..rows as i32)
            .map_err(plot_error)?;

        chart
            .configure_mesh()
            .x_desc(x_label)
            .y_desc(y_label)
            .label_style(("sans-serif", scaled_font_size(16)).into_font())
            .axis_desc_style(("sans-serif", scaled_font_size(20)).into_font())
            .disable_mesh()
            .draw()
            .map_err(plot_error)?;

        chart
            .draw_series(slice.indexed_iter().map(|((r, c), &v)| {
                let (r, c) = (r as i32, c as i32);
                Rectangle::new([(c, r), (c + 1, r + 1)], colormap(v, min, max).filled())
            }))
            .map_err(plot_error)?;
    }

    root.present().map_err(plot_error)?;
    debug!("wrote {}", filename.display());
    Ok(())
}
