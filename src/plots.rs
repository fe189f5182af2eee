//! Static chart rendering from a trace and the precinct table.
//!
//! Pure functions of their inputs; each writes one SVG file. Missing trace
//! columns or out-of-range precinct selections are errors, with no fallback
//! rendering.

use std::path::Path;

use plotters::prelude::*;

use crate::error::{Error, Result};
use crate::sampler::{column_means, credible_interval, Trace};

const STEELBLUE: RGBColor = RGBColor(70, 130, 180);
const SALMON: RGBColor = RGBColor(250, 128, 114);

/// Grid resolution for the density curves.
const KDE_POINTS: usize = 500;
/// Peak height of each density band, in row units; > 1 lets bands overlap.
const OVERLAP: f64 = 1.3;
/// Cap on posterior draws fed to the KDE, for rendering speed.
const KDE_MAX_SAMPLES: usize = 2000;

fn perr<E: std::fmt::Display>(e: E) -> Error {
    Error::Plot(e.to_string())
}

/// Ridgeline chart of the minority and majority posterior support densities
/// for the selected precincts, one band per precinct.
pub fn plot_precinct_densities(
    trace: &Trace,
    labels: &[String],
    selected: &[usize],
    district: u32,
    out: &Path,
) -> Result<()> {
    if selected.is_empty() {
        return Err(Error::Plot("no precincts selected".to_string()));
    }
    if labels.len() != trace.n_precincts() {
        return Err(Error::Plot(format!(
            "{} labels for {} precincts",
            labels.len(),
            trace.n_precincts()
        )));
    }
    for &idx in selected {
        if idx >= trace.n_precincts() {
            return Err(Error::Plot(format!(
                "precinct index {idx} out of range ({} precincts)",
                trace.n_precincts()
            )));
        }
    }

    let n = selected.len();
    let height = (140 * n + 160) as u32;
    let root = SVGBackend::new(out, (960, height)).into_drawing_area();
    root.fill(&WHITE).map_err(perr)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Inferring majority and minority bloc voting in North Carolina {district}"),
            ("sans-serif", 28),
        )
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(180)
        .build_cartesian_2d(0f64..1f64, 0f64..(n as f64 + OVERLAP + 0.5))
        .map_err(perr)?;

    let names: Vec<String> = selected.iter().map(|&i| labels[i].clone()).collect();
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("Pct vote for democrat")
        .y_labels(n + 2)
        .y_label_formatter(&|y: &f64| {
            let i = y.round() as usize;
            if (y - y.round()).abs() < 1e-6 && (1..=names.len()).contains(&i) {
                names[i - 1].clone()
            } else {
                String::new()
            }
        })
        .draw()
        .map_err(perr)?;

    let grid: Vec<f64> = (0..KDE_POINTS)
        .map(|i| i as f64 / (KDE_POINTS - 1) as f64)
        .collect();

    for (row, &idx) in selected.iter().enumerate() {
        let baseline = (row + 1) as f64;
        let minority = thinned_column(trace, true, idx);
        let majority = thinned_column(trace, false, idx);

        for (samples, color, label) in [
            (minority, STEELBLUE, "Minority"),
            (majority, SALMON, "Majority"),
        ] {
            let density = gaussian_kde(&samples, &grid);
            let peak = density.iter().cloned().fold(f64::MIN, f64::max).max(1e-12);
            let points: Vec<(f64, f64)> = grid
                .iter()
                .zip(&density)
                .map(|(&x, &d)| (x, baseline + OVERLAP * d / peak))
                .collect();

            let series = chart
                .draw_series(AreaSeries::new(points.iter().copied(), baseline, color.mix(0.7)))
                .map_err(perr)?;
            if row == 0 {
                series.label(label).legend(move |(x, y)| {
                    Rectangle::new([(x, y - 5), (x + 12, y + 5)], color.filled())
                });
            }
            chart
                .draw_series(LineSeries::new(points, BLACK.stroke_width(2)))
                .map_err(perr)?;
        }
    }

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.9))
        .draw()
        .map_err(perr)?;
    root.present().map_err(perr)?;
    Ok(())
}

/// Posterior mean minority and majority support per precinct against the
/// precinct's minority population share, with 95% credible whiskers.
pub fn plot_posterior_means(
    trace: &Trace,
    pct_minority: &[f64],
    district: u32,
    out: &Path,
) -> Result<()> {
    if pct_minority.len() != trace.n_precincts() {
        return Err(Error::Plot(format!(
            "{} pct_minority values for {} precincts",
            pct_minority.len(),
            trace.n_precincts()
        )));
    }

    let min_mean = column_means(&trace.minority_rate);
    let maj_mean = column_means(&trace.majority_rate);
    let (min_lo, min_hi) = credible_interval(&trace.minority_rate, 0.95);
    let (maj_lo, maj_hi) = credible_interval(&trace.majority_rate, 0.95);

    let root = SVGBackend::new(out, (900, 620)).into_drawing_area();
    root.fill(&WHITE).map_err(perr)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Posterior support for democrats by group, district {district}"),
            ("sans-serif", 26),
        )
        .margin(10)
        .x_label_area_size(44)
        .y_label_area_size(54)
        .build_cartesian_2d(0f64..1f64, 0f64..1f64)
        .map_err(perr)?;

    chart
        .configure_mesh()
        .x_desc("Pct minority in precinct")
        .y_desc("Pct vote for democrat")
        .draw()
        .map_err(perr)?;

    chart
        .draw_series(pct_minority.iter().enumerate().map(|(i, &x)| {
            ErrorBar::new_vertical(x, min_lo[i], min_mean[i], min_hi[i], STEELBLUE.filled(), 6)
        }))
        .map_err(perr)?
        .label("Minority")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 14, y)], STEELBLUE.stroke_width(3)));

    chart
        .draw_series(pct_minority.iter().enumerate().map(|(i, &x)| {
            ErrorBar::new_vertical(x, maj_lo[i], maj_mean[i], maj_hi[i], SALMON.filled(), 6)
        }))
        .map_err(perr)?
        .label("Majority")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 14, y)], SALMON.stroke_width(3)));

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.9))
        .draw()
        .map_err(perr)?;
    root.present().map_err(perr)?;
    Ok(())
}

fn thinned_column(trace: &Trace, minority: bool, idx: usize) -> Vec<f64> {
    let col = if minority {
        trace.minority_rate.column(idx)
    } else {
        trace.majority_rate.column(idx)
    };
    let stride = (col.len() / KDE_MAX_SAMPLES).max(1);
    col.iter().step_by(stride).copied().collect()
}

/// Gaussian kernel density estimate on a fixed grid, Scott's bandwidth.
fn gaussian_kde(samples: &[f64], grid: &[f64]) -> Vec<f64> {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let sd = (samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();
    let bandwidth = (sd * n.powf(-0.2)).max(1e-4);
    let norm = n * bandwidth * (2.0 * std::f64::consts::PI).sqrt();
    grid.iter()
        .map(|&x| {
            samples
                .iter()
                .map(|&s| {
                    let z = (x - s) / bandwidth;
                    (-0.5 * z * z).exp()
                })
                .sum::<f64>()
                / norm
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::Diagnostics;
    use ndarray::Array2;
    use std::fs;

    fn toy_trace(draws: usize, n: usize) -> Trace {
        let fill = |base: f64| {
            Array2::from_shape_fn((draws, n), |(d, j)| {
                base + 0.1 * ((d * 31 + j * 17) % 10) as f64 / 10.0
            })
        };
        Trace {
            minority_rate: fill(0.7),
            majority_rate: fill(0.3),
            expected_dem_share: fill(0.5),
            alpha: Array2::from_elem((draws, 2), 2.0),
            beta: Array2::from_elem((draws, 2), 2.0),
            diagnostics: Diagnostics {
                chains: 1,
                draws_per_chain: draws,
                accept_latent: 0.4,
                accept_hyper: 0.4,
                max_rhat: 1.0,
            },
        }
    }

    #[test]
    fn kde_integrates_to_one() {
        let samples: Vec<f64> = (0..200).map(|i| 0.4 + 0.001 * (i % 50) as f64).collect();
        let grid: Vec<f64> = (0..=1000).map(|i| i as f64 / 1000.0).collect();
        let density = gaussian_kde(&samples, &grid);
        let integral: f64 = density.windows(2).map(|w| (w[0] + w[1]) / 2.0).sum::<f64>() / 1000.0;
        assert!((integral - 1.0).abs() < 0.05, "integral = {integral}");
    }

    #[test]
    fn density_plot_writes_svg() {
        let trace = toy_trace(50, 3);
        let labels = vec!["A (1)".to_string(), "B (2)".to_string(), "C (3)".to_string()];
        let out = std::env::temp_dir().join("ecoinfer_test_densities.svg");
        let _ = fs::remove_file(&out);
        plot_precinct_densities(&trace, &labels, &[0, 2], 9, &out).unwrap();
        assert!(fs::metadata(&out).unwrap().len() > 0);
        let _ = fs::remove_file(&out);
    }

    #[test]
    fn density_plot_rejects_bad_selection() {
        let trace = toy_trace(50, 3);
        let labels = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let out = std::env::temp_dir().join("ecoinfer_test_bad.svg");
        assert!(plot_precinct_densities(&trace, &labels, &[], 1, &out).is_err());
        assert!(plot_precinct_densities(&trace, &labels, &[7], 1, &out).is_err());
    }

    #[test]
    fn means_plot_writes_svg() {
        let trace = toy_trace(50, 3);
        let out = std::env::temp_dir().join("ecoinfer_test_means.svg");
        let _ = fs::remove_file(&out);
        plot_posterior_means(&trace, &[0.2, 0.5, 0.8], 9, &out).unwrap();
        assert!(fs::metadata(&out).unwrap().len() > 0);
        let _ = fs::remove_file(&out);
    }

    #[test]
    fn means_plot_checks_lengths() {
        let trace = toy_trace(50, 3);
        let out = std::env::temp_dir().join("ecoinfer_test_means_bad.svg");
        assert!(plot_posterior_means(&trace, &[0.2], 9, &out).is_err());
    }
}
