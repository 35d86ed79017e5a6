//! Shared 2-D projection of spike features.
//!
//! All spikes across all clusters go through one PCA fit so the clusters
//! are visually comparable on a single coordinate system. For very large
//! spike counts the fit runs on a random subsample and the fitted
//! projection is then applied to every spike, trading a little coordinate
//! fidelity for bounded fitting cost.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::seq::index::sample as sample_indices;

/// A fitted 2-component PCA projection.
pub struct Projection {
    mean: DVector<f64>,
    /// d x 2 component matrix.
    components: DMatrix<f64>,
}

impl Projection {
    /// Fit a 2-component projection over feature rows.
    ///
    /// Degenerate inputs (fewer than two rows, or rank below two) still
    /// yield a projection; missing components are zero, so the transformed
    /// coordinates collapse onto an axis rather than failing the run.
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let n = rows.len();
        let d = rows.first().map(Vec::len).unwrap_or(0);

        if n == 0 || d == 0 {
            return Self {
                mean: DVector::zeros(d),
                components: DMatrix::zeros(d, 2),
            };
        }

        let mut mean = DVector::zeros(d);
        for row in rows {
            for (j, &v) in row.iter().enumerate() {
                mean[j] += v;
            }
        }
        mean /= n as f64;

        let centered = DMatrix::from_fn(n, d, |i, j| rows[i][j] - mean[j]);
        let scale = 1.0 / (n.max(2) - 1) as f64;

        let components = if d <= n {
            // Covariance eigendecomposition in feature space
            let cov = centered.transpose() * &centered * scale;
            top_two_eigenvectors(cov)
        } else {
            // More features than samples: eigendecompose the Gram matrix
            // and map the sample-space eigenvectors back to feature space.
            let gram = &centered * centered.transpose() * scale;
            let sample_components = top_two_eigenvectors(gram);
            let mut feature_components = DMatrix::zeros(d, 2);
            for c in 0..2 {
                let u = sample_components.column(c);
                let v = centered.transpose() * u;
                let norm = v.norm();
                if norm > f64::EPSILON {
                    feature_components.set_column(c, &(v / norm));
                }
            }
            feature_components
        };

        Self { mean, components }
    }

    /// Project one feature row onto the two fitted components.
    pub fn transform(&self, row: &[f64]) -> (f64, f64) {
        let mut x = 0.0;
        let mut y = 0.0;
        for (j, &v) in row.iter().enumerate() {
            let centered = v - self.mean[j];
            x += centered * self.components[(j, 0)];
            y += centered * self.components[(j, 1)];
        }
        (x, y)
    }

    /// Project every row.
    pub fn transform_all(&self, rows: &[Vec<f64>]) -> Vec<(f64, f64)> {
        rows.iter().map(|row| self.transform(row)).collect()
    }
}

/// Fit on at most `max_fit` randomly chosen rows, then project every row.
pub fn project_with_subsample(rows: &[Vec<f64>], max_fit: usize) -> Vec<(f64, f64)> {
    let projection = if rows.len() > max_fit {
        tracing::info!(
            total = rows.len(),
            fit_on = max_fit,
            "fitting projection on a random subsample"
        );
        let mut rng = rand::thread_rng();
        let chosen: Vec<Vec<f64>> = sample_indices(&mut rng, rows.len(), max_fit)
            .into_iter()
            .map(|i| rows[i].clone())
            .collect();
        Projection::fit(&chosen)
    } else {
        Projection::fit(rows)
    };

    projection.transform_all(rows)
}

/// Columns of the two dominant eigenvectors of a symmetric matrix.
fn top_two_eigenvectors(matrix: DMatrix<f64>) -> DMatrix<f64> {
    let dim = matrix.nrows();
    let eigen = SymmetricEigen::new(matrix);

    let mut order: Vec<usize> = (0..dim).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut components = DMatrix::zeros(dim, 2);
    for (c, &idx) in order.iter().take(2).enumerate() {
        components.set_column(c, &eigen.eigenvectors.column(idx));
    }
    components
}
