use crate::core::models::structure::Lattice;
use nalgebra::Vector3;
use thiserror::Error;

const ZERO_DISTANCE: f64 = 1e-8;

/// Largest number of cells scanned on either side of the origin cell.
pub const MAX_CELLS_PER_AXIS: i32 = 64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Reaching {cutoff} Angstroms needs more than {max} cells along axis {axis}", max = MAX_CELLS_PER_AXIS)]
    TooManyCells { cutoff: f64, axis: usize },
}

/// Perpendicular distances between opposite faces of the cell.
pub fn cell_heights(lattice: &Lattice) -> Vector3<f64> {
    let m = lattice.matrix();
    let (a, b, c) = (m.column(0), m.column(1), m.column(2));
    let volume = lattice.volume();
    Vector3::new(
        volume / b.cross(&c).norm(),
        volume / c.cross(&a).norm(),
        volume / a.cross(&b).norm(),
    )
}

/// Number of cells to scan along each axis so that every image within
/// `cutoff` of a site inside the cell is visited.
///
/// Flat cells and very long cutoffs fail instead of producing a scan that
/// would never finish.
pub fn translation_bounds(lattice: &Lattice, cutoff: f64) -> Result<[i32; 3], GeometryError> {
    let heights = cell_heights(lattice);
    let mut bounds = [0; 3];
    for (axis, bound) in bounds.iter_mut().enumerate() {
        let cells = (cutoff / heights[axis]).ceil();
        if !cells.is_finite() || cells >= f64::from(MAX_CELLS_PER_AXIS) {
            return Err(GeometryError::TooManyCells { cutoff, axis: axis + 1 });
        }
        *bound = (cells.max(0.0) as i32)
            .checked_add(1)
            .ok_or(GeometryError::TooManyCells { cutoff, axis: axis + 1 })?;
    }
    Ok(bounds)
}

/// Integer lattice translations within `bounds`, as fractional vectors.
pub fn translations(bounds: [i32; 3]) -> impl Iterator<Item = Vector3<f64>> {
    let [na, nb, nc] = bounds;
    (-na..=na).flat_map(move |i| {
        (-nb..=nb).flat_map(move |j| {
            (-nc..=nc).map(move |k| Vector3::new(i as f64, j as f64, k as f64))
        })
    })
}

/// Cartesian vectors from `from` to every periodic image of `to` whose
/// length lies in `[lower, upper]`, excluding the zero vector.
pub fn periodic_images(
    lattice: &Lattice,
    from: &Vector3<f64>,
    to: &Vector3<f64>,
    lower: f64,
    upper: f64,
) -> Result<Vec<Vector3<f64>>, GeometryError> {
    let m = lattice.matrix();
    let base = to - from;
    Ok(translations(translation_bounds(lattice, upper)?)
        .map(|t| m * (base + t))
        .filter(|v| {
            let d = v.norm();
            d > ZERO_DISTANCE && d >= lower && d <= upper
        })
        .collect())
}

/// Shortest non-zero Cartesian vector from `from` to an image of `to`.
pub fn shortest_image(
    lattice: &Lattice,
    from: &Vector3<f64>,
    to: &Vector3<f64>,
) -> Result<Vector3<f64>, GeometryError> {
    let m = lattice.matrix();
    let wrapped = (to - from).map(|c| c - c.round());
    // Any image shorter than the wrapped one lies within one cell of it.
    let reach = (m * wrapped).norm().max(cell_heights(lattice).max());
    Ok(periodic_images(lattice, from, to, 0.0, reach)?
        .into_iter()
        .min_by(|a, b| a.norm().total_cmp(&b.norm()))
        .unwrap_or_else(|| m * wrapped))
}
