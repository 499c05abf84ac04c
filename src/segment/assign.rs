use super::debris::CellLabels;
use super::labeler::{Label, BACKGROUND_LABEL};
use super::raster::RasterGrid;

/// Cell id of every spot, read off the final label of its grid cell through
/// the raster's inverse index. Spots on background, or outside the grid,
/// get 0.
pub fn assign_spots(grid: &RasterGrid, cells: &CellLabels, nspots: usize) -> Vec<Label> {
    let mut assignments = vec![BACKGROUND_LABEL; nspots];
    let labels = cells.labels();
    let (nx, ny) = grid.shape();
    assert_eq!((nx, ny), cells.dim());

    for i in 0..nx {
        for j in 0..ny {
            let label = labels[[i, j]];
            if label == BACKGROUND_LABEL {
                continue;
            }
            for &spot in grid.spots_in(i, j) {
                assignments[spot] = label;
            }
        }
    }

    assignments
}
