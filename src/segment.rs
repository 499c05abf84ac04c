pub mod assign;
pub mod debris;
pub mod distance;
pub mod labeler;
pub mod normalize;
pub mod raster;
pub mod smooth;
pub mod threshold;

use log::{debug, info, warn};

use crate::error::Result;
use crate::params::SegmentationParams;
use crate::spots::Spot;
use assign::assign_spots;
use debris::{filter_debris, CellLabels};
use distance::distance_map;
use labeler::{labeler_from_params, Label, BACKGROUND_LABEL};
use normalize::normalize;
use raster::{rasterize, RasterGrid};
use smooth::gaussian_blur;
use threshold::adaptive_threshold;

/// Counts gathered while segmenting, written out alongside the tables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentationReport {
    pub nspots: usize,
    pub nout_of_bounds: usize,
    pub nforeground_pixels: usize,
    pub nregions_labeled: usize,
    pub nregions_removed: usize,
    pub nfilled_pixels: usize,
    pub ncells: usize,
    pub nunassigned_spots: usize,

    // no region survived the debris filter
    pub degenerate: bool,
}

pub struct Segmentation {
    pub grid: RasterGrid,
    pub cells: CellLabels,

    // cell id per input spot, 0 when unassigned
    pub assignments: Vec<Label>,

    pub report: SegmentationReport,
}

impl Segmentation {
    pub fn cell_ids(&self) -> Vec<Label> {
        self.cells.cell_ids()
    }
}

// Rasterize -> normalize -> blur -> threshold -> label -> filter -> assign.
pub fn segment_spots(spots: &[Spot], params: &SegmentationParams) -> Result<Segmentation> {
    params.validate()?;
    debug!("Segmentation parameters: {:?}", params);

    let grid = rasterize(spots, params)?;

    let normalized = normalize(&grid.values, params.max_value);
    let smoothed = gaussian_blur(&normalized, params.σ);
    drop(normalized);

    let mask = adaptive_threshold(&smoothed, params.threshold_radius, params.threshold_offset);
    drop(smoothed);
    info!(
        "Thresholding kept {} of {} pixels as foreground",
        mask.nforeground(),
        mask.mask.len()
    );

    let distance = distance_map(&mask);
    let labeler = labeler_from_params(params);
    let image = labeler.label(&mask, &distance);
    let nregions_labeled = image.nregions();
    info!(
        "{:?} labeling found {} candidate regions",
        params.labeler, nregions_labeled
    );

    let (cells, stats) = filter_debris(image, params.min_region_size);

    let assignments = assign_spots(&grid, &cells, spots.len());
    let nunassigned_spots = assignments
        .iter()
        .filter(|&&cell| cell == BACKGROUND_LABEL)
        .count();

    let degenerate = stats.nkept == 0;
    if degenerate {
        warn!(
            "No regions survived debris filtering (min region size {}); every spot is unassigned",
            params.min_region_size
        );
    } else {
        info!(
            "Assigned {} of {} spots to {} cells",
            spots.len() - nunassigned_spots,
            spots.len(),
            stats.nkept
        );
    }

    let report = SegmentationReport {
        nspots: spots.len(),
        nout_of_bounds: grid.nout_of_bounds(),
        nforeground_pixels: mask.nforeground(),
        nregions_labeled,
        nregions_removed: stats.nremoved,
        nfilled_pixels: stats.nfilled_pixels,
        ncells: stats.nkept,
        nunassigned_spots,
        degenerate,
    };

    Ok(Segmentation {
        grid,
        cells,
        assignments,
        report,
    })
}
