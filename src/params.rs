use clap::ValueEnum;

use crate::error::{Error, Result};

/// Which region labeling strategy turns the binary mask into a label image.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LabelerKind {
    /// Marker-controlled watershed on the distance map.
    Watershed,
    /// Flood-fill connected components of the mask.
    Components,
}

/// Physical bounds covered by the raster grid.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Extent {
    pub xmin: f32,
    pub xmax: f32,
    pub ymin: f32,
    pub ymax: f32,
}

impl Extent {
    pub fn new(xmin: f32, xmax: f32, ymin: f32, ymax: f32) -> Self {
        Extent {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }
}

// Every tunable of the spot -> cell pipeline. Passed explicitly to each stage.
#[derive(Clone, Debug)]
pub struct SegmentationParams {
    pub nx: usize,
    pub ny: usize,

    // fixed field of view; when None a square-pixel grid centered on the
    // spot coordinate span is used
    pub extent: Option<Extent>,

    // floor on the automatic pixel edge, in coordinate units
    pub min_pixel_size: f32,

    // outlier ceiling applied before rescaling to [0, 1]
    pub max_value: Option<f32>,

    // gaussian blur spread, in pixels
    pub σ: f32,

    // adaptive threshold: disc radius (pixels) and offset above the local mean
    pub threshold_radius: usize,
    pub threshold_offset: f32,

    pub labeler: LabelerKind,
    pub watershed_tolerance: f32,
    pub watershed_ext: usize,

    // debris cutoff in pixels
    pub min_region_size: usize,

    // converts spot coordinate units to output units
    pub coordinate_scale: f32,

    pub layer: u32,
    pub experiment: String,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        SegmentationParams {
            nx: 1000,
            ny: 1000,
            extent: None,
            min_pixel_size: 1.0,
            max_value: None,
            σ: 1.0,
            threshold_radius: 5,
            threshold_offset: 0.02,
            labeler: LabelerKind::Watershed,
            watershed_tolerance: 1.0,
            watershed_ext: 1,
            min_region_size: 10,
            coordinate_scale: 1.0,
            layer: 1,
            experiment: String::from("experiment"),
        }
    }
}

impl SegmentationParams {
    pub fn validate(&self) -> Result<()> {
        if self.nx == 0 {
            return Err(Error::config("nx", self.nx, "grid width must be positive"));
        }
        if self.ny == 0 {
            return Err(Error::config("ny", self.ny, "grid height must be positive"));
        }
        if !(self.min_pixel_size.is_finite() && self.min_pixel_size > 0.0) {
            return Err(Error::config(
                "min_pixel_size",
                self.min_pixel_size,
                "pixel size floor must be positive",
            ));
        }
        if !(self.σ.is_finite() && self.σ > 0.0) {
            return Err(Error::config("sigma", self.σ, "blur spread must be positive"));
        }
        if self.threshold_radius == 0 {
            return Err(Error::config(
                "threshold_radius",
                self.threshold_radius,
                "kernel radius must be positive",
            ));
        }
        if !self.threshold_offset.is_finite() {
            return Err(Error::config(
                "threshold_offset",
                self.threshold_offset,
                "offset must be finite",
            ));
        }
        if !(self.watershed_tolerance.is_finite() && self.watershed_tolerance >= 0.0) {
            return Err(Error::config(
                "watershed_tolerance",
                self.watershed_tolerance,
                "tolerance must be non-negative",
            ));
        }
        if !(self.coordinate_scale.is_finite() && self.coordinate_scale > 0.0) {
            return Err(Error::config(
                "coordinate_scale",
                self.coordinate_scale,
                "scale factor must be positive",
            ));
        }
        if let Some(max_value) = self.max_value {
            if !(max_value > 0.0) {
                return Err(Error::config(
                    "max_value",
                    max_value,
                    "clip ceiling must be positive",
                ));
            }
        }
        if let Some(extent) = &self.extent {
            let finite = [extent.xmin, extent.xmax, extent.ymin, extent.ymax]
                .iter()
                .all(|v| v.is_finite());
            if !finite || extent.width() <= 0.0 || extent.height() <= 0.0 {
                return Err(Error::config(
                    "extent",
                    format!("{:?}", extent),
                    "extent must be finite with max > min on both axes",
                ));
            }
        }

        Ok(())
    }
}

/// How query expression is brought onto the reference's dynamic range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum QueryScaling {
    /// Correlate raw counts.
    None,
    /// Rescale each cell over the shared genes so its total matches the
    /// atlas's mean total, keeping the cell's relative profile.
    LibrarySize,
}

#[derive(Clone, Debug)]
pub struct MappingParams {
    pub scaling: QueryScaling,
    // ranked alternatives kept after the best match
    pub nalternatives: usize,
}

impl Default for MappingParams {
    fn default() -> Self {
        MappingParams {
            scaling: QueryScaling::LibrarySize,
            nalternatives: 5,
        }
    }
}
