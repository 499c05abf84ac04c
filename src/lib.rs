pub mod aggregate;
pub mod error;
pub mod output;
pub mod params;
pub mod reference;
pub mod schemas;
pub mod segment;
pub mod spots;

pub use aggregate::{aggregate, CellMetadata, ExpressionMatrix};
pub use error::{Error, Result};
pub use params::{Extent, LabelerKind, MappingParams, QueryScaling, SegmentationParams};
pub use reference::{read_reference_csv, MappingResult, ReferenceAtlas, ReferenceMapper};
pub use segment::labeler::{Label, BACKGROUND_LABEL};
pub use segment::{segment_spots, Segmentation, SegmentationReport};
pub use spots::{read_spots_csv, Spot, SpotColumns, SpotTable};
