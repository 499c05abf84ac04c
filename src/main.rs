use anyhow::{bail, Context};
use clap::Parser;
use flexi_logger::{Duplicate, FileSpec, Logger};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rayon::current_num_threads;
use regex::Regex;

use spotseg::output::{
    run_summary, write_cell_metadata, write_expression_matrix, write_mapping_results,
    write_run_summary, write_spot_assignments,
};
use spotseg::schemas::OutputFormat;
use spotseg::{
    aggregate, read_reference_csv, read_spots_csv, segment_spots, Extent, LabelerKind,
    MappingParams, QueryScaling, ReferenceMapper, SegmentationParams, SpotColumns,
};

#[derive(Parser, Debug)]
#[command(name = "spotseg")]
#[command(about = "Segment spatial transcriptomics spots into cells and assign cell types.")]
struct Args {
    spots_csv: String,

    // mean expression per cell type; mapping is skipped without it
    #[arg(long, default_value = None)]
    reference_csv: Option<String>,

    #[arg(long, default_value_t = false)]
    xenium: bool,

    #[arg(long, default_value_t = false)]
    cosmx: bool,

    #[arg(long, default_value_t = false)]
    merfish: bool,

    #[arg(long, default_value = None)]
    gene_column: Option<String>,

    #[arg(short, long, default_value = None)]
    x_column: Option<String>,

    #[arg(short, long, default_value = None)]
    y_column: Option<String>,

    #[arg(short, long, default_value = None)]
    z_column: Option<String>,

    #[arg(long, default_value = None)]
    experiment_column: Option<String>,

    #[arg(long, default_value = None)]
    weight_column: Option<String>,

    #[arg(long, default_value_t = false)]
    ignore_z_coord: bool,

    // spots whose gene matches are dropped before segmenting
    #[arg(long, default_value = None)]
    excluded_genes: Option<String>,

    #[arg(long, default_value_t = 1000)]
    nx: usize,

    #[arg(long, default_value_t = 1000)]
    ny: usize,

    // xmin, xmax, ymin, ymax
    #[arg(long, num_args = 4, value_delimiter = ',', allow_negative_numbers = true)]
    extent: Option<Vec<f32>>,

    // floor on the automatic pixel edge, in coordinate units
    #[arg(long, default_value_t = 1.0)]
    min_pixel_size: f32,

    #[arg(long, default_value = None)]
    max_value: Option<f32>,

    #[arg(long, default_value_t = 1.0)]
    sigma: f32,

    #[arg(long, default_value_t = 5)]
    threshold_radius: usize,

    #[arg(long, default_value_t = 0.02, allow_negative_numbers = true)]
    threshold_offset: f32,

    #[arg(long, value_enum, default_value_t = LabelerKind::Watershed)]
    labeler: LabelerKind,

    #[arg(long, default_value_t = 1.0)]
    watershed_tolerance: f32,

    #[arg(long, default_value_t = 1)]
    watershed_ext: usize,

    #[arg(long, default_value_t = 10)]
    min_region_size: usize,

    #[arg(long, default_value_t = 1.0)]
    coordinate_scale: f32,

    #[arg(long, default_value_t = 1)]
    layer: u32,

    // used for cells whose spots carry no experiment label
    #[arg(long, default_value = "experiment")]
    experiment: String,

    #[arg(long, value_enum, default_value_t = QueryScaling::LibrarySize)]
    query_scaling: QueryScaling,

    #[arg(long, default_value_t = 5)]
    nalternatives: usize,

    #[arg(long, default_value = "spot-assignments.csv.gz")]
    output_spots: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_spots_fmt: OutputFormat,

    #[arg(long, default_value = "expression.csv.gz")]
    output_expression: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_expression_fmt: OutputFormat,

    #[arg(long, default_value = "cell-metadata.csv.gz")]
    output_cell_metadata: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_cell_metadata_fmt: OutputFormat,

    #[arg(long, default_value = "cell-types.csv.gz")]
    output_cell_types: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_cell_types_fmt: OutputFormat,

    #[arg(long, default_value = None)]
    output_summary: Option<String>,

    #[arg(short = 't', long, default_value = None)]
    nthreads: Option<usize>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value = None)]
    log_file: Option<String>,
}

fn set_xenium_presets(args: &mut Args) {
    args.gene_column.get_or_insert(String::from("feature_name"));
    args.x_column.get_or_insert(String::from("x_location"));
    args.y_column.get_or_insert(String::from("y_location"));
    args.z_column.get_or_insert(String::from("z_location"));
}

fn set_cosmx_presets(args: &mut Args) {
    args.gene_column.get_or_insert(String::from("target"));
    args.x_column.get_or_insert(String::from("x_global_px"));
    args.y_column.get_or_insert(String::from("y_global_px"));
    args.z_column.get_or_insert(String::from("z"));
    args.experiment_column.get_or_insert(String::from("fov"));
}

fn set_merfish_presets(args: &mut Args) {
    args.gene_column.get_or_insert(String::from("gene"));
    args.x_column.get_or_insert(String::from("x"));
    args.y_column.get_or_insert(String::from("y"));
    args.z_column.get_or_insert(String::from("z"));
}

fn spot_columns(args: &Args) -> SpotColumns {
    let defaults = SpotColumns::default();
    SpotColumns {
        gene: args.gene_column.clone().unwrap_or(defaults.gene),
        x: args.x_column.clone().unwrap_or(defaults.x),
        y: args.y_column.clone().unwrap_or(defaults.y),
        z: if args.ignore_z_coord {
            None
        } else {
            args.z_column.clone()
        },
        experiment: args.experiment_column.clone(),
        weight: args.weight_column.clone(),
    }
}

fn segmentation_params(args: &Args) -> SegmentationParams {
    SegmentationParams {
        nx: args.nx,
        ny: args.ny,
        extent: args
            .extent
            .as_ref()
            .map(|e| Extent::new(e[0], e[1], e[2], e[3])),
        min_pixel_size: args.min_pixel_size,
        max_value: args.max_value,
        σ: args.sigma,
        threshold_radius: args.threshold_radius,
        threshold_offset: args.threshold_offset,
        labeler: args.labeler,
        watershed_tolerance: args.watershed_tolerance,
        watershed_ext: args.watershed_ext,
        min_region_size: args.min_region_size,
        coordinate_scale: args.coordinate_scale,
        layer: args.layer,
        experiment: args.experiment.clone(),
    }
}

fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();

    let logger = Logger::try_with_env_or_str(&args.log_level)?;
    let _logger = match &args.log_file {
        Some(log_file) => logger
            .log_to_file(FileSpec::try_from(log_file)?)
            .duplicate_to_stderr(Duplicate::Warn)
            .start()?,
        None => logger.log_to_stderr().start()?,
    };

    if let Some(nthreads) = args.nthreads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build_global()?;
    }
    info!("Using {} threads", current_num_threads());

    if (args.xenium as u8) + (args.cosmx as u8) + (args.merfish as u8) > 1 {
        bail!("At most one of --xenium, --cosmx, --merfish can be set");
    }
    if args.xenium {
        set_xenium_presets(&mut args);
    }
    if args.cosmx {
        set_cosmx_presets(&mut args);
    }
    if args.merfish {
        set_merfish_presets(&mut args);
    }

    let excluded_genes = args
        .excluded_genes
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid --excluded-genes pattern")?;

    let params = segmentation_params(&args);
    params.validate()?;

    // read the atlas up front so a bad file fails before segmenting
    let reference = match &args.reference_csv {
        Some(path) => Some(
            read_reference_csv(path)
                .with_context(|| format!("reading reference atlas {}", path))?,
        ),
        None => None,
    };

    let table = read_spots_csv(&args.spots_csv, &spot_columns(&args), &excluded_genes)
        .with_context(|| format!("reading spots from {}", args.spots_csv))?;
    if table.is_empty() {
        warn!("No spots read from {}", args.spots_csv);
    }

    let seg = segment_spots(&table.spots, &params)?;
    if seg.report.degenerate {
        warn!("No cells found; output tables will be empty");
    }

    let (matrix, metadata) = aggregate(&table, &seg, &params);

    let results = match reference {
        Some(atlas) => {
            let mapper = ReferenceMapper::new(
                atlas,
                MappingParams {
                    scaling: args.query_scaling,
                    nalternatives: args.nalternatives,
                },
            );
            let progress = ProgressBar::new(matrix.ncells() as u64);
            progress.set_style(ProgressStyle::with_template(
                "Mapping cells {bar:40} {pos}/{len} [{elapsed_precise}]",
            )?);
            let results = mapper.map_matrix(&matrix, Some(&progress))?;
            progress.finish_and_clear();
            Some(results)
        }
        None => None,
    };

    if let Some(path) = &args.output_spots {
        write_spot_assignments(path, args.output_spots_fmt, &table, &seg.assignments)?;
    }
    if let Some(path) = &args.output_expression {
        write_expression_matrix(path, args.output_expression_fmt, &matrix)?;
    }
    if let Some(path) = &args.output_cell_metadata {
        write_cell_metadata(path, args.output_cell_metadata_fmt, &metadata)?;
    }
    if let (Some(path), Some(results)) = (&args.output_cell_types, &results) {
        write_mapping_results(path, args.output_cell_types_fmt, results, args.nalternatives)?;
    }
    if let Some(path) = &args.output_summary {
        let summary = run_summary(&params, &seg.report, results.as_deref());
        write_run_summary(path, &summary)?;
    }

    Ok(())
}
