use crate::cluster::{order, Axis, Dendrogram, DistanceMetric, Linkage, OrderSpec};
use crate::matrix::Matrix;
use crate::scale::{scale, ScalingSpec};
use clap::Args;
use plotters::coord::Shift;
use plotters::prelude::*;
use std::error::Error;
use std::path::Path;
use std::time::Instant;

/// A single color in the output grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    fn to_plotters(self) -> RGBColor {
        RGBColor(self.r, self.g, self.b)
    }

    fn lerp(a: Rgb, b: Rgb, t: f64) -> Rgb {
        let t = t.clamp(0.0, 1.0);
        Rgb {
            r: (a.r as f64 + (b.r as f64 - a.r as f64) * t).round() as u8,
            g: (a.g as f64 + (b.g as f64 - a.g as f64) * t).round() as u8,
            b: (a.b as f64 + (b.b as f64 - a.b as f64) * t).round() as u8,
        }
    }
}

/// Parse a color name or "#RRGGBB" hex string.
pub fn parse_color(s: &str) -> Result<Rgb, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix('#') {
        if hex.len() != 6 {
            return Err(format!("Invalid hex color: {}", s));
        }
        let r = u8::from_str_radix(&hex[0..2], 16).map_err(|_| format!("Invalid hex color: {}", s))?;
        let g = u8::from_str_radix(&hex[2..4], 16).map_err(|_| format!("Invalid hex color: {}", s))?;
        let b = u8::from_str_radix(&hex[4..6], 16).map_err(|_| format!("Invalid hex color: {}", s))?;
        return Ok(Rgb { r, g, b });
    }
    match s.to_lowercase().as_str() {
        "black" => Ok(Rgb { r: 0, g: 0, b: 0 }),
        "white" => Ok(Rgb { r: 255, g: 255, b: 255 }),
        "red" => Ok(Rgb { r: 255, g: 0, b: 0 }),
        "green" => Ok(Rgb { r: 0, g: 255, b: 0 }),
        "blue" => Ok(Rgb { r: 0, g: 0, b: 255 }),
        "yellow" => Ok(Rgb { r: 255, g: 255, b: 0 }),
        "orange" => Ok(Rgb { r: 255, g: 165, b: 0 }),
        other => Err(format!(
            "Unknown color name: {}. Use black/white/red/green/blue/yellow/orange or #RRGGBB",
            other
        )),
    }
}

// 9-step diverging brewer palettes, low to high.
const RDYLGN_9: [Rgb; 9] = [
    Rgb { r: 215, g: 48, b: 39 },
    Rgb { r: 244, g: 109, b: 67 },
    Rgb { r: 253, g: 174, b: 97 },
    Rgb { r: 254, g: 224, b: 139 },
    Rgb { r: 255, g: 255, b: 191 },
    Rgb { r: 217, g: 239, b: 139 },
    Rgb { r: 166, g: 217, b: 106 },
    Rgb { r: 102, g: 189, b: 99 },
    Rgb { r: 26, g: 152, b: 80 },
];
const RDBU_9: [Rgb; 9] = [
    Rgb { r: 178, g: 24, b: 43 },
    Rgb { r: 214, g: 96, b: 77 },
    Rgb { r: 244, g: 165, b: 130 },
    Rgb { r: 253, g: 219, b: 199 },
    Rgb { r: 247, g: 247, b: 247 },
    Rgb { r: 209, g: 229, b: 240 },
    Rgb { r: 146, g: 197, b: 222 },
    Rgb { r: 67, g: 147, b: 195 },
    Rgb { r: 33, g: 102, b: 172 },
];

/// A discrete color scale over a numeric domain.
///
/// Values are clamped to the domain before lookup, so extreme values
/// saturate to the endpoint colors instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorScale {
    pub colors: Vec<Rgb>,
    pub domain: (f64, f64),
}

impl ColorScale {
    /// Interpolate along ordered anchor colors into `levels` discrete steps
    /// (e.g. green -> black -> red).
    pub fn from_anchors(anchors: &[Rgb], levels: usize, domain: (f64, f64)) -> ColorScale {
        let levels = levels.max(2);
        if anchors.len() < 2 {
            let color = anchors.first().copied().unwrap_or(Rgb { r: 0, g: 0, b: 0 });
            return ColorScale {
                colors: vec![color; levels],
                domain,
            };
        }
        let colors = (0..levels)
            .map(|k| {
                let t = k as f64 / (levels - 1) as f64;
                let pos = t * (anchors.len() - 1) as f64;
                let seg = (pos.floor() as usize).min(anchors.len() - 2);
                Rgb::lerp(anchors[seg], anchors[seg + 1], pos - seg as f64)
            })
            .collect();
        ColorScale { colors, domain }
    }

    /// A named brewer-style diverging palette resampled to `levels` steps.
    pub fn from_palette(
        name: &str,
        levels: usize,
        reversed: bool,
        domain: (f64, f64),
    ) -> Result<ColorScale, String> {
        let base: &[Rgb] = match name.to_lowercase().as_str() {
            "rdylgn" => &RDYLGN_9,
            "rdbu" => &RDBU_9,
            other => {
                return Err(format!(
                    "Unknown palette: {}. Supported: rdylgn, rdbu",
                    other
                ))
            }
        };
        let mut scale = ColorScale::from_anchors(base, levels, domain);
        if reversed {
            scale.colors.reverse();
        }
        Ok(scale)
    }

    pub fn levels(&self) -> usize {
        self.colors.len()
    }

    /// Map a value to its color, clamping to the domain first.
    pub fn color_for(&self, value: f64) -> Rgb {
        let (lo, hi) = self.domain;
        if hi <= lo {
            return self.colors[0];
        }
        let v = value.clamp(lo, hi);
        let t = (v - lo) / (hi - lo);
        let idx = ((t * self.levels() as f64) as usize).min(self.levels() - 1);
        self.colors[idx]
    }
}

/// The final pipeline output: the reordered matrix, its per-cell colors,
/// the scale, and the dendrograms to draw beside clustered axes.
#[derive(Debug, Clone)]
pub struct RenderedHeatmap {
    pub matrix: Matrix,
    pub grid: Vec<Vec<Rgb>>,
    pub scale: ColorScale,
    pub row_dendrogram: Option<Dendrogram>,
    pub col_dendrogram: Option<Dendrogram>,
}

/// Reindex the matrix by the axis orders and map every cell to a color.
///
/// Pure: no I/O, no hidden state. Out-of-domain values clamp to the scale's
/// endpoint colors; rendering never fails on data range.
pub fn render(
    matrix: &Matrix,
    row_order: &[usize],
    col_order: &[usize],
    color_scale: &ColorScale,
    row_dendrogram: Option<Dendrogram>,
    col_dendrogram: Option<Dendrogram>,
) -> RenderedHeatmap {
    let reordered = matrix.reorder(row_order, col_order);
    let grid = reordered
        .values
        .iter()
        .map(|row| row.iter().map(|&v| color_scale.color_for(v)).collect())
        .collect();
    RenderedHeatmap {
        matrix: reordered,
        grid,
        scale: color_scale.clone(),
        row_dendrogram,
        col_dendrogram,
    }
}

/// Observed finite min/max of the matrix, used as the scale domain when no
/// clamp pair is given.
pub fn value_range(matrix: &Matrix) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for row in &matrix.values {
        for &v in row {
            if v.is_finite() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
    }
    if lo > hi {
        (0.0, 1.0)
    } else {
        (lo, hi)
    }
}

// Fixed-margin layout constants; width is fixed, height grows with rows.
const TITLE_HEIGHT: i32 = 60;
const LABEL_WIDTH: i32 = 120;
const LABEL_HEIGHT: i32 = 30;
const DENDRO_BAND: i32 = 90;
const COLORBAR_WIDTH: i32 = 30;
const COLORBAR_MARGIN: i32 = 20;
const PLOT_MARGIN: i32 = 20;
const BASE_PLOT_WIDTH: i32 = 1200;
const MIN_CELL_HEIGHT: f64 = 15.0;

struct HeatmapLayout {
    total_width: u32,
    total_height: u32,
    plot_x: i32,
    plot_y: i32,
    plot_height: f64,
    cell_width: f64,
    cell_height: f64,
}

fn compute_layout(rendered: &RenderedHeatmap) -> HeatmapLayout {
    let n_rows = rendered.matrix.n_rows();
    let n_cols = rendered.matrix.n_cols();
    let row_band = if rendered.row_dendrogram.is_some() {
        DENDRO_BAND
    } else {
        0
    };
    let col_band = if rendered.col_dendrogram.is_some() {
        DENDRO_BAND
    } else {
        0
    };

    let plot_x = row_band + LABEL_WIDTH + PLOT_MARGIN;
    let plot_y = TITLE_HEIGHT + col_band + PLOT_MARGIN;
    let plot_width =
        (BASE_PLOT_WIDTH - plot_x - COLORBAR_WIDTH - COLORBAR_MARGIN - PLOT_MARGIN) as f64;
    let plot_height = (n_rows as f64 * MIN_CELL_HEIGHT).max(400.0);

    HeatmapLayout {
        total_width: BASE_PLOT_WIDTH as u32,
        total_height: (plot_y + plot_height as i32 + LABEL_HEIGHT + PLOT_MARGIN) as u32,
        plot_x,
        plot_y,
        plot_height,
        cell_width: plot_width / n_cols as f64,
        cell_height: plot_height / n_rows as f64,
    }
}

/// Draw a rendered heatmap to an SVG or PNG file, chosen by extension.
pub fn draw_heatmap(
    rendered: &RenderedHeatmap,
    output_path: &str,
    title: &str,
) -> Result<(), Box<dyn Error>> {
    let layout = compute_layout(rendered);
    if output_path.to_lowercase().ends_with(".png") {
        let root = BitMapBackend::new(output_path, (layout.total_width, layout.total_height))
            .into_drawing_area();
        draw_on(&root, rendered, &layout, title)?;
        root.present()?;
    } else {
        let root = SVGBackend::new(output_path, (layout.total_width, layout.total_height))
            .into_drawing_area();
        draw_on(&root, rendered, &layout, title)?;
        root.present()?;
    }
    Ok(())
}

fn draw_on<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    rendered: &RenderedHeatmap,
    layout: &HeatmapLayout,
    title: &str,
) -> Result<(), Box<dyn Error>>
where
    DB::ErrorType: 'static,
{
    let n_rows = rendered.matrix.n_rows();
    let n_cols = rendered.matrix.n_cols();

    root.fill(&WHITE)?;
    root.draw(&Text::new(
        title.to_string(),
        (layout.total_width as i32 / 2 - title.len() as i32 * 7, 30),
        ("sans-serif", 28).into_font().color(&BLACK),
    ))?;

    // Row labels (y-axis), thinned when crowded.
    let row_band = if rendered.row_dendrogram.is_some() {
        DENDRO_BAND
    } else {
        0
    };
    let row_interval = (n_rows / 60).max(1);
    for (r, label) in rendered.matrix.row_labels.iter().enumerate() {
        if r % row_interval != 0 && r != n_rows - 1 {
            continue;
        }
        let y = layout.plot_y + ((r as f64 + 0.5) * layout.cell_height) as i32;
        root.draw(&Text::new(
            label.clone(),
            (row_band + 5, y),
            ("sans-serif", 11).into_font().color(&BLACK),
        ))?;
    }

    // Column labels (x-axis), thinned when crowded.
    let col_interval = (n_cols / 20).max(1);
    for (c, label) in rendered.matrix.col_labels.iter().enumerate() {
        if c % col_interval != 0 && c != n_cols - 1 {
            continue;
        }
        let x = layout.plot_x + ((c as f64 + 0.5) * layout.cell_width) as i32;
        root.draw(&Text::new(
            label.clone(),
            (x, layout.plot_y + layout.plot_height as i32 + 15),
            ("sans-serif", 10).into_font().color(&BLACK),
        ))?;
    }

    // Heatmap cells.
    let mut progress = crate::progress::ProgressBar::new(n_rows);
    for (r, row) in rendered.grid.iter().enumerate() {
        for (c, color) in row.iter().enumerate() {
            let x0 = layout.plot_x as f64 + c as f64 * layout.cell_width;
            let y0 = layout.plot_y as f64 + r as f64 * layout.cell_height;
            let x1 = x0 + layout.cell_width;
            let y1 = y0 + layout.cell_height;
            root.draw(&Rectangle::new(
                [(x0 as i32, y0 as i32), (x1 as i32, y1 as i32)],
                color.to_plotters().filled(),
            ))?;
        }
        progress.update(r + 1)?;
    }
    progress.finish()?;

    // Dendrograms beside the clustered axes.
    if let Some(tree) = &rendered.row_dendrogram {
        draw_row_dendrogram(root, tree, layout)?;
    }
    if let Some(tree) = &rendered.col_dendrogram {
        draw_col_dendrogram(root, tree, layout)?;
    }

    // Colorbar: one band per discrete level, low at the bottom.
    let colorbar_x = layout.total_width as i32 - COLORBAR_WIDTH - COLORBAR_MARGIN;
    let levels = rendered.scale.levels();
    let band_height = layout.plot_height / levels as f64;
    for (i, color) in rendered.scale.colors.iter().enumerate() {
        let y1 = layout.plot_y as f64 + layout.plot_height - i as f64 * band_height;
        let y0 = y1 - band_height;
        root.draw(&Rectangle::new(
            [
                (colorbar_x, y0 as i32),
                (colorbar_x + COLORBAR_WIDTH, y1 as i32),
            ],
            color.to_plotters().filled(),
        ))?;
    }
    let (lo, hi) = rendered.scale.domain;
    root.draw(&Text::new(
        format!("{:.2}", hi),
        (colorbar_x, layout.plot_y - 8),
        ("sans-serif", 10).into_font().color(&BLACK),
    ))?;
    root.draw(&Text::new(
        format!("{:.2}", lo),
        (colorbar_x, layout.plot_y + layout.plot_height as i32 + 10),
        ("sans-serif", 10).into_font().color(&BLACK),
    ))?;

    Ok(())
}

/// Draw the row dendrogram in the left band. Returns nothing; recursion
/// happens in `draw_row_node`, which yields each subtree's row center.
fn draw_row_dendrogram<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    tree: &Dendrogram,
    layout: &HeatmapLayout,
) -> Result<(), Box<dyn Error>>
where
    DB::ErrorType: 'static,
{
    let max_height = tree.height().max(f64::MIN_POSITIVE);
    // x = band edge at height 0, moving left as merge height grows.
    let x_of = |h: f64| (DENDRO_BAND as f64 - 10.0) * (1.0 - h / max_height) + 5.0;
    let mut next_leaf = 0usize;
    draw_row_node(root, tree, layout, &x_of, &mut next_leaf)?;
    Ok(())
}

fn draw_row_node<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    node: &Dendrogram,
    layout: &HeatmapLayout,
    x_of: &dyn Fn(f64) -> f64,
    next_leaf: &mut usize,
) -> Result<f64, Box<dyn Error>>
where
    DB::ErrorType: 'static,
{
    match node {
        Dendrogram::Leaf(_) => {
            let y = layout.plot_y as f64 + (*next_leaf as f64 + 0.5) * layout.cell_height;
            *next_leaf += 1;
            Ok(y)
        }
        Dendrogram::Node {
            height,
            left,
            right,
        } => {
            let ly = draw_row_node(root, left, layout, x_of, next_leaf)?;
            let ry = draw_row_node(root, right, layout, x_of, next_leaf)?;
            let x = x_of(*height);
            let lx = x_of(left.height());
            let rx = x_of(right.height());
            let style = BLACK.stroke_width(1);
            root.draw(&PathElement::new(
                vec![(lx as i32, ly as i32), (x as i32, ly as i32)],
                style,
            ))?;
            root.draw(&PathElement::new(
                vec![(rx as i32, ry as i32), (x as i32, ry as i32)],
                style,
            ))?;
            root.draw(&PathElement::new(
                vec![(x as i32, ly as i32), (x as i32, ry as i32)],
                style,
            ))?;
            Ok((ly + ry) / 2.0)
        }
    }
}

/// Draw the column dendrogram in the top band, mirrored from the row case.
fn draw_col_dendrogram<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    tree: &Dendrogram,
    layout: &HeatmapLayout,
) -> Result<(), Box<dyn Error>>
where
    DB::ErrorType: 'static,
{
    let max_height = tree.height().max(f64::MIN_POSITIVE);
    let band_top = (TITLE_HEIGHT + 5) as f64;
    let y_of = |h: f64| band_top + (DENDRO_BAND as f64 - 10.0) * (1.0 - h / max_height);
    let mut next_leaf = 0usize;
    draw_col_node(root, tree, layout, &y_of, &mut next_leaf)?;
    Ok(())
}

fn draw_col_node<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    node: &Dendrogram,
    layout: &HeatmapLayout,
    y_of: &dyn Fn(f64) -> f64,
    next_leaf: &mut usize,
) -> Result<f64, Box<dyn Error>>
where
    DB::ErrorType: 'static,
{
    match node {
        Dendrogram::Leaf(_) => {
            let x = layout.plot_x as f64 + (*next_leaf as f64 + 0.5) * layout.cell_width;
            *next_leaf += 1;
            Ok(x)
        }
        Dendrogram::Node {
            height,
            left,
            right,
        } => {
            let lx = draw_col_node(root, left, layout, y_of, next_leaf)?;
            let rx = draw_col_node(root, right, layout, y_of, next_leaf)?;
            let y = y_of(*height);
            let ly = y_of(left.height());
            let ry = y_of(right.height());
            let style = BLACK.stroke_width(1);
            root.draw(&PathElement::new(
                vec![(lx as i32, ly as i32), (lx as i32, y as i32)],
                style,
            ))?;
            root.draw(&PathElement::new(
                vec![(rx as i32, ry as i32), (rx as i32, y as i32)],
                style,
            ))?;
            root.draw(&PathElement::new(
                vec![(lx as i32, y as i32), (rx as i32, y as i32)],
                style,
            ))?;
            Ok((lx + rx) / 2.0)
        }
    }
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Input delimited matrix file
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output image file (.svg or .png)
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Scaling method: none, row-zscore
    #[arg(long = "scaling", default_value = "none")]
    pub scaling: String,
    /// Row ordering: identity, cluster
    #[arg(long = "row-order", default_value = "identity")]
    pub row_order: String,
    /// Column ordering: identity, cluster
    #[arg(long = "col-order", default_value = "identity")]
    pub col_order: String,
    /// Distance metric for clustering: euclidean, manhattan
    #[arg(long = "metric", default_value = "euclidean")]
    pub metric: String,
    /// Linkage method for clustering: average, complete, ward
    #[arg(long = "linkage", default_value = "average")]
    pub linkage: String,
    /// Reverse the final row order (reconciles renderers that flip rows)
    #[arg(long = "reverse-rows", default_value_t = false)]
    pub reverse_rows: bool,
    /// Named palette: rdylgn, rdbu (overrides --anchors)
    #[arg(long = "palette")]
    pub palette: Option<String>,
    /// Reverse the palette direction
    #[arg(long = "palette-reversed", default_value_t = false)]
    pub palette_reversed: bool,
    /// Comma-separated anchor colors for interpolation
    #[arg(long = "anchors", default_value = "green,black,red")]
    pub anchors: String,
    /// Number of discrete color levels
    #[arg(long = "levels", default_value_t = 12)]
    pub levels: usize,
    /// Clamp values to LO,HI before color mapping (e.g. "-2,2")
    #[arg(long = "clamp")]
    pub clamp: Option<String>,
    /// Plot title
    #[arg(long = "title", default_value = "Heatmap")]
    pub title: String,
    /// Optional CSV of the scaled, reordered matrix
    #[arg(long = "matrix-out")]
    pub matrix_out: Option<String>,
    /// Log file path
    #[arg(long = "log")]
    pub log: Option<String>,
}

fn parse_order_spec(
    kind: &str,
    metric: DistanceMetric,
    linkage: Linkage,
) -> Result<OrderSpec, String> {
    match kind.to_lowercase().as_str() {
        "identity" => Ok(OrderSpec::Identity { reverse: false }),
        "cluster" => Ok(OrderSpec::Cluster { metric, linkage }),
        _ => Err(format!(
            "Unknown ordering: {}. Supported: identity, cluster",
            kind
        )),
    }
}

fn parse_clamp(s: &str) -> Result<(f64, f64), String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 2 {
        return Err(format!("Clamp must be LO,HI, got: {}", s));
    }
    let lo: f64 = parts[0]
        .trim()
        .parse()
        .map_err(|_| format!("Invalid clamp bound: {}", parts[0]))?;
    let hi: f64 = parts[1]
        .trim()
        .parse()
        .map_err(|_| format!("Invalid clamp bound: {}", parts[1]))?;
    if !(lo.is_finite() && hi.is_finite() && lo < hi) {
        return Err(format!("Clamp bounds must be finite with LO < HI: {}", s));
    }
    Ok((lo, hi))
}

fn validate_render_args(args: &RenderArgs) -> Result<(), Box<dyn Error>> {
    if args.input.trim().is_empty() {
        return Err("Error: Input file path cannot be empty".into());
    }
    if !Path::new(&args.input).exists() {
        return Err(format!("Error: Input file does not exist: {}", args.input).into());
    }
    let out = args.output.to_lowercase();
    if !(out.ends_with(".svg") || out.ends_with(".png")) {
        return Err(format!(
            "Error: Output file must end with .svg or .png: {}",
            args.output
        )
        .into());
    }
    if args.levels < 2 {
        return Err(format!("Error: Levels must be at least 2, current: {}", args.levels).into());
    }
    args.scaling.parse::<ScalingSpec>()?;
    args.metric.parse::<DistanceMetric>()?;
    args.linkage.parse::<Linkage>()?;
    if let Some(clamp) = &args.clamp {
        parse_clamp(clamp)?;
    }
    if args.palette.is_none() {
        let anchors: Vec<&str> = args.anchors.split(',').collect();
        if anchors.len() < 2 {
            return Err(format!(
                "Error: Need at least 2 anchor colors, got: {}",
                args.anchors
            )
            .into());
        }
        for a in anchors {
            parse_color(a)?;
        }
    }
    Ok(())
}

/// `render` subcommand: the full pipeline. Load, scale, order both axes,
/// color-map, and draw.
pub fn render_heatmap(args: &RenderArgs, logger: &mut crate::Logger) -> Result<(), Box<dyn Error>> {
    validate_render_args(args)?;

    let start_time = Instant::now();
    let scaling: ScalingSpec = args.scaling.parse()?;
    let metric: DistanceMetric = args.metric.parse()?;
    let linkage: Linkage = args.linkage.parse()?;
    let row_spec = parse_order_spec(&args.row_order, metric, linkage)?;
    let col_spec = parse_order_spec(&args.col_order, metric, linkage)?;

    logger.log("=== ExprHeat Render Function Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Runtime: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ))?;
    logger.log(&format!("Input File: {}", args.input))?;
    logger.log(&format!("Output File: {}", args.output))?;
    logger.log(&format!("Scaling: {:?}", scaling))?;
    logger.log(&format!("Row Order: {:?}", row_spec))?;
    logger.log(&format!("Column Order: {:?}", col_spec))?;
    logger.log(&format!("Color Levels: {}", args.levels))?;

    let matrix = Matrix::from_delimited(&args.input)?;
    logger.log(&format!(
        "Loaded matrix: {} rows x {} columns",
        matrix.n_rows(),
        matrix.n_cols()
    ))?;

    let scaled = scale(&matrix, scaling)?;

    let (mut row_order, row_tree) = order(&scaled, Axis::Rows, &row_spec)?;
    let (col_order, col_tree) = order(&scaled, Axis::Columns, &col_spec)?;
    if args.reverse_rows {
        row_order.reverse();
    }
    // A reversed row order would draw the dendrogram against the wrong leaf
    // positions; drop it rather than mirror it.
    let row_tree = if args.reverse_rows { None } else { row_tree };

    let domain = match &args.clamp {
        Some(clamp) => parse_clamp(clamp)?,
        None => value_range(&scaled),
    };
    let color_scale = match &args.palette {
        Some(name) => ColorScale::from_palette(name, args.levels, args.palette_reversed, domain)?,
        None => {
            let anchors: Vec<Rgb> = args
                .anchors
                .split(',')
                .map(parse_color)
                .collect::<Result<_, _>>()?;
            ColorScale::from_anchors(&anchors, args.levels, domain)
        }
    };
    logger.log(&format!("Scale Domain: [{:.4}, {:.4}]", domain.0, domain.1))?;

    let rendered = render(
        &scaled,
        &row_order,
        &col_order,
        &color_scale,
        row_tree,
        col_tree,
    );

    if let Some(matrix_out) = &args.matrix_out {
        rendered.matrix.write_csv(matrix_out)?;
        logger.log(&format!("Ordered matrix written to {}", matrix_out))?;
        println!("[Output] Ordered matrix: {}", matrix_out);
    }

    draw_heatmap(&rendered, &args.output, &args.title)?;
    logger.log(&format!("Heatmap written to {}", args.output))?;
    println!("[Output] Heatmap: {}", args.output);
    println!("{}", crate::progress::format_time_used(start_time.elapsed()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::ScalingSpec;

    fn matrix_of(rows: Vec<Vec<f64>>) -> Matrix {
        let n_cols = rows[0].len();
        Matrix {
            row_labels: (0..rows.len())
                .map(|i| char::from(b'A' + i as u8).to_string())
                .collect(),
            col_labels: (0..n_cols).map(|i| format!("s{}", i + 1)).collect(),
            values: rows,
        }
    }

    #[test]
    fn anchor_scale_hits_endpoints() {
        let green = parse_color("green").unwrap();
        let red = parse_color("red").unwrap();
        let black = parse_color("black").unwrap();
        let scale = ColorScale::from_anchors(&[green, black, red], 12, (-2.0, 2.0));
        assert_eq!(scale.levels(), 12);
        assert_eq!(scale.colors[0], green);
        assert_eq!(scale.colors[11], red);
    }

    #[test]
    fn out_of_range_values_clamp_to_endpoint_colors() {
        let green = parse_color("green").unwrap();
        let red = parse_color("red").unwrap();
        let scale = ColorScale::from_anchors(&[green, red], 12, (-2.0, 2.0));
        assert_eq!(scale.color_for(1000.0), scale.color_for(2.0));
        assert_eq!(scale.color_for(-999.0), scale.color_for(-2.0));
    }

    #[test]
    fn palette_reversed_flips_direction() {
        let fwd = ColorScale::from_palette("rdylgn", 9, false, (0.0, 1.0)).unwrap();
        let rev = ColorScale::from_palette("rdylgn", 9, true, (0.0, 1.0)).unwrap();
        assert_eq!(fwd.colors[0], rev.colors[8]);
        assert_eq!(fwd.colors[8], rev.colors[0]);
    }

    #[test]
    fn unknown_palette_is_rejected() {
        assert!(ColorScale::from_palette("magma", 9, false, (0.0, 1.0)).is_err());
    }

    #[test]
    fn hex_colors_parse() {
        assert_eq!(
            parse_color("#1a9850").unwrap(),
            Rgb {
                r: 26,
                g: 152,
                b: 80
            }
        );
        assert!(parse_color("#12345").is_err());
        assert!(parse_color("mauve").is_err());
    }

    #[test]
    fn identity_render_preserves_arrangement() {
        let m = matrix_of(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let scale = ColorScale::from_anchors(
            &[parse_color("green").unwrap(), parse_color("red").unwrap()],
            12,
            value_range(&m),
        );
        let out = render(&m, &[0, 1], &[0, 1], &scale, None, None);
        assert_eq!(out.matrix, m);
    }

    #[test]
    fn render_applies_both_permutations() {
        let m = matrix_of(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let scale = ColorScale::from_anchors(
            &[parse_color("green").unwrap(), parse_color("red").unwrap()],
            2,
            (1.0, 4.0),
        );
        let out = render(&m, &[1, 0], &[1, 0], &scale, None, None);
        assert_eq!(out.matrix.values[0], vec![4.0, 3.0]);
        assert_eq!(out.matrix.row_labels, vec!["B", "A"]);
        assert_eq!(out.grid[0][0], scale.color_for(4.0));
    }

    #[test]
    fn end_to_end_scaled_identity_heatmap() {
        // Five labeled rows, five samples, z-scored, identity orders, a
        // 12-level green-to-red scale.
        let m = matrix_of(vec![
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
            vec![5.0, 4.0, 3.0, 2.0, 1.0],
            vec![2.0, 2.0, 2.0, 2.0, 2.0],
            vec![0.0, 10.0, 0.0, 10.0, 0.0],
            vec![-3.0, -1.0, 0.0, 1.0, 3.0],
        ]);
        let scaled = crate::scale::scale(&m, ScalingSpec::RowZScore).unwrap();
        let scale = ColorScale::from_anchors(
            &[
                parse_color("green").unwrap(),
                parse_color("black").unwrap(),
                parse_color("red").unwrap(),
            ],
            12,
            (-2.0, 2.0),
        );
        let identity: Vec<usize> = (0..5).collect();
        let out = render(&scaled, &identity, &identity, &scale, None, None);
        assert_eq!(out.matrix.n_rows(), 5);
        assert_eq!(out.matrix.n_cols(), 5);
        assert_eq!(out.matrix.row_labels, vec!["A", "B", "C", "D", "E"]);
        assert_eq!(out.matrix.col_labels, vec!["s1", "s2", "s3", "s4", "s5"]);
        for row in &out.grid {
            for cell in row {
                assert!(scale.colors.contains(cell));
            }
        }
    }

    #[test]
    fn degenerate_domain_uses_first_color() {
        let scale = ColorScale::from_anchors(
            &[parse_color("green").unwrap(), parse_color("red").unwrap()],
            4,
            (1.0, 1.0),
        );
        assert_eq!(scale.color_for(1.0), scale.colors[0]);
    }

    #[test]
    fn clamp_string_parses() {
        assert_eq!(parse_clamp("-2,2").unwrap(), (-2.0, 2.0));
        assert!(parse_clamp("2,-2").is_err());
        assert!(parse_clamp("1").is_err());
    }
}
