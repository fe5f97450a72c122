use crate::error::HeatmapError;
use crate::matrix::Matrix;
use crate::scale::{scale, ScalingSpec};
use clap::Args;
use rayon::prelude::*;
use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// Which side of the matrix an ordering applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Rows,
    Columns,
}

impl std::str::FromStr for Axis {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rows" | "row" => Ok(Axis::Rows),
            "columns" | "cols" | "col" => Ok(Axis::Columns),
            _ => Err(format!("Unknown axis: {}. Supported: rows, columns", s)),
        }
    }
}

/// Pairwise distance between two item vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Euclidean,
    Manhattan,
}

impl DistanceMetric {
    pub fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f64>()
                .sqrt(),
            DistanceMetric::Manhattan => {
                a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
            }
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "manhattan" | "cityblock" => Ok(DistanceMetric::Manhattan),
            _ => Err(format!(
                "Unknown distance metric: {}. Supported: euclidean, manhattan",
                s
            )),
        }
    }
}

/// Inter-cluster distance rule for agglomerative merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Mean of all pairwise member distances.
    Average,
    /// Maximum pairwise member distance.
    Complete,
    /// Ward's minimum-variance criterion, centroid form:
    /// sqrt(2|A||B|/(|A|+|B|)) * ||centroid_A - centroid_B||.
    Ward,
}

impl std::str::FromStr for Linkage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "average" | "avg" => Ok(Linkage::Average),
            "complete" | "max" => Ok(Linkage::Complete),
            "ward" => Ok(Linkage::Ward),
            _ => Err(format!(
                "Unknown linkage method: {}. Supported: average, complete, ward",
                s
            )),
        }
    }
}

/// Per-axis ordering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSpec {
    /// Preserve input order, optionally reversed.
    Identity { reverse: bool },
    /// Agglomerative hierarchical clustering; the dendrogram's left-to-right
    /// leaf order becomes the axis order.
    Cluster {
        metric: DistanceMetric,
        linkage: Linkage,
    },
}

/// Binary merge tree from hierarchical clustering.
///
/// Leaves carry original axis indices; each internal node owns both subtrees
/// and records the inter-cluster distance at which they merged.
#[derive(Debug, Clone, PartialEq)]
pub enum Dendrogram {
    Leaf(usize),
    Node {
        height: f64,
        left: Box<Dendrogram>,
        right: Box<Dendrogram>,
    },
}

impl Dendrogram {
    /// Merge height of this node (0 for a leaf).
    pub fn height(&self) -> f64 {
        match self {
            Dendrogram::Leaf(_) => 0.0,
            Dendrogram::Node { height, .. } => *height,
        }
    }

    pub fn n_leaves(&self) -> usize {
        match self {
            Dendrogram::Leaf(_) => 1,
            Dendrogram::Node { left, right, .. } => left.n_leaves() + right.n_leaves(),
        }
    }

    /// Smallest original index under this subtree. Used to fix child order so
    /// leaf order is reproducible.
    fn min_leaf(&self) -> usize {
        match self {
            Dendrogram::Leaf(i) => *i,
            Dendrogram::Node { left, right, .. } => left.min_leaf().min(right.min_leaf()),
        }
    }

    /// Leaf indices read left to right; this is the axis order when
    /// clustering was requested.
    pub fn leaves(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.n_leaves());
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<usize>) {
        match self {
            Dendrogram::Leaf(i) => out.push(*i),
            Dendrogram::Node { left, right, .. } => {
                left.collect_leaves(out);
                right.collect_leaves(out);
            }
        }
    }
}

/// One step of the merge history, for the `cluster` subcommand's output.
#[derive(Debug, Clone)]
pub struct Merge {
    pub height: f64,
    pub members: Vec<usize>,
}

struct ClusterState {
    members: Vec<usize>,
    sums: Vec<f64>,
    tree: Dendrogram,
}

fn linkage_distance(
    linkage: Linkage,
    a: &ClusterState,
    b: &ClusterState,
    distances: &[Vec<f64>],
) -> f64 {
    match linkage {
        Linkage::Average => {
            let mut total = 0.0;
            for &i in &a.members {
                for &j in &b.members {
                    total += distances[i][j];
                }
            }
            total / (a.members.len() * b.members.len()) as f64
        }
        Linkage::Complete => {
            let mut max = 0.0f64;
            for &i in &a.members {
                for &j in &b.members {
                    max = max.max(distances[i][j]);
                }
            }
            max
        }
        Linkage::Ward => {
            let na = a.members.len() as f64;
            let nb = b.members.len() as f64;
            let centroid_gap: f64 = a
                .sums
                .iter()
                .zip(b.sums.iter())
                .map(|(sa, sb)| {
                    let d = sa / na - sb / nb;
                    d * d
                })
                .sum::<f64>()
                .sqrt();
            (2.0 * na * nb / (na + nb)).sqrt() * centroid_gap
        }
    }
}

/// Agglomerative hierarchical clustering over the item vectors.
///
/// Repeatedly merges the two closest clusters under the linkage until one
/// remains. Ties between equally close pairs break to the lowest (i, j) pair
/// in scan order, and the subtree holding the smaller minimum original index
/// goes on the left of each merge node, so the result is reproducible.
fn cluster_items(
    items: &[Vec<f64>],
    metric: DistanceMetric,
    linkage: Linkage,
) -> (Dendrogram, Vec<Merge>) {
    let n = items.len();
    debug_assert!(n >= 2);

    // Pairwise distances over the original items. Row-parallel; each row is
    // computed independently so the result does not depend on scheduling.
    let distances: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .map(|j| metric.distance(&items[i], &items[j]))
                .collect()
        })
        .collect();

    let mut clusters: Vec<ClusterState> = (0..n)
        .map(|i| ClusterState {
            members: vec![i],
            sums: items[i].clone(),
            tree: Dendrogram::Leaf(i),
        })
        .collect();
    let mut merges = Vec::with_capacity(n - 1);

    while clusters.len() > 1 {
        let mut min_dist = f64::INFINITY;
        let mut merge_i = 0;
        let mut merge_j = 1;
        for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                let d = linkage_distance(linkage, &clusters[i], &clusters[j], &distances);
                // Strict < keeps the earliest pair on ties.
                if d < min_dist {
                    min_dist = d;
                    merge_i = i;
                    merge_j = j;
                }
            }
        }

        let right = clusters.remove(merge_j);
        let left = clusters.remove(merge_i);

        let mut members = left.members.clone();
        members.extend_from_slice(&right.members);
        let sums: Vec<f64> = left
            .sums
            .iter()
            .zip(right.sums.iter())
            .map(|(a, b)| a + b)
            .collect();

        let (lo, hi) = if left.tree.min_leaf() <= right.tree.min_leaf() {
            (left.tree, right.tree)
        } else {
            (right.tree, left.tree)
        };
        let tree = Dendrogram::Node {
            height: min_dist,
            left: Box::new(lo),
            right: Box::new(hi),
        };

        merges.push(Merge {
            height: min_dist,
            members: members.clone(),
        });
        clusters.insert(
            merge_i,
            ClusterState {
                members,
                sums,
                tree,
            },
        );
    }

    let root = clusters.pop().expect("one cluster remains").tree;
    (root, merges)
}

/// Compute the ordering for one axis of the matrix.
///
/// Identity returns `0..n-1` (reversed when asked) with no dendrogram.
/// Cluster returns the dendrogram's leaf order plus the tree itself. Fails
/// with `DegenerateInput` when the axis has fewer than two items to cluster.
pub fn order(
    matrix: &Matrix,
    axis: Axis,
    spec: &OrderSpec,
) -> Result<(Vec<usize>, Option<Dendrogram>), HeatmapError> {
    let n = match axis {
        Axis::Rows => matrix.n_rows(),
        Axis::Columns => matrix.n_cols(),
    };
    match spec {
        OrderSpec::Identity { reverse } => {
            let mut perm: Vec<usize> = (0..n).collect();
            if *reverse {
                perm.reverse();
            }
            Ok((perm, None))
        }
        OrderSpec::Cluster { metric, linkage } => {
            if n < 2 {
                return Err(HeatmapError::DegenerateInput {
                    axis: match axis {
                        Axis::Rows => "rows",
                        Axis::Columns => "columns",
                    },
                    found: n,
                });
            }
            let items: Vec<Vec<f64>> = match axis {
                Axis::Rows => matrix.values.clone(),
                Axis::Columns => (0..n).map(|c| matrix.column(c)).collect(),
            };
            let (tree, _) = cluster_items(&items, *metric, *linkage);
            Ok((tree.leaves(), Some(tree)))
        }
    }
}

#[derive(Args, Debug)]
pub struct ClusterArgs {
    /// Input delimited matrix file
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output CSV with one line per position in the computed order
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Axis to cluster: rows, columns
    #[arg(short = 'a', long = "axis", default_value = "rows")]
    pub axis: String,
    /// Distance metric: euclidean, manhattan
    #[arg(long = "metric", default_value = "euclidean")]
    pub metric: String,
    /// Linkage method: average, complete, ward
    #[arg(long = "linkage", default_value = "average")]
    pub linkage: String,
    /// Scaling applied before clustering: none, row-zscore
    #[arg(long = "scaling", default_value = "none")]
    pub scaling: String,
    /// Optional CSV recording the merge history (step, height, members)
    #[arg(long = "merges")]
    pub merges: Option<String>,
    /// Log file path
    #[arg(long = "log")]
    pub log: Option<String>,
}

fn validate_cluster_args(args: &ClusterArgs) -> Result<(), Box<dyn Error>> {
    if args.input.trim().is_empty() {
        return Err("Error: Input file path cannot be empty".into());
    }
    if !Path::new(&args.input).exists() {
        return Err(format!("Error: Input file does not exist: {}", args.input).into());
    }
    if args.output.trim().is_empty() {
        return Err("Error: Output file path cannot be empty".into());
    }
    args.axis.parse::<Axis>()?;
    args.metric.parse::<DistanceMetric>()?;
    args.linkage.parse::<Linkage>()?;
    args.scaling.parse::<ScalingSpec>()?;
    Ok(())
}

/// `cluster` subcommand: compute one axis ordering and write it (and
/// optionally the merge history) as CSV.
pub fn cluster_csv(args: &ClusterArgs, logger: &mut crate::Logger) -> Result<(), Box<dyn Error>> {
    validate_cluster_args(args)?;

    let start_time = Instant::now();
    let axis: Axis = args.axis.parse()?;
    let metric: DistanceMetric = args.metric.parse()?;
    let linkage: Linkage = args.linkage.parse()?;
    let scaling: ScalingSpec = args.scaling.parse()?;

    logger.log("=== ExprHeat Cluster Function Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Runtime: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ))?;
    logger.log(&format!("Input File: {}", args.input))?;
    logger.log(&format!("Axis: {:?}", axis))?;
    logger.log(&format!("Distance Metric: {:?}", metric))?;
    logger.log(&format!("Linkage Method: {:?}", linkage))?;
    logger.log(&format!("Scaling: {:?}", scaling))?;

    let matrix = Matrix::from_delimited(&args.input)?;
    logger.log_and_progress(&format!(
        "Loaded matrix: {} rows x {} columns",
        matrix.n_rows(),
        matrix.n_cols()
    ))?;
    logger.finish_progress()?;
    let matrix = scale(&matrix, scaling)?;

    let n = match axis {
        Axis::Rows => matrix.n_rows(),
        Axis::Columns => matrix.n_cols(),
    };
    if n < 2 {
        return Err(Box::new(HeatmapError::DegenerateInput {
            axis: match axis {
                Axis::Rows => "rows",
                Axis::Columns => "columns",
            },
            found: n,
        }));
    }
    let items: Vec<Vec<f64>> = match axis {
        Axis::Rows => matrix.values.clone(),
        Axis::Columns => (0..n).map(|c| matrix.column(c)).collect(),
    };
    let (tree, merges) = cluster_items(&items, metric, linkage);
    let leaf_order = tree.leaves();

    let labels = match axis {
        Axis::Rows => &matrix.row_labels,
        Axis::Columns => &matrix.col_labels,
    };
    let file = File::create(&args.output)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "position,index,label")?;
    for (pos, &idx) in leaf_order.iter().enumerate() {
        writeln!(writer, "{},{},{}", pos, idx, labels[idx])?;
    }
    writer.flush()?;
    logger.log(&format!("Leaf order written to {}", args.output))?;

    if let Some(merges_path) = &args.merges {
        let file = File::create(merges_path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "step,height,size,members")?;
        for (step, merge) in merges.iter().enumerate() {
            let members: Vec<String> = merge.members.iter().map(|m| m.to_string()).collect();
            writeln!(
                writer,
                "{},{:.6},{},{}",
                step + 1,
                merge.height,
                merge.members.len(),
                members.join(";")
            )?;
        }
        writer.flush()?;
        logger.log(&format!("Merge history written to {}", merges_path))?;
        println!("[Output] Merge history: {}", merges_path);
    }

    println!("[Output] Leaf order: {}", args.output);
    println!("{}", crate::progress::format_time_used(start_time.elapsed()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_of(rows: Vec<Vec<f64>>) -> Matrix {
        let n_cols = rows[0].len();
        Matrix {
            row_labels: (0..rows.len()).map(|i| format!("r{}", i)).collect(),
            col_labels: (0..n_cols).map(|i| format!("c{}", i)).collect(),
            values: rows,
        }
    }

    fn is_permutation(perm: &[usize], n: usize) -> bool {
        let mut seen = vec![false; n];
        for &p in perm {
            if p >= n || seen[p] {
                return false;
            }
            seen[p] = true;
        }
        perm.len() == n
    }

    #[test]
    fn identity_order_is_untouched() {
        let m = matrix_of(vec![vec![1.0], vec![2.0], vec![3.0]]);
        let (perm, tree) = order(&m, Axis::Rows, &OrderSpec::Identity { reverse: false }).unwrap();
        assert_eq!(perm, vec![0, 1, 2]);
        assert!(tree.is_none());
    }

    #[test]
    fn identity_reverse_flips() {
        let m = matrix_of(vec![vec![1.0], vec![2.0], vec![3.0]]);
        let (perm, _) = order(&m, Axis::Rows, &OrderSpec::Identity { reverse: true }).unwrap();
        assert_eq!(perm, vec![2, 1, 0]);
    }

    #[test]
    fn cluster_order_is_a_permutation() {
        let m = matrix_of(vec![
            vec![1.0, 1.0],
            vec![9.0, 9.0],
            vec![1.1, 0.9],
            vec![9.2, 8.8],
            vec![5.0, 5.0],
        ]);
        let spec = OrderSpec::Cluster {
            metric: DistanceMetric::Euclidean,
            linkage: Linkage::Average,
        };
        let (perm, tree) = order(&m, Axis::Rows, &spec).unwrap();
        assert!(is_permutation(&perm, 5));
        assert_eq!(tree.unwrap().n_leaves(), 5);
    }

    #[test]
    fn cluster_groups_close_rows_adjacently() {
        // Rows 0 and 2 are nearly identical, as are 1 and 3.
        let m = matrix_of(vec![
            vec![1.0, 1.0],
            vec![9.0, 9.0],
            vec![1.1, 0.9],
            vec![9.2, 8.8],
        ]);
        let spec = OrderSpec::Cluster {
            metric: DistanceMetric::Euclidean,
            linkage: Linkage::Average,
        };
        let (perm, _) = order(&m, Axis::Rows, &spec).unwrap();
        let pos = |i: usize| perm.iter().position(|&p| p == i).unwrap();
        assert_eq!((pos(0) as i64 - pos(2) as i64).abs(), 1);
        assert_eq!((pos(1) as i64 - pos(3) as i64).abs(), 1);
    }

    #[test]
    fn clustering_is_deterministic() {
        let m = matrix_of(vec![
            vec![0.3, 1.2, 4.0],
            vec![2.2, 0.1, 3.3],
            vec![0.4, 1.1, 4.2],
            vec![7.0, 6.5, 0.2],
            vec![2.0, 0.3, 3.1],
        ]);
        let spec = OrderSpec::Cluster {
            metric: DistanceMetric::Euclidean,
            linkage: Linkage::Average,
        };
        let (perm1, tree1) = order(&m, Axis::Rows, &spec).unwrap();
        let (perm2, tree2) = order(&m, Axis::Rows, &spec).unwrap();
        assert_eq!(perm1, perm2);
        assert_eq!(tree1, tree2);
    }

    #[test]
    fn tied_distances_break_to_lowest_pair() {
        // Three identical rows: every pairwise distance is zero. The first
        // merge must take (0, 1), leaving leaf order 0, 1, 2.
        let m = matrix_of(vec![vec![1.0, 2.0]; 3]);
        let spec = OrderSpec::Cluster {
            metric: DistanceMetric::Euclidean,
            linkage: Linkage::Average,
        };
        let (perm, _) = order(&m, Axis::Rows, &spec).unwrap();
        assert_eq!(perm, vec![0, 1, 2]);
    }

    #[test]
    fn column_axis_clusters_columns() {
        // Columns 0 and 2 carry near-identical profiles.
        let m = matrix_of(vec![
            vec![1.0, 8.0, 1.1],
            vec![2.0, 9.0, 2.1],
            vec![3.0, 7.5, 2.9],
        ]);
        let spec = OrderSpec::Cluster {
            metric: DistanceMetric::Euclidean,
            linkage: Linkage::Complete,
        };
        let (perm, _) = order(&m, Axis::Columns, &spec).unwrap();
        assert!(is_permutation(&perm, 3));
        let pos = |i: usize| perm.iter().position(|&p| p == i).unwrap();
        assert_eq!((pos(0) as i64 - pos(2) as i64).abs(), 1);
    }

    #[test]
    fn fewer_than_two_items_is_degenerate() {
        let m = matrix_of(vec![vec![1.0, 2.0, 3.0]]);
        let spec = OrderSpec::Cluster {
            metric: DistanceMetric::Euclidean,
            linkage: Linkage::Average,
        };
        let err = order(&m, Axis::Rows, &spec).unwrap_err();
        assert!(matches!(
            err,
            HeatmapError::DegenerateInput {
                axis: "rows",
                found: 1
            }
        ));
    }

    #[test]
    fn ward_merges_tight_pair_first() {
        let m = matrix_of(vec![vec![0.0, 0.0], vec![0.1, 0.0], vec![10.0, 10.0]]);
        let spec = OrderSpec::Cluster {
            metric: DistanceMetric::Euclidean,
            linkage: Linkage::Ward,
        };
        let (perm, tree) = order(&m, Axis::Rows, &spec).unwrap();
        assert!(is_permutation(&perm, 3));
        // Root splits the far point from the tight pair.
        match tree.unwrap() {
            Dendrogram::Node { left, right, .. } => {
                let sizes = (left.n_leaves(), right.n_leaves());
                assert!(sizes == (2, 1) || sizes == (1, 2));
            }
            Dendrogram::Leaf(_) => panic!("expected an internal root"),
        }
    }

    #[test]
    fn merge_heights_are_recorded() {
        let items = vec![vec![0.0], vec![1.0], vec![5.0]];
        let (tree, merges) =
            cluster_items(&items, DistanceMetric::Euclidean, Linkage::Average);
        assert_eq!(merges.len(), 2);
        assert!((merges[0].height - 1.0).abs() < 1e-12);
        // Average of d(0,5)=5 and d(1,5)=4.
        assert!((merges[1].height - 4.5).abs() < 1e-12);
        assert!((tree.height() - 4.5).abs() < 1e-12);
    }

    #[test]
    fn manhattan_metric_distance() {
        let d = DistanceMetric::Manhattan.distance(&[1.0, 2.0], &[4.0, 0.0]);
        assert!((d - 5.0).abs() < 1e-12);
    }
}
