use std::{collections::BTreeMap, path::PathBuf, process::exit, str::FromStr, time::Instant};

use netcanvas_core::{
    canonical::CanonicalOrder,
    catalog::Catalog,
    description::{load_graph, GraphDescription, LoadError},
    dim::{Dimensions, ParseDimensionError},
    validate::ValidatorBuilder,
};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use structopt::StructOpt;
use thiserror::Error;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "netcanvas",
    about = "Validate and compare neural network graph descriptions"
)]
pub enum Opt {
    /// Infer shapes and parameter counts, and print the validation report
    Validate {
        #[structopt(parse(from_os_str))]
        path: PathBuf,

        #[structopt(
            long = "input-shape",
            number_of_values = 1,
            help = "Shape of an input node, e.g. `input-1=B,1,28,28` (repeatable)"
        )]
        input_shapes: Vec<InputShape>,
    },

    /// Check whether a submission is structurally equivalent to a reference
    Compare {
        #[structopt(parse(from_os_str))]
        reference: PathBuf,

        #[structopt(parse(from_os_str))]
        submission: PathBuf,

        #[structopt(long = "topological", help = "Order nodes topologically instead of by layout")]
        topological: bool,
    },

    /// Grade many submissions against one reference
    Grade {
        #[structopt(parse(from_os_str))]
        reference: PathBuf,

        #[structopt(parse(from_os_str), required = true)]
        submissions: Vec<PathBuf>,

        #[structopt(long = "topological", help = "Order nodes topologically instead of by layout")]
        topological: bool,
    },
}

#[derive(Debug)]
pub struct InputShape {
    pub node: String,
    pub shape: Dimensions,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Failed to load {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: LoadError,
    },

    #[error("Invalid input shape '{0}' (expected <node>=<shape>)")]
    InputShape(String),

    #[error(transparent)]
    Dimension(#[from] ParseDimensionError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FromStr for InputShape {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((node, shape)) = s.split_once('=') else {
            return Err(CliError::InputShape(s.to_owned()));
        };
        let node = node.trim();
        if node.is_empty() {
            return Err(CliError::InputShape(s.to_owned()));
        }
        Ok(InputShape {
            node: node.to_owned(),
            shape: shape.parse()?,
        })
    }
}

fn main() {
    color_backtrace::install();
    env_logger::init();

    let opt = Opt::from_args();

    match run(opt) {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {e}");
            exit(2);
        }
    }
}

/// Returns whether the graph validated, or the submission matched.
fn run(opt: Opt) -> Result<bool, CliError> {
    let catalog = Catalog::standard();

    match opt {
        Opt::Validate { path, input_shapes } => {
            let desc = load(path)?;
            let validator = ValidatorBuilder::new(&catalog)
                .with_input_shapes(input_shapes.into_iter().map(|i| (i.node, i.shape)))
                .build();
            let report = validator.validate(&desc);
            println!("{}", report.to_json()?);
            Ok(report.valid)
        }
        Opt::Compare {
            reference,
            submission,
            topological,
        } => {
            let validator = ValidatorBuilder::new(&catalog)
                .with_canonical_order(canonical_order(topological))
                .build();
            let equivalent = validator.compare(&load(reference)?, &load(submission)?);
            println!("{equivalent}");
            Ok(equivalent)
        }
        Opt::Grade {
            reference,
            submissions,
            topological,
        } => {
            let validator = ValidatorBuilder::new(&catalog)
                .with_canonical_order(canonical_order(topological))
                .build();
            let grader = validator.grader(&load(reference)?);

            log::info!("grade: start ({} submissions)", submissions.len());
            let start = Instant::now();
            let grades = submissions
                .par_iter()
                .map(|path| {
                    // An unreadable submission fails on its own.
                    let grade = match load(path.clone()) {
                        Ok(submission) => grader.grade(&submission),
                        Err(err) => {
                            log::warn!("grade: {}", err);
                            false
                        }
                    };
                    (path.display().to_string(), grade)
                })
                .collect::<BTreeMap<_, _>>();
            log::info!("grade: finished in {:?}", start.elapsed());

            println!("{}", serde_json::to_string_pretty(&grades)?);
            Ok(true)
        }
    }
}

fn load(path: PathBuf) -> Result<GraphDescription, CliError> {
    log::debug!("load: {:?}", path);
    load_graph(&path).map_err(|source| CliError::Load { path, source })
}

fn canonical_order(topological: bool) -> CanonicalOrder {
    if topological {
        CanonicalOrder::Topological
    } else {
        CanonicalOrder::Layout
    }
}

#[test]
fn parse_input_shape() {
    let input: InputShape = "input-1=B,1,28,28".parse().unwrap();
    assert_eq!(input.node, "input-1");
    assert_eq!(input.shape, Dimensions::batched(&[1, 28, 28]));
    assert!(matches!(
        "B,1,28,28".parse::<InputShape>(),
        Err(CliError::InputShape(_))
    ));
    assert!(matches!(
        "x=B,one".parse::<InputShape>(),
        Err(CliError::Dimension(_))
    ));
}
