#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::process;
use std::sync::Arc;

use glyco::config::ServiceConfig;
use glyco::evaluate::Evaluation;
use glyco::http;
use glyco::model::artifact::{Classifier, TrainedModel};
use glyco::model::data::{DEFAULT_OUTCOME_COLUMN, load_reference_dataset, load_unlabelled_dataset};
use glyco::model::estimate::{FitConfig, train_model};
use glyco::schema::FeatureSchema;
use glyco::startup::ServiceContext;

#[derive(Args)]
pub struct ServeArgs {
    /// Path to the service configuration file (.toml)
    #[arg(long)]
    pub config: String,

    /// Address to listen on; overrides `server.bind` from the configuration file
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,
}

#[derive(Args)]
pub struct TrainArgs {
    /// Path to the labelled reference CSV/TSV file
    pub reference_data: String,

    /// Where to write the trained model
    #[arg(long, default_value = "model.toml")]
    pub output: String,

    /// Name of the ground-truth column
    #[arg(long, default_value = DEFAULT_OUTCOME_COLUMN)]
    pub outcome_column: String,

    /// Ridge penalty on the standardized, non-intercept coefficients
    #[arg(long, default_value = "1e-4")]
    pub lambda: f64,

    /// Maximum number of BFGS iterations
    #[arg(long, default_value = "200")]
    pub max_iterations: usize,

    /// Convergence tolerance for the gradient norm
    #[arg(long, default_value = "1e-5")]
    pub tolerance: f64,
}

#[derive(Args)]
pub struct EvaluateArgs {
    /// Path to the service configuration file (.toml)
    #[arg(long)]
    pub config: String,
}

#[derive(Args)]
pub struct InferArgs {
    /// Path to a CSV/TSV file with the six predictor columns (no outcome needed)
    pub data: String,

    /// Path to trained model file (.toml)
    #[arg(long)]
    pub model: String,

    /// Where to write the predictions
    #[arg(long, default_value = "predictions.tsv")]
    pub output: String,
}

#[derive(Parser)]
#[command(
    name = "glyco",
    about = "Diabetes risk prediction service",
    long_about = "Serves a trained logistic classifier over HTTP, trains it from a labelled \
                 health-indicator extract, and scores files offline."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP prediction service
    #[command(about = "Start the prediction service (GET/POST /pred, /info, /confusion)")]
    Serve(ServeArgs),

    /// Fit a classifier from labelled reference data
    #[command(about = "Train the classifier (outputs: model.toml)")]
    Train(TrainArgs),

    /// Print the defaults and confusion matrix the service would start with
    #[command(about = "Run the startup phase and report its results")]
    Evaluate(EvaluateArgs),

    /// Score every complete row of a file
    #[command(about = "Apply a trained model to new data (outputs: predictions.tsv)")]
    Infer(InferArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Serve(args)) => serve(args),
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Evaluate(args)) => evaluate(args),
        Some(Commands::Infer(args)) => infer(args),
        None => Cli::command().print_help().map(|()| println!()).map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

pub fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ServiceConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    // Nothing is bound until startup has finished.
    let context = Arc::new(ServiceContext::initialize(&config)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(http::serve(&config.server.bind, context))?;
    Ok(())
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let schema = FeatureSchema::standard();
    println!("Loading reference data from: {}", args.reference_data);
    let data = load_reference_dataset(&args.reference_data, &schema, &args.outcome_column)?;
    println!("Loaded {} rows", data.len());

    let fit_config = FitConfig {
        lambda: args.lambda,
        max_iterations: args.max_iterations,
        convergence_tolerance: args.tolerance,
    };
    let model = train_model(&data, &schema, &fit_config)?;

    println!("Intercept: {:.6}", model.coefficients.intercept);
    for (term, value) in &model.coefficients.terms {
        println!("  {term}: {value:.6}");
    }

    model.save(&args.output)?;
    println!("Model saved to: {}", args.output);
    Ok(())
}

pub fn evaluate(args: EvaluateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServiceConfig::load(&args.config)?;
    let context = ServiceContext::initialize(&config)?;

    println!("Default values:");
    for (name, value) in context.defaults().iter() {
        println!("  {name}: {value}");
    }
    print_evaluation(context.evaluation());
    Ok(())
}

fn print_evaluation(evaluation: &Evaluation) {
    println!(
        "Confusion matrix ({} of {} reference rows; {} without a label, {} with missing predictors):",
        evaluation.matrix.total(),
        evaluation.rows_total,
        evaluation.excluded_missing_label,
        evaluation.excluded_missing_features
    );
    println!("{:<12}\t{:>12}\t{:>12}", "actual", "NoDiabetes", "Diabetes");
    let rows = evaluation.matrix.cells().collect::<Vec<_>>();
    for pair in rows.chunks(2) {
        println!(
            "{:<12}\t{:>12}\t{:>12}",
            pair[0].actual.label(),
            pair[0].count,
            pair[1].count
        );
    }
    if let Some(accuracy) = evaluation.matrix.accuracy() {
        println!("Accuracy: {:.4}", accuracy);
    }
}

pub fn infer(args: InferArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", args.model);
    let schema = FeatureSchema::standard();
    let model = TrainedModel::load(&args.model)?;
    model.check_schema(&schema)?;

    let data = load_unlabelled_dataset(&args.data, &schema)?;
    let (indices, rows): (Vec<usize>, Vec<_>) = (0..data.len())
        .filter_map(|index| data.row(index).map(|row| (index, row)))
        .unzip();
    let skipped = data.len() - rows.len();
    if skipped > 0 {
        log::warn!("Skipping {skipped} rows with missing predictors");
    }

    let probabilities = model.predict_probability(&rows)?;
    let classes = model.predict_class(&rows)?;

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&args.output)?;
    writer.write_record(["row", "predicted_class", "prob_Diabetes"])?;
    for ((index, class), probability) in indices.iter().zip(&classes).zip(probabilities.iter()) {
        writer.write_record([
            (index + 1).to_string(),
            class.label().to_string(),
            probability.to_string(),
        ])?;
    }
    writer.flush()?;

    println!("Predictions for {} rows saved to: {}", rows.len(), args.output);
    Ok(())
}
