use clap::{Parser, Subcommand};
use edamame::predict::*;
use edamame::preprocess::*;
use edamame::train::*;
use log::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "EDAMAME",
    long_about = "Expression Denoising Autoencoder with Multiple count noise models\n\
		  Count tables are delimited text files (optionally gzipped)\n\
		  with sample rows and feature columns."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,

    #[arg(
        long,
        short,
        global = true,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints per-epoch losses instead of a progress bar."
    )]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Prepare a count table for training",
        long_about = "Prepare a count table in three steps:\n\
		      (1) Drop samples and features without counts\n\
		      (2) Estimate size factors (deseq or zheng)\n\
		      (3) Optionally hold out a test fold.\n"
    )]
    Preprocess(PreprocessArgs),

    #[command(
        about = "Train a count autoencoder",
        long_about = "Train an autoencoder with a count noise model:\n\
		      (1) Normalize the input by size factors, log1p and z-scores\n\
		      (2) Fit encoder and decoder by minibatch gradient descent\n\
		      with learning rate reduction and early stopping\n\
		      (3) Save the best model and the denoised training data.\n"
    )]
    Train(TrainArgs),

    #[command(
        about = "Denoise or embed data with a trained model",
        long_about = "Replay the training normalization on new data, then save\n\
		      the decoded parameters and/or the bottleneck.\n"
    )]
    Predict(PredictArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match cli.commands {
        Commands::Preprocess(args) => {
            run_preprocess(&args)?;
        }
        Commands::Train(mut args) => {
            args.verbose = cli.verbose;
            run_train(&args)?;
        }
        Commands::Predict(args) => {
            run_predict(&args)?;
        }
    }

    info!("Done");
    Ok(())
}
