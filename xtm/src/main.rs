mod common;
mod fit_topic;
mod infer_topic;

use common::*;
use fit_topic::*;
use infer_topic::*;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "XTM",
    long_about = "Neural topic model with optimal-transport regularization\n\
		  of topic-word and topic-group relationships.\n\
		  Corpora are `.mtx` (documents x words) or dense delimited files."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train a topic model",
        long_about = "Train the topic model in three stages: \n\
		      (1) Fit the encoder, topic and word embeddings via SGD\n\
		      (2) Group topics by k-means at the grouping epoch\n\
		      (3) Estimate topic proportions of the training documents.\n"
    )]
    Train(TrainArgs),

    #[command(
        about = "Estimate topic proportions with a trained model",
        long_about = "Load a trained model and write the topic proportions\n\
		      (posterior means) of a new corpus.\n"
    )]
    Infer(InferArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Train(args) => {
            fit_xtm(args)?;
        }
        Commands::Infer(args) => {
            infer_xtm(args)?;
        }
    }

    info!("Done");
    Ok(())
}
