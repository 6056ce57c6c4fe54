use crate::common::*;

use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use xtm_core::candle_model_xtm::XtmModel;

#[derive(Args, Debug)]
pub struct InferArgs {
    #[arg(
        required = true,
        help = "Corpus",
        long_help = "Bag-of-words corpus (documents x words) over the\n\
		     vocabulary the model was trained with."
    )]
    data_file: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Trained model header",
        long_help = "Output header of a previous `train` run.\n\
		     Reads {model}.config.json and {model}.safetensors."
    )]
    model: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output file",
        long_help = "Output file for topic proportions (documents x topics)."
    )]
    out: Box<str>,

    #[arg(long, default_value_t = 200, help = "Minibatch size")]
    batch_size: usize,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "A device for cuda")]
    device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

pub fn infer_xtm(args: &InferArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let dev = make_device(&args.device, args.device_no)?;
    let trained = OutputFiles::new(&args.model);

    let manifest = ModelManifest::read(&trained.config)?;
    let x_nd = read_corpus_checked(&args.data_file, manifest.model.vocab_size)?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let model = XtmModel::new(manifest.model, None, vb, &varmap)?;
    varmap.load(&trained.parameters)?;
    info!("loaded parameters from {}", trained.parameters);

    let theta_nk = model.get_theta(&x_nd, args.batch_size)?;
    write_tensor_tsv(&theta_nk, &args.out)?;
    info!("wrote {}", args.out);
    Ok(())
}
