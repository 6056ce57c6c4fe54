use crate::common::*;

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use xtm_core::candle_data_loader::*;
use xtm_core::candle_inference::{StepLrSchedule, TrainConfig};
use xtm_core::candle_model_xtm::*;
use xtm_core::candle_topic_grouping::GroupConnectionWeights;
use xtm_core::candle_xtm_training::*;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        required = true,
        help = "Training corpus",
        long_help = "Bag-of-words training corpus (documents x words).\n\
		     Either a MatrixMarket file (`.mtx` or `.mtx.gz`)\n\
		     or a dense tab/comma/space-delimited file."
    )]
    train_file: Box<str>,

    #[arg(
        long,
        short = 'w',
        required = true,
        help = "Vocabulary file",
        long_help = "Vocabulary file with one word per line,\n\
		     in the column order of the corpus."
    )]
    vocab: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results.\n\
		     Specify the output file or prefix for generated files:\n\
		     - {out}.config.json\n\
		     - {out}.safetensors\n\
		     - {out}.beta.tsv\n\
		     - {out}.top_words.txt\n\
		     - {out}.theta.tsv\n\
		     - {out}.groups.txt\n\
		     - {out}.topic_embeddings.tsv\n\
		     - {out}.loss_trace.tsv\n"
    )]
    out: Box<str>,

    #[arg(
        long,
        help = "Held-out corpus",
        long_help = "Held-out corpus with the same vocabulary.\n\
		     Its topic proportions go to {out}.test_theta.tsv."
    )]
    test_file: Option<Box<str>>,

    #[arg(
        long,
        help = "Pretrained word embeddings",
        long_help = "Pretrained word embeddings (words x dimension),\n\
		     one row per vocabulary word. They are normalized\n\
		     and trained further; their dimension overrides --embed-size."
    )]
    word_embeddings: Option<Box<str>>,

    #[arg(
        long,
        help = "Contextual document embeddings",
        long_help = "Precomputed contextual embeddings (documents x dimension),\n\
		     aligned by row with the training corpus."
    )]
    contextual_embeddings: Option<Box<str>>,

    #[arg(short = 't', long, default_value_t = 50, help = "Number of topics")]
    num_topics: usize,

    #[arg(
        short = 'g',
        long,
        default_value_t = 10,
        help = "Number of topic groups",
        long_help = "Number of topic groups.\n\
		     Topics are clustered once by k-means on their embeddings."
    )]
    num_groups: usize,

    #[arg(long, default_value_t = 200, help = "Hidden units of the encoder")]
    en_units: usize,

    #[arg(long, default_value_t = 0.4, help = "Dropout rate of the encoder")]
    dropout: f32,

    #[arg(long, default_value_t = 200, help = "Embedding dimension")]
    embed_size: usize,

    #[arg(
        long,
        default_value_t = 0.2,
        help = "Temperature of the topic-word softmax"
    )]
    beta_temp: f64,

    #[arg(long, default_value_t = 250.0, help = "Weight of the word transport loss")]
    weight_loss_ecr: f64,

    #[arg(long, default_value_t = 250.0, help = "Weight of the group transport loss")]
    weight_loss_xgr: f64,

    #[arg(
        long,
        default_value_t = 20.0,
        help = "Sharpness of the word transport plan",
        long_help = "Inverse entropic regularization of the word transport.\n\
		     Larger values give sparser plans."
    )]
    alpha_ecr: f64,

    #[arg(long, default_value_t = 4.0, help = "Sharpness of the group transport plan")]
    alpha_xgr: f64,

    #[arg(long, default_value_t = 1000, help = "Maximum Sinkhorn iterations")]
    sinkhorn_max_iter: usize,

    #[arg(
        long,
        default_value_t = 10,
        help = "Epoch at which topics are grouped",
        long_help = "Epoch at which topics are grouped.\n\
		     The group transport loss applies afterwards."
    )]
    group_epoch: usize,

    #[arg(long, short = 'i', default_value_t = 200, help = "Number of epochs")]
    epochs: usize,

    #[arg(long, default_value_t = 200, help = "Minibatch size")]
    batch_size: usize,

    #[arg(long, default_value_t = 1e-3, help = "Learning rate")]
    learning_rate: f32,

    #[arg(
        long,
        default_value_t = false,
        help = "Decay learning rate stepwise",
        long_help = "Multiply the learning rate by --lr-gamma\n\
		     every --lr-step-size epochs."
    )]
    lr_scheduler: bool,

    #[arg(long, default_value_t = 125, help = "Epochs between learning rate steps")]
    lr_step_size: usize,

    #[arg(long, default_value_t = 0.5, help = "Learning rate decay factor")]
    lr_gamma: f64,

    #[arg(long, default_value_t = 15, help = "Number of top words per topic")]
    num_top_words: usize,

    #[arg(long, default_value_t = 0, help = "Random seed")]
    seed: u64,

    #[arg(
        long,
        default_value_t = 100,
        help = "Group transport plan logging interval",
        long_help = "Log the group transport plan every this many\n\
		     group-loss computations (with --verbose)."
    )]
    diagnostic_interval: usize,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or metal, we may want to choose a different device."
    )]
    device_no: usize,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints per-epoch losses and group diagnostics."
    )]
    verbose: bool,
}

pub fn fit_xtm(args: &TrainArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let dev = make_device(&args.device, args.device_no)?;
    if !dev.is_cpu() {
        dev.set_seed(args.seed)?;
    }

    let outputs = OutputFiles::new(&args.out);
    mkdir_parent(&outputs.config)?;

    ////////////////////
    // 1. read inputs //
    ////////////////////

    let vocab = read_lines(&args.vocab)?;
    info!("{} words in the vocabulary", vocab.len());

    let x_nd = read_corpus_checked(&args.train_file, vocab.len())?;

    let pretrained = match args.word_embeddings.as_deref() {
        Some(file) => {
            let we = read_dense_tensor(file)?;
            info!("pretrained word embeddings {:?}", we.dims());
            Some(we)
        }
        None => None,
    };

    let mut data = match args.contextual_embeddings.as_deref() {
        Some(file) => {
            let ctx = read_dense_tensor(file)?;
            info!("contextual embeddings {:?}", ctx.dims());
            InMemoryData::new_with_contextual(&x_nd, &ctx)?
        }
        None => InMemoryData::new(&x_nd)?,
    }
    .with_seed(args.seed);

    //////////////////////
    // 2. build a model //
    //////////////////////

    let config = XtmConfig {
        vocab_size: vocab.len(),
        num_topics: args.num_topics,
        num_groups: args.num_groups,
        en_units: args.en_units,
        dropout: args.dropout,
        embed_size: args.embed_size,
        beta_temp: args.beta_temp,
        weight_loss_ecr: args.weight_loss_ecr,
        weight_loss_xgr: args.weight_loss_xgr,
        alpha_ecr: args.alpha_ecr,
        alpha_xgr: args.alpha_xgr,
        sinkhorn_max_iter: args.sinkhorn_max_iter,
        group_epoch: args.group_epoch,
        group_weights: GroupConnectionWeights::default(),
        seed: args.seed,
        ..Default::default()
    };

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let mut model = XtmModel::new(config, pretrained.as_ref(), vb, &varmap)?;

    let lr_schedule = args.lr_scheduler.then_some(StepLrSchedule {
        step_size: args.lr_step_size,
        gamma: args.lr_gamma,
    });

    let manifest = ModelManifest {
        model: model.config().clone(),
        learning_rate: args.learning_rate,
        batch_size: args.batch_size,
        epochs: args.epochs,
        lr_step: lr_schedule.map(|s| (s.step_size, s.gamma)),
        num_top_words: args.num_top_words,
    };
    manifest.write(&outputs.config)?;
    info!("wrote {}", outputs.config);

    //////////////
    // 3. train //
    //////////////

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        lr_schedule,
        seed: args.seed,
        device: dev.clone(),
        verbose: args.verbose,
        show_progress: true,
        diagnostic_interval: args.diagnostic_interval,
    };

    let trace = XtmTrainer::new(&mut model, &varmap).train(&mut data, &train_config)?;

    write_loss_trace(&trace, &outputs.loss_trace)?;
    varmap.save(&outputs.parameters)?;
    info!("saved parameters to {}", outputs.parameters);

    ///////////////////////
    // 4. write outcomes //
    ///////////////////////

    let beta_kv = model.get_beta()?;
    write_tensor_tsv(&beta_kv, &outputs.beta)?;
    write_lines(
        &top_words(&beta_kv, &vocab, args.num_top_words)?,
        &outputs.top_words,
    )?;
    write_tensor_tsv(model.topic_embeddings(), &outputs.topic_embeddings)?;

    let group_lines: Vec<String> = match model.grouping().groups() {
        Some(groups) => groups
            .members
            .iter()
            .map(|topics| {
                topics
                    .iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join("\t")
            })
            .collect(),
        None => {
            info!(
                "topics were never grouped (epochs {} <= group epoch {})",
                args.epochs, args.group_epoch
            );
            vec![]
        }
    };
    write_lines(&group_lines, &outputs.groups)?;

    write_theta(&model, &x_nd, args.batch_size, &outputs.theta)?;

    if let Some(test_file) = args.test_file.as_deref() {
        let x_test = read_corpus_checked(test_file, vocab.len())?;
        write_theta(&model, &x_test, args.batch_size, &outputs.test_theta)?;
    }

    Ok(())
}

fn write_theta(model: &XtmModel, x_nd: &Tensor, batch_size: usize, file: &str) -> anyhow::Result<()> {
    let theta_nk = model.get_theta(x_nd, batch_size)?;
    write_tensor_tsv(&theta_nk, file)?;
    info!("wrote {}", file);
    Ok(())
}

fn write_loss_trace(trace: &[LossScores], file: &str) -> anyhow::Result<()> {
    let mut lines = vec![format!("epoch\t{}", LossBreakdown::NAMES.join("\t"))];
    for (e, scores) in trace.iter().enumerate() {
        let values: Vec<String> = scores.to_array().iter().map(|x| x.to_string()).collect();
        lines.push(format!("{}\t{}", e + 1, values.join("\t")));
    }
    write_lines(&lines, file)
}
