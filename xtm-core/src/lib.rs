pub mod candle_aux_layers;
pub mod candle_data_loader;
pub mod candle_decoder_embedding_topic;
pub mod candle_encoder_logistic_normal;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_model_xtm;
pub mod candle_optimal_transport;
pub mod candle_topic_grouping;
pub mod candle_xtm_training;
pub mod corpus_io;

pub use candle_core;
pub use candle_nn;
