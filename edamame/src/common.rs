pub use log::{debug, info, warn};

pub type Mat = nalgebra::DMatrix<f32>;
pub type DVec = nalgebra::DVector<f32>;

pub use candle_util::{candle_core, candle_nn};
pub use matrix_util::traits::*;

/// delimiters accepted in input tables
pub const TABLE_DELIMITERS: [char; 3] = ['\t', ',', ' '];

/// rows per forward pass when evaluating a whole dataset
pub const EVAL_BATCH_SIZE: usize = 256;
