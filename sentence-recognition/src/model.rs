use candle_core::{D, Module, ModuleT, Result, Tensor};
use candle_nn::{
    Conv2d, Conv2dConfig, Dropout, LSTM, LSTMConfig, Linear, RNN, VarBuilder, conv2d, linear, lstm,
};

const CONV_CHANNELS: [usize; 4] = [32, 64, 128, 128];
const PROJECTION_DIM: usize = 256;
const LSTM_HIDDEN: [usize; 2] = [128, 64];

/// Number of CTC frames produced for an input of the given width.
pub fn time_steps(width: u32) -> usize {
    width as usize / 4
}

fn reverse_time(xs: &Tensor) -> Result<Tensor> {
    let steps = xs.dim(1)? as u32;
    let indices = Tensor::from_vec((0..steps).rev().collect::<Vec<_>>(), steps as usize, xs.device())?;
    xs.index_select(&indices, 1)
}

#[derive(Debug, Clone)]
struct BiLstm {
    forward: LSTM,
    backward: LSTM,
}

impl BiLstm {
    fn new(in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let forward = lstm(in_dim, hidden_dim, LSTMConfig::default(), vb.pp("forward"))?;
        let backward = lstm(in_dim, hidden_dim, LSTMConfig::default(), vb.pp("backward"))?;
        Ok(Self { forward, backward })
    }

    /// `(batch, time, in_dim)` -> `(batch, time, 2 * hidden_dim)`
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let forward = self.forward.states_to_tensor(&self.forward.seq(xs)?)?;
        let reversed = reverse_time(xs)?;
        let backward = self.backward.states_to_tensor(&self.backward.seq(&reversed)?)?;
        let backward = reverse_time(&backward)?;
        Tensor::cat(&[&forward, &backward], D::Minus1)
    }
}

/// Convolutional feature extractor followed by two bidirectional LSTMs and a
/// per-frame classifier over the vocabulary plus the CTC blank.
#[derive(Debug, Clone)]
pub struct Crnn {
    convs: Vec<Conv2d>,
    projection: Linear,
    rnn1: BiLstm,
    rnn2: BiLstm,
    dropout: Dropout,
    head: Linear,
    num_classes: usize,
}

impl Crnn {
    pub fn new(vb: VarBuilder, height: u32, num_classes: usize) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let mut convs = Vec::with_capacity(CONV_CHANNELS.len());
        let mut in_channels = 3;
        for (i, &out_channels) in CONV_CHANNELS.iter().enumerate() {
            convs.push(conv2d(in_channels, out_channels, 3, config, vb.pp(format!("conv{i}")))?);
            in_channels = out_channels;
        }

        let feature_height = height as usize / 8;
        let projection = linear(in_channels * feature_height, PROJECTION_DIM, vb.pp("projection"))?;
        let rnn1 = BiLstm::new(PROJECTION_DIM, LSTM_HIDDEN[0], vb.pp("rnn1"))?;
        let rnn2 = BiLstm::new(2 * LSTM_HIDDEN[0], LSTM_HIDDEN[1], vb.pp("rnn2"))?;
        let head = linear(2 * LSTM_HIDDEN[1], num_classes, vb.pp("head"))?;

        Ok(Self {
            convs,
            projection,
            rnn1,
            rnn2,
            dropout: Dropout::new(0.2),
            head,
            num_classes,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// `(batch, 3, H, W)` -> `(batch, 128, H / 8, W / 4)`
    fn features(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            xs = conv.forward(&xs)?.relu()?;
            xs = match i {
                0 | 1 => xs.max_pool2d(2)?,
                2 => xs.max_pool2d_with_stride((2, 1), (2, 1))?,
                _ => xs,
            };
        }
        Ok(xs)
    }
}

impl ModuleT for Crnn {
    /// Returns per-frame log-probabilities `(batch, W / 4, num_classes)`.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.features(xs)?;
        let (batch, channels, height, width) = features.dims4()?;
        let sequence = features
            .permute((0, 3, 1, 2))?
            .contiguous()?
            .reshape((batch, width, channels * height))?;

        let xs = self.projection.forward(&sequence)?.relu()?;
        let xs = self.dropout.forward_t(&xs, train)?;
        let xs = self.rnn1.forward(&xs)?;
        let xs = self.dropout.forward_t(&xs, train)?;
        let xs = self.rnn2.forward(&xs)?;
        let xs = self.dropout.forward_t(&xs, train)?;
        let logits = self.head.forward(&xs)?;

        candle_nn::ops::log_softmax(&logits, D::Minus1)
    }
}
