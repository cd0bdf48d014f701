use ndarray::{Array4, ArrayView4, Axis};

use super::LossFn;

/// Mean squared error loss function.
///
/// The squared error is averaged over the channel axis, so every pixel of every
/// sample contributes one value to the total.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mse;

impl Mse {
    /// Returns a new `Mse`.
    pub fn new() -> Self {
        Self
    }
}

impl LossFn for Mse {
    fn loss(&self, y_pred: ArrayView4<f32>, y: ArrayView4<f32>) -> f32 {
        let channels = y.len_of(Axis(3)).max(1) as f32;

        (&y_pred - &y).mapv(|x| x.powi(2)).sum() / channels
    }

    fn loss_prime(&self, y_pred: ArrayView4<f32>, y: ArrayView4<f32>) -> Array4<f32> {
        let channels = y.len_of(Axis(3)).max(1) as f32;

        (&y_pred - &y) * (2.0 / channels)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;

    use super::*;

    #[test]
    fn loss_averages_channels_and_sums_positions() {
        let y = Array4::<f32>::zeros((2, 2, 2, 4));
        let y_pred = Array4::<f32>::from_elem((2, 2, 2, 4), 0.5);

        // 8 positions, each with mean(0.25) over channels.
        assert_eq!(Mse.loss(y_pred.view(), y.view()), 2.0);
    }

    #[test]
    fn loss_prime_is_scaled_difference() {
        let y = Array4::<f32>::zeros((1, 1, 1, 2));
        let y_pred = Array4::from_shape_vec((1, 1, 1, 2), vec![1.0, -2.0]).unwrap();

        let d = Mse.loss_prime(y_pred.view(), y.view());
        assert_eq!(d.as_slice().unwrap(), &[1.0, -2.0]);
    }
}
