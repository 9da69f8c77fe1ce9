//! Target angle generation and float comparisons used by the sweep checks.

/// Slack applied before rounding the element count up, so that `(final - initial) / step`
/// landing a hair above an integer does not add an extra overshooting element.
const COUNT_EPSILON: f64 = 1e-9;

/// Build the ordered list of target angles.
///
/// Steps uniformly from `initial` and stops at the first element past
/// `final_angle + step`, the way `arange(initial, final + step, step)` does: the nominal
/// final angle is included when the range divides evenly, otherwise the sequence ends on
/// one element that overshoots it. The first element is always exactly `initial`.
///
/// The step is expected to be validated by the caller. A zero or non-finite step yields
/// only the initial angle.
///
/// ```
/// use waveplate_sweep::experiment::angles::angle_sequence;
///
/// assert_eq!(angle_sequence(0.0, 10.0, 5.0), vec![0.0, 5.0, 10.0]);
/// assert_eq!(angle_sequence(0.0, 11.0, 5.0), vec![0.0, 5.0, 10.0, 15.0]);
/// assert_eq!(angle_sequence(20.0, 20.0, 5.0), vec![20.0]);
/// ```
pub fn angle_sequence(initial: f64, final_angle: f64, step: f64) -> Vec<f64> {
    if !step.is_finite() || step == 0.0 {
        return vec![initial];
    }

    let span = (final_angle + step - initial) / step;
    let count = if span.is_finite() && span > 0.0 {
        (span - COUNT_EPSILON).ceil().max(1.0) as usize
    } else {
        // final lies behind initial relative to the step direction
        1
    };

    (0..count).map(|i| initial + i as f64 * step).collect()
}

/// `|a - b| <= atol + rtol * |b|`, the usual relative/absolute closeness test.
pub fn is_close(a: f64, b: f64, rtol: f64, atol: f64) -> bool {
    (a - b).abs() <= atol + rtol * b.abs()
}

/// Element-wise [`is_close`]; sequences of different length are never close.
pub fn all_close(a: &[f64], b: &[f64], rtol: f64, atol: f64) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| is_close(x, y, rtol, atol))
}
