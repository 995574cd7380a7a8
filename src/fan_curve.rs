//! Fan curve calculations for temperature-based speed control.
//!
//! Implements linear interpolation between temperature points and the
//! extrapolation toward full speed above the last point.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Highest PWM duty cycle.
pub const MAX_PWM: u8 = 255;

/// One temperature/output pair of a fan curve.
///
/// `output` is on the PWM scale (0-255); rotation fans rescale it.
///
/// # Example
///
/// ```
/// use fancontrold::fan_curve::CurvePoint;
///
/// let point = CurvePoint { temp: 45.0, output: 120 }; // 45°C -> duty 120
/// let from_tuple: CurvePoint = (45.0, 120).into();
/// assert_eq!(point, from_tuple);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub temp: f64,
    pub output: u8,
}

impl From<(f64, u8)> for CurvePoint {
    fn from(value: (f64, u8)) -> Self {
        Self {
            temp: value.0,
            output: value.1,
        }
    }
}

/// Piecewise linear fan response.
///
/// Invariant: at least one point, strictly ascending by temperature.
#[derive(Debug, Clone, PartialEq)]
pub struct FanCurve {
    points: Vec<CurvePoint>,
}

impl FanCurve {
    /// Builds a curve, sorting the points by temperature.
    ///
    /// # Errors
    ///
    /// Fails for an empty point list, non-finite temperatures, or two points
    /// sharing a temperature.
    pub fn new(mut points: Vec<CurvePoint>) -> Result<Self> {
        if points.is_empty() {
            bail!("Fan curve needs at least one point");
        }
        if let Some(bad) = points.iter().find(|p| !p.temp.is_finite()) {
            bail!("Fan curve point has invalid temperature {}", bad.temp);
        }

        points.sort_by(|a, b| a.temp.total_cmp(&b.temp));

        if let Some(pair) = points.windows(2).find(|w| w[0].temp == w[1].temp) {
            bail!("Fan curve has two points at {}°C", pair[0].temp);
        }

        Ok(Self { points })
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    /// Output for `temp` on the PWM scale.
    ///
    /// Below the first point the first output applies. Above the last point
    /// the curve continues linearly toward [`MAX_PWM`] at `ceiling`, the
    /// lowest critical temperature of the controller's sensors, and stays
    /// there. A ceiling at or below the last point means full speed.
    pub fn output_at(&self, temp: f64, ceiling: f64) -> f64 {
        let first = self.points[0];
        if temp <= first.temp {
            return f64::from(first.output);
        }

        if let Some(pair) = self.points.windows(2).find(|w| temp <= w[1].temp) {
            return interpolate(pair[0], pair[1], temp);
        }

        let last = self.points[self.points.len() - 1];
        if ceiling <= last.temp {
            return f64::from(MAX_PWM);
        }

        let full_speed = CurvePoint {
            temp: ceiling,
            output: MAX_PWM,
        };
        interpolate(last, full_speed, temp).clamp(f64::from(last.output), f64::from(MAX_PWM))
    }
}

fn interpolate(this: CurvePoint, next: CurvePoint, temp: f64) -> f64 {
    let ratio = (temp - this.temp) / (next.temp - this.temp);
    f64::from(this.output) + ratio * (f64::from(next.output) - f64::from(this.output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn curve(points: &[(f64, u8)]) -> FanCurve {
        FanCurve::new(points.iter().copied().map(CurvePoint::from).collect()).unwrap()
    }

    #[test]
    fn midpoint_between_points() {
        let c = curve(&[(30.0, 50), (50.0, 150), (70.0, 255)]);
        assert_eq!(c.output_at(40.0, 90.0), 100.0);
        assert_eq!(c.output_at(60.0, 90.0), 202.5);
    }

    #[test]
    fn exact_point_temperatures() {
        let c = curve(&[(30.0, 50), (50.0, 150), (70.0, 255)]);
        assert_eq!(c.output_at(30.0, 90.0), 50.0);
        assert_eq!(c.output_at(50.0, 90.0), 150.0);
        assert_eq!(c.output_at(70.0, 90.0), 255.0);
    }

    #[test]
    fn below_first_point_uses_first_output() {
        let c = curve(&[(30.0, 50), (50.0, 150)]);
        assert_eq!(c.output_at(10.0, 90.0), 50.0);
        assert_eq!(c.output_at(-20.0, 90.0), 50.0);
    }

    #[test]
    fn above_last_point_extrapolates_toward_ceiling() {
        let c = curve(&[(30.0, 50), (50.0, 150)]);
        // Halfway between (50, 150) and (90, 255).
        assert_eq!(c.output_at(70.0, 90.0), 202.5);
        assert_eq!(c.output_at(90.0, 90.0), 255.0);
        assert_eq!(c.output_at(120.0, 90.0), 255.0);
    }

    #[test]
    fn above_last_point_with_full_speed_curve() {
        let c = curve(&[(30.0, 50), (50.0, 150), (70.0, 255)]);
        assert_eq!(c.output_at(80.0, 90.0), 255.0);
    }

    #[test]
    fn ceiling_not_above_last_point_means_full_speed() {
        let c = curve(&[(30.0, 50), (50.0, 150)]);
        assert_eq!(c.output_at(51.0, 50.0), 255.0);
        assert_eq!(c.output_at(51.0, 40.0), 255.0);
    }

    #[test]
    fn single_point_curve() {
        let c = curve(&[(40.0, 100)]);
        assert_eq!(c.output_at(20.0, 80.0), 100.0);
        assert_eq!(c.output_at(40.0, 80.0), 100.0);
        assert_eq!(c.output_at(60.0, 80.0), 177.5);
    }

    #[test]
    fn points_are_sorted_on_construction() {
        let c = curve(&[(70.0, 255), (30.0, 50), (50.0, 150)]);
        let temps: Vec<f64> = c.points().iter().map(|p| p.temp).collect();
        assert_eq!(temps, vec![30.0, 50.0, 70.0]);
    }

    #[test]
    fn empty_curve_rejected() {
        assert!(FanCurve::new(vec![]).is_err());
    }

    #[test]
    fn duplicate_temperature_rejected() {
        let err = FanCurve::new(vec![(40.0, 80).into(), (40.0, 120).into()]).unwrap_err();
        assert!(err.to_string().contains("two points"));
    }

    #[test]
    fn nan_temperature_rejected() {
        assert!(FanCurve::new(vec![(f64::NAN, 80).into()]).is_err());
    }

    fn rising_curve() -> impl Strategy<Value = FanCurve> {
        prop::collection::vec((1.0f64..15.0, 0u8..=255u8), 1..8).prop_map(|steps| {
            let mut temp = 20.0;
            let mut outputs: Vec<u8> = steps.iter().map(|(_, out)| *out).collect();
            outputs.sort_unstable();
            let points = steps
                .iter()
                .zip(outputs)
                .map(|((gap, _), output)| {
                    temp += gap;
                    CurvePoint { temp, output }
                })
                .collect();
            FanCurve::new(points).unwrap()
        })
    }

    proptest! {
        #[test]
        fn output_stays_in_pwm_range(c in rising_curve(), temp in -20.0f64..200.0, ceiling in 0.0f64..150.0) {
            let out = c.output_at(temp, ceiling);
            prop_assert!((0.0..=255.0).contains(&out));
        }

        #[test]
        fn rising_curve_is_monotonic(c in rising_curve(), a in -20.0f64..200.0, b in -20.0f64..200.0, ceiling in 0.0f64..150.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(c.output_at(lo, ceiling) <= c.output_at(hi, ceiling) + 1e-9);
        }
    }
}
