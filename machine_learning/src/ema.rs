use ndarray::Zip;

use crate::{MlErr, ParamSet, Result};

/// Decay applied to the shadow parameters on every completed step.
pub const EMA_DECAY: f32 = 0.9999;

/// Steps the EMA shadow towards the live parameters.
///
/// Every tensor becomes `shadow * decay + live * (1 - decay)`. A `decay` of `0` makes the shadow
/// an exact copy of `live`, which is how the shadow gets initialized.
///
/// # Arguments
/// * `shadow` - The EMA parameters, mutated in place.
/// * `live` - The parameters being trained.
/// * `decay` - How much of the current shadow value is kept.
///
/// # Errors
/// Returns `ParamKeyMismatch` if both sets don't share the same keys, or `ShapeMismatch` if some
/// tensor differs in shape. Nothing is written in either case.
pub fn update_ema(shadow: &mut ParamSet, live: &ParamSet, decay: f32) -> Result<()> {
    shadow.check_same_keys(live)?;

    for (name, l) in live {
        let s = shadow.require(name)?;
        if s.shape() != l.shape() {
            return Err(MlErr::ShapeMismatch {
                what: format!("ema.{name}"),
                got: s.shape().to_vec(),
                expected: l.shape().to_vec(),
            });
        }
    }

    let keep = 1.0 - decay;
    for (name, l) in live {
        let s = shadow.require_mut(name)?;
        Zip::from(s)
            .and(l)
            .par_for_each(|s, &l| *s = *s * decay + l * keep);
    }

    Ok(())
}
