//! Test fixtures and builders for model and evaluation tests.
//!
//! Provides a seeded synthetic cohort whose outcome depends on the predictors
//! through a known logistic relationship.

use crate::model::data::ReferenceDataset;
use crate::schema::{FeatureSchema, FeatureValue, Outcome};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// True coefficients used to simulate outcomes.
pub const TRUE_INTERCEPT: f64 = -1.6;
pub const TRUE_HIGH_BP: f64 = 1.4;
pub const TRUE_BMI: f64 = 0.11;
pub const TRUE_SMOKER: f64 = 0.3;
pub const TRUE_HEART: f64 = 0.9;
pub const TRUE_PHYS_ACTIVITY: f64 = -0.5;
pub const TRUE_MALE: f64 = 0.2;

fn yes_no(flag: bool) -> FeatureValue {
    FeatureValue::Category(if flag { "Yes" } else { "No" })
}

/// Simulates `n` complete, labelled reference rows.
pub fn synthetic_cohort(schema: &FeatureSchema, n: usize, seed: u64) -> ReferenceDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut columns: Vec<Vec<Option<FeatureValue>>> = vec![Vec::with_capacity(n); schema.len()];
    let mut outcomes = Vec::with_capacity(n);

    for _ in 0..n {
        let high_bp = rng.gen_bool(0.4);
        let bmi: f64 = rng.gen_range(18.0..45.0);
        let smoker = rng.gen_bool(0.45);
        let heart = rng.gen_bool(0.1);
        let active = rng.gen_bool(0.75);
        let male = rng.gen_bool(0.45);

        let eta = TRUE_INTERCEPT
            + TRUE_HIGH_BP * f64::from(u8::from(high_bp))
            + TRUE_BMI * (bmi - 28.0)
            + TRUE_SMOKER * f64::from(u8::from(smoker))
            + TRUE_HEART * f64::from(u8::from(heart))
            + TRUE_PHYS_ACTIVITY * f64::from(u8::from(active))
            + TRUE_MALE * f64::from(u8::from(male));
        let p = 1.0 / (1.0 + (-eta).exp());

        columns[0].push(Some(yes_no(high_bp)));
        columns[1].push(Some(FeatureValue::Number(bmi)));
        columns[2].push(Some(yes_no(smoker)));
        columns[3].push(Some(yes_no(heart)));
        columns[4].push(Some(yes_no(active)));
        columns[5].push(Some(FeatureValue::Category(if male { "Male" } else { "Female" })));
        outcomes.push(Some(if rng.gen_bool(p) {
            Outcome::Diabetes
        } else {
            Outcome::NoDiabetes
        }));
    }

    ReferenceDataset::new(schema, columns, outcomes).expect("synthetic cohort matches the schema")
}
