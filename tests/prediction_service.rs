use glyco::config::ServiceConfig;
use glyco::defaults::DefaultsError;
use glyco::encode::{EncodeError, RawInput, RawValue};
use glyco::handler::PredictError;
use glyco::model::artifact::TrainedModel;
use glyco::model::data::{DEFAULT_OUTCOME_COLUMN, load_reference_dataset};
use glyco::model::estimate::{FitConfig, train_model};
use glyco::schema::{FeatureSchema, FeatureValue, Outcome};
use glyco::startup::{ServiceContext, StartupError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const FEATURES: [&str; 6] = [
    "HighBP",
    "BMI",
    "Smoker",
    "HeartDiseaseorAttack",
    "PhysActivity",
    "Sex",
];

/// Writes a survey-coded cohort (0/1 codes, as in the public extract) with a few
/// missing cells, and returns its path.
fn write_cohort(dir: &Path, n: usize, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut text = String::from("Diabetes_binary,HighBP,BMI,Smoker,HeartDiseaseorAttack,PhysActivity,Sex,Age\n");
    for i in 0..n {
        let high_bp = rng.gen_bool(0.45);
        let bmi: f64 = rng.gen_range(17.0..48.0);
        let smoker = rng.gen_bool(0.4);
        let heart = rng.gen_bool(0.1);
        let active = rng.gen_bool(0.7);
        let male = rng.gen_bool(0.45);
        let eta = -2.0
            + 1.5 * f64::from(u8::from(high_bp))
            + 0.09 * (bmi - 28.0)
            + 0.8 * f64::from(u8::from(heart))
            - 0.4 * f64::from(u8::from(active))
            + 0.2 * f64::from(u8::from(male));
        let diabetic = rng.gen_bool(1.0 / (1.0 + (-eta).exp()));

        let label = if i % 97 == 13 { "NA".to_string() } else { format!("{}.0", u8::from(diabetic)) };
        let bmi_cell = if i % 89 == 5 { String::new() } else { format!("{bmi:.1}") };
        writeln!(
            text,
            "{label},{}.0,{bmi_cell},{}.0,{}.0,{}.0,{}.0,{}.0",
            u8::from(high_bp),
            u8::from(smoker),
            u8::from(heart),
            u8::from(active),
            u8::from(male),
            rng.gen_range(1..14)
        )
        .unwrap();
    }
    let path = dir.join("cohort.csv");
    fs::write(&path, text).unwrap();
    path.to_str().unwrap().to_string()
}

fn write_config(dir: &Path, data: &str, model: &str) -> ServiceConfig {
    let text = format!(
        "[server]\nbind = \"127.0.0.1:0\"\n\n[data]\nreference_data = {data:?}\n\n[model]\npath = {model:?}\n\n[info]\nname = \"Diabetes risk\"\ngithub_pages_url = \"https://example.github.io/glyco\"\n"
    );
    let path = dir.join("glyco.toml");
    fs::write(&path, text).unwrap();
    ServiceConfig::load(&path).unwrap()
}

/// Trains on a synthetic cohort and starts the service context from files on disk.
fn start_service(dir: &TempDir) -> ServiceContext {
    let schema = FeatureSchema::standard();
    let data_path = write_cohort(dir.path(), 1500, 42);
    let data = load_reference_dataset(&data_path, &schema, DEFAULT_OUTCOME_COLUMN).unwrap();
    let model = train_model(&data, &schema, &FitConfig::default()).unwrap();
    let model_path = dir.path().join("model.toml");
    model.save(model_path.to_str().unwrap()).unwrap();

    let config = write_config(dir.path(), &data_path, model_path.to_str().unwrap());
    ServiceContext::initialize(&config).unwrap()
}

fn text(value: &str) -> RawValue {
    RawValue::Text(value.to_string())
}

#[test]
fn full_request_is_echoed_and_scored() {
    let dir = tempfile::tempdir().unwrap();
    let service = start_service(&dir);

    let raw = RawInput::new()
        .with("BMI", RawValue::Number(32.0))
        .with("Smoker", text("Yes"))
        .with("HighBP", text("Yes"))
        .with("HeartDiseaseorAttack", text("No"))
        .with("PhysActivity", text("No"))
        .with("Sex", text("Male"));
    let result = service.handler().predict(&raw).unwrap();

    assert_eq!(result.input.get("BMI"), Some(&FeatureValue::Number(32.0)));
    assert_eq!(result.input.get("Smoker"), Some(&FeatureValue::Category("Yes")));
    assert_eq!(result.input.get("HighBP"), Some(&FeatureValue::Category("Yes")));
    assert_eq!(
        result.input.get("HeartDiseaseorAttack"),
        Some(&FeatureValue::Category("No"))
    );
    assert_eq!(result.input.get("PhysActivity"), Some(&FeatureValue::Category("No")));
    assert_eq!(result.input.get("Sex"), Some(&FeatureValue::Category("Male")));
    assert!(Outcome::ALL.contains(&result.predicted_class));
    assert!((0.0..=1.0).contains(&result.prob_diabetes));
    assert_eq!(
        result.predicted_class == Outcome::Diabetes,
        result.prob_diabetes >= 0.5
    );
}

#[test]
fn empty_request_encodes_to_the_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let service = start_service(&dir);

    let result = service.handler().predict(&RawInput::new()).unwrap();
    assert_eq!(result.input, service.defaults().as_row());

    // Every subset of omitted features takes the defaults for exactly those features.
    let supplied = [
        ("HighBP", text("Yes")),
        ("BMI", text("41.5")),
        ("Smoker", text("No")),
        ("HeartDiseaseorAttack", text("Yes")),
        ("PhysActivity", text("No")),
        ("Sex", text("Female")),
    ];
    for mask in 0u32..(1 << FEATURES.len()) {
        let mut raw = RawInput::new();
        for (bit, (name, value)) in supplied.iter().enumerate() {
            if mask & (1 << bit) != 0 {
                raw.insert(*name, value.clone());
            }
        }
        let row = service.handler().encode(&raw).unwrap();
        for (bit, name) in FEATURES.iter().enumerate() {
            if mask & (1 << bit) == 0 {
                assert_eq!(row.get(name), service.defaults().get(name), "mask {mask:06b}");
            }
        }
    }
}

#[test]
fn out_of_domain_category_names_feature_and_domain() {
    let dir = tempfile::tempdir().unwrap();
    let service = start_service(&dir);

    match service.handler().predict(&RawInput::new().with("HighBP", text("maybe"))) {
        Err(PredictError::Encode(EncodeError::InvalidCategory {
            feature, allowed, ..
        })) => {
            assert_eq!(feature, "HighBP");
            assert_eq!(allowed, vec!["No".to_string(), "Yes".to_string()]);
        }
        other => panic!("Expected InvalidCategory, got {:?}", other),
    }
}

#[test]
fn repeated_predictions_are_identical() {
    let dir = tempfile::tempdir().unwrap();
    let service = start_service(&dir);
    let raw = RawInput::new().with("BMI", text("27")).with("Sex", text("Male"));
    assert_eq!(
        service.handler().predict(&raw).unwrap(),
        service.handler().predict(&raw).unwrap()
    );
}

#[test]
fn confusion_matrix_counts_labelled_complete_rows() {
    let dir = tempfile::tempdir().unwrap();
    let service = start_service(&dir);
    let evaluation = service.evaluation();

    assert_eq!(evaluation.rows_total, 1500);
    assert!(evaluation.excluded_missing_label > 0);
    assert!(evaluation.excluded_missing_features > 0);
    assert_eq!(
        service.confusion_matrix().total() as usize,
        evaluation.rows_total
            - evaluation.excluded_missing_label
            - evaluation.excluded_missing_features
    );
    assert!(service.confusion_matrix().accuracy().unwrap() > 0.5);
}

#[test]
fn trained_artifact_round_trips_through_toml() {
    let dir = tempfile::tempdir().unwrap();
    start_service(&dir);
    let model = TrainedModel::load(dir.path().join("model.toml").to_str().unwrap()).unwrap();
    model.check_schema(&FeatureSchema::standard()).unwrap();
    assert_eq!(model.coefficients.terms.len(), 6);
    assert!(model.coefficients.terms["HighBPYes"] > 0.0);
}

#[test]
fn missing_reference_column_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    start_service(&dir);

    let broken = dir.path().join("broken.csv");
    fs::write(&broken, "Diabetes_binary,HighBP,BMI\n0,1,30\n").unwrap();
    let config = write_config(
        dir.path(),
        broken.to_str().unwrap(),
        dir.path().join("model.toml").to_str().unwrap(),
    );
    match ServiceContext::initialize(&config) {
        Err(StartupError::Data(err)) => assert!(err.to_string().contains("Smoker")),
        Err(other) => panic!("Expected a data error, got {other}"),
        Ok(_) => panic!("Startup should have failed"),
    }
}

#[test]
fn all_missing_reference_column_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    start_service(&dir);

    let mut text = String::from("Diabetes_binary,HighBP,BMI,Smoker,HeartDiseaseorAttack,PhysActivity,Sex\n");
    for i in 0..20 {
        writeln!(text, "{},{},NA,0,0,1,{}", i % 2, (i / 2) % 2, i % 3 % 2).unwrap();
    }
    let no_bmi = dir.path().join("no_bmi.csv");
    fs::write(&no_bmi, text).unwrap();

    let config = write_config(
        dir.path(),
        no_bmi.to_str().unwrap(),
        dir.path().join("model.toml").to_str().unwrap(),
    );
    match ServiceContext::initialize(&config) {
        Err(StartupError::Defaults(DefaultsError::EmptyColumn(name))) => assert_eq!(name, "BMI"),
        Err(other) => panic!("Expected EmptyColumn(BMI), got {other}"),
        Ok(_) => panic!("Startup should have failed"),
    }
}
