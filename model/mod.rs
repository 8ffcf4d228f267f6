//! The trained classifier and everything needed to produce or feed it: the
//! on-disk artifact, reference data loading, and offline estimation.

pub mod artifact;
pub mod data;
pub mod estimate;

#[cfg(test)]
pub mod test_fixtures;
