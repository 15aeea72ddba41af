//! Expected values and comparison settings for merge validation

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest scale a decimal can carry
const MAX_SCALE: u32 = 28;

/// Expected totals of one header template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderExpectation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<Decimal>,
}

/// Expectations and comparison parameters for one validation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationContext {
    expectations: BTreeMap<String, HeaderExpectation>,
    sum_tolerance: Decimal,
    sum_scale: u32,
    missing_expectations_as_warning: bool,
    reference_pass: bool,
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self {
            expectations: BTreeMap::new(),
            sum_tolerance: Decimal::new(1, 2),
            sum_scale: 2,
            missing_expectations_as_warning: true,
            reference_pass: false,
        }
    }
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `count` data rows for the named header
    pub fn expect_row_count(mut self, header_name: impl Into<String>, count: u64) -> Self {
        self.expectations.entry(header_name.into()).or_default().row_count = Some(count);
        self
    }

    /// Expect the named header's values to sum to `sum`
    pub fn expect_sum(mut self, header_name: impl Into<String>, sum: Decimal) -> Self {
        self.expectations.entry(header_name.into()).or_default().sum = Some(sum);
        self
    }

    /// Maximum allowed absolute difference between sums; the sign is ignored
    pub fn with_tolerance(mut self, tolerance: Decimal) -> Self {
        self.sum_tolerance = tolerance.abs();
        self
    }

    /// Number of fractional digits sums are rounded to before comparison
    pub fn with_scale(mut self, scale: u32) -> Self {
        self.sum_scale = scale;
        self
    }

    /// Report missing expectations as issues instead of only logging them
    pub fn strict(mut self) -> Self {
        self.missing_expectations_as_warning = false;
        self
    }

    pub fn with_missing_expectations_as_warning(mut self, warn_only: bool) -> Self {
        self.missing_expectations_as_warning = warn_only;
        self
    }

    /// Enable the independent reference recomputation
    pub fn with_reference_pass(mut self, enabled: bool) -> Self {
        self.reference_pass = enabled;
        self
    }

    pub fn expected_row_count(&self, header_name: &str) -> Option<u64> {
        self.expectations.get(header_name).and_then(|e| e.row_count)
    }

    pub fn expected_sum(&self, header_name: &str) -> Option<Decimal> {
        self.expectations.get(header_name).and_then(|e| e.sum)
    }

    pub fn expectations(&self) -> &BTreeMap<String, HeaderExpectation> {
        &self.expectations
    }

    pub fn tolerance(&self) -> Decimal {
        self.sum_tolerance.abs()
    }

    pub fn scale(&self) -> u32 {
        self.sum_scale.min(MAX_SCALE)
    }

    pub fn missing_expectations_as_warning(&self) -> bool {
        self.missing_expectations_as_warning
    }

    pub fn reference_pass_enabled(&self) -> bool {
        self.reference_pass
    }
}
