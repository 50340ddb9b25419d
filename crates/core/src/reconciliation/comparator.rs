//! Field comparison policy
//!
//! Decides whether an uploaded record diverges from the system value. Only
//! tracked fields are compared. A missing field, JSON `null` and an empty
//! string are all treated as "no value".
//!
//! Text is read as a number only for fields the mapping marks numeric, or
//! when the other side already holds a JSON number. Identifiers such as
//! phone numbers keep their leading zeros and signs. Integers compare
//! exactly; the tolerance only loosens comparisons involving fractions.

use serde_json::{Number, Value};
use tillsync_domain::ReconciliationConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldComparator {
    tracked_fields: Vec<String>,
    numeric_fields: Vec<String>,
    numeric_tolerance: f64,
    case_sensitive: bool,
    trim_whitespace: bool,
}

/// Normalised scalar view of a field value.
#[derive(Debug, PartialEq)]
enum Scalar<'a> {
    Absent,
    Integer(i128),
    Float(f64),
    Text(String),
    Other(&'a Value),
}

impl FieldComparator {
    pub fn new(tracked_fields: Vec<String>) -> Self {
        Self::from_config(tracked_fields, &ReconciliationConfig::default())
    }

    pub fn from_config(tracked_fields: Vec<String>, config: &ReconciliationConfig) -> Self {
        Self {
            tracked_fields,
            numeric_fields: Vec::new(),
            numeric_tolerance: config.numeric_tolerance.abs(),
            case_sensitive: config.case_sensitive,
            trim_whitespace: config.trim_whitespace,
        }
    }

    /// Fields whose text values are read as numbers.
    #[must_use]
    pub fn with_numeric_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.numeric_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_numeric_tolerance(mut self, tolerance: f64) -> Self {
        self.numeric_tolerance = tolerance.abs();
        self
    }

    #[must_use]
    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    pub fn tracked_fields(&self) -> &[String] {
        &self.tracked_fields
    }

    /// A record absent on either side always diverges.
    pub fn diverges(&self, system: Option<&Value>, uploaded: Option<&Value>) -> bool {
        match (system, uploaded) {
            (Some(system), Some(uploaded)) => !self.differing_fields(system, uploaded).is_empty(),
            _ => true,
        }
    }

    /// Tracked fields whose values differ between the two records.
    pub fn differing_fields(&self, system: &Value, uploaded: &Value) -> Vec<String> {
        self.tracked_fields
            .iter()
            .filter(|field| {
                !self.field_equal(field, system.get(field.as_str()), uploaded.get(field.as_str()))
            })
            .cloned()
            .collect()
    }

    pub fn field_equal(&self, field: &str, a: Option<&Value>, b: Option<&Value>) -> bool {
        let numeric = self.numeric_fields.iter().any(|f| f == field)
            || matches!(a, Some(Value::Number(_)))
            || matches!(b, Some(Value::Number(_)));

        match (self.scalar(a, numeric), self.scalar(b, numeric)) {
            (Scalar::Absent, Scalar::Absent) => true,
            (Scalar::Integer(x), Scalar::Integer(y)) => {
                x == y || self.within_tolerance(x.abs_diff(y) as f64)
            }
            (Scalar::Integer(x), Scalar::Float(y)) | (Scalar::Float(y), Scalar::Integer(x)) => {
                self.within_tolerance((x as f64 - y).abs())
            }
            (Scalar::Float(x), Scalar::Float(y)) => self.within_tolerance((x - y).abs()),
            (Scalar::Text(x), Scalar::Text(y)) => x == y,
            (Scalar::Other(x), Scalar::Other(y)) => x == y,
            _ => false,
        }
    }

    fn within_tolerance(&self, difference: f64) -> bool {
        difference <= self.numeric_tolerance
    }

    fn scalar<'a>(&self, value: Option<&'a Value>, numeric: bool) -> Scalar<'a> {
        match value {
            None | Some(Value::Null) => Scalar::Absent,
            Some(v @ Value::Number(n)) => number_scalar(n).unwrap_or(Scalar::Other(v)),
            Some(Value::Bool(b)) => Scalar::Text(b.to_string()),
            Some(Value::String(s)) => self.text_scalar(s, numeric),
            Some(other) => Scalar::Other(other),
        }
    }

    fn text_scalar(&self, raw: &str, numeric: bool) -> Scalar<'static> {
        let text = if self.trim_whitespace { raw.trim() } else { raw };
        if text.trim().is_empty() {
            return Scalar::Absent;
        }
        if numeric {
            if let Some(number) = parse_numeric(text.trim()) {
                return number;
            }
        }
        if self.case_sensitive {
            Scalar::Text(text.to_string())
        } else {
            Scalar::Text(text.to_lowercase())
        }
    }
}

fn number_scalar(n: &Number) -> Option<Scalar<'static>> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
        .map(Scalar::Integer)
        .or_else(|| n.as_f64().map(Scalar::Float))
}

fn parse_numeric(text: &str) -> Option<Scalar<'static>> {
    if let Ok(integer) = text.parse::<i128>() {
        return Some(Scalar::Integer(integer));
    }
    text.parse::<f64>().ok().filter(|f| f.is_finite()).map(Scalar::Float)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stock() -> FieldComparator {
        FieldComparator::new(vec!["stock".into()])
    }

    #[test]
    fn equal_values_agree() {
        assert!(!stock().diverges(Some(&json!({"stock": 10})), Some(&json!({"stock": 10}))));
    }

    #[test]
    fn different_values_diverge() {
        let comparator = stock();
        let system = json!({"stock": 10});
        let uploaded = json!({"stock": 7});
        assert!(comparator.diverges(Some(&system), Some(&uploaded)));
        assert_eq!(comparator.differing_fields(&system, &uploaded), vec!["stock"]);
    }

    #[test]
    fn numeric_strings_compare_as_numbers() {
        let comparator = stock();
        assert!(!comparator.diverges(Some(&json!({"stock": 10})), Some(&json!({"stock": " 10.0 "}))));
        assert!(comparator.diverges(Some(&json!({"stock": 10})), Some(&json!({"stock": "10.5"}))));

        let loose = stock().with_numeric_tolerance(0.01);
        assert!(!loose.diverges(Some(&json!({"stock": 1.001})), Some(&json!({"stock": "1.0"}))));
    }

    #[test]
    fn untracked_fields_are_ignored() {
        assert!(!stock().diverges(
            Some(&json!({"stock": 3, "name": "Widget"})),
            Some(&json!({"stock": "3", "name": "Gadget"}))
        ));
    }

    #[test]
    fn missing_null_and_empty_are_equal() {
        let comparator = stock();
        assert!(comparator.field_equal("stock", None, Some(&json!(null))));
        assert!(comparator.field_equal("stock", Some(&json!("  ")), None));
        assert!(!comparator.field_equal("stock", Some(&json!(0)), None));
    }

    #[test]
    fn case_policy_is_configurable() {
        let fields = vec!["status".to_string()];
        let strict = FieldComparator::new(fields.clone());
        let relaxed = FieldComparator::new(fields).case_insensitive();
        let system = json!({"status": "Shipped"});
        let uploaded = json!({"status": "shipped"});
        assert!(strict.diverges(Some(&system), Some(&uploaded)));
        assert!(!relaxed.diverges(Some(&system), Some(&uploaded)));
    }

    #[test]
    fn absent_records_always_diverge() {
        assert!(stock().diverges(None, Some(&json!({"stock": 1}))));
        assert!(stock().diverges(Some(&json!({"stock": 1})), None));
    }

    #[test]
    fn identifier_strings_are_not_read_as_numbers() {
        let comparator = FieldComparator::new(vec!["phone".into()]);
        for (system, uploaded) in [("0412345678", "412345678"), ("+15551234", "15551234")] {
            assert!(
                comparator.diverges(Some(&json!({"phone": system})), Some(&json!({"phone": uploaded}))),
                "{system} vs {uploaded}"
            );
        }
        assert!(!comparator.diverges(
            Some(&json!({"phone": "0412345678"})),
            Some(&json!({"phone": " 0412345678 "}))
        ));
    }

    #[test]
    fn numeric_fields_read_text_on_both_sides() {
        let comparator = FieldComparator::new(vec!["total".into()]).with_numeric_fields(["total"]);
        assert!(!comparator.diverges(Some(&json!({"total": "12.50"})), Some(&json!({"total": "12.5"}))));
        assert!(comparator.diverges(Some(&json!({"total": "12.50"})), Some(&json!({"total": "12.51"}))));
    }

    #[test]
    fn large_integers_compare_exactly() {
        let comparator = FieldComparator::new(vec!["ref".into()]);
        let system = json!({"ref": 9_007_199_254_740_993_u64});
        assert!(comparator.diverges(Some(&system), Some(&json!({"ref": 9_007_199_254_740_992_u64}))));
        assert!(comparator.diverges(Some(&system), Some(&json!({"ref": "9007199254740992"}))));
        assert!(!comparator.diverges(Some(&system), Some(&json!({"ref": "9007199254740993"}))));
        assert!(comparator.diverges(
            Some(&json!({"ref": u64::MAX})),
            Some(&json!({"ref": u64::MAX - 1}))
        ));
    }
}
