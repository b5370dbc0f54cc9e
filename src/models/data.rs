//! Parameter, observational data and realization types.
//!
//! K_i: These types represent the core data flow through the pipeline.
//! B_i: Anything arriving from outside (external realizations, evaluation
//! requests) is parsed from loosely typed JSON and validated here, at the
//! boundary where it enters.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::{ConfigError, HistMatchError, Result};

/// One parameter vector of the model.
pub type ParSet = Vec<f64>;

/// Identifier of one model output (data point).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataIdx(pub String);

impl std::fmt::Display for DataIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataIdx {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DataIdx {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<i64> for DataIdx {
    fn from(i: i64) -> Self {
        Self(i.to_string())
    }
}

/// A model parameter with its bounds and optional best estimate.
///
/// K_i: `lower < upper` once the parameter has passed [`ModelParameter::check`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameter {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<f64>,
}

impl ModelParameter {
    pub fn new(name: impl Into<String>, lower: f64, upper: f64, estimate: Option<f64>) -> Self {
        Self {
            name: name.into(),
            lower,
            upper,
            estimate,
        }
    }

    pub fn range(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    /// B_i(bounds ordered and finite) → Result
    pub fn check(&self) -> std::result::Result<(), ConfigError> {
        if !(self.lower.is_finite() && self.upper.is_finite() && self.lower < self.upper) {
            return Err(ConfigError::InvalidBounds {
                name: self.name.clone(),
                lower: self.lower,
                upper: self.upper,
            });
        }
        Ok(())
    }
}

/// Space in which a data value (and its errors) is expressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSpace {
    #[default]
    Lin,
    Log10,
    Ln,
}

impl DataSpace {
    /// Default model discrepancy variance for a value in this space.
    ///
    /// A sixth of the linear value as standard deviation, carried into log
    /// space as the log of a 1/6 relative perturbation.
    pub fn default_md_var(self, value: f64) -> f64 {
        match self {
            Self::Lin => (value / 6.0).powi(2),
            Self::Log10 => (7.0f64 / 6.0).log10().powi(2),
            Self::Ln => (7.0f64 / 6.0).ln().powi(2),
        }
    }
}

/// One observed data point the emulator is matched against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub idx: DataIdx,
    pub value: f64,
    /// Error below the value (used when the emulator lies under the data)
    pub err_lower: f64,
    /// Error above the value
    pub err_upper: f64,
    #[serde(default)]
    pub space: DataSpace,
}

impl DataPoint {
    /// Data point with a symmetric error in linear space.
    pub fn new(idx: impl Into<DataIdx>, value: f64, err: f64) -> Self {
        Self {
            idx: idx.into(),
            value,
            err_lower: err,
            err_upper: err,
            space: DataSpace::Lin,
        }
    }

    pub fn with_space(mut self, space: DataSpace) -> Self {
        self.space = space;
        self
    }

    /// Observational variance on the side where `adj_exp` lies.
    pub fn err_var(&self, adj_exp: f64) -> f64 {
        if adj_exp >= self.value {
            self.err_upper.powi(2)
        } else {
            self.err_lower.powi(2)
        }
    }
}

/// Model outputs for every sample of a sample set.
///
/// K_i: every column has exactly one value per sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOutputSet {
    pub values: BTreeMap<DataIdx, Vec<f64>>,
    /// Optional per-sample model error variance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_var: Option<BTreeMap<DataIdx, Vec<f64>>>,
}

impl ModelOutputSet {
    pub fn column(&self, idx: &DataIdx) -> Result<&[f64]> {
        self.values
            .get(idx)
            .map(Vec::as_slice)
            .ok_or_else(|| HistMatchError::Input(format!("no model output for data point {idx}")))
    }

    pub fn err_column(&self, idx: &DataIdx) -> Option<&[f64]> {
        self.err_var
            .as_ref()
            .and_then(|m| m.get(idx))
            .map(Vec::as_slice)
    }

    /// Validate key set and column lengths against the expected data and sample count.
    ///
    /// B_i(keys match) → Input error
    /// B_i(columns have n_sam values) → Shape error
    pub fn validate(&self, data: &[DataPoint], n_sam: usize) -> Result<()> {
        let expected: BTreeSet<&DataIdx> = data.iter().map(|d| &d.idx).collect();
        check_key_set("model output set", self.values.keys().collect(), &expected)?;
        for (idx, col) in &self.values {
            check_column_len(&format!("model output {idx}"), col.len(), n_sam)?;
            if col.iter().any(|v| !v.is_finite()) {
                return Err(HistMatchError::Value(format!(
                    "model output {idx} contains non-finite values"
                )));
            }
        }
        if let Some(err_var) = &self.err_var {
            check_key_set("model error variances", err_var.keys().collect(), &expected)?;
            for (idx, col) in err_var {
                check_column_len(&format!("model error variance {idx}"), col.len(), n_sam)?;
                if col.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                    return Err(HistMatchError::Value(format!(
                        "model error variance {idx} must be finite and non-negative"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_key_set(what: &str, got: BTreeSet<&DataIdx>, expected: &BTreeSet<&DataIdx>) -> Result<()> {
    if &got != expected {
        let missing: Vec<String> = expected.difference(&got).map(|k| k.to_string()).collect();
        let extra: Vec<String> = got.difference(expected).map(|k| k.to_string()).collect();
        return Err(HistMatchError::Input(format!(
            "{what} keys do not match the model data (missing: {missing:?}, unexpected: {extra:?})"
        )));
    }
    Ok(())
}

fn check_column_len(what: &str, len: usize, n_sam: usize) -> Result<()> {
    if len != n_sam {
        return Err(HistMatchError::Shape(format!(
            "{what} has {len} values, expected {n_sam}"
        )));
    }
    Ok(())
}

/// Externally provided samples and model outputs that replace sampling and evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRealizationSet {
    /// Parameter name → one value per sample
    pub sam_set: BTreeMap<String, Vec<f64>>,
    /// Data index → one output per sample
    pub mod_set: BTreeMap<DataIdx, Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_var: Option<BTreeMap<DataIdx, Vec<f64>>>,
}

impl ExternalRealizationSet {
    /// Parse either `[sam_set, mod_set]` or `{"sam_set": .., "mod_set": ..}`.
    ///
    /// B_i(list has two members) → Shape error
    /// B_i(mapping has both keys) → Input error
    /// B_i(members are mappings of columns) → Type error
    pub fn from_value(value: &Value) -> Result<Self> {
        let (sam, modv, err) = match value {
            Value::Array(items) => {
                if items.len() != 2 {
                    return Err(HistMatchError::Shape(format!(
                        "external realization list must have 2 members (sam_set, mod_set), got {}",
                        items.len()
                    )));
                }
                (&items[0], &items[1], None)
            }
            Value::Object(map) => {
                let sam = map.get("sam_set").ok_or_else(|| {
                    HistMatchError::Input("external realization set has no 'sam_set' key".into())
                })?;
                let modv = map.get("mod_set").ok_or_else(|| {
                    HistMatchError::Input("external realization set has no 'mod_set' key".into())
                })?;
                (sam, modv, map.get("err_var"))
            }
            other => {
                return Err(HistMatchError::Input(format!(
                    "external realization set must be a list or a mapping, got {}",
                    json_kind(other)
                )))
            }
        };

        let sam_set = parse_columns("sam_set", sam)?;
        let mod_set = parse_columns("mod_set", modv)?
            .into_iter()
            .map(|(k, v)| (DataIdx(k), v))
            .collect();
        let err_var = match err {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                parse_columns("err_var", v)?
                    .into_iter()
                    .map(|(k, v)| (DataIdx(k), v))
                    .collect(),
            ),
        };

        Ok(Self {
            sam_set,
            mod_set,
            err_var,
        })
    }

    /// Validate against the model and convert into a row-major sample set plus outputs.
    pub fn validate(
        &self,
        params: &[ModelParameter],
        data: &[DataPoint],
    ) -> Result<(Vec<ParSet>, ModelOutputSet)> {
        let expected: BTreeSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
        let got: BTreeSet<&str> = self.sam_set.keys().map(String::as_str).collect();
        if got != expected {
            return Err(HistMatchError::Input(format!(
                "external sam_set parameters {got:?} do not match model parameters {expected:?}"
            )));
        }

        let n_sam = self.sam_set.values().next().map(Vec::len).unwrap_or(0);
        if n_sam == 0 {
            return Err(HistMatchError::Shape(
                "external sam_set contains no samples".to_string(),
            ));
        }
        for (name, col) in &self.sam_set {
            check_column_len(&format!("external sam_set column '{name}'"), col.len(), n_sam)?;
        }

        let mut sam_set = vec![Vec::with_capacity(params.len()); n_sam];
        for par in params {
            let col = &self.sam_set[&par.name];
            for (row, &v) in sam_set.iter_mut().zip(col) {
                if !par.contains(v) {
                    return Err(HistMatchError::Input(format!(
                        "external sample value {v} for '{}' lies outside [{}, {}]",
                        par.name, par.lower, par.upper
                    )));
                }
                row.push(v);
            }
        }

        let mod_set = ModelOutputSet {
            values: self.mod_set.clone(),
            err_var: self.err_var.clone(),
        };
        mod_set.validate(data, n_sam)?;

        Ok((sam_set, mod_set))
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

fn parse_number(what: &str, v: &Value) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| HistMatchError::Type(format!("{what} must be numeric, got {}", json_kind(v))))
}

/// Parse a mapping of key → scalar or list of scalars.
fn parse_columns(what: &str, v: &Value) -> Result<BTreeMap<String, Vec<f64>>> {
    let map = v.as_object().ok_or_else(|| {
        HistMatchError::Type(format!("{what} must be a mapping, got {}", json_kind(v)))
    })?;
    map.iter()
        .map(|(k, col)| {
            let values = match col {
                Value::Array(items) => items
                    .iter()
                    .map(|x| parse_number(what, x))
                    .collect::<Result<Vec<f64>>>()?,
                scalar => vec![parse_number(what, scalar)?],
            };
            Ok((k.clone(), values))
        })
        .collect()
}

/// Parse parameter sets for evaluation.
///
/// Accepts a single vector, a list of vectors, or a mapping of parameter name
/// to value (or list of values).
pub fn parse_par_sets(value: &Value, params: &[ModelParameter]) -> Result<Vec<ParSet>> {
    let n_par = params.len();
    let sets = match value {
        Value::Array(items) if items.iter().all(Value::is_number) => {
            vec![items
                .iter()
                .map(|x| parse_number("parameter value", x))
                .collect::<Result<ParSet>>()?]
        }
        Value::Array(items) => items
            .iter()
            .map(|row| match row {
                Value::Array(inner) => {
                    if inner.iter().any(Value::is_array) {
                        return Err(HistMatchError::Shape(
                            "parameter sets must be at most two-dimensional".to_string(),
                        ));
                    }
                    inner
                        .iter()
                        .map(|x| parse_number("parameter value", x))
                        .collect::<Result<ParSet>>()
                }
                other => Err(HistMatchError::Type(format!(
                    "parameter set must be a list, got {}",
                    json_kind(other)
                ))),
            })
            .collect::<Result<Vec<ParSet>>>()?,
        Value::Object(_) => {
            let cols = parse_columns("parameter sets", value)?;
            let expected: BTreeSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
            let got: BTreeSet<&str> = cols.keys().map(String::as_str).collect();
            if got != expected {
                return Err(HistMatchError::Input(format!(
                    "parameter names {got:?} do not match model parameters {expected:?}"
                )));
            }
            let n = cols.values().next().map(Vec::len).unwrap_or(0);
            for (name, col) in &cols {
                check_column_len(&format!("parameter column '{name}'"), col.len(), n)?;
            }
            (0..n)
                .map(|i| params.iter().map(|p| cols[&p.name][i]).collect())
                .collect()
        }
        other => {
            return Err(HistMatchError::Type(format!(
                "parameter sets must be a list or a mapping, got {}",
                json_kind(other)
            )))
        }
    };
    check_par_sets(&sets, n_par)?;
    Ok(sets)
}

/// B_i(every set has n_par values) → Shape error
pub fn check_par_sets(sets: &[ParSet], n_par: usize) -> Result<()> {
    if sets.is_empty() {
        return Err(HistMatchError::Shape(
            "no parameter sets were provided".to_string(),
        ));
    }
    if let Some(bad) = sets.iter().find(|s| s.len() != n_par) {
        return Err(HistMatchError::Shape(format!(
            "parameter set has {} values, model has {n_par} parameters",
            bad.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> Vec<ModelParameter> {
        vec![
            ModelParameter::new("A", 1.0, 5.0, Some(2.5)),
            ModelParameter::new("B", 1.0, 3.0, Some(2.0)),
        ]
    }

    fn data() -> Vec<DataPoint> {
        vec![DataPoint::new("1", 1.5, 0.05), DataPoint::new("2", 2.5, 0.05)]
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let p = ModelParameter::new("A", 3.0, 1.0, None);
        assert!(matches!(p.check(), Err(ConfigError::InvalidBounds { .. })));
    }

    #[test]
    fn test_ext_real_set_list_form() {
        let ext = ExternalRealizationSet::from_value(&json!([
            {"A": [2.0, 3.0], "B": [1.5, 2.5]},
            {"1": [1.0, 1.1], "2": [2.0, 2.1]}
        ]))
        .unwrap();
        let (sam, mods) = ext.validate(&params(), &data()).unwrap();
        assert_eq!(sam, vec![vec![2.0, 1.5], vec![3.0, 2.5]]);
        assert_eq!(mods.column(&DataIdx::from("2")).unwrap(), &[2.0, 2.1]);
    }

    #[test]
    fn test_ext_real_set_errors() {
        let three = ExternalRealizationSet::from_value(&json!([1, 1, 1]));
        assert!(matches!(three, Err(HistMatchError::Shape(_))));

        let no_sam = ExternalRealizationSet::from_value(&json!({"mod_set": 1}));
        assert!(matches!(no_sam, Err(HistMatchError::Input(_))));

        let scalar = ExternalRealizationSet::from_value(&json!(1));
        assert!(matches!(scalar, Err(HistMatchError::Input(_))));

        let list_members = ExternalRealizationSet::from_value(&json!([[1.0, 1.0], [1.0, 1.0]]));
        assert!(matches!(list_members, Err(HistMatchError::Type(_))));

        let uneven = ExternalRealizationSet::from_value(&json!([
            {"A": [2.0], "B": [1.5]},
            {"1": [1.0, 1.1], "2": [2.0, 2.1]}
        ]))
        .unwrap();
        assert!(matches!(
            uneven.validate(&params(), &data()),
            Err(HistMatchError::Shape(_))
        ));

        let wrong_key = ExternalRealizationSet::from_value(&json!([
            {"A": [2.0], "C": [1.5]},
            {"1": [1.0], "2": [2.0]}
        ]))
        .unwrap();
        assert!(matches!(
            wrong_key.validate(&params(), &data()),
            Err(HistMatchError::Input(_))
        ));
    }

    #[test]
    fn test_parse_par_sets_shapes() {
        let p = params();
        assert_eq!(parse_par_sets(&json!([2.5, 2.0]), &p).unwrap().len(), 1);
        assert_eq!(
            parse_par_sets(&json!([[2.5, 2.0], [3.0, 1.5]]), &p).unwrap().len(),
            2
        );
        assert_eq!(
            parse_par_sets(&json!({"A": [2.5, 3.0], "B": [2.0, 1.5]}), &p).unwrap(),
            vec![vec![2.5, 2.0], vec![3.0, 1.5]]
        );
        assert!(matches!(
            parse_par_sets(&json!([[[2.5, 2.0]]]), &p),
            Err(HistMatchError::Shape(_))
        ));
        assert!(matches!(
            parse_par_sets(&json!([2.5, 2.0, 1.0]), &p),
            Err(HistMatchError::Shape(_))
        ));
    }

    #[test]
    fn test_two_sided_err_var() {
        let mut d = DataPoint::new("1", 1.0, 0.1);
        d.err_upper = 0.3;
        assert!((d.err_var(2.0) - 0.09).abs() < 1e-12);
        assert!((d.err_var(0.5) - 0.01).abs() < 1e-12);
    }
}
