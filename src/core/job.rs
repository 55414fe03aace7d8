use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strum::{Display, EnumIter, EnumString};

/// Keys starting with this marker are metadata and never reach the child's argv.
pub const METADATA_PREFIX: char = '_';
/// Parameter holding the GPU index handed to the child.
pub const GPU_KEY: &str = "gpu";
/// Metadata key selecting a sub-directory of the result dir for the log file.
pub const RESULT_SUBDIR_KEY: &str = "_result_subdir";

#[derive(
    Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
}

impl JobState {
    /// `queued -> running -> completed`, never backwards.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running) | (JobState::Running, JobState::Completed)
        )
    }
}

/// A single parameter value of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// `true` passes `True` after the key, `false` passes the bare key.
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
    /// Bare `--key` with no value token.
    Flag,
}

impl ParamValue {
    /// Tokens placed after `--key` on the command line.
    pub fn to_arg_tokens(&self) -> Vec<String> {
        match self {
            ParamValue::Flag | ParamValue::Bool(false) => Vec::new(),
            ParamValue::List(items) => items.iter().flat_map(|v| v.to_arg_tokens()).collect(),
            other => vec![other.to_string()],
        }
    }

    pub fn contains_path_separator(&self) -> bool {
        match self {
            ParamValue::Str(s) => s.contains(std::path::MAIN_SEPARATOR) || s.contains('/'),
            ParamValue::List(items) => items.iter().any(ParamValue::contains_path_separator),
            _ => false,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(true) => f.write_str("True"),
            ParamValue::Bool(false) => f.write_str("False"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => f.write_str(&format_float(*v)),
            ParamValue::Str(v) => f.write_str(v),
            ParamValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            ParamValue::Flag => f.write_str("None"),
        }
    }
}

/// Shortest round-trip form. Exponents below -4 or from 16 up use scientific
/// notation with a signed two-digit exponent (`1e-05`, `1.5e+16`); integral
/// values keep a trailing `.0` so `3.0` and `3` name different files.
fn format_float(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if v != 0.0 {
        let sci = format!("{v:e}");
        if let Some((mantissa, exp)) = sci.split_once('e') {
            if let Ok(exp) = exp.parse::<i32>() {
                if !(-4..16).contains(&exp) {
                    let sign = if exp < 0 { '-' } else { '+' };
                    return format!("{mantissa}e{sign}{:02}", exp.abs());
                }
            }
        }
    }
    if v.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        ParamValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Named parameter set describing one invocation of the target program.
///
/// Entries are kept sorted by key, so iteration order is the order used for
/// both log file names and the projected argument vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobSpec {
    params: BTreeMap<String, ParamValue>,
}

pub fn is_metadata_key(key: &str) -> bool {
    key.starts_with(METADATA_PREFIX)
}

impl JobSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// All entries, metadata included, sorted by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Entries that are passed to the child program.
    pub fn params(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.iter().filter(|(k, _)| !is_metadata_key(k))
    }

    /// GPU requested by the job, if any.
    pub fn gpu(&self) -> Option<u32> {
        match self.params.get(GPU_KEY)? {
            ParamValue::Int(i) => u32::try_from(*i).ok(),
            ParamValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// A `gpu` entry that is null or not an index counts as absent.
    pub fn has_gpu(&self) -> bool {
        self.gpu().is_some()
    }

    /// Record a GPU chosen by the allocator.
    pub fn assign_gpu(&mut self, index: u32) {
        self.insert(GPU_KEY, index);
    }

    pub fn result_subdir(&self) -> Option<&str> {
        match self.params.get(RESULT_SUBDIR_KEY)? {
            ParamValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}: {value}")?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for JobSpec {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut spec = JobSpec::new();
        for (k, v) in iter {
            spec.insert(k, v);
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_state_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Completed));
        assert!(!JobState::Completed.can_transition_to(JobState::Running));
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(JobState::Running.to_string(), "running");
        assert_eq!(JobState::from_str("completed").unwrap(), JobState::Completed);
    }

    #[test]
    fn test_value_rendering() {
        assert_eq!(ParamValue::from(1).to_string(), "1");
        assert_eq!(ParamValue::from(3.2).to_string(), "3.2");
        assert_eq!(ParamValue::from(3.0).to_string(), "3.0");
        assert_eq!(ParamValue::from(vec![1, 2]).to_string(), "[1, 2]");
        assert_eq!(
            ParamValue::from(vec![1, 2]).to_arg_tokens(),
            vec!["1".to_string(), "2".to_string()]
        );
        assert!(ParamValue::Flag.to_arg_tokens().is_empty());
    }

    #[test]
    fn test_float_rendering_switches_to_exponent() {
        assert_eq!(ParamValue::from(1e-5).to_string(), "1e-05");
        assert_eq!(ParamValue::from(0.0001).to_string(), "0.0001");
        assert_eq!(ParamValue::from(1e16).to_string(), "1e+16");
        assert_eq!(ParamValue::from(1.5e16).to_string(), "1.5e+16");
        assert_eq!(ParamValue::from(1e15).to_string(), "1000000000000000.0");
        assert_eq!(ParamValue::from(-2.5e-7).to_string(), "-2.5e-07");
        assert_eq!(ParamValue::from(0.0).to_string(), "0.0");
        assert_eq!(ParamValue::Flag.to_string(), "None");
    }

    #[test]
    fn test_bool_values() {
        let spec: JobSpec = serde_json::from_str(r#"{"amp": true, "dry": false, "n": 1}"#).unwrap();
        assert_eq!(spec.get("amp"), Some(&ParamValue::Bool(true)));
        assert_eq!(spec.get("n"), Some(&ParamValue::Int(1)));
        assert_eq!(spec.to_string(), "{amp: True, dry: False, n: 1}");
        assert_eq!(ParamValue::Bool(true).to_arg_tokens(), vec!["True".to_string()]);
        assert!(ParamValue::Bool(false).to_arg_tokens().is_empty());
    }

    #[test]
    fn test_null_gpu_is_unassigned() {
        let mut spec: JobSpec = serde_json::from_str(r#"{"gpu": null, "number": 1}"#).unwrap();
        assert!(!spec.has_gpu());
        assert_eq!(spec.gpu(), None);
        spec.assign_gpu(1);
        assert!(spec.has_gpu());
        assert_eq!(spec.get(GPU_KEY), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn test_metadata_is_not_a_param() {
        let spec = JobSpec::new()
            .with("lr", 0.1)
            .with(RESULT_SUBDIR_KEY, "sweep");
        let keys: Vec<_> = spec.params().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["lr"]);
        assert_eq!(spec.result_subdir(), Some("sweep"));
    }

    #[test]
    fn test_assign_gpu() {
        let mut spec = JobSpec::new().with("number", 3);
        assert!(!spec.has_gpu());
        assert_eq!(spec.gpu(), None);
        spec.assign_gpu(2);
        assert_eq!(spec.gpu(), Some(2));
        assert_eq!(spec.get(GPU_KEY), Some(&ParamValue::Int(2)));
    }

    #[test]
    fn test_deserialize_from_json() {
        let spec: JobSpec =
            serde_json::from_str(r#"{"number": 10, "lr": 0.5, "name": "a", "mul": [1, 2]}"#)
                .unwrap();
        assert_eq!(spec.get("number"), Some(&ParamValue::Int(10)));
        assert_eq!(spec.get("lr"), Some(&ParamValue::Float(0.5)));
        assert_eq!(spec.get("mul"), Some(&ParamValue::from(vec![1, 2])));
    }
}
