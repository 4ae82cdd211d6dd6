// Matrix Strategy Expansion
// Expands a job's matrix strategy into concrete job instances

use crate::workflow::models::{Matrix, Strategy};

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Upper bound on instances produced by one matrix
pub const MAX_MATRIX_COMBINATIONS: usize = 256;

/// Upper bound on the raw product before `exclude` is applied
const MAX_MATRIX_PRODUCT: usize = 65_536;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MatrixError {
    #[error("matrix axis '{0}' must be a list of values")]
    InvalidAxis(String),

    #[error("matrix expands to zero combinations")]
    Empty,

    #[error("matrix expands to {0} combinations (limit is 256)")]
    TooManyCombinations(usize),
}

/// A single matrix instance (one combination of matrix values)
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixInstance {
    /// Display name of this combination, e.g. `ubuntu-latest, 18`
    pub name: String,
    /// Matrix values for this instance (`matrix.<key>`)
    pub values: BTreeMap<String, Value>,
}

impl MatrixInstance {
    /// The implicit instance of a job without a matrix
    pub fn implicit() -> Self {
        Self {
            name: String::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn is_implicit(&self) -> bool {
        self.values.is_empty()
    }

    fn from_values(values: BTreeMap<String, Value>) -> Self {
        let name = values
            .values()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(", ");
        Self { name, values }
    }
}

/// One combination while expanding; `original` holds the keys that came
/// from the Cartesian product and must never be overwritten by `include`.
struct Combination {
    values: BTreeMap<String, Value>,
    original: Vec<String>,
}

/// Matrix expander for job strategies
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a strategy into matrix instances.
    ///
    /// Without a matrix this yields the single implicit instance.
    pub fn expand(strategy: &Strategy) -> Result<Vec<MatrixInstance>, MatrixError> {
        match &strategy.matrix {
            Some(matrix) => Self::expand_matrix(matrix),
            None => Ok(vec![MatrixInstance::implicit()]),
        }
    }

    /// Expand an optional strategy (jobs without `strategy:` get one instance)
    pub fn expand_optional(
        strategy: Option<&Strategy>,
    ) -> Result<Vec<MatrixInstance>, MatrixError> {
        match strategy {
            Some(strategy) => Self::expand(strategy),
            None => Ok(vec![MatrixInstance::implicit()]),
        }
    }

    /// Expand a matrix: product of the axes, minus `exclude`, plus `include`.
    pub fn expand_matrix(matrix: &Matrix) -> Result<Vec<MatrixInstance>, MatrixError> {
        let axes = Self::axes(matrix)?;

        let product_size = axes
            .iter()
            .map(|(_, values)| values.len())
            .try_fold(1usize, |acc, n| acc.checked_mul(n))
            .unwrap_or(usize::MAX);
        // The 256 limit applies after exclude; this only refuses absurd products
        if product_size > MAX_MATRIX_PRODUCT {
            return Err(MatrixError::TooManyCombinations(product_size));
        }

        let mut combinations: Vec<Combination> = if axes.is_empty() {
            Vec::new()
        } else {
            Self::cartesian_product(&axes)
        };

        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| is_partial_match(&combo.values, exclude))
        });

        let extendable = combinations.len();
        for include in &matrix.include {
            let mut extended = false;

            for combo in combinations.iter_mut().take(extendable) {
                let overwrites_original = include.iter().any(|(key, value)| {
                    combo.original.contains(key) && combo.values.get(key) != Some(value)
                });
                if !overwrites_original {
                    for (key, value) in include {
                        combo.values.insert(key.clone(), value.clone());
                    }
                    extended = true;
                }
            }

            if !extended {
                combinations.push(Combination {
                    values: include.clone(),
                    original: Vec::new(),
                });
            }
        }

        if combinations.is_empty() {
            return Err(MatrixError::Empty);
        }
        if combinations.len() > MAX_MATRIX_COMBINATIONS {
            return Err(MatrixError::TooManyCombinations(combinations.len()));
        }

        Ok(combinations
            .into_iter()
            .map(|combo| MatrixInstance::from_values(combo.values))
            .collect())
    }

    /// Number of instances a strategy expands to.
    ///
    /// Equals the product of the axis cardinalities, minus excluded
    /// combinations, plus includes that extend no existing combination.
    pub fn combination_count(strategy: &Strategy) -> Result<usize, MatrixError> {
        Ok(Self::expand(strategy)?.len())
    }

    /// Get the maximum parallel limit from a strategy
    pub fn max_parallel(strategy: &Strategy) -> Option<u32> {
        strategy.max_parallel
    }

    /// Check if a strategy has matrix expansion
    pub fn has_matrix(strategy: &Strategy) -> bool {
        strategy.matrix.is_some()
    }

    fn axes(matrix: &Matrix) -> Result<Vec<(&String, &Vec<Value>)>, MatrixError> {
        matrix
            .dimensions
            .iter()
            .map(|(name, value)| match value {
                Value::Array(values) => Ok((name, values)),
                _ => Err(MatrixError::InvalidAxis(name.clone())),
            })
            .collect()
    }

    fn cartesian_product(axes: &[(&String, &Vec<Value>)]) -> Vec<Combination> {
        let mut combinations = vec![BTreeMap::new()];

        for (name, values) in axes {
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for combo in &combinations {
                for value in values.iter() {
                    let mut extended: BTreeMap<String, Value> = combo.clone();
                    extended.insert((*name).clone(), value.clone());
                    next.push(extended);
                }
            }
            combinations = next;
        }

        let original: Vec<String> = axes.iter().map(|(name, _)| (*name).clone()).collect();
        combinations
            .into_iter()
            .map(|values| Combination {
                values,
                original: original.clone(),
            })
            .collect()
    }
}

/// True when every key of `pattern` is present in `values` with the same value
fn is_partial_match(values: &BTreeMap<String, Value>, pattern: &BTreeMap<String, Value>) -> bool {
    pattern
        .iter()
        .all(|(key, expected)| values.get(key) == Some(expected))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
