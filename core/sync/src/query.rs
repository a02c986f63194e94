//! Query Executor: conjunctive equality/membership filtering with stable
//! multi-key ordering.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use offlinekit_common::{DatabaseName, Error, Key, Result, Row};

use crate::store::LocalStore;

/// Sort direction of one ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// One sort key of a selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    /// Field to compare.
    #[serde(alias = "expression")]
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

/// Test applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    /// Field equals the value.
    Equals(Value),
    /// Field equals any of the values; an empty list matches nothing.
    AnyOf(Vec<Value>),
}

impl Criterion {
    /// Interpret a criteria value: arrays test membership, scalars equality.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(values) => Criterion::AnyOf(values.clone()),
            other => Criterion::Equals(other.clone()),
        }
    }

    /// Check a field value against this criterion. A missing field never matches.
    pub fn matches(&self, field: Option<&Value>) -> bool {
        let Some(field) = field else {
            return false;
        };
        match self {
            Criterion::Equals(expected) => values_equal(field, expected),
            Criterion::AnyOf(candidates) => candidates.iter().any(|c| values_equal(field, c)),
        }
    }
}

/// Query descriptor: a table, optional criteria and optional orderings.
///
/// Criteria keep insertion order; the first one is the primary filter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Selector {
    /// Table to read.
    #[serde(rename = "type")]
    pub table: String,
    /// Field to scalar (equality) or array (membership).
    #[serde(default)]
    pub criteria: Row,
    #[serde(default)]
    pub orderings: Vec<SortOrder>,
}

impl Selector {
    /// Selector returning every row of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            criteria: Row::new(),
            orderings: Vec::new(),
        }
    }

    /// Require `field` to equal `value`, or be a member when `value` is an array.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.criteria.insert(field.into(), value.into());
        self
    }

    /// Require `field` to be one of `values`.
    pub fn any_of<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.criteria.insert(field.into(), Value::Array(values));
        self
    }

    /// Append a sort key.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.orderings.push(SortOrder {
            field: field.into(),
            direction,
        });
        self
    }

    /// Criteria in declaration order.
    pub fn criteria(&self) -> impl Iterator<Item = (&str, Criterion)> + '_ {
        self.criteria
            .iter()
            .map(|(field, value)| (field.as_str(), Criterion::from_value(value)))
    }

    /// Filter and sort rows.
    pub fn evaluate(&self, rows: Vec<Row>) -> Vec<Row> {
        let mut criteria = self.criteria();

        let mut result = match criteria.next() {
            None => rows,
            Some((field, primary)) => rows
                .into_iter()
                .filter(|row| primary.matches(row.get(field)))
                .collect(),
        };

        for (field, secondary) in criteria {
            result.retain(|row| secondary.matches(row.get(field)));
        }

        if !self.orderings.is_empty() {
            result.sort_by(|a, b| self.compare(a, b));
        }
        result
    }

    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for order in &self.orderings {
            let ordering = compare_values(a.get(&order.field), b.get(&order.field));
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Equality with numbers compared by value, so `1` equals `1.0`. Integers
/// compare exactly, including those beyond the `f64` mantissa.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_numbers(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    match (Key::from_value(a), Key::from_value(b)) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => Ordering::Equal,
    }
}

fn rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(_) => 5,
    }
}

/// Total order used for sorting: missing, null, booleans, numbers, strings,
/// then arrays and objects by their JSON text.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x @ Value::Number(_)), Some(y @ Value::Number(_))) => compare_numbers(x, y),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) if rank(a) == 5 && rank(b) == 5 => x.to_string().cmp(&y.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Push-style consumer of query results.
pub trait ResultSink: Send {
    /// Receive a batch of rows.
    fn add_rows(&mut self, rows: Vec<Row>);

    /// All rows have been delivered.
    fn data_done(&mut self);

    /// The query failed; no completion follows.
    fn data_error(&mut self, error: Error);
}

/// Push a query result to `sink`: every row then completion, or the error.
pub fn deliver(result: Result<Vec<Row>>, sink: &mut dyn ResultSink) {
    match result {
        Ok(rows) => {
            sink.add_rows(rows);
            sink.data_done();
        }
        Err(e) => sink.data_error(e),
    }
}

/// Sink collecting everything it receives.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub rows: Vec<Row>,
    pub done: bool,
    pub error: Option<Error>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows on success, the delivered error otherwise.
    pub fn into_result(self) -> Result<Vec<Row>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.rows),
        }
    }
}

impl ResultSink for CollectSink {
    fn add_rows(&mut self, rows: Vec<Row>) {
        self.rows.extend(rows);
    }

    fn data_done(&mut self) {
        self.done = true;
    }

    fn data_error(&mut self, error: Error) {
        self.error = Some(error);
    }
}

/// Evaluates selectors against one named database.
pub struct QueryExecutor {
    store: Arc<LocalStore>,
    database: DatabaseName,
}

impl QueryExecutor {
    pub fn new(store: Arc<LocalStore>, database: DatabaseName) -> Self {
        Self { store, database }
    }

    /// Run a selector, pushing every match to `sink` then signalling completion.
    ///
    /// A missing database or table is reported through `sink.data_error`.
    pub async fn fetch(&self, selector: &Selector, sink: &mut dyn ResultSink) {
        deliver(self.fetch_rows(selector).await, sink);
    }

    /// Run a selector and return the matches.
    ///
    /// # Errors
    /// - `DatabaseMissing` when the database or table does not exist
    pub async fn fetch_rows(&self, selector: &Selector) -> Result<Vec<Row>> {
        let database = self.store.open_existing(&self.database).await?.ok_or_else(|| {
            Error::DatabaseMissing(format!("Database '{}' does not exist", self.database))
        })?;
        let rows = database.table(&selector.table)?.all().await?;
        let scanned = rows.len();
        let result = selector.evaluate(rows);
        debug!(
            "Fetched {} of {} rows from '{}.{}'",
            result.len(),
            scanned,
            self.database,
            selector.table
        );
        Ok(result)
    }
}
