use crate::subjects::{Subject, SubjectError, SubjectTable};
use crate::trace::ChartTrace;
use ndarray::{Array1, Array2, Axis};
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

const ENTRY_COLUMN: &str = "entrytime";
const EXIT_COLUMN: &str = "otime";
const STATUS_COLUMN: &str = "censorid";
const UNIT_COLUMN: &str = "unit";

/// Errors surfaced while reading subject tables or writing chart traces.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Error from the underlying Polars library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the input file.")]
    ColumnNotFound(String),
    #[error(
        "Column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the column '{0}'.")]
    MissingValues(String),
    #[error("Column '{column_name}' must only hold 0 or 1 but row {row} holds {value}.")]
    InvalidStatus {
        column_name: String,
        row: usize,
        value: i64,
    },
    #[error("The input file has no 'unit' column to split units by.")]
    NoUnitColumn,
    #[error("The input file holds {0} units; a chart is built for one unit at a time.")]
    MultipleUnits(usize),
    #[error("Validation error: {0}")]
    Validation(#[from] SubjectError),
    #[error("Validation error in unit '{unit}': {source}")]
    UnitValidation {
        unit: String,
        #[source]
        source: SubjectError,
    },
}

/// Subjects read from disk. Files with a `unit` column are split by unit and
/// each unit is validated on its own, so only the rows of one unit need to be
/// sorted by entry time.
#[derive(Debug, Clone)]
pub enum LoadedSubjects {
    /// No unit column: every row belongs to the same unit.
    Pooled(SubjectTable),
    /// One table per unit label, in order of unit name.
    Units(Vec<(String, SubjectTable)>),
}

impl LoadedSubjects {
    /// The single monitored unit held by the file.
    pub fn into_table(self) -> Result<SubjectTable, DataError> {
        match self {
            Self::Pooled(table) => Ok(table),
            Self::Units(units) => match <[(String, SubjectTable); 1]>::try_from(units) {
                Ok([(_, table)]) => Ok(table),
                Err(units) => Err(DataError::MultipleUnits(units.len())),
            },
        }
    }

    /// The per-unit tables; fails for files without a unit column.
    pub fn into_units(self) -> Result<Vec<(String, SubjectTable)>, DataError> {
        match self {
            Self::Pooled(_) => Err(DataError::NoUnitColumn),
            Self::Units(units) => Ok(units),
        }
    }
}

/// Load a subject table from a TSV (or comma-separated `.csv`) file.
///
/// Required columns are `entrytime`, `otime` and `censorid` (0 = censored,
/// 1 = failure); an optional `unit` column labels the monitored unit. Every
/// other numeric column is kept as a covariate. Names are case-insensitive.
/// Rows must already be sorted by entry time, within each unit when a unit
/// column is present.
pub fn load_subject_table(path: &str) -> Result<LoadedSubjects, DataError> {
    let df = read_tabular(path)?;
    let name_map = build_case_insensitive_map(
        df.get_column_names()
            .into_iter()
            .map(|name| name.as_str().to_string()),
    );
    let mut used_columns = HashSet::new();

    let entry = extract_f64_column(&df, &name_map, ENTRY_COLUMN)?;
    let exit = extract_f64_column(&df, &name_map, EXIT_COLUMN)?;
    let status = extract_status_column(&df, &name_map, STATUS_COLUMN)?;
    for key in [ENTRY_COLUMN, EXIT_COLUMN, STATUS_COLUMN] {
        if let Some(actual) = name_map.get(key) {
            used_columns.insert(actual.clone());
        }
    }

    let units = match name_map.get(UNIT_COLUMN) {
        Some(actual) => {
            used_columns.insert(actual.clone());
            Some(extract_string_column(&df, actual)?)
        }
        None => None,
    };

    let n = entry.len();
    let mut covariate_names = Vec::new();
    let mut covariate_columns = Vec::new();
    for original in df.get_column_names() {
        let original_str = original.as_str();
        if used_columns.contains(original_str) {
            continue;
        }
        let column = df
            .column(original_str)
            .map_err(|_| DataError::ColumnNotFound(original_str.to_string()))?;
        if matches!(column.dtype(), DataType::String) {
            continue;
        }
        let casted = match column.cast(&DataType::Float64) {
            Ok(values) => values,
            Err(_) => continue,
        };
        let values = casted.f64()?;
        if values.null_count() > 0 {
            return Err(DataError::MissingValues(original_str.to_string()));
        }
        covariate_names.push(original_str.to_string());
        covariate_columns.push(Array1::from_iter(values.into_no_null_iter()));
    }

    let mut covariates = Array2::<f64>::zeros((n, covariate_columns.len()));
    for (idx, column) in covariate_columns.into_iter().enumerate() {
        covariates.column_mut(idx).assign(&column);
    }

    let subjects: Vec<Subject> = entry
        .iter()
        .zip(exit.iter())
        .zip(status)
        .map(|((&entrytime, &otime), failed)| Subject::new(entrytime, otime, failed))
        .collect();
    match units {
        Some(units) => Ok(LoadedSubjects::Units(split_units(
            &subjects,
            &covariate_names,
            &covariates,
            &units,
        )?)),
        None => Ok(LoadedSubjects::Pooled(SubjectTable::with_covariates(
            subjects,
            covariate_names,
            covariates,
        )?)),
    }
}

/// Groups rows by unit label, preserving file order within each unit, and
/// validates every unit as its own table.
fn split_units(
    subjects: &[Subject],
    covariate_names: &[String],
    covariates: &Array2<f64>,
    units: &[String],
) -> Result<Vec<(String, SubjectTable)>, DataError> {
    let mut rows_by_unit: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (row, unit) in units.iter().enumerate() {
        rows_by_unit.entry(unit.as_str()).or_default().push(row);
    }
    rows_by_unit
        .into_iter()
        .map(|(unit, rows)| {
            let unit_subjects = rows.iter().map(|&row| subjects[row]).collect();
            let table = SubjectTable::with_covariates(
                unit_subjects,
                covariate_names.to_vec(),
                covariates.select(Axis(0), &rows),
            )
            .map_err(|source| DataError::UnitValidation {
                unit: unit.to_string(),
                source,
            })?;
            Ok((unit.to_string(), table))
        })
        .collect()
}

/// Write a chart trace as a TSV with columns `time`, `value`, `multiplier`
/// and `start_time`.
pub fn write_trace(trace: &ChartTrace, path: &Path) -> Result<(), DataError> {
    let points = trace.points();
    let mut df = DataFrame::new(vec![
        Series::new("time".into(), points.iter().map(|p| p.time).collect::<Vec<_>>()).into(),
        Series::new("value".into(), points.iter().map(|p| p.value).collect::<Vec<_>>()).into(),
        Series::new(
            "multiplier".into(),
            points.iter().map(|p| p.multiplier).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "start_time".into(),
            points.iter().map(|p| p.start_time).collect::<Vec<_>>(),
        )
        .into(),
    ])?;
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .with_separator(b'\t')
        .finish(&mut df)?;
    Ok(())
}

fn read_tabular(path: &str) -> Result<DataFrame, DataError> {
    let path = Path::new(path);
    let separator = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("csv") => b',',
        _ => b'\t',
    };
    let file = File::open(path)?;
    CsvReadOptions::default()
        .with_has_header(true)
        .map_parse_options(|options| options.with_separator(separator))
        .into_reader_with_file_handle(file)
        .finish()
        .map_err(DataError::from)
}

fn build_case_insensitive_map<I, S>(names: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut map = HashMap::new();
    for name in names {
        let original = name.as_ref().to_string();
        map.insert(original.to_ascii_lowercase(), original);
    }
    map
}

fn lookup<'a>(
    df: &'a DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<(&'a Column, String), DataError> {
    let actual = map
        .get(&key.to_ascii_lowercase())
        .ok_or_else(|| DataError::ColumnNotFound(key.to_string()))?;
    let column = df
        .column(actual)
        .map_err(|_| DataError::ColumnNotFound(actual.clone()))?;
    Ok((column, actual.clone()))
}

fn extract_f64_column(
    df: &DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Array1<f64>, DataError> {
    let (column, actual) = lookup(df, map, key)?;
    let dtype = column.dtype().clone();
    let casted = column
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: actual.clone(),
            expected_type: "float",
            found_type: dtype.to_string(),
        })?;
    let values = casted.f64()?;
    if values.null_count() > 0 {
        return Err(DataError::MissingValues(actual));
    }
    Ok(Array1::from_iter(values.into_no_null_iter()))
}

fn extract_status_column(
    df: &DataFrame,
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<bool>, DataError> {
    let (column, actual) = lookup(df, map, key)?;
    let dtype = column.dtype().clone();
    let casted = column
        .cast(&DataType::Int64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: actual.clone(),
            expected_type: "integer",
            found_type: dtype.to_string(),
        })?;
    let values = casted.i64()?;
    if values.null_count() > 0 {
        return Err(DataError::MissingValues(actual));
    }
    values
        .into_no_null_iter()
        .enumerate()
        .map(|(row, value)| match value {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DataError::InvalidStatus {
                column_name: actual.clone(),
                row,
                value: other,
            }),
        })
        .collect()
}

fn extract_string_column(df: &DataFrame, actual: &str) -> Result<Vec<String>, DataError> {
    let column = df
        .column(actual)
        .map_err(|_| DataError::ColumnNotFound(actual.to_string()))?;
    let casted = column.cast(&DataType::String)?;
    let values = casted.str()?;
    if values.null_count() > 0 {
        return Err(DataError::MissingValues(actual.to_string()));
    }
    Ok(values.into_no_null_iter().map(str::to_string).collect())
}
