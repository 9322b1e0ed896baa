//! Header and coordinate reads through libnetcdf.

use std::path::Path;

use ::netcdf::{AttributeValue, Variable};

use super::{FileSummary, VariableSummary};
use crate::error::SitepackError;

pub fn summarize(path: &Path) -> Result<FileSummary, SitepackError> {
    let file = ::netcdf::open(path).map_err(|err| read_error(path, err))?;
    let mut summary = FileSummary::default();

    for dimension in file.dimensions() {
        summary
            .dimensions
            .insert(dimension.name().to_string(), dimension.len());
    }
    for attribute in file.attributes() {
        if let Some(text) = attribute.value().ok().and_then(attribute_text) {
            summary
                .global_attributes
                .insert(attribute.name().to_string(), text);
        }
    }
    for variable in file.variables() {
        summary.variables.push(VariableSummary {
            name: variable.name().to_string(),
            dims: variable
                .dimensions()
                .iter()
                .map(|dim| dim.name().to_string())
                .collect(),
            attributes: variable
                .attributes()
                .filter_map(|attribute| {
                    let text = attribute.value().ok().and_then(attribute_text)?;
                    Some((attribute.name().to_string(), text))
                })
                .collect(),
        });
    }

    let Some((lat, lon)) = summary.coordinate_pair() else {
        return Ok(summary);
    };
    for name in summary.wanted_variables(&lat, &lon) {
        let Some(variable) = file.variable(&name) else {
            continue;
        };
        let fills = fill_values(summary.variable(&name));
        let values = read_values(&variable, &fills).map_err(|err| read_error(path, err))?;
        summary.data.insert(name, values);
    }
    Ok(summary)
}

/// Values with fill and missing markers replaced by NaN, like `_` in CDL.
fn read_values(variable: &Variable, fills: &[f64]) -> Result<Vec<f64>, ::netcdf::Error> {
    let mut values: Vec<f64> = variable.get_values(..)?;
    for value in values.iter_mut() {
        if fills.contains(value) {
            *value = f64::NAN;
        }
    }
    Ok(values)
}

fn fill_values(variable: Option<&VariableSummary>) -> Vec<f64> {
    let Some(variable) = variable else {
        return Vec::new();
    };
    ["_FillValue", "missing_value"]
        .iter()
        .filter_map(|name| variable.attributes.get(*name)?.parse().ok())
        .collect()
}

fn attribute_text(value: AttributeValue) -> Option<String> {
    match value {
        AttributeValue::Str(text) => Some(text),
        other => f64::try_from(other).ok().map(|number| number.to_string()),
    }
}

fn read_error(path: &Path, err: ::netcdf::Error) -> SitepackError {
    SitepackError::Netcdf(format!("{}: {err}", path.display()))
}
