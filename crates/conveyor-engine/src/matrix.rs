//! Matrix expansion.
//!
//! A matrix declares named dimensions with value lists; expansion takes
//! the full cross product, removes entries matched by `exclude`, then
//! applies `include` entries in declared order. Expansion is pure and
//! deterministic: dimensions iterate in name order, values in declared
//! order, and includes append after the surviving product.

use conveyor_core::definition::{
    DimensionAssignment, MatrixDefinition, dimension_value_str, format_assignment,
};
use conveyor_core::{Error, Result};

/// Expand a matrix into concrete assignments.
///
/// A matrix with no dimensions and no includes yields the single empty
/// assignment (one unparameterized instance); a dimension with an empty
/// value list empties the whole product. `include` entries can still
/// append to an empty base.
pub fn expand(job: &str, matrix: &MatrixDefinition) -> Result<Vec<DimensionAssignment>> {
    if matrix.dimensions.is_empty() && matrix.include.is_empty() {
        return Ok(vec![DimensionAssignment::new()]);
    }
    let mut base = cross_product(matrix);
    base.retain(|assignment| !matrix.exclude.iter().any(|e| matches(assignment, e)));

    // Includes merge into exactly one surviving assignment, or append as
    // a standalone instance when nothing matches. Matching more than one
    // assignment is a diagnostic: the author almost certainly meant to
    // name a single cell.
    let survivors = base.len();
    for entry in &matrix.include {
        let candidates: Vec<usize> = base[..survivors]
            .iter()
            .enumerate()
            .filter(|(_, assignment)| overlaps(assignment, entry))
            .map(|(i, _)| i)
            .collect();
        match candidates.len() {
            0 => base.push(entry.clone()),
            1 => {
                let target = &mut base[candidates[0]];
                for (k, v) in entry {
                    target.insert(k.clone(), v.clone());
                }
            }
            count => {
                return Err(Error::AmbiguousInclude {
                    job: job.to_string(),
                    entry: format_assignment(entry),
                    count,
                });
            }
        }
    }

    Ok(base)
}

fn cross_product(matrix: &MatrixDefinition) -> Vec<DimensionAssignment> {
    if matrix.dimensions.is_empty() {
        return Vec::new();
    }
    let mut out = vec![DimensionAssignment::new()];
    for (name, values) in &matrix.dimensions {
        let mut next = Vec::with_capacity(out.len() * values.len());
        for assignment in &out {
            for value in values {
                let mut grown = assignment.clone();
                grown.insert(name.clone(), value.clone());
                next.push(grown);
            }
        }
        out = next;
    }
    out
}

/// True when every key of the partial entry is present in the assignment
/// with an equal value. An empty entry matches nothing.
fn matches(assignment: &DimensionAssignment, partial: &DimensionAssignment) -> bool {
    !partial.is_empty()
        && partial.iter().all(|(k, v)| {
            assignment
                .get(k)
                .is_some_and(|a| dimension_value_str(a) == dimension_value_str(v))
        })
}

/// True when the entry shares at least one key with the assignment and
/// every shared key carries an equal value.
fn overlaps(assignment: &DimensionAssignment, entry: &DimensionAssignment) -> bool {
    let mut shared = false;
    for (k, v) in entry {
        match assignment.get(k) {
            Some(a) if dimension_value_str(a) == dimension_value_str(v) => shared = true,
            Some(_) => return false,
            None => {}
        }
    }
    shared
}
