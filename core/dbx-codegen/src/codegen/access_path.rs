//! AccessPath, FilterMarker and OrdinalMapping
//!
//! An [`AccessPath`] says how the current value of one logical column is read
//! at a given point of the emitted code. The [`OrdinalMapping`] holds one path
//! per output column; operators replace entries, never mutate a path.

use crate::codegen::hash_map::MapDescriptor;
use crate::codegen::ir::{CodeExpr, Literal, MarkerKind, Method};
use crate::codegen::types::{LogicalType, QueryVariableType};
use crate::config::LaneWidth;
use crate::error::{DbxError, DbxResult};
use crate::plan::ScalarValue;
use smallvec::SmallVec;
use std::sync::Arc;

/// Selection vector or validity mask attached to a batch.
///
/// Two markers are the same instance when they name the same array.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterMarker {
    pub kind: MarkerKind,
    /// Variable holding the selection indices / validity flags
    pub array: String,
    /// Selected-row count (selection) or batch length (validity)
    pub length: CodeExpr,
}

impl FilterMarker {
    pub fn selection(array: impl Into<String>, length: CodeExpr) -> Self {
        Self {
            kind: MarkerKind::Selection,
            array: array.into(),
            length,
        }
    }

    pub fn validity(array: impl Into<String>, length: CodeExpr) -> Self {
        Self {
            kind: MarkerKind::Validity,
            array: array.into(),
            length,
        }
    }

    pub fn array_expr(&self) -> CodeExpr {
        CodeExpr::var(&self.array)
    }
}

/// How a logical column's current value is read.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessPath {
    /// Literal folded into the code
    Constant { value: Literal, ty: LogicalType },
    ScalarVariable { name: String, ty: LogicalType },
    /// Pooled array whose active prefix length is read through `length`
    RawArraySlice {
        array: String,
        ty: LogicalType,
        length: Box<AccessPath>,
    },
    ColumnVector { vector: String, ty: LogicalType },
    ColumnVectorWithSelection {
        vector: String,
        ty: LogicalType,
        selection: String,
        length: CodeExpr,
    },
    ColumnVectorWithValidity {
        vector: String,
        ty: LogicalType,
        validity: String,
        length: CodeExpr,
    },
    /// One element of a vector at a row index
    IndexedVectorElement {
        vector: String,
        ty: LogicalType,
        index: CodeExpr,
    },
    /// One element of an arbitrary array expression (e.g. a map's backing array)
    ArrayElement {
        array: CodeExpr,
        ty: LogicalType,
        index: CodeExpr,
    },
    MapHandle {
        name: String,
        descriptor: Arc<MapDescriptor>,
    },
    SimdLoopBinding {
        vector: String,
        ty: LogicalType,
        offset: String,
        lane_count: String,
        lane_mask: String,
        memory: String,
        lane_width: LaneWidth,
    },
}

impl AccessPath {
    pub fn constant(value: &ScalarValue) -> DbxResult<Self> {
        let (value, ty) = literal_of(value)?;
        Ok(AccessPath::Constant { value, ty })
    }

    pub fn scalar(name: impl Into<String>, ty: LogicalType) -> Self {
        AccessPath::ScalarVariable {
            name: name.into(),
            ty,
        }
    }

    pub fn logical_type(&self) -> Option<LogicalType> {
        match self {
            AccessPath::Constant { ty, .. }
            | AccessPath::ScalarVariable { ty, .. }
            | AccessPath::RawArraySlice { ty, .. }
            | AccessPath::ColumnVector { ty, .. }
            | AccessPath::ColumnVectorWithSelection { ty, .. }
            | AccessPath::ColumnVectorWithValidity { ty, .. }
            | AccessPath::IndexedVectorElement { ty, .. }
            | AccessPath::ArrayElement { ty, .. }
            | AccessPath::SimdLoopBinding { ty, .. } => Some(*ty),
            AccessPath::MapHandle { .. } => None,
        }
    }

    pub fn query_type(&self) -> QueryVariableType {
        match self {
            AccessPath::Constant { ty, .. }
            | AccessPath::ScalarVariable { ty, .. }
            | AccessPath::IndexedVectorElement { ty, .. }
            | AccessPath::ArrayElement { ty, .. } => QueryVariableType::Scalar(*ty),
            AccessPath::RawArraySlice { ty, .. } => QueryVariableType::RawArray(*ty),
            AccessPath::ColumnVector { ty, .. } => QueryVariableType::Vector(*ty),
            AccessPath::ColumnVectorWithSelection { ty, .. } => {
                QueryVariableType::VectorWithSelection(*ty)
            }
            AccessPath::ColumnVectorWithValidity { ty, .. } => {
                QueryVariableType::VectorWithValidity(*ty)
            }
            AccessPath::SimdLoopBinding { ty, .. } => QueryVariableType::SimdLanes(*ty),
            AccessPath::MapHandle { descriptor, .. } => {
                QueryVariableType::GeneratedMap(descriptor.name.clone())
            }
        }
    }

    /// Batch-valued (a whole vector or array slice).
    pub fn is_vector_family(&self) -> bool {
        matches!(
            self,
            AccessPath::RawArraySlice { .. }
                | AccessPath::ColumnVector { .. }
                | AccessPath::ColumnVectorWithSelection { .. }
                | AccessPath::ColumnVectorWithValidity { .. }
        )
    }

    /// Single-valued at the current point of the code.
    pub fn is_scalar_family(&self) -> bool {
        matches!(
            self,
            AccessPath::Constant { .. }
                | AccessPath::ScalarVariable { .. }
                | AccessPath::IndexedVectorElement { .. }
                | AccessPath::ArrayElement { .. }
        )
    }

    /// Expression reading the current scalar value.
    pub fn read_scalar(&self) -> DbxResult<CodeExpr> {
        match self {
            AccessPath::Constant { value, .. } => Ok(CodeExpr::Lit(value.clone())),
            AccessPath::ScalarVariable { name, .. } => Ok(CodeExpr::var(name)),
            AccessPath::IndexedVectorElement { vector, index, .. } => {
                Ok(CodeExpr::var(vector).index(index.clone()))
            }
            AccessPath::ArrayElement { array, index, .. } => {
                Ok(array.clone().index(index.clone()))
            }
            other => Err(DbxError::invariant(
                "AccessPath",
                format!("cannot read a scalar through {}", other.query_type()),
            )),
        }
    }

    /// Expression naming the batch variable.
    pub fn vector_expr(&self) -> DbxResult<CodeExpr> {
        match self {
            AccessPath::RawArraySlice { array, .. } => Ok(CodeExpr::var(array)),
            AccessPath::ColumnVector { vector, .. }
            | AccessPath::ColumnVectorWithSelection { vector, .. }
            | AccessPath::ColumnVectorWithValidity { vector, .. } => Ok(CodeExpr::var(vector)),
            other => Err(DbxError::invariant(
                "AccessPath",
                format!("cannot read a vector through {}", other.query_type()),
            )),
        }
    }

    /// Row count of the underlying batch, ignoring any selection.
    pub fn batch_length(&self) -> DbxResult<CodeExpr> {
        match self {
            AccessPath::RawArraySlice { length, .. } => length.read_scalar(),
            AccessPath::ColumnVector { vector, .. } => {
                Ok(CodeExpr::var(vector).method(Method::Len, vec![]))
            }
            AccessPath::ColumnVectorWithValidity { length, .. } => Ok(length.clone()),
            AccessPath::ColumnVectorWithSelection { vector, .. } => {
                Ok(CodeExpr::var(vector).method(Method::Len, vec![]))
            }
            other => Err(DbxError::invariant(
                "AccessPath",
                format!("{} has no batch length", other.query_type()),
            )),
        }
    }

    pub fn marker(&self) -> Option<FilterMarker> {
        match self {
            AccessPath::ColumnVectorWithSelection {
                selection, length, ..
            } => Some(FilterMarker::selection(selection, length.clone())),
            AccessPath::ColumnVectorWithValidity {
                validity, length, ..
            } => Some(FilterMarker::validity(validity, length.clone())),
            _ => None,
        }
    }

    /// The same batch carrying `marker`. Scalar paths are returned unchanged.
    pub fn with_marker(&self, marker: &FilterMarker) -> DbxResult<AccessPath> {
        if let Some(existing) = self.marker() {
            if existing.kind != marker.kind {
                return Err(DbxError::invariant(
                    "AccessPath",
                    "selection vectors and validity masks cannot be combined on one column",
                ));
            }
        }
        let (vector, ty) = match self {
            AccessPath::RawArraySlice { array, ty, .. } => (array.clone(), *ty),
            AccessPath::ColumnVector { vector, ty }
            | AccessPath::ColumnVectorWithSelection { vector, ty, .. }
            | AccessPath::ColumnVectorWithValidity { vector, ty, .. } => (vector.clone(), *ty),
            _ => return Ok(self.clone()),
        };
        Ok(match marker.kind {
            MarkerKind::Selection => AccessPath::ColumnVectorWithSelection {
                vector,
                ty,
                selection: marker.array.clone(),
                length: marker.length.clone(),
            },
            MarkerKind::Validity => AccessPath::ColumnVectorWithValidity {
                vector,
                ty,
                validity: marker.array.clone(),
                length: marker.length.clone(),
            },
            MarkerKind::None => {
                return Err(DbxError::invariant(
                    "AccessPath",
                    "attaching an empty marker",
                ));
            }
        })
    }

    /// Path of the element at `row` of a batch; scalar paths stay as they are.
    pub fn element_at(&self, row: CodeExpr) -> DbxResult<AccessPath> {
        if self.is_scalar_family() {
            return Ok(self.clone());
        }
        let ty = self.logical_type().ok_or_else(|| {
            DbxError::invariant("AccessPath", "map handles have no elements")
        })?;
        match self.vector_expr()? {
            CodeExpr::Var(vector) => Ok(AccessPath::IndexedVectorElement {
                vector,
                ty,
                index: row,
            }),
            array => Ok(AccessPath::ArrayElement {
                array,
                ty,
                index: row,
            }),
        }
    }
}

/// Code literal and logical type of a plan literal.
pub fn literal_of(value: &ScalarValue) -> DbxResult<(Literal, LogicalType)> {
    let ty = LogicalType::of_literal(value)?;
    let lit = match value {
        ScalarValue::Null => {
            return Err(DbxError::unsupported("Expression", "NULL literal in generated code"));
        }
        ScalarValue::Boolean(v) => Literal::Bool(*v),
        ScalarValue::Int32(v) => Literal::Int(*v),
        ScalarValue::Int64(v) => Literal::Long(*v),
        ScalarValue::Float64(v) => Literal::Double(*v),
        ScalarValue::Utf8(s) => Literal::Str(s.clone()),
        ScalarValue::Binary(bytes) => Literal::Bytes(bytes.clone()),
        ScalarValue::Date32(days) => Literal::Date(*days),
    };
    Ok((lit, ty))
}

/// Ordered access paths, one per logical output column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrdinalMapping {
    paths: SmallVec<[AccessPath; 8]>,
}

impl OrdinalMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn push(&mut self, path: AccessPath) {
        self.paths.push(path);
    }

    pub fn get(&self, ordinal: usize) -> DbxResult<&AccessPath> {
        self.paths.get(ordinal).ok_or_else(|| {
            DbxError::invariant(
                "OrdinalMapping",
                format!("ordinal {ordinal} out of range ({} columns)", self.paths.len()),
            )
        })
    }

    pub fn replace(&mut self, ordinal: usize, path: AccessPath) -> DbxResult<()> {
        let len = self.paths.len();
        let slot = self.paths.get_mut(ordinal).ok_or_else(|| {
            DbxError::invariant(
                "OrdinalMapping",
                format!("ordinal {ordinal} out of range ({len} columns)"),
            )
        })?;
        *slot = path;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessPath> {
        self.paths.iter()
    }

    /// The filtering marker shared by every batch column.
    pub fn shared_marker(&self, operator: &str) -> DbxResult<Option<FilterMarker>> {
        let mut batches = self.paths.iter().filter(|p| p.is_vector_family());
        let Some(first) = batches.next() else {
            return Ok(None);
        };
        let marker = first.marker();
        for path in batches {
            if path.marker() != marker {
                return Err(DbxError::invariant(
                    operator,
                    "batch columns carry different filtering markers",
                ));
            }
        }
        Ok(marker)
    }

    /// Shared marker and the length primitives iterate over.
    ///
    /// `None` when no column is batch-valued.
    pub fn batch_extent(&self, operator: &str) -> DbxResult<Option<(Option<FilterMarker>, CodeExpr)>> {
        let marker = self.shared_marker(operator)?;
        let Some(first) = self.paths.iter().find(|p| p.is_vector_family()) else {
            return Ok(None);
        };
        let length = match &marker {
            Some(m) => m.length.clone(),
            None => first.batch_length()?,
        };
        Ok(Some((marker, length)))
    }

    /// Replace every batch column by the element at `row`.
    pub fn elements_at(&self, row: &CodeExpr) -> DbxResult<OrdinalMapping> {
        self.paths
            .iter()
            .map(|p| p.element_at(row.clone()))
            .collect()
    }
}

impl FromIterator<AccessPath> for OrdinalMapping {
    fn from_iter<I: IntoIterator<Item = AccessPath>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(name: &str) -> AccessPath {
        AccessPath::ColumnVector {
            vector: name.to_string(),
            ty: LogicalType::Int,
        }
    }

    #[test]
    fn test_read_scalar_from_vector_is_invariant_violation() {
        let err = vector("vec_0").read_scalar().unwrap_err();
        assert!(matches!(err, DbxError::InternalInvariantViolation { .. }));

        let err = AccessPath::scalar("x_1", LogicalType::Int)
            .vector_expr()
            .unwrap_err();
        assert!(matches!(err, DbxError::InternalInvariantViolation { .. }));
    }

    #[test]
    fn test_markers_are_mutually_exclusive() {
        let sel = FilterMarker::selection("sel_0", CodeExpr::var("sel_len_1"));
        let valid = FilterMarker::validity("valid_2", CodeExpr::var("len_3"));
        let selected = vector("vec_0").with_marker(&sel).unwrap();
        assert_eq!(selected.marker(), Some(sel.clone()));
        assert!(selected.with_marker(&valid).is_err());

        // narrowing with another selection of the same kind replaces it
        let sel2 = FilterMarker::selection("sel_4", CodeExpr::var("sel_len_5"));
        assert_eq!(selected.with_marker(&sel2).unwrap().marker(), Some(sel2));
    }

    #[test]
    fn test_with_marker_keeps_scalars() {
        let c = AccessPath::constant(&ScalarValue::Int32(7)).unwrap();
        let sel = FilterMarker::selection("sel_0", CodeExpr::var("n"));
        assert_eq!(c.with_marker(&sel).unwrap(), c);
    }

    #[test]
    fn test_shared_marker_detects_divergence() {
        let sel_a = FilterMarker::selection("sel_a", CodeExpr::var("n_a"));
        let sel_b = FilterMarker::selection("sel_b", CodeExpr::var("n_b"));
        let mapping: OrdinalMapping = [
            vector("v0").with_marker(&sel_a).unwrap(),
            vector("v1").with_marker(&sel_b).unwrap(),
        ]
        .into_iter()
        .collect();
        assert!(mapping.shared_marker("Project").is_err());

        let mapping: OrdinalMapping = [
            vector("v0").with_marker(&sel_a).unwrap(),
            AccessPath::constant(&ScalarValue::Int64(1)).unwrap(),
        ]
        .into_iter()
        .collect();
        let (marker, length) = mapping.batch_extent("Sink").unwrap().unwrap();
        assert_eq!(marker, Some(sel_a));
        assert_eq!(length, CodeExpr::var("n_a"));
    }

    #[test]
    fn test_element_at() {
        let row = CodeExpr::var("row_0");
        let elem = vector("vec_1").element_at(row.clone()).unwrap();
        assert_eq!(
            elem.read_scalar().unwrap(),
            CodeExpr::var("vec_1").index(row)
        );
        assert_eq!(elem.query_type(), QueryVariableType::Scalar(LogicalType::Int));
    }
}
