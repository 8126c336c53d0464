//! Pipeline output schemas.

use common_error::{StrataError, StrataResult};

use crate::segment::Segment;
use crate::types::DataType;

/// Whether a column's nulls are materialised as a sparse map or the
/// column is stored dense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Density {
    Dense,
    Sparse,
}

/// One column of an output schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub data_type: DataType,
    pub density: Density,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            density: Density::Dense,
        }
    }

    pub fn sparse(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            density: Density::Sparse,
        }
    }
}

/// The declared shape of a pipeline stage's output: ordered columns, the
/// index column, and whether the schema is dynamic.
///
/// Every clause transforms one of these via `modify_schema`, so the
/// driver can describe the final result before any data is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputSchema {
    fields: Vec<FieldDef>,
    pub index_column: Option<String>,
    pub dynamic: bool,
}

impl OutputSchema {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self {
            fields,
            index_column: None,
            dynamic: false,
        }
    }

    pub fn with_index(mut self, index_column: impl Into<String>) -> Self {
        self.index_column = Some(index_column.into());
        self
    }

    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Derive the schema of an in-memory segment.
    pub fn of_segment(segment: &Segment) -> StrataResult<Self> {
        let descriptor = segment.descriptor()?;
        let fields = descriptor
            .fields
            .into_iter()
            .map(|(name, dt)| FieldDef::new(name, dt))
            .collect();
        Ok(Self {
            fields,
            index_column: descriptor.index_column,
            dynamic: false,
        })
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Append a field, replacing any existing field of the same name in
    /// place (the project-clause overwrite rule).
    pub fn add_field(&mut self, field: FieldDef) {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    /// Mark every column sparse (filters may introduce gaps).
    pub fn make_sparse(&mut self) {
        for f in &mut self.fields {
            f.density = Density::Sparse;
        }
    }

    /// Check the given columns are present, unless the schema is dynamic.
    pub fn require_columns<'a>(
        &self,
        columns: impl IntoIterator<Item = &'a str>,
        clause_name: &str,
    ) -> StrataResult<()> {
        if self.dynamic {
            return Ok(());
        }
        for col in columns {
            if !self.has_column(col) {
                return Err(StrataError::schema_error(format!(
                    "{clause_name} requires column '{col}' which is not in the schema"
                )));
            }
        }
        Ok(())
    }

    /// Keep only the named columns, preserving this schema's order.
    pub fn retain(&mut self, names: &[&str]) {
        self.fields.retain(|f| names.contains(&f.name.as_str()));
        if let Some(index) = &self.index_column {
            if !names.contains(&index.as_str()) {
                self.index_column = None;
            }
        }
    }

    /// Column union in left-to-right order (outer concat). A name
    /// appearing in both schemas must agree on type unless either schema
    /// is dynamic; columns missing from one side become sparse.
    pub fn union(&self, other: &Self) -> StrataResult<Self> {
        let dynamic = self.dynamic || other.dynamic;
        let mut fields = self.fields.clone();
        for f in &mut fields {
            if !other.has_column(&f.name) {
                f.density = Density::Sparse;
            }
        }
        for field in &other.fields {
            match self.field(&field.name) {
                Some(existing) => {
                    if existing.data_type != field.data_type && !dynamic {
                        return Err(StrataError::schema_error(format!(
                            "column '{}' has conflicting types {} and {}",
                            field.name, existing.data_type, field.data_type
                        )));
                    }
                }
                None => {
                    let mut f = field.clone();
                    f.density = Density::Sparse;
                    fields.push(f);
                }
            }
        }
        Ok(Self {
            fields,
            index_column: self.index_column.clone(),
            dynamic,
        })
    }

    /// Column intersection in this schema's order (inner concat).
    pub fn intersection(&self, other: &Self) -> StrataResult<Self> {
        let dynamic = self.dynamic || other.dynamic;
        let mut fields = Vec::new();
        for field in &self.fields {
            if let Some(theirs) = other.field(&field.name) {
                if theirs.data_type != field.data_type && !dynamic {
                    return Err(StrataError::schema_error(format!(
                        "column '{}' has conflicting types {} and {}",
                        field.name, field.data_type, theirs.data_type
                    )));
                }
                fields.push(field.clone());
            }
        }
        let index_column = self
            .index_column
            .as_ref()
            .filter(|ic| fields.iter().any(|f| &&f.name == ic))
            .cloned();
        Ok(Self {
            fields,
            index_column,
            dynamic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_ab() -> OutputSchema {
        OutputSchema::new(vec![
            FieldDef::new("x", DataType::Int64),
            FieldDef::new("y", DataType::Int64),
        ])
    }

    fn schema_bc() -> OutputSchema {
        OutputSchema::new(vec![
            FieldDef::new("y", DataType::Int64),
            FieldDef::new("z", DataType::Int64),
        ])
    }

    #[test]
    fn test_union_is_outer() {
        let joined = schema_ab().union(&schema_bc()).unwrap();
        assert_eq!(joined.field_names(), vec!["x", "y", "z"]);
        assert_eq!(joined.field("x").unwrap().density, Density::Sparse);
        assert_eq!(joined.field("y").unwrap().density, Density::Dense);
        assert_eq!(joined.field("z").unwrap().density, Density::Sparse);
    }

    #[test]
    fn test_intersection_is_inner() {
        let joined = schema_ab().intersection(&schema_bc()).unwrap();
        assert_eq!(joined.field_names(), vec!["y"]);
    }

    #[test]
    fn test_type_conflict_is_fatal_when_static() {
        let other = OutputSchema::new(vec![FieldDef::new("y", DataType::Float64)]);
        assert!(schema_ab().union(&other).is_err());
        assert!(schema_ab()
            .with_dynamic(true)
            .union(&other)
            .is_ok());
    }

    #[test]
    fn test_require_columns() {
        let schema = schema_ab();
        assert!(schema.require_columns(["x"], "Filter").is_ok());
        assert!(schema.require_columns(["q"], "Filter").is_err());
        assert!(schema
            .clone()
            .with_dynamic(true)
            .require_columns(["q"], "Filter")
            .is_ok());
    }

    #[test]
    fn test_add_field_replaces() {
        let mut schema = schema_ab();
        schema.add_field(FieldDef::new("y", DataType::Float64));
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.field("y").unwrap().data_type, DataType::Float64);
    }
}
