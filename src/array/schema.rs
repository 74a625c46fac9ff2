//! Array schemas.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::uri::Uri;

/// The coordinate datatype of an array.
///
/// A closed variant: operations that depend on the coordinate type (domain
/// expansion, in particular) dispatch on it once at their entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datatype {
    /// Signed 8-bit integer coordinates.
    Int8,
    /// Unsigned 8-bit integer coordinates.
    UInt8,
    /// Signed 16-bit integer coordinates.
    Int16,
    /// Unsigned 16-bit integer coordinates.
    UInt16,
    /// Signed 32-bit integer coordinates.
    Int32,
    /// Unsigned 32-bit integer coordinates.
    UInt32,
    /// Signed 64-bit integer coordinates.
    Int64,
    /// Unsigned 64-bit integer coordinates.
    UInt64,
    /// 32-bit floating point coordinates.
    Float32,
    /// 64-bit floating point coordinates.
    Float64,
}

/// A named dimension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    /// Dimension name.
    pub name: String,
}

/// A named attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Cell datatype.
    pub datatype: Datatype,
}

#[derive(Serialize, Deserialize)]
struct SchemaDocument {
    version: u32,
    key_value: bool,
    coords_type: Datatype,
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
}

const SCHEMA_VERSION: u32 = 1;

/// An array schema.
///
/// Immutable once loaded; the coordinator attaches one to each open entry and
/// hands out shared references for the lifetime of the open.
#[derive(Clone, Debug)]
pub struct ArraySchema {
    uri: Uri,
    key_value: bool,
    coords_type: Datatype,
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
}

impl ArraySchema {
    /// Create a schema for the array at `uri`.
    #[must_use]
    pub fn new(
        uri: Uri,
        key_value: bool,
        coords_type: Datatype,
        dimensions: Vec<Dimension>,
        attributes: Vec<Attribute>,
    ) -> Self {
        Self {
            uri,
            key_value,
            coords_type,
            dimensions,
            attributes,
        }
    }

    /// The array URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Rebind the schema to a different array location.
    pub fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    /// Whether this is a key-value array.
    #[must_use]
    pub fn is_kv(&self) -> bool {
        self.key_value
    }

    /// The coordinate datatype.
    #[must_use]
    pub fn coords_type(&self) -> Datatype {
        self.coords_type
    }

    /// The number of dimensions.
    #[must_use]
    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    /// The dimensions.
    #[must_use]
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// The attributes.
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Validate the schema.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidArgument`] if the schema has no
    /// dimensions or attributes, or duplicated or reserved names.
    pub fn check(&self) -> Result<(), StorageError> {
        if self.dimensions.is_empty() {
            return Err(StorageError::InvalidArgument(
                "schema has no dimensions".to_string(),
            ));
        }
        if self.attributes.is_empty() {
            return Err(StorageError::InvalidArgument(
                "schema has no attributes".to_string(),
            ));
        }
        let mut names: Vec<&str> = self
            .dimensions
            .iter()
            .map(|dim| dim.name.as_str())
            .chain(self.attributes.iter().map(|attr| attr.name.as_str()))
            .collect();
        names.sort_unstable();
        for pair in names.windows(2) {
            if pair[0] == pair[1] {
                return Err(StorageError::InvalidArgument(format!(
                    "duplicate name {} in schema",
                    pair[0]
                )));
            }
        }
        if names
            .iter()
            .any(|name| name.is_empty() || name.starts_with("__"))
        {
            return Err(StorageError::InvalidArgument(
                "schema names must be non-empty and not reserved".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to the stored document form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let doc = SchemaDocument {
            version: SCHEMA_VERSION,
            key_value: self.key_value,
            coords_type: self.coords_type,
            dimensions: self.dimensions.clone(),
            attributes: self.attributes.clone(),
        };
        Ok(serde_json::to_vec(&doc)?)
    }

    /// Deserialize from the stored document form, binding to `uri`.
    pub fn from_bytes(bytes: &[u8], uri: Uri) -> Result<Self, StorageError> {
        let doc: SchemaDocument = serde_json::from_slice(bytes)?;
        if doc.version > SCHEMA_VERSION {
            return Err(StorageError::ParseError(format!(
                "unsupported schema version {}",
                doc.version
            )));
        }
        Ok(Self {
            uri,
            key_value: doc.key_value,
            coords_type: doc.coords_type,
            dimensions: doc.dimensions,
            attributes: doc.attributes,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_schema(uri: &Uri) -> ArraySchema {
    ArraySchema::new(
        uri.clone(),
        false,
        Datatype::Int64,
        vec![
            Dimension {
                name: "rows".to_string(),
            },
            Dimension {
                name: "cols".to_string(),
            },
        ],
        vec![Attribute {
            name: "a".to_string(),
            datatype: Datatype::Float64,
        }],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_round_trip() {
        let uri = Uri::new("mem://arrays/a").unwrap();
        let schema = test_schema(&uri);
        schema.check().unwrap();
        let bytes = schema.to_bytes().unwrap();
        let loaded = ArraySchema::from_bytes(&bytes, uri.clone()).unwrap();
        assert_eq!(loaded.uri(), &uri);
        assert_eq!(loaded.dim_num(), 2);
        assert_eq!(loaded.coords_type(), Datatype::Int64);
        assert!(!loaded.is_kv());
    }

    #[test]
    fn schema_check_rejects_duplicates() {
        let uri = Uri::new("mem://arrays/a").unwrap();
        let schema = ArraySchema::new(
            uri,
            false,
            Datatype::Int32,
            vec![Dimension {
                name: "d".to_string(),
            }],
            vec![Attribute {
                name: "d".to_string(),
                datatype: Datatype::Int32,
            }],
        );
        assert!(schema.check().is_err());
    }
}
