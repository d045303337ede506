use super::{Dataset, DatasetError};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Reads one source file into a raw [`Dataset`].
///
/// Implementations must not rename or decode anything; normalization is
/// applied afterwards by [`super::normalize`].
pub trait DatasetReader: Send + Sync {
    /// Short name of the format, for log messages
    fn format_name(&self) -> &'static str;

    /// Read every variable and attribute of `path`
    ///
    /// # Arguments
    /// * `path` - Path to the source file
    ///
    /// # Returns
    /// * `Result<Dataset, DatasetError>` - The raw dataset or error
    fn read(&self, path: &Path) -> Result<Dataset, DatasetError>;
}

/// Self-describing JSON source files (a serialized [`Dataset`])
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonReader;

impl DatasetReader for JsonReader {
    fn format_name(&self) -> &'static str {
        "json"
    }

    fn read(&self, path: &Path) -> Result<Dataset, DatasetError> {
        let file = File::open(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let dataset: Dataset = serde_json::from_reader(BufReader::new(file))?;
        for (name, var) in &dataset.variables {
            if var.dims.len() != var.values.ndim() {
                return Err(DatasetError::InvalidFormat(format!(
                    "{}: variable '{}' names {} dimensions for a {}-d array",
                    path.display(),
                    name,
                    var.dims.len(),
                    var.values.ndim()
                )));
            }
        }
        Ok(dataset)
    }
}

#[cfg(feature = "netcdf")]
mod netcdf_reader {
    use super::super::{AttributeValue, Attributes, Dataset, DatasetError, Variable};
    use super::DatasetReader;
    use ndarray::{ArrayD, IxDyn};
    use std::path::Path;

    /// NetCDF-3/4 source files
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NetcdfReader;

    fn convert_attributes<'a, I>(attrs: I) -> Attributes
    where
        I: Iterator<Item = netcdf::Attribute<'a>>,
    {
        let mut out = Attributes::new();
        for attr in attrs {
            let value = match attr.value() {
                Ok(netcdf::AttributeValue::Str(s)) => AttributeValue::String(s),
                Ok(netcdf::AttributeValue::Double(v)) => AttributeValue::Double(v),
                Ok(netcdf::AttributeValue::Float(v)) => AttributeValue::Double(v as f64),
                Ok(netcdf::AttributeValue::Int(v)) => AttributeValue::Double(v as f64),
                Ok(netcdf::AttributeValue::Short(v)) => AttributeValue::Double(v as f64),
                Ok(netcdf::AttributeValue::Doubles(v)) => AttributeValue::DoubleArray(v),
                Ok(netcdf::AttributeValue::Floats(v)) => {
                    AttributeValue::DoubleArray(v.into_iter().map(f64::from).collect())
                }
                Ok(netcdf::AttributeValue::Ints(v)) => {
                    AttributeValue::DoubleArray(v.into_iter().map(f64::from).collect())
                }
                _ => continue,
            };
            out.insert(attr.name().to_string(), value);
        }
        out
    }

    impl DatasetReader for NetcdfReader {
        fn format_name(&self) -> &'static str {
            "netcdf"
        }

        fn read(&self, path: &Path) -> Result<Dataset, DatasetError> {
            let file = netcdf::open(path)?;
            let mut dataset = Dataset::new();
            dataset.attrs = convert_attributes(file.attributes());

            for var in file.variables() {
                let dims: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
                let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
                let raw: Vec<f64> = match var.get_values::<f64, _>(..) {
                    Ok(values) => values,
                    Err(e) => {
                        log::debug!("Skipping non-numeric variable {} in {}: {}", var.name(), path.display(), e);
                        continue;
                    }
                };
                let values = ArrayD::from_shape_vec(IxDyn(&shape), raw)?;
                dataset.variables.insert(
                    var.name(),
                    Variable {
                        dims,
                        values,
                        attrs: convert_attributes(var.attributes()),
                    },
                );
            }
            Ok(dataset)
        }
    }
}

#[cfg(feature = "netcdf")]
pub use netcdf_reader::NetcdfReader;

/// Detect NetCDF by its magic bytes (classic `CDF\x01`/`CDF\x02` or HDF5).
pub fn is_netcdf_format(path: &Path) -> Result<bool, DatasetError> {
    let mut file = File::open(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut buffer = [0u8; 8];
    match file.read_exact(&mut buffer) {
        Ok(()) => {
            if buffer[0..3] == [b'C', b'D', b'F'] && (buffer[3] == 1 || buffer[3] == 2) {
                return Ok(true);
            }
            Ok(buffer == [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'])
        }
        Err(_) => Ok(false),
    }
}

/// Detect JSON by its first non-blank byte.
pub fn is_json_format(path: &Path) -> Result<bool, DatasetError> {
    let mut file = File::open(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut buffer = [0u8; 64];
    let n = file.read(&mut buffer).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(buffer[..n]
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{'))
}

#[cfg(feature = "netcdf")]
fn netcdf_reader() -> Result<Box<dyn DatasetReader>, DatasetError> {
    Ok(Box::new(NetcdfReader))
}

#[cfg(not(feature = "netcdf"))]
fn netcdf_reader() -> Result<Box<dyn DatasetReader>, DatasetError> {
    Err(DatasetError::InvalidFormat(
        "NetCDF input requires building with the `netcdf` feature".to_string(),
    ))
}

/// Pick a reader for `path` from its content, falling back to its extension.
pub fn create_reader(path: &Path) -> Result<Box<dyn DatasetReader>, DatasetError> {
    if is_netcdf_format(path)? {
        return netcdf_reader();
    }
    if is_json_format(path)? {
        return Ok(Box::new(JsonReader));
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("nc") | Some("nc4") | Some("netcdf") => netcdf_reader(),
        Some("json") => Ok(Box::new(JsonReader)),
        _ => Err(DatasetError::InvalidFormat(format!(
            "Unable to detect format for file: {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Variable;
    use ndarray::array;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_json_reader_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.json");
        let mut ds = Dataset::new();
        ds.insert("lat", Variable::new(&["lat"], array![-45.0, 45.0].into_dyn()).unwrap());
        std::fs::write(&path, serde_json::to_string(&ds).unwrap()).unwrap();

        let reader = create_reader(&path).unwrap();
        assert_eq!(reader.format_name(), "json");
        assert_eq!(reader.read(&path).unwrap(), ds);
    }

    #[test]
    fn test_detects_netcdf_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"CDF\x01\0\0\0\0").unwrap();
        assert!(is_netcdf_format(&path).unwrap());
        assert!(!is_json_format(&path).unwrap());
    }

    #[test]
    fn test_unknown_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();
        assert!(matches!(create_reader(&path), Err(DatasetError::InvalidFormat(_))));
    }
}
