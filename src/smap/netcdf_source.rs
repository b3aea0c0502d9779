use super::{Field, FieldFile, FieldSource};
use crate::{
    error::{ReshuffleError, ReshuffleResult},
    image::{AttrValue, Attributes},
};
use netcdf::AttributeValue;
use once_cell::sync::OnceCell;
use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

/// Reads SPL3SMP HDF5 files through the netCDF-4 library.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetcdfFieldSource;

/// An open SPL3SMP file.
pub struct NetcdfFile {
    file: netcdf::File,
    path: String,
}

impl FieldSource for NetcdfFieldSource {
    type File = NetcdfFile;

    fn open(&self, path: &Path) -> ReshuffleResult<NetcdfFile> {
        let _lock = netcdf_lock();

        let file = netcdf::open(path).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("error opening {}: {}", path.display(), err),
            )
        })?;

        Ok(NetcdfFile {
            file,
            path: path.display().to_string(),
        })
    }
}

impl FieldFile for NetcdfFile {
    fn groups(&self) -> Vec<String> {
        let _lock = netcdf_lock();

        match self.file.groups() {
            Ok(groups) => groups.map(|g| g.name()).collect(),
            Err(_) => vec![],
        }
    }

    fn field(&self, group: &str, name: &str) -> ReshuffleResult<Field> {
        let _lock = netcdf_lock();
        let missing = || ReshuffleError::field_lookup(format!("{}/{}", group, name), self.path.clone());

        let grp = self.file.group(group).ok().flatten().ok_or_else(missing)?;
        let var = grp.variable(name).ok_or_else(missing)?;

        let dims = var.dimensions();
        if dims.len() != 2 {
            return Err(missing());
        }
        let shape = (dims[0].len(), dims[1].len());

        let values: Vec<f64> = var.get_values(..).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("error reading {}/{} from {}: {}", group, name, self.path, err),
            )
        })?;

        let mut attributes = Attributes::new();
        for attr in var.attributes() {
            if let Some(value) = attr.value().ok().and_then(attribute_value) {
                attributes.insert(attr.name().to_string(), value);
            }
        }

        Ok(Field {
            values,
            shape,
            attributes,
        })
    }
}

/// Scalar numbers and strings, everything else is not used.
fn attribute_value(value: AttributeValue) -> Option<AttrValue> {
    match value {
        AttributeValue::Str(s) => Some(AttrValue::Text(s)),
        other => f64::try_from(other).ok().map(AttrValue::Number),
    }
}

static NETCDF_GLOBAL_LOCK: OnceCell<Mutex<()>> = OnceCell::new();

/// The netCDF library is not thread safe, every call into it holds this lock.
fn netcdf_lock() -> MutexGuard<'static, ()> {
    NETCDF_GLOBAL_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
