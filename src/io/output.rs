//! About the output files and directories.
use crate::common::error::*;
use std::fs;
use std::path::Path;





/// Create the directory of a saved model
///
/// # Parameters
/// ```text
/// dir: the model directory
/// override_existing: if the directory already exists, replace it (true) or refuse (false)
/// ```
pub fn create_model_dir(dir: &Path, override_existing: bool) -> Result<()>
{
    let dir_exist = fs::metadata(dir);
    match dir_exist
    {
        Ok(_) if !override_existing =>
        {
            return Err(NxcError::Configuration(format!("'{}' already exists, set 'override' to replace it", dir.display())))
        },
        Ok(_) =>
        {
            fs::remove_dir_all(dir).map_err(|err| error_file(dir, err))?;
        },
        Err(_) => (),
    }
    fs::create_dir_all(dir).map_err(|err| error_file(dir, err))
}

/// Write a whole text file
pub fn write_text(path: &Path, text: &str) -> Result<()>
{
    fs::write(path, text).map_err(|err| error_file(path, err))
}

/// Read a whole text file
pub fn read_text(path: &Path) -> Result<String>
{
    fs::read_to_string(path).map_err(|err| error_file(path, err))
}
