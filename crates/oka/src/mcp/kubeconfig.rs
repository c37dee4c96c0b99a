use kube::config::Kubeconfig;
use std::io::Write;
use tempfile::NamedTempFile;

use crate::{Error, Result};

/// Copy the current kubeconfig into a temporary file, removed when the
/// returned handle is closed or dropped.
pub fn isolated_copy() -> Result<NamedTempFile> {
    let config = Kubeconfig::read()
        .map_err(|e| Error::Config(format!("failed to read kubeconfig: {}", e)))?;
    write_temp(&config)
}

pub fn write_temp(config: &Kubeconfig) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("oka-kubeconfig-")
        .suffix(".yaml")
        .tempfile()?;
    serde_yaml::to_writer(&mut file, config)?;
    file.flush()?;
    Ok(file)
}
