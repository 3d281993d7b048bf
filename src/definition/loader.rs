use crate::definition::ProcessModel;
use anyhow::{Context as AnyhowContext, Result};
use std::fs;
use std::path::Path;

pub fn load_model_from_yaml(file_path: impl AsRef<Path>) -> Result<ProcessModel> {
    let path = file_path.as_ref();
    let yaml_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read YAML file from {}", path.display()))?;

    let model: ProcessModel = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", path.display()))?;

    Ok(model)
}
