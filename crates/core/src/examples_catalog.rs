//! Listing of the bundled example images for the clothes swapper.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];
pub const HUMAN_DIR: &str = "human";
pub const GARMENT_DIR: &str = "garment";

#[derive(Debug, Error)]
pub enum ExamplesError {
    #[error("The example directory '{}' was not found on the server.", .0.display())]
    MissingDirectory(PathBuf),
    #[error("Failed to list example files from the server.")]
    Io(#[source] io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HumanExample {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GarmentExample {
    pub path: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExampleCatalog {
    pub human_examples: Vec<HumanExample>,
    pub garment_examples: Vec<GarmentExample>,
}

pub async fn list_examples(root: &Path) -> Result<ExampleCatalog, ExamplesError> {
    let human_examples = image_files(&root.join(HUMAN_DIR))
        .await?
        .into_iter()
        .map(|file| HumanExample {
            path: public_path(HUMAN_DIR, &file),
        })
        .collect();

    let garment_examples = image_files(&root.join(GARMENT_DIR))
        .await?
        .into_iter()
        .map(|file| GarmentExample {
            path: public_path(GARMENT_DIR, &file),
            description: describe(&file),
        })
        .collect();

    Ok(ExampleCatalog {
        human_examples,
        garment_examples,
    })
}

/// Image file names in `dir`, sorted.
async fn image_files(dir: &Path) -> Result<Vec<String>, ExamplesError> {
    let mut entries = fs::read_dir(dir).await.map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => ExamplesError::MissingDirectory(dir.to_path_buf()),
        _ => ExamplesError::Io(err),
    })?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(ExamplesError::Io)? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_image(&name) {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}

fn is_image(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn public_path(kind: &str, file: &str) -> String {
    format!("/examples/{kind}/{file}")
}

/// `red_t_shirt.v2.png` -> `red t shirt`
fn describe(file: &str) -> String {
    file.split('.').next().unwrap_or(file).replace('_', " ")
}
